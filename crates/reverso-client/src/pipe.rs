//! Data pipes
//!
//! A pipe is a fresh connection to the server that announces itself with
//! a [`PipeClientHello`], optionally switches to an encrypted stream keyed
//! off the control handshake, and then carries a multiplexed session. The
//! client plays the server role in that session: it accepts streams the
//! tunnel server opens and forwards each to a local service.

use futures::StreamExt;
use reverso_crypto::{prf, CipherRole, CipherStream, PreMasterSecret, SESSION_KEY_LEN};
use reverso_proto::{write_message, ClientId, CodecError, ControlMessage, PipeClientHello, PipeNonce};
use reverso_transport::{BoxedStream, TransportError};
use thiserror::Error;
use tokio_yamux::session::SessionType;
use tokio_yamux::{Config as YamuxConfig, Session, StreamHandle};
use tracing::debug;
use uuid::Uuid;

/// Per-stream receive buffer of a pipe session (4 MiB)
pub const PIPE_RECEIVE_BUFFER: u32 = 4 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum PipeError {
    #[error("Control handshake incomplete: missing {0}")]
    NotReady(&'static str),

    #[error("Dial error: {0}")]
    Dial(#[from] TransportError),

    #[error("Pipe handshake failed: {0}")]
    Handshake(#[from] CodecError),

    #[error("Pipe session error: {0}")]
    Session(#[from] std::io::Error),
}

/// Derive the 16-byte key of one pipe from the control secret
pub fn derive_pipe_key(
    secret: &PreMasterSecret,
    client_id: &ClientId,
    once: &PipeNonce,
) -> [u8; SESSION_KEY_LEN] {
    let mut key = [0u8; SESSION_KEY_LEN];
    prf(&mut key, secret.as_bytes(), client_id.as_bytes(), once.as_bytes());
    key
}

/// Announce a freshly dialed connection as a pipe and start its session.
///
/// With a secret, everything after the hello is encrypted.
pub async fn pipe_handshake(
    mut conn: BoxedStream,
    client_id: ClientId,
    secret: Option<&PreMasterSecret>,
) -> Result<PipeSession, PipeError> {
    let hello = PipeClientHello {
        once: Uuid::new_v4(),
        client_id,
    };
    write_message(&mut conn, &ControlMessage::PipeClientHello(hello.clone())).await?;

    let stream: BoxedStream = match secret {
        Some(secret) => {
            let key = derive_pipe_key(secret, &hello.client_id, &hello.once);
            Box::new(CipherStream::new(conn, &key, CipherRole::Client))
        }
        None => conn,
    };

    debug!(once = %hello.once, encrypted = secret.is_some(), "Pipe hello sent");
    Ok(PipeSession::new(stream))
}

/// Multiplexed session over one pipe, in the server role
pub struct PipeSession {
    session: Session<BoxedStream>,
}

impl PipeSession {
    pub fn new(stream: BoxedStream) -> Self {
        let config = YamuxConfig {
            max_stream_window_size: PIPE_RECEIVE_BUFFER,
            ..YamuxConfig::default()
        };
        Self {
            session: Session::new(stream, config, SessionType::Server),
        }
    }

    /// Next stream opened by the server, or `None` once the session ended.
    ///
    /// Polling this also drives I/O for streams already accepted.
    pub async fn accept_stream(&mut self) -> Result<Option<StreamHandle>, PipeError> {
        match self.session.next().await {
            Some(Ok(stream)) => Ok(Some(stream)),
            Some(Err(e)) => Err(PipeError::Session(e)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reverso_crypto::KeyExchange;
    use reverso_proto::read_message;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_pipe_key_depends_on_nonce() {
        let client = KeyExchange::generate().unwrap();
        let server = KeyExchange::generate().unwrap();
        let server_pub = server.public_bytes();
        let secret = client.complete(&server_pub).unwrap();
        let client_id = Uuid::from_u128(1);

        let a = derive_pipe_key(&secret, &client_id, &Uuid::from_u128(10));
        let b = derive_pipe_key(&secret, &client_id, &Uuid::from_u128(11));
        assert_ne!(a, b);
        assert_eq!(a, derive_pipe_key(&secret, &client_id, &Uuid::from_u128(10)));
    }

    #[tokio::test]
    async fn test_plain_pipe_accepts_stream() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let client_id = Uuid::from_u128(42);

        let peer = tokio::spawn(async move {
            let hello: ControlMessage = read_message(&mut server).await.unwrap();
            match hello {
                ControlMessage::PipeClientHello(hello) => assert_eq!(hello.client_id, client_id),
                other => panic!("unexpected message: {:?}", other),
            }

            let mut session = Session::new(server, YamuxConfig::default(), SessionType::Client);
            let mut control = session.control();
            tokio::spawn(async move { while session.next().await.is_some() {} });

            let mut stream = control.open_stream().await.unwrap();
            stream.write_all(b"ping").await.unwrap();
            let mut reply = [0u8; 4];
            stream.read_exact(&mut reply).await.unwrap();
            reply
        });

        let mut pipe = pipe_handshake(Box::new(client), client_id, None)
            .await
            .unwrap();
        let mut stream = pipe.accept_stream().await.unwrap().unwrap();

        let server_side = tokio::spawn(async move {
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
            stream.write_all(b"pong").await.unwrap();
            stream
        });

        // Keep the session driven while the stream is used
        let driver = tokio::spawn(async move { while let Ok(Some(_)) = pipe.accept_stream().await {} });

        assert_eq!(&peer.await.unwrap(), b"pong");
        let _stream = server_side.await.unwrap();
        driver.abort();
    }
}
