//! AES-128-CTR stream cipher over an async byte stream.
//!
//! Each direction runs its own keystream. The IV of a direction is derived
//! from the session key and a direction label, so one side must be built
//! with [`CipherRole::Client`] and the other with [`CipherRole::Server`].

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use aes::Aes128;
use ctr::cipher::generic_array::GenericArray;
use ctr::cipher::{KeyIvInit, StreamCipher};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::SESSION_KEY_LEN;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

/// Largest plaintext chunk accepted by a single `poll_write`
const MAX_WRITE_CHUNK: usize = 16 * 1024;

const CLIENT_WRITE_LABEL: &[u8] = b"reverso client write";
const SERVER_WRITE_LABEL: &[u8] = b"reverso server write";

/// Which end of the connection this wrapper sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherRole {
    /// The side that dialed the connection
    Client,
    /// The side that accepted the connection
    Server,
}

fn derive_iv(key: &[u8; SESSION_KEY_LEN], label: &[u8]) -> [u8; 16] {
    let digest = Sha256::new().chain_update(key).chain_update(label).finalize();
    let mut iv = [0u8; 16];
    iv.copy_from_slice(&digest[..16]);
    iv
}

fn keystream(key: &[u8; SESSION_KEY_LEN], label: &[u8]) -> Aes128Ctr {
    let iv = derive_iv(key, label);
    Aes128Ctr::new(GenericArray::from_slice(key), GenericArray::from_slice(&iv))
}

/// Transparent encrypting wrapper implementing `AsyncRead + AsyncWrite`
pub struct CipherStream<S> {
    inner: S,
    encryptor: Aes128Ctr,
    decryptor: Aes128Ctr,
    /// Ciphertext accepted from the caller but not yet written to `inner`
    pending: Vec<u8>,
    pending_pos: usize,
}

impl<S> CipherStream<S> {
    pub fn new(inner: S, key: &[u8; SESSION_KEY_LEN], role: CipherRole) -> Self {
        let (write_label, read_label) = match role {
            CipherRole::Client => (CLIENT_WRITE_LABEL, SERVER_WRITE_LABEL),
            CipherRole::Server => (SERVER_WRITE_LABEL, CLIENT_WRITE_LABEL),
        };

        Self {
            inner,
            encryptor: keystream(key, write_label),
            decryptor: keystream(key, read_label),
            pending: Vec::new(),
            pending_pos: 0,
        }
    }
}

impl<S: AsyncWrite + Unpin> CipherStream<S> {
    fn poll_write_pending(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.pending_pos < self.pending.len() {
            let n = ready!(
                Pin::new(&mut self.inner).poll_write(cx, &self.pending[self.pending_pos..])
            )?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending_pos += n;
        }

        self.pending.clear();
        self.pending_pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CipherStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();

        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;

        this.decryptor.apply_keystream(&mut buf.filled_mut()[before..]);
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CipherStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        // Keystream already advanced over pending bytes; they go out first
        ready!(this.poll_write_pending(cx))?;

        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let accepted = buf.len().min(MAX_WRITE_CHUNK);
        this.pending.extend_from_slice(&buf[..accepted]);
        this.encryptor.apply_keystream(&mut this.pending);

        if let Poll::Ready(Err(e)) = this.poll_write_pending(cx) {
            return Poll::Ready(Err(e));
        }

        Poll::Ready(Ok(accepted))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_write_pending(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_write_pending(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const KEY: [u8; SESSION_KEY_LEN] = *b"0123456789abcdef";

    #[tokio::test]
    async fn test_client_and_server_roles_interoperate() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut client = CipherStream::new(a, &KEY, CipherRole::Client);
        let mut server = CipherStream::new(b, &KEY, CipherRole::Server);

        client.write_all(b"hello from client").await.unwrap();
        client.flush().await.unwrap();
        let mut buf = [0u8; 17];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello from client");

        server.write_all(b"hello back").await.unwrap();
        server.flush().await.unwrap();
        let mut buf = [0u8; 10];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello back");
    }

    #[tokio::test]
    async fn test_bytes_on_the_wire_are_not_plaintext() {
        let (a, mut raw) = tokio::io::duplex(1024);
        let mut client = CipherStream::new(a, &KEY, CipherRole::Client);

        client.write_all(b"plaintext payload").await.unwrap();
        client.flush().await.unwrap();

        let mut wire = [0u8; 17];
        raw.read_exact(&mut wire).await.unwrap();
        assert_ne!(&wire, b"plaintext payload");
    }

    #[tokio::test]
    async fn test_large_writes_survive_small_transport_buffer() {
        // 64-byte duplex buffer forces partial writes of the pending ciphertext
        let (a, b) = tokio::io::duplex(64);
        let mut client = CipherStream::new(a, &KEY, CipherRole::Client);
        let mut server = CipherStream::new(b, &KEY, CipherRole::Server);

        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
            client.shutdown().await.unwrap();
        });

        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();
        writer.await.unwrap();

        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_mismatched_keys_garble_data() {
        let (a, b) = tokio::io::duplex(1024);
        let mut client = CipherStream::new(a, &KEY, CipherRole::Client);
        let mut server = CipherStream::new(b, b"fedcba9876543210", CipherRole::Server);

        client.write_all(b"secret").await.unwrap();
        client.flush().await.unwrap();
        let mut buf = [0u8; 6];
        server.read_exact(&mut buf).await.unwrap();
        assert_ne!(&buf, b"secret");
    }
}
