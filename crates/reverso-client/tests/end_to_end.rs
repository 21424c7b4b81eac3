//! Full client flow against an in-process fake tunnel server:
//! handshake, tunnel sync, pipe request, stream forwarding to a local
//! TCP service, close.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reverso_client::{ClientConfig, Control, EncryptMode, TunnelConfig, TunnelProtocol};
use reverso_crypto::{prf, CipherRole, CipherStream, KeyExchange, PreMasterSecret};
use reverso_proto::{
    read_message, write_message, AddTunnels, ClientId, ControlMessage, ControlServerHello,
    MessageCodec, StreamHeader,
};
use reverso_transport::{BoxedStream, Dialer, TransportError, TransportResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_yamux::session::SessionType;
use tokio_yamux::{Config as YamuxConfig, Control as YamuxControl, Session, StreamHandle};
use uuid::Uuid;

const CLIENT_ID: ClientId = Uuid::from_u128(1);
const TIMEOUT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Hands the server end of every dialed pipe to the fake server
struct DuplexDialer {
    pipes: mpsc::UnboundedSender<DuplexStream>,
}

#[async_trait]
impl Dialer for DuplexDialer {
    async fn dial(&self) -> TransportResult<BoxedStream> {
        let (client, server) = tokio::io::duplex(256 * 1024);
        self.pipes
            .send(server)
            .map_err(|_| TransportError::ConnectionFailed {
                addr: "fake-server".to_string(),
                source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
            })?;
        Ok(Box::new(client))
    }
}

struct FakeServer {
    reader: FramedRead<ReadHalf<DuplexStream>, MessageCodec>,
    writer: FramedWrite<WriteHalf<DuplexStream>, MessageCodec>,
    pipes: mpsc::UnboundedReceiver<DuplexStream>,
    secret: Option<PreMasterSecret>,
}

impl FakeServer {
    async fn recv(&mut self) -> ControlMessage {
        timeout(TIMEOUT, self.reader.next())
            .await
            .expect("timed out waiting for client")
            .expect("client closed control connection")
            .expect("malformed control message")
    }

    async fn send(&mut self, message: ControlMessage) {
        self.writer.send(message).await.unwrap();
    }

    /// Accept the next pipe and return a handle for opening streams on it
    async fn accept_pipe(&mut self) -> YamuxControl {
        let mut pipe = timeout(TIMEOUT, self.pipes.recv())
            .await
            .expect("timed out waiting for pipe")
            .expect("dialer dropped");

        let hello = match read_message::<_, ControlMessage>(&mut pipe).await.unwrap() {
            ControlMessage::PipeClientHello(hello) => hello,
            other => panic!("unexpected pipe hello: {:?}", other),
        };
        assert_eq!(hello.client_id, CLIENT_ID);

        let stream: BoxedStream = match &self.secret {
            Some(secret) => {
                let mut key = [0u8; 16];
                prf(
                    &mut key,
                    secret.as_bytes(),
                    hello.client_id.as_bytes(),
                    hello.once.as_bytes(),
                );
                Box::new(CipherStream::new(pipe, &key, CipherRole::Server))
            }
            None => Box::new(pipe),
        };

        let mut session = Session::new(stream, YamuxConfig::default(), SessionType::Client);
        let control = session.control();
        tokio::spawn(async move { while let Some(Ok(_)) = session.next().await {} });
        control
    }
}

async fn open_tunnel_stream(pipe: &mut YamuxControl, tunnel: &str) -> StreamHandle {
    let mut stream = pipe.open_stream().await.unwrap();
    write_message(
        &mut stream,
        &StreamHeader {
            tunnel: tunnel.to_string(),
        },
    )
    .await
    .unwrap();
    stream
}

/// Local service echoing every byte back
async fn spawn_echo_service() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut read_half, mut write_half) = socket.split();
                let _ = tokio::io::copy(&mut read_half, &mut write_half).await;
            });
        }
    });

    format!("http://{}", addr)
}

/// Connect a control to the fake server, sync `tunnels`, start running and
/// ask for one pipe.
async fn connect(
    encrypt_mode: EncryptMode,
    tunnels: Vec<(&str, TunnelConfig)>,
) -> (Arc<Control>, FakeServer, JoinHandle<Result<(), reverso_client::ControlError>>) {
    let (client_end, server_end) = tokio::io::duplex(64 * 1024);
    let (pipes_tx, pipes_rx) = mpsc::unbounded_channel();

    let mut config = ClientConfig {
        server_addr: "fake-server:8867".to_string(),
        auth_token: "test-token".to_string(),
        encrypt_mode,
        ..Default::default()
    };
    for (name, tunnel) in tunnels {
        config.tunnels.insert(name.to_string(), tunnel);
    }

    let control = Arc::new(
        Control::new(Box::new(client_end), config)
            .with_dialer(Arc::new(DuplexDialer { pipes: pipes_tx }))
            .with_signal_handling(false),
    );

    let (read_half, write_half) = tokio::io::split(server_end);
    let mut server = FakeServer {
        reader: FramedRead::new(read_half, MessageCodec::new()),
        writer: FramedWrite::new(write_half, MessageCodec::new()),
        pipes: pipes_rx,
        secret: None,
    };

    let handshake = tokio::spawn(async move {
        let hello = match server.recv().await {
            ControlMessage::ControlClientHello(hello) => hello,
            other => panic!("unexpected message: {:?}", other),
        };
        assert_eq!(hello.auth_token, "test-token");

        let cipher_key = match hello.cipher_key {
            Some(client_key) => {
                let exchange = KeyExchange::generate().unwrap();
                let public = exchange.public_bytes().to_vec();
                server.secret = Some(exchange.complete(&client_key).unwrap());
                Some(public)
            }
            None => None,
        };
        server
            .send(ControlMessage::ControlServerHello(ControlServerHello {
                client_id: CLIENT_ID,
                cipher_key,
            }))
            .await;
        server
    });

    control.client_handshake().await.unwrap();
    let mut server = handshake.await.unwrap();

    control.client_add_tunnels().await.unwrap();
    let tunnels = match server.recv().await {
        ControlMessage::AddTunnels(add) => add.tunnels,
        other => panic!("unexpected message: {:?}", other),
    };
    server
        .send(ControlMessage::AddTunnels(AddTunnels { tunnels }))
        .await;

    let run = tokio::spawn(control.clone().run());
    server.send(ControlMessage::PipeReq).await;

    (control, server, run)
}

async fn assert_echo(stream: &mut StreamHandle, payload: &[u8]) {
    stream.write_all(payload).await.unwrap();
    let mut reply = vec![0u8; payload.len()];
    timeout(TIMEOUT, stream.read_exact(&mut reply))
        .await
        .expect("timed out waiting for echo")
        .unwrap();
    assert_eq!(reply, payload);
}

async fn wait_for_pipes(control: &Control, expected: i64) {
    timeout(TIMEOUT, async {
        while control.pipe_count() != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("pipe count never reached {}", expected));
}

#[tokio::test]
async fn test_forwards_stream_without_encryption() {
    init_tracing();
    let local = spawn_echo_service().await;
    let (control, mut server, run) = connect(
        EncryptMode::None,
        vec![("web", TunnelConfig::new(TunnelProtocol::Http, local))],
    )
    .await;

    let mut pipe = server.accept_pipe().await;
    let mut stream = open_tunnel_stream(&mut pipe, "web").await;
    assert_echo(&mut stream, b"hello local").await;

    assert_eq!(control.client_id(), Some(CLIENT_ID));
    assert_eq!(control.pipe_count(), 1);
    assert!(control.tunnels().await.contains_key("web"));

    control.close();
    timeout(TIMEOUT, run).await.unwrap().unwrap().unwrap();
    assert!(control.is_closed());
    wait_for_pipes(&control, 0).await;
}

#[tokio::test]
async fn test_forwards_stream_with_encryption() {
    init_tracing();
    let local = spawn_echo_service().await;
    let (control, mut server, run) = connect(
        EncryptMode::Aes,
        vec![("web", TunnelConfig::new(TunnelProtocol::Http, local))],
    )
    .await;
    assert!(server.secret.is_some());

    let mut pipe = server.accept_pipe().await;
    let mut stream = open_tunnel_stream(&mut pipe, "web").await;
    assert_echo(&mut stream, b"hello over an encrypted pipe").await;

    // Larger payload crossing many frames and cipher chunks
    let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
    let writer = {
        let payload = payload.clone();
        let mut stream = open_tunnel_stream(&mut pipe, "web").await;
        tokio::spawn(async move {
            let (mut read_half, mut write_half) = tokio::io::split(&mut stream);
            let mut received = vec![0u8; payload.len()];
            let (write, read) = tokio::join!(
                write_half.write_all(&payload),
                read_half.read_exact(&mut received)
            );
            write.unwrap();
            read.unwrap();
            received
        })
    };
    let received = timeout(TIMEOUT, writer).await.unwrap().unwrap();
    assert!(received == payload);

    control.close();
    timeout(TIMEOUT, run).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_unknown_tunnel_does_not_disturb_other_streams() {
    init_tracing();
    let local = spawn_echo_service().await;
    let (control, mut server, run) = connect(
        EncryptMode::None,
        vec![("web", TunnelConfig::new(TunnelProtocol::Http, local))],
    )
    .await;

    let mut pipe = server.accept_pipe().await;
    let _missing = open_tunnel_stream(&mut pipe, "missing").await;
    let mut stream = open_tunnel_stream(&mut pipe, "web").await;
    assert_echo(&mut stream, b"still works").await;

    assert!(!control.is_closed());
    assert_eq!(control.pipe_count(), 1);

    control.close();
    timeout(TIMEOUT, run).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_server_requests_additional_pipes() {
    init_tracing();
    let local = spawn_echo_service().await;
    let (control, mut server, run) = connect(
        EncryptMode::Aes,
        vec![("web", TunnelConfig::new(TunnelProtocol::Http, local))],
    )
    .await;

    let mut first = server.accept_pipe().await;
    server.send(ControlMessage::PipeReq).await;
    let mut second = server.accept_pipe().await;
    wait_for_pipes(&control, 2).await;

    let mut a = open_tunnel_stream(&mut first, "web").await;
    let mut b = open_tunnel_stream(&mut second, "web").await;
    assert_echo(&mut a, b"first pipe").await;
    assert_echo(&mut b, b"second pipe").await;

    control.close();
    timeout(TIMEOUT, run).await.unwrap().unwrap().unwrap();
    wait_for_pipes(&control, 0).await;
}

#[tokio::test]
async fn test_server_disconnect_closes_control() {
    init_tracing();
    let (control, server, run) = connect(EncryptMode::None, Vec::new()).await;

    drop(server);

    timeout(TIMEOUT, run).await.unwrap().unwrap().unwrap();
    assert!(control.is_closed());
}
