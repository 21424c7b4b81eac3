//! Control connection state machine
//!
//! One [`Control`] owns a single connection to the tunnel server. After
//! [`Control::client_handshake`] and [`Control::client_add_tunnels`],
//! [`Control::run`] drives it until close:
//!
//! - moderator: turns the first close request into the closed signal and
//!   shuts the connection down exactly once
//! - receive loop: dispatches inbound messages
//! - transmit loop: sole writer of queued messages, rate limits keepalives
//! - heartbeat: pings on an interval and closes when the server goes quiet
//! - signal bridge: optional, closes on SIGINT/SIGTERM and exits the process

use futures::{SinkExt, StreamExt};
use reverso_crypto::{CryptoError, KeyExchange, PreMasterSecret};
use reverso_proto::{
    AddTunnels, ClientId, CodecError, ControlClientHello, ControlMessage, MessageCodec,
    TunnelConfig,
};
use reverso_transport::{BoxedStream, Dialer};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, trace, warn};

use crate::config::ClientConfig;
use crate::forwarder::Forwarder;
use crate::pipe::{self, PipeError, PipeSession};
use crate::registry::TunnelRegistry;
use crate::shutdown::ShutdownHandle;
use crate::signal;

/// Capacity of the outbound message queue
const OUTBOUND_QUEUE_CAPACITY: usize = 128;

/// Upper bound on shutting down the control connection once closed
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

type ControlReader = FramedRead<ReadHalf<BoxedStream>, MessageCodec>;
type ControlWriter = FramedWrite<WriteHalf<BoxedStream>, MessageCodec>;

/// Control connection errors
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Server rejected client: {0}")]
    ServerRejected(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Control connection is closed")]
    Closed,

    #[error("Control connection is already running")]
    AlreadyRunning,
}

impl From<CodecError> for ControlError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(e) => ControlError::Io(e),
            other => ControlError::Protocol(other.to_string()),
        }
    }
}

impl ControlError {
    /// Errors that a reconnect cannot fix
    pub fn is_non_recoverable(&self) -> bool {
        matches!(
            self,
            ControlError::ServerRejected(_) | ControlError::Crypto(_)
        )
    }
}

/// Keepalive timing.
///
/// The transmit loop drops a keepalive when anything was written within
/// the last `interval / 2`.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(70),
        }
    }
}

/// Client side of one control connection
pub struct Control {
    config: Arc<ClientConfig>,
    dialer: Arc<dyn Dialer>,
    reader: Mutex<Option<ControlReader>>,
    writer: Mutex<ControlWriter>,
    outbound_tx: mpsc::Sender<ControlMessage>,
    outbound_rx: Mutex<Option<mpsc::Receiver<ControlMessage>>>,
    registry: Arc<TunnelRegistry>,
    forwarder: Arc<Forwarder>,
    client_id: OnceLock<ClientId>,
    pre_master_secret: OnceLock<PreMasterSecret>,
    epoch: Instant,
    /// Nanoseconds since `epoch` of the last successful read
    last_read: AtomicU64,
    total_pipes: AtomicI64,
    shutdown: ShutdownHandle,
    heartbeat: HeartbeatConfig,
    handle_signals: bool,
}

impl Control {
    /// Wrap an established connection to the tunnel server
    pub fn new(conn: BoxedStream, config: ClientConfig) -> Self {
        let dialer: Arc<dyn Dialer> = Arc::new(config.dialer());
        let registry = Arc::new(TunnelRegistry::new());
        let forwarder = Arc::new(Forwarder::new(registry.clone(), config.verify_local_tls));
        let (read_half, write_half) = tokio::io::split(conn);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);

        Self {
            config: Arc::new(config),
            dialer,
            reader: Mutex::new(Some(FramedRead::new(read_half, MessageCodec::new()))),
            writer: Mutex::new(FramedWrite::new(write_half, MessageCodec::new())),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            registry,
            forwarder,
            client_id: OnceLock::new(),
            pre_master_secret: OnceLock::new(),
            epoch: Instant::now(),
            last_read: AtomicU64::new(0),
            total_pipes: AtomicI64::new(0),
            shutdown: ShutdownHandle::new(),
            heartbeat: HeartbeatConfig::default(),
            handle_signals: true,
        }
    }

    /// Replace the dialer used to open pipes
    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Install the SIGINT/SIGTERM bridge while running (default: on)
    pub fn with_signal_handling(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    /// Identity assigned by the server, once the handshake succeeded
    pub fn client_id(&self) -> Option<ClientId> {
        self.client_id.get().copied()
    }

    /// Number of live pipes
    pub fn pipe_count(&self) -> i64 {
        self.total_pipes.load(Ordering::SeqCst)
    }

    /// Snapshot of the tunnels synced from the server
    pub async fn tunnels(&self) -> HashMap<String, TunnelConfig> {
        self.registry.snapshot().await
    }

    /// Request close. Idempotent, non-blocking, safe from any task.
    pub fn close(&self) {
        if !self.shutdown.is_close_requested() {
            debug!(client_id = %self.client_id_display(), "Control close requested");
        }
        self.shutdown.request_close();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_closed()
    }

    /// Send the client hello and process the server's reply.
    ///
    /// Nothing is recorded unless the whole exchange succeeds.
    pub async fn client_handshake(&self) -> Result<(), ControlError> {
        let exchange = if self.config.encrypt_mode.is_enabled() {
            Some(KeyExchange::generate()?)
        } else {
            None
        };

        let hello = ControlClientHello {
            cipher_key: exchange.as_ref().map(|ex| ex.public_bytes().to_vec()),
            auth_token: self.config.auth_token.clone(),
        };
        self.write_direct(ControlMessage::ControlClientHello(hello))
            .await?;

        let reply = {
            let mut guard = self.reader.lock().await;
            let reader = guard.as_mut().ok_or(ControlError::AlreadyRunning)?;
            reader.next().await
        };

        let server_hello = match reply {
            Some(Ok(ControlMessage::ControlServerHello(hello))) => hello,
            Some(Ok(ControlMessage::Error(err))) => {
                return Err(ControlError::ServerRejected(err.message))
            }
            Some(Ok(other)) => {
                return Err(ControlError::Protocol(format!(
                    "expected server hello, got {}",
                    other.message_type()
                )))
            }
            Some(Err(e)) => return Err(e.into()),
            None => {
                return Err(ControlError::Handshake(
                    "connection closed before server hello".to_string(),
                ))
            }
        };

        let secret = match (exchange, server_hello.cipher_key) {
            (Some(exchange), Some(server_key)) => Some(exchange.complete(&server_key)?),
            (None, None) => None,
            (Some(_), None) => {
                return Err(CryptoError::KeyExchange(
                    "server hello carries no key material".to_string(),
                )
                .into())
            }
            (None, Some(_)) => {
                return Err(CryptoError::KeyExchange(
                    "server sent key material but encryption is disabled".to_string(),
                )
                .into())
            }
        };

        self.client_id
            .set(server_hello.client_id)
            .map_err(|_| ControlError::Handshake("handshake already completed".to_string()))?;
        if let Some(secret) = secret {
            let _ = self.pre_master_secret.set(secret);
        }

        info!(
            client_id = %self.client_id_display(),
            encrypted = self.config.encrypt_mode.is_enabled(),
            "Control handshake complete"
        );
        Ok(())
    }

    /// Register the configured tunnels with the server
    pub async fn client_add_tunnels(&self) -> Result<(), ControlError> {
        let message = ControlMessage::AddTunnels(AddTunnels {
            tunnels: self.config.tunnels.clone(),
        });
        self.write_direct(message).await?;
        debug!(count = self.config.tunnels.len(), "Sent tunnel definitions");
        Ok(())
    }

    /// Merge tunnel definitions from the server into the registry
    pub async fn sync_tunnels(&self, add: AddTunnels) {
        for (name, tunnel) in &add.tunnels {
            info!(
                client_id = %self.client_id_display(),
                tunnel = %name,
                local = %tunnel.local_addr,
                remote = %tunnel.remote_addr(),
                "Tunnel synced"
            );
        }
        self.registry.merge(add.tunnels).await;
    }

    /// Drive the connection until it is closed.
    ///
    /// Pipes spawned by the receive loop are not awaited; they observe the
    /// closed signal and unwind on their own.
    pub async fn run(self: Arc<Self>) -> Result<(), ControlError> {
        let reader = self
            .reader
            .lock()
            .await
            .take()
            .ok_or(ControlError::AlreadyRunning)?;
        let outbound_rx = self
            .outbound_rx
            .lock()
            .await
            .take()
            .ok_or(ControlError::AlreadyRunning)?;

        info!(client_id = %self.client_id_display(), "Control connection running");

        let moderator = tokio::spawn(self.clone().moderator());
        let receiver = tokio::spawn(self.clone().recv_loop(reader));
        let transmitter = tokio::spawn(self.clone().transmit_loop(outbound_rx));
        let signals = self.handle_signals.then(|| {
            tokio::spawn(signal::listen_and_stop(
                self.shutdown.clone(),
                self.client_id_display(),
            ))
        });

        self.heartbeat_loop().await;
        self.shutdown.closed().await;

        for task in [moderator, receiver, transmitter] {
            if let Err(e) = task.await {
                error!(error = %e, "Control task panicked");
            }
        }
        if let Some(signals) = signals {
            let _ = signals.await;
        }

        info!(
            client_id = %self.client_id_display(),
            pipes = self.pipe_count(),
            "Control connection closed"
        );
        Ok(())
    }

    async fn moderator(self: Arc<Self>) {
        self.shutdown.close_requested().await;
        self.shutdown.mark_closed();

        let mut writer = self.writer.lock().await;
        match tokio::time::timeout(CLOSE_TIMEOUT, writer.get_mut().shutdown()).await {
            Ok(Ok(())) => debug!("Control connection shut down"),
            Ok(Err(e)) => debug!(error = %e, "Shutting down control connection failed"),
            Err(_) => warn!("Timed out shutting down control connection"),
        }
    }

    async fn recv_loop(self: Arc<Self>, mut reader: ControlReader) {
        self.touch_last_read();

        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.closed() => return,
                next = reader.next() => next,
            };

            let message = match next {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    warn!(client_id = %self.client_id_display(), error = %e, "Reading control message failed");
                    self.close();
                    return;
                }
                None => {
                    warn!(client_id = %self.client_id_display(), "Server closed control connection");
                    self.close();
                    return;
                }
            };

            self.touch_last_read();
            trace!(message_type = %message.message_type(), "Received control message");

            match message {
                ControlMessage::Pong => {}
                ControlMessage::Ping => {
                    if !self.enqueue(ControlMessage::Pong).await {
                        return;
                    }
                }
                ControlMessage::PipeReq => {
                    tokio::spawn(self.clone().create_pipe());
                }
                ControlMessage::AddTunnels(add) => self.sync_tunnels(add).await,
                ControlMessage::Error(err) => {
                    error!(client_id = %self.client_id_display(), error = %err, "Server reported error");
                    self.close();
                    return;
                }
                other => {
                    error!(
                        client_id = %self.client_id_display(),
                        message_type = %other.message_type(),
                        "Unexpected control message"
                    );
                    self.close();
                    return;
                }
            }
        }
    }

    async fn transmit_loop(self: Arc<Self>, mut queue: mpsc::Receiver<ControlMessage>) {
        let keepalive_gap = self.heartbeat.interval / 2;
        // Only writes made by this loop move last_write; the handshake and
        // tunnel registration write directly and are not counted.
        let mut last_write = Instant::now();

        loop {
            let message = tokio::select! {
                biased;
                _ = self.shutdown.closed() => return,
                message = queue.recv() => match message {
                    Some(message) => message,
                    None => return,
                },
            };

            if message.is_keepalive() && last_write.elapsed() < keepalive_gap {
                trace!(message_type = %message.message_type(), "Dropping keepalive, connection recently written");
                continue;
            }

            let mut writer = self.writer.lock().await;
            let result = tokio::select! {
                biased;
                _ = self.shutdown.closed() => return,
                result = writer.send(message) => result,
            };
            drop(writer);

            if let Err(e) = result {
                warn!(client_id = %self.client_id_display(), error = %e, "Writing control message failed");
                self.close();
                return;
            }
            last_write = Instant::now();
        }
    }

    async fn heartbeat_loop(&self) {
        let interval = self.heartbeat.interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.closed() => return,
                _ = ticker.tick() => {
                    let idle = self.since_last_read();
                    if idle > self.heartbeat.timeout {
                        warn!(
                            client_id = %self.client_id_display(),
                            idle_secs = idle.as_secs(),
                            "Server heartbeat timed out"
                        );
                        self.close();
                        return;
                    }
                    if !self.enqueue(ControlMessage::Ping).await {
                        return;
                    }
                }
            }
        }
    }

    /// Open a pipe and serve its streams until the pipe or the control closes
    async fn create_pipe(self: Arc<Self>) {
        let mut session = match self.open_pipe().await {
            Ok(session) => session,
            Err(e) => {
                error!(
                    client_id = %self.client_id_display(),
                    addr = %self.config.server_addr,
                    error = %e,
                    "Creating pipe failed"
                );
                return;
            }
        };

        let open = self.total_pipes.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(client_id = %self.client_id_display(), pipes = open, "Pipe established");
        let _pipe_guard = scopeguard::guard((), |_| {
            let remaining = self.total_pipes.fetch_sub(1, Ordering::SeqCst) - 1;
            debug!(client_id = %self.client_id_display(), pipes = remaining, "Pipe closed");
        });

        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.shutdown.closed() => return,
                accepted = session.accept_stream() => accepted,
            };

            match accepted {
                Ok(Some(stream)) => {
                    let forwarder = self.forwarder.clone();
                    tokio::spawn(async move { forwarder.handle(stream).await });
                }
                Ok(None) => return,
                Err(e) => {
                    warn!(client_id = %self.client_id_display(), error = %e, "Accepting pipe stream failed");
                    return;
                }
            }
        }
    }

    async fn open_pipe(&self) -> Result<PipeSession, PipeError> {
        let client_id = self.client_id().ok_or(PipeError::NotReady("client id"))?;
        let secret = if self.config.encrypt_mode.is_enabled() {
            Some(
                self.pre_master_secret
                    .get()
                    .ok_or(PipeError::NotReady("pre-master secret"))?,
            )
        } else {
            None
        };

        let conn = self.dialer.dial().await?;
        pipe::pipe_handshake(conn, client_id, secret).await
    }

    /// Write outside the transmit loop, holding the writer lock
    async fn write_direct(&self, message: ControlMessage) -> Result<(), ControlError> {
        let mut writer = self.writer.lock().await;
        tokio::select! {
            biased;
            _ = self.shutdown.closed() => Err(ControlError::Closed),
            result = writer.send(message) => result.map_err(ControlError::from),
        }
    }

    /// Queue a message for the transmit loop. False once closed.
    async fn enqueue(&self, message: ControlMessage) -> bool {
        tokio::select! {
            biased;
            _ = self.shutdown.closed() => false,
            sent = self.outbound_tx.send(message) => sent.is_ok(),
        }
    }

    fn touch_last_read(&self) {
        let nanos = self.epoch.elapsed().as_nanos() as u64;
        self.last_read.store(nanos, Ordering::SeqCst);
    }

    fn since_last_read(&self) -> Duration {
        let last = Duration::from_nanos(self.last_read.load(Ordering::SeqCst));
        self.epoch.elapsed().saturating_sub(last)
    }

    fn client_id_display(&self) -> String {
        self.client_id
            .get()
            .map(|id| id.simple().to_string())
            .unwrap_or_default()
    }
}
