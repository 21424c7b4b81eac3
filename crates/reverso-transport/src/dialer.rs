//! Dialing the tunnel server

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use crate::proxy::connect_via_proxy;
use crate::tls::{build_insecure_tls_connector, build_tls_connector, server_name};
use crate::{split_host_port, BoxedStream, TransportError, TransportMode, TransportResult};

/// Opens new raw connections to the tunnel server
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self) -> TransportResult<BoxedStream>;
}

/// Dialer for the configured server address, transport mode and proxy
#[derive(Debug, Clone)]
pub struct TransportDialer {
    server_addr: String,
    mode: TransportMode,
    http_proxy: Option<String>,
    insecure: bool,
}

impl TransportDialer {
    pub fn new(server_addr: impl Into<String>, mode: TransportMode) -> Self {
        Self {
            server_addr: server_addr.into(),
            mode,
            http_proxy: None,
            insecure: false,
        }
    }

    pub fn with_http_proxy(mut self, proxy: Option<String>) -> Self {
        self.http_proxy = proxy;
        self
    }

    /// Skip server certificate verification in TLS mode
    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    async fn connect_tcp(&self) -> TransportResult<TcpStream> {
        let stream = match &self.http_proxy {
            Some(proxy) => connect_via_proxy(proxy, &self.server_addr).await?,
            None => TcpStream::connect(&self.server_addr).await.map_err(|source| {
                TransportError::ConnectionFailed {
                    addr: self.server_addr.clone(),
                    source,
                }
            })?,
        };

        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[async_trait]
impl Dialer for TransportDialer {
    async fn dial(&self) -> TransportResult<BoxedStream> {
        let tcp = self.connect_tcp().await?;

        match self.mode {
            TransportMode::Tcp => {
                debug!(addr = %self.server_addr, "Connected to server over TCP");
                Ok(Box::new(tcp))
            }
            TransportMode::Tls => {
                let (host, _) = split_host_port(&self.server_addr)?;
                let connector = if self.insecure {
                    build_insecure_tls_connector()
                } else {
                    build_tls_connector()
                };

                let tls = connector
                    .connect(server_name(&host)?, tcp)
                    .await
                    .map_err(|e| TransportError::TlsError(e.to_string()))?;

                debug!(addr = %self.server_addr, "Connected to server over TLS");
                Ok(Box::new(tls))
            }
        }
    }
}
