//! Forwarding of pipe streams to local services

use reverso_proto::{
    read_message_limited, CodecError, StreamHeader, TunnelConfig, TunnelProtocol,
    MAX_STREAM_HEADER_SIZE,
};
use reverso_transport::tls::server_name;
use reverso_transport::{build_insecure_tls_connector, build_tls_connector, BoxedStream};
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio_rustls::TlsConnector;
use tracing::{debug, error, warn};

use crate::registry::TunnelRegistry;
use crate::udp::UdpStream;

/// Errors that can occur while forwarding one stream
#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("Reading stream header failed: {0}")]
    Header(#[from] CodecError),

    #[error("Unknown tunnel: {0}")]
    UnknownTunnel(String),

    #[error("Invalid local address: {0}")]
    InvalidLocalAddr(String),

    #[error("Unsupported local scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Failed to connect to local address {address}: {source}")]
    ConnectionFailed {
        address: String,
        source: std::io::Error,
    },

    #[error("TLS handshake with {address} failed: {message}")]
    Tls { address: String, message: String },
}

/// Where a tunnel's local service lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEndpoint {
    Tcp { host: String, port: u16 },
    Tls { host: String, port: u16 },
    Unix { path: PathBuf },
    /// Any other scheme; tcp, tcp4, tcp6, udp, udp4 and udp6 can be dialed
    Other {
        scheme: String,
        host: String,
        port: u16,
    },
}

impl fmt::Display for LocalEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalEndpoint::Tcp { host, port } => write!(f, "tcp://{}", join_host_port(host, *port)),
            LocalEndpoint::Tls { host, port } => write!(f, "tls://{}", join_host_port(host, *port)),
            LocalEndpoint::Unix { path } => write!(f, "unix://{}", path.display()),
            LocalEndpoint::Other { scheme, host, port } => {
                write!(f, "{}://{}", scheme, join_host_port(host, *port))
            }
        }
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

struct ParsedAddr {
    scheme: String,
    host: String,
    port: Option<u16>,
}

/// Split `scheme://host:port/path` into its parts. A missing scheme is empty.
fn parse_local_addr(addr: &str) -> Result<ParsedAddr, ForwardError> {
    let invalid = || ForwardError::InvalidLocalAddr(addr.to_string());

    let (scheme, rest) = match addr.split_once("://") {
        Some((scheme, rest)) => (scheme.to_ascii_lowercase(), rest),
        None => (String::new(), addr),
    };

    if scheme == "unix" {
        if rest.is_empty() {
            return Err(invalid());
        }
        return Ok(ParsedAddr {
            scheme,
            host: rest.to_string(),
            port: None,
        });
    }

    let authority = rest.split('/').next().unwrap_or_default();
    if authority.is_empty() {
        return Err(invalid());
    }

    let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
        let (host, tail) = bracketed.split_once(']').ok_or_else(invalid)?;
        let port = match tail.strip_prefix(':') {
            Some(port) => Some(port.parse::<u16>().map_err(|_| invalid())?),
            None if tail.is_empty() => None,
            None => return Err(invalid()),
        };
        (host, port)
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port.parse::<u16>().map_err(|_| invalid())?)),
            None => (authority, None),
        }
    };

    if host.is_empty() {
        return Err(invalid());
    }

    Ok(ParsedAddr {
        scheme,
        host: host.to_string(),
        port,
    })
}

impl LocalEndpoint {
    /// Classify a tunnel's local address.
    ///
    /// http(s) and scheme-less addresses default to ports 80/443 and are
    /// wrapped in TLS when the tunnel is exposed as https.
    pub fn resolve(tunnel: &TunnelConfig) -> Result<Self, ForwardError> {
        let parsed = parse_local_addr(&tunnel.local_addr)?;

        match parsed.scheme.as_str() {
            "unix" => Ok(LocalEndpoint::Unix {
                path: PathBuf::from(parsed.host),
            }),
            "" | "http" | "https" => {
                let default_port = if parsed.scheme == "https" { 443 } else { 80 };
                let port = parsed.port.unwrap_or(default_port);
                if tunnel.protocol == TunnelProtocol::Https {
                    Ok(LocalEndpoint::Tls {
                        host: parsed.host,
                        port,
                    })
                } else {
                    Ok(LocalEndpoint::Tcp {
                        host: parsed.host,
                        port,
                    })
                }
            }
            _ => {
                let port = parsed
                    .port
                    .ok_or_else(|| ForwardError::InvalidLocalAddr(tunnel.local_addr.clone()))?;
                Ok(LocalEndpoint::Other {
                    scheme: parsed.scheme,
                    host: parsed.host,
                    port,
                })
            }
        }
    }
}

/// Routes streams to local services by tunnel name
pub struct Forwarder {
    registry: Arc<TunnelRegistry>,
    tls: TlsConnector,
}

impl Forwarder {
    pub fn new(registry: Arc<TunnelRegistry>, verify_local_tls: bool) -> Self {
        let tls = if verify_local_tls {
            build_tls_connector()
        } else {
            build_insecure_tls_connector()
        };
        Self { registry, tls }
    }

    /// Forward one stream, logging instead of returning failures
    pub async fn handle<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        match self.forward(stream).await {
            Ok(()) => {}
            Err(ForwardError::UnknownTunnel(name)) => {
                error!(tunnel = %name, "Can't find tunnel by name");
            }
            Err(e @ ForwardError::Header(_)) => {
                debug!(error = %e, "Stream closed before header");
            }
            Err(e) => {
                warn!(error = %e, "Forwarding stream failed");
            }
        }
    }

    /// Read the stream header, dial the tunnel's local service and bridge
    /// the two until either side finishes. The stream is dropped on error.
    pub async fn forward<S>(&self, mut stream: S) -> Result<(), ForwardError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let header: StreamHeader =
            read_message_limited(&mut stream, MAX_STREAM_HEADER_SIZE).await?;
        let tunnel = self
            .registry
            .get(&header.tunnel)
            .await
            .ok_or_else(|| ForwardError::UnknownTunnel(header.tunnel.clone()))?;

        let endpoint = LocalEndpoint::resolve(&tunnel)?;
        let local = self.dial(&endpoint).await?;

        debug!(tunnel = %header.tunnel, local = %endpoint, "Forwarding stream");
        bridge(stream, local).await;
        Ok(())
    }

    async fn dial(&self, endpoint: &LocalEndpoint) -> Result<BoxedStream, ForwardError> {
        let connection_failed = |source| ForwardError::ConnectionFailed {
            address: endpoint.to_string(),
            source,
        };

        match endpoint {
            LocalEndpoint::Tcp { host, port } => {
                let tcp = TcpStream::connect((host.as_str(), *port))
                    .await
                    .map_err(connection_failed)?;
                Ok(Box::new(tcp))
            }
            LocalEndpoint::Tls { host, port } => {
                let tcp = TcpStream::connect((host.as_str(), *port))
                    .await
                    .map_err(connection_failed)?;
                let tls_error = |message: String| ForwardError::Tls {
                    address: endpoint.to_string(),
                    message,
                };
                let name = server_name(host).map_err(|e| tls_error(e.to_string()))?;
                let tls = self
                    .tls
                    .connect(name, tcp)
                    .await
                    .map_err(|e| tls_error(e.to_string()))?;
                Ok(Box::new(tls))
            }
            LocalEndpoint::Unix { path } => dial_unix(path).await.map_err(connection_failed),
            LocalEndpoint::Other { scheme, host, port } => {
                let (datagram, family) = match scheme.as_str() {
                    "tcp" => (false, AddrFamily::Any),
                    "tcp4" => (false, AddrFamily::V4),
                    "tcp6" => (false, AddrFamily::V6),
                    "udp" => (true, AddrFamily::Any),
                    "udp4" => (true, AddrFamily::V4),
                    "udp6" => (true, AddrFamily::V6),
                    other => return Err(ForwardError::UnsupportedScheme(other.to_string())),
                };

                let addrs = lookup(host, *port, family).await.map_err(connection_failed)?;
                if datagram {
                    let udp = connect_udp(&addrs).await.map_err(connection_failed)?;
                    Ok(Box::new(udp))
                } else {
                    let tcp = connect_tcp(&addrs).await.map_err(connection_failed)?;
                    Ok(Box::new(tcp))
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AddrFamily {
    Any,
    V4,
    V6,
}

impl AddrFamily {
    fn matches(self, addr: &SocketAddr) -> bool {
        match self {
            AddrFamily::Any => true,
            AddrFamily::V4 => addr.is_ipv4(),
            AddrFamily::V6 => addr.is_ipv6(),
        }
    }
}

/// Resolve `host:port`, keeping only addresses of `family`
async fn lookup(host: &str, port: u16, family: AddrFamily) -> io::Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await?
        .filter(|addr| family.matches(addr))
        .collect();

    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no {:?} address found for '{}'", family, host),
        ));
    }
    Ok(addrs)
}

async fn connect_tcp(addrs: &[SocketAddr]) -> io::Result<TcpStream> {
    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable)))
}

async fn connect_udp(addrs: &[SocketAddr]) -> io::Result<UdpStream> {
    let mut last_error = None;
    for addr in addrs {
        let bind: SocketAddr = if addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let attempt = async {
            let socket = UdpSocket::bind(bind).await?;
            socket.connect(addr).await?;
            Ok::<_, io::Error>(socket)
        };
        match attempt.await {
            Ok(socket) => return Ok(UdpStream::new(socket)),
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable)))
}

#[cfg(unix)]
async fn dial_unix(path: &std::path::Path) -> std::io::Result<BoxedStream> {
    let stream = tokio::net::UnixStream::connect(path).await?;
    Ok(Box::new(stream))
}

#[cfg(not(unix))]
async fn dial_unix(_path: &std::path::Path) -> std::io::Result<BoxedStream> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "unix sockets are not supported on this platform",
    ))
}

/// Copy bytes both ways until the first direction finishes, then shut
/// down both write sides.
pub async fn bridge<A, B>(stream: A, local: B)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut stream_read, mut stream_write) = tokio::io::split(stream);
    let (mut local_read, mut local_write) = tokio::io::split(local);

    tokio::select! {
        result = tokio::io::copy(&mut stream_read, &mut local_write) => match result {
            Ok(bytes) => debug!(bytes, "Remote side finished"),
            Err(e) => debug!(error = %e, "Copy to local service failed"),
        },
        result = tokio::io::copy(&mut local_read, &mut stream_write) => match result {
            Ok(bytes) => debug!(bytes, "Local side finished"),
            Err(e) => debug!(error = %e, "Copy to remote side failed"),
        },
    }

    let _ = stream_write.shutdown().await;
    let _ = local_write.shutdown().await;
}
