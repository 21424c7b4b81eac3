//! Transport layer for reverso connections
//!
//! Produces raw byte-stream connections to the tunnel server (plain TCP or
//! TLS, optionally through an HTTP CONNECT proxy) and the rustls connectors
//! shared with local backend dialing.

pub mod dialer;
pub mod proxy;
pub mod tls;

pub use dialer::{Dialer, TransportDialer};
pub use tls::{build_insecure_tls_connector, build_tls_connector};

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Any bidirectional async byte stream that can be moved across tasks
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Type-erased connection handed between the transport and protocol layers
pub type BoxedStream = Box<dyn AsyncStream>;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection to {addr} failed: {source}")]
    ConnectionFailed {
        addr: String,
        source: std::io::Error,
    },

    #[error("Proxy error: {0}")]
    ProxyError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// How connections to the tunnel server are carried
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    #[default]
    Tcp,
    Tls,
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportMode::Tcp => f.write_str("tcp"),
            TransportMode::Tls => f.write_str("tls"),
        }
    }
}

/// Split `host:port`, accepting bracketed IPv6 literals
pub fn split_host_port(addr: &str) -> TransportResult<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| TransportError::InvalidAddress(format!("missing port in '{}'", addr)))?;

    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(TransportError::InvalidAddress(format!(
            "missing host in '{}'",
            addr
        )));
    }

    let port = port
        .parse::<u16>()
        .map_err(|_| TransportError::InvalidAddress(format!("invalid port in '{}'", addr)))?;

    Ok((host.to_string(), port))
}
