//! Protocol message types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Identity assigned to a client by the server during the control handshake
pub type ClientId = Uuid;

/// Per-pipe random nonce sent in the pipe hello
pub type PipeNonce = Uuid;

/// Main control protocol message enum
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ControlMessage {
    ControlClientHello(ControlClientHello),
    ControlServerHello(ControlServerHello),
    PipeClientHello(PipeClientHello),
    AddTunnels(AddTunnels),
    /// Server asks the client to open one more data pipe
    PipeReq,
    Ping,
    Pong,
    Error(ErrorMessage),
}

impl ControlMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            ControlMessage::ControlClientHello(_) => MessageType::ControlClientHello,
            ControlMessage::ControlServerHello(_) => MessageType::ControlServerHello,
            ControlMessage::PipeClientHello(_) => MessageType::PipeClientHello,
            ControlMessage::AddTunnels(_) => MessageType::AddTunnels,
            ControlMessage::PipeReq => MessageType::PipeReq,
            ControlMessage::Ping => MessageType::Ping,
            ControlMessage::Pong => MessageType::Pong,
            ControlMessage::Error(_) => MessageType::Error,
        }
    }

    /// Ping and Pong carry no payload and may be dropped by the sender's rate limiter
    pub fn is_keepalive(&self) -> bool {
        matches!(self, ControlMessage::Ping | ControlMessage::Pong)
    }
}

/// Discriminant of a [`ControlMessage`], used for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    ControlClientHello,
    ControlServerHello,
    PipeClientHello,
    AddTunnels,
    PipeReq,
    Ping,
    Pong,
    Error,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::ControlClientHello => "control-client-hello",
            MessageType::ControlServerHello => "control-server-hello",
            MessageType::PipeClientHello => "pipe-client-hello",
            MessageType::AddTunnels => "add-tunnels",
            MessageType::PipeReq => "pipe-request",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::Error => "error",
        };
        f.write_str(name)
    }
}

/// First message on a new control connection
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ControlClientHello {
    /// Client key-exchange public material, absent when encryption is disabled
    pub cipher_key: Option<Vec<u8>>,
    pub auth_token: String,
}

/// Server reply to [`ControlClientHello`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlServerHello {
    pub client_id: ClientId,
    /// Server key-exchange public material, absent when encryption is disabled
    pub cipher_key: Option<Vec<u8>>,
}

/// First message on a new pipe connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipeClientHello {
    pub once: PipeNonce,
    pub client_id: ClientId,
}

/// Tunnel definitions keyed by tunnel name
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AddTunnels {
    pub tunnels: HashMap<String, TunnelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorMessage {
    pub message: String,
}

impl fmt::Display for ErrorMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Header written by the server at the start of every logical stream in a pipe
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamHeader {
    pub tunnel: String,
}

/// Public protocol a tunnel is exposed with
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TunnelProtocol {
    #[default]
    Http,
    Https,
    Tcp,
    Udp,
}

impl fmt::Display for TunnelProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TunnelProtocol::Http => "http",
            TunnelProtocol::Https => "https",
            TunnelProtocol::Tcp => "tcp",
            TunnelProtocol::Udp => "udp",
        };
        f.write_str(name)
    }
}

/// Configuration of one named tunnel
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TunnelConfig {
    #[serde(default)]
    pub protocol: TunnelProtocol,
    /// Local service, e.g. `http://127.0.0.1:8080` or `unix:///run/app.sock`
    pub local_addr: String,
    #[serde(default)]
    pub subdomain: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub remote_port: Option<u16>,
    #[serde(default)]
    pub http_host_rewrite: Option<String>,
}

impl TunnelConfig {
    pub fn new(protocol: TunnelProtocol, local_addr: impl Into<String>) -> Self {
        Self {
            protocol,
            local_addr: local_addr.into(),
            ..Default::default()
        }
    }

    /// Remote descriptor used to identify the tunnel in logs
    pub fn remote_addr(&self) -> String {
        match self.protocol {
            TunnelProtocol::Http | TunnelProtocol::Https => {
                let host = self
                    .hostname
                    .as_deref()
                    .or(self.subdomain.as_deref())
                    .unwrap_or("");
                format!("{}://{}", self.protocol, host)
            }
            TunnelProtocol::Tcp | TunnelProtocol::Udp => {
                format!("{}://:{}", self.protocol, self.remote_port.unwrap_or(0))
            }
        }
    }
}
