//! Client configuration

use reverso_proto::TunnelConfig;
use reverso_transport::{TransportDialer, TransportMode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Session encryption negotiated on the control connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptMode {
    /// Pipes carry plaintext
    None,
    /// X25519 handshake, AES-128-CTR on every pipe
    #[default]
    Aes,
}

impl EncryptMode {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, EncryptMode::None)
    }
}

/// Immutable client configuration, passed explicitly into the control layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Tunnel server address (host:port)
    pub server_addr: String,
    #[serde(default)]
    pub transport: TransportMode,
    /// Optional HTTP CONNECT proxy, e.g. `http://proxy.local:3128`
    #[serde(default)]
    pub http_proxy: Option<String>,
    #[serde(default)]
    pub auth_token: String,
    #[serde(default)]
    pub encrypt_mode: EncryptMode,
    /// Skip certificate verification of the tunnel server in TLS mode
    #[serde(default)]
    pub insecure: bool,
    /// Verify certificates of https local backends.
    ///
    /// Off by default: local backends sit inside the trust boundary and
    /// commonly use self-signed certificates.
    #[serde(default)]
    pub verify_local_tls: bool,
    #[serde(default)]
    pub tunnels: HashMap<String, TunnelConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: String::new(),
            transport: TransportMode::Tcp,
            http_proxy: None,
            auth_token: String::new(),
            encrypt_mode: EncryptMode::Aes,
            insecure: false,
            verify_local_tls: false,
            tunnels: HashMap::new(),
        }
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Dialer for the control connection and for new pipes
    pub fn dialer(&self) -> TransportDialer {
        TransportDialer::new(self.server_addr.clone(), self.transport)
            .with_http_proxy(self.http_proxy.clone())
            .with_insecure(self.insecure)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.server_addr.is_empty() {
            return Err("server_addr is required".to_string());
        }
        for (name, tunnel) in &self.tunnels {
            if name.is_empty() {
                return Err("tunnel names must not be empty".to_string());
            }
            if tunnel.local_addr.is_empty() {
                return Err(format!("tunnel '{}' has no local_addr", name));
            }
        }
        Ok(())
    }
}

/// Builder for ClientConfig
#[derive(Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn server_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.server_addr = addr.into();
        self
    }

    pub fn transport(mut self, transport: TransportMode) -> Self {
        self.config.transport = transport;
        self
    }

    pub fn http_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.config.http_proxy = Some(proxy.into());
        self
    }

    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.config.auth_token = token.into();
        self
    }

    pub fn encrypt_mode(mut self, mode: EncryptMode) -> Self {
        self.config.encrypt_mode = mode;
        self
    }

    pub fn insecure(mut self, insecure: bool) -> Self {
        self.config.insecure = insecure;
        self
    }

    pub fn verify_local_tls(mut self, verify: bool) -> Self {
        self.config.verify_local_tls = verify;
        self
    }

    pub fn tunnel(mut self, name: impl Into<String>, tunnel: TunnelConfig) -> Self {
        self.config.tunnels.insert(name.into(), tunnel);
        self
    }

    pub fn build(self) -> Result<ClientConfig, String> {
        self.config.validate()?;
        Ok(self.config)
    }
}
