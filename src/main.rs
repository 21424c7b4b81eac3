//! Reverso CLI - expose local services through a reverse tunnel
//!
//! Keeps a control connection to the tunnel server alive, reconnecting
//! with exponential backoff whenever it drops.

use anyhow::{Context, Result};
use clap::Parser;
use reverso_client::{
    ClientConfig, Control, ControlError, EncryptMode, TunnelConfig, TunnelProtocol,
};
use reverso_transport::{Dialer, TransportMode};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Reverso - tunnel your local services through a remote server
#[derive(Parser, Debug)]
#[command(name = "reverso")]
#[command(about = "Reverso - tunnel your local services through a remote server")]
#[command(version)]
#[command(long_about = r#"
Connect to a tunnel server and forward the server's streams to local
services. Automatically reconnects if the connection drops.

EXAMPLES:
  # Expose a local web server
  reverso --server tunnel.example.com:8867 --token $TOKEN \
    --tunnel web=http://127.0.0.1:8080

  # Use a YAML config file
  reverso --config reverso.yaml

ENVIRONMENT VARIABLES:
  REVERSO_CONFIG   Path to the YAML config file
  REVERSO_SERVER   Tunnel server address
  REVERSO_TOKEN    Authentication token
  REVERSO_PROXY    HTTP CONNECT proxy
    "#)]
struct Cli {
    /// YAML config file
    #[arg(short, long, env = "REVERSO_CONFIG")]
    config: Option<PathBuf>,

    /// Tunnel server address (e.g., tunnel.example.com:8867)
    #[arg(long, env = "REVERSO_SERVER")]
    server: Option<String>,

    /// Authentication token
    #[arg(long, env = "REVERSO_TOKEN")]
    token: Option<String>,

    /// Transport to the server: tcp or tls
    #[arg(long, value_parser = parse_transport)]
    transport: Option<TransportMode>,

    /// Pipe encryption: none or aes
    #[arg(long, value_parser = parse_encrypt_mode)]
    encrypt: Option<EncryptMode>,

    /// HTTP CONNECT proxy (e.g., http://proxy.local:3128)
    #[arg(long, env = "REVERSO_PROXY")]
    proxy: Option<String>,

    /// Tunnel as name=local_addr, repeatable (e.g., web=http://127.0.0.1:8080)
    #[arg(long = "tunnel", value_parser = parse_tunnel)]
    tunnels: Vec<(String, TunnelConfig)>,

    /// Skip server certificate verification (insecure, for development only)
    #[arg(long)]
    insecure: bool,

    /// Maximum reconnection attempts (0 = infinite)
    #[arg(long, default_value = "0")]
    max_reconnect_attempts: usize,

    /// Initial reconnection delay in seconds
    #[arg(long, default_value = "1")]
    reconnect_delay: u64,

    /// Maximum reconnection delay in seconds
    #[arg(long, default_value = "60")]
    max_reconnect_delay: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_transport(value: &str) -> Result<TransportMode, String> {
    match value {
        "tcp" => Ok(TransportMode::Tcp),
        "tls" => Ok(TransportMode::Tls),
        other => Err(format!("unknown transport '{}', expected tcp or tls", other)),
    }
}

fn parse_encrypt_mode(value: &str) -> Result<EncryptMode, String> {
    match value {
        "none" => Ok(EncryptMode::None),
        "aes" => Ok(EncryptMode::Aes),
        other => Err(format!("unknown encrypt mode '{}', expected none or aes", other)),
    }
}

fn parse_tunnel(value: &str) -> Result<(String, TunnelConfig), String> {
    let (name, local_addr) = value
        .split_once('=')
        .ok_or_else(|| format!("expected name=local_addr, got '{}'", value))?;

    let protocol = match local_addr.split_once("://").map(|(scheme, _)| scheme) {
        Some("https") => TunnelProtocol::Https,
        Some("tcp") | Some("tcp4") | Some("tcp6") => TunnelProtocol::Tcp,
        Some("udp") => TunnelProtocol::Udp,
        _ => TunnelProtocol::Http,
    };

    Ok((name.to_string(), TunnelConfig::new(protocol, local_addr)))
}

/// Setup logging; RUST_LOG overrides the verbosity flag
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn load_config(cli: &Cli) -> Result<ClientConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_yaml::from_str::<ClientConfig>(&content)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?
        }
        None => ClientConfig::default(),
    };

    if let Some(server) = &cli.server {
        config.server_addr = server.clone();
    }
    if let Some(token) = &cli.token {
        config.auth_token = token.clone();
    }
    if let Some(transport) = cli.transport {
        config.transport = transport;
    }
    if let Some(encrypt) = cli.encrypt {
        config.encrypt_mode = encrypt;
    }
    if let Some(proxy) = &cli.proxy {
        config.http_proxy = Some(proxy.clone());
    }
    if cli.insecure {
        config.insecure = true;
    }
    for (name, tunnel) in &cli.tunnels {
        config.tunnels.insert(name.clone(), tunnel.clone());
    }

    config.validate().map_err(anyhow::Error::msg)?;
    Ok(config)
}

/// One control connection from dial to close
async fn run_session(config: &ClientConfig) -> Result<()> {
    let conn = config
        .dialer()
        .dial()
        .await
        .with_context(|| format!("Failed to connect to {}", config.server_addr))?;

    let control = Arc::new(Control::new(conn, config.clone()));
    control.client_handshake().await?;
    control.client_add_tunnels().await?;

    info!(
        client_id = %control.client_id().map(|id| id.simple().to_string()).unwrap_or_default(),
        server = %config.server_addr,
        tunnels = config.tunnels.len(),
        "Connected to tunnel server"
    );

    control.run().await?;
    Ok(())
}

fn is_non_recoverable(err: &anyhow::Error) -> bool {
    err.downcast_ref::<ControlError>()
        .map(ControlError::is_non_recoverable)
        .unwrap_or(false)
}

/// Connect to the server with automatic reconnection
async fn connect_with_reconnect(
    config: ClientConfig,
    max_attempts: usize,
    initial_delay: Duration,
    max_delay: Duration,
) -> Result<()> {
    let mut attempt = 0;
    let mut current_delay = initial_delay;

    loop {
        attempt += 1;

        if max_attempts > 0 && attempt > max_attempts {
            error!("Maximum reconnection attempts ({}) reached", max_attempts);
            anyhow::bail!("Failed to connect after {} attempts", max_attempts);
        }

        info!(attempt, server = %config.server_addr, "Connecting to tunnel server");

        match run_session(&config).await {
            Ok(()) => {
                // Connection was established and later closed
                warn!("Control connection closed, reconnecting");
                attempt = 0;
                current_delay = initial_delay;
            }
            Err(e) if is_non_recoverable(&e) => {
                error!("Non-recoverable error: {:#}", e);
                return Err(e);
            }
            Err(e) => {
                error!("Connection error: {:#}", e);
                warn!(
                    "Reconnecting in {} seconds... (attempt {})",
                    current_delay.as_secs(),
                    attempt + 1
                );
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(current_delay) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                return Ok(());
            }
        }

        // Exponential backoff with max cap
        current_delay = std::cmp::min(current_delay * 2, max_delay);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let config = load_config(&cli)?;

    info!("Reverso starting...");
    info!("Server: {} ({})", config.server_addr, config.transport);
    for (name, tunnel) in &config.tunnels {
        info!("Tunnel {}: {} -> {}", name, tunnel.remote_addr(), tunnel.local_addr);
    }
    if config.insecure {
        warn!("Server certificate verification disabled (insecure mode)");
    }
    if !config.encrypt_mode.is_enabled() {
        warn!("Pipe encryption disabled");
    }

    connect_with_reconnect(
        config,
        cli.max_reconnect_attempts,
        Duration::from_secs(cli.reconnect_delay),
        Duration::from_secs(cli.max_reconnect_delay),
    )
    .await?;

    info!("Reverso stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tunnel() {
        let (name, tunnel) = parse_tunnel("web=https://127.0.0.1:8443").unwrap();
        assert_eq!(name, "web");
        assert_eq!(tunnel.protocol, TunnelProtocol::Https);
        assert_eq!(tunnel.local_addr, "https://127.0.0.1:8443");

        let (_, tunnel) = parse_tunnel("ssh=tcp://127.0.0.1:22").unwrap();
        assert_eq!(tunnel.protocol, TunnelProtocol::Tcp);

        let (_, tunnel) = parse_tunnel("app=127.0.0.1:3000").unwrap();
        assert_eq!(tunnel.protocol, TunnelProtocol::Http);

        assert!(parse_tunnel("no-separator").is_err());
    }

    #[test]
    fn test_cli_overrides_config() {
        let cli = Cli::parse_from([
            "reverso",
            "--server",
            "tunnel.example.com:8867",
            "--token",
            "secret",
            "--encrypt",
            "none",
            "--tunnel",
            "web=http://127.0.0.1:8080",
        ]);
        let config = load_config(&cli).unwrap();

        assert_eq!(config.server_addr, "tunnel.example.com:8867");
        assert_eq!(config.auth_token, "secret");
        assert_eq!(config.encrypt_mode, EncryptMode::None);
        assert_eq!(config.tunnels.len(), 1);
    }

    #[test]
    fn test_is_non_recoverable() {
        let rejected = anyhow::Error::from(ControlError::ServerRejected("bad token".into()));
        assert!(is_non_recoverable(&rejected));

        let io = anyhow::Error::from(ControlError::Io(std::io::Error::from(
            std::io::ErrorKind::ConnectionReset,
        )));
        assert!(!is_non_recoverable(&io));
    }
}
