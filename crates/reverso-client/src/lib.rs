//! Reverso tunnel client
//!
//! Keeps a control connection to a tunnel server, opens data pipes on the
//! server's request and forwards every stream carried by a pipe to the
//! local service registered under the stream's tunnel name.
//!
//! ```no_run
//! use reverso_client::{ClientConfig, Control};
//! use reverso_transport::Dialer;
//! use std::sync::Arc;
//!
//! # async fn connect(config: ClientConfig) -> Result<(), Box<dyn std::error::Error>> {
//! let conn = config.dialer().dial().await?;
//! let control = Arc::new(Control::new(conn, config));
//! control.client_handshake().await?;
//! control.client_add_tunnels().await?;
//! control.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod control;
pub mod forwarder;
pub mod pipe;
pub mod registry;
pub mod shutdown;
pub mod signal;
pub mod udp;

pub use config::{ClientConfig, ClientConfigBuilder, EncryptMode};
pub use control::{Control, ControlError, HeartbeatConfig};
pub use forwarder::{Forwarder, ForwardError, LocalEndpoint};
pub use pipe::{PipeError, PipeSession, PIPE_RECEIVE_BUFFER};
pub use registry::TunnelRegistry;
pub use shutdown::ShutdownHandle;
pub use udp::UdpStream;

// Re-export protocol types used in the public API
pub use reverso_proto::{ClientId, TunnelConfig, TunnelProtocol};
