//! Reverso Protocol Definitions
//!
//! This crate defines the control messages, tunnel descriptions and the
//! framing codec spoken between the tunnel client and the tunnel server.

pub mod codec;
pub mod messages;

pub use codec::{read_message, read_message_limited, write_message, CodecError, MessageCodec};
pub use messages::*;

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Maximum size of the header tagging a multiplexed stream
pub const MAX_STREAM_HEADER_SIZE: usize = 4 * 1024;
