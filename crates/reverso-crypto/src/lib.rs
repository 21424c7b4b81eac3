//! Session-key primitives used by the tunnel client.
//!
//! - [`KeyExchange`]: ephemeral X25519 producing the control-level pre-master secret
//! - [`prf`]: TLS 1.2 PRF (P_SHA256) deriving per-pipe keys
//! - [`CipherStream`]: AES-128-CTR wrapper over any async byte stream

pub mod cipher;
pub mod exchange;
pub mod prf;

pub use cipher::{CipherRole, CipherStream};
pub use exchange::{KeyExchange, PreMasterSecret};
pub use prf::prf;

use thiserror::Error;

/// Length of the per-pipe session key
pub const SESSION_KEY_LEN: usize = 16;

/// Length of an X25519 public key
pub const PUBLIC_KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("key exchange produced a non-contributory shared secret")]
    NonContributory,

    #[error("key exchange failed: {0}")]
    KeyExchange(String),
}
