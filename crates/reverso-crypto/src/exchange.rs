//! Ephemeral X25519 key exchange for the control handshake.

use rand::rngs::OsRng;
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::{CryptoError, PUBLIC_KEY_LEN};

/// Shared secret established by the control handshake.
///
/// Written once by the handshake and only read afterwards.
#[derive(Clone, PartialEq, Eq)]
pub struct PreMasterSecret([u8; 32]);

impl PreMasterSecret {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for PreMasterSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PreMasterSecret(..)")
    }
}

/// One side of a key exchange in progress.
pub struct KeyExchange {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl KeyExchange {
    /// Generate a fresh ephemeral keypair.
    pub fn generate() -> Result<Self, CryptoError> {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Ok(Self { secret, public })
    }

    /// Public material sent to the peer.
    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        *self.public.as_bytes()
    }

    /// Combine our private key with the peer's public material.
    pub fn complete(self, peer_public: &[u8]) -> Result<PreMasterSecret, CryptoError> {
        let peer: [u8; PUBLIC_KEY_LEN] =
            peer_public
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: PUBLIC_KEY_LEN,
                    actual: peer_public.len(),
                })?;

        let shared = self.secret.diffie_hellman(&PublicKey::from(peer));
        if !shared.was_contributory() {
            return Err(CryptoError::NonContributory);
        }

        Ok(PreMasterSecret(shared.to_bytes()))
    }
}
