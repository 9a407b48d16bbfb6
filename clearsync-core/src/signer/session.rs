use crate::error::Result;
use crate::signer::{address_of, keccak256, Signature};
use crate::types::{Address, ChannelState};
use k256::ecdsa::SigningKey;
use rand::rngs::OsRng;
use std::fmt;

/// Ephemeral signing identity for the lifetime of one client.
///
/// Owns no funds and is never written to disk. The auth handshake delegates
/// wallet authority to it; after that it signs every off-chain request and
/// the user's half of each channel state.
pub struct SessionKey {
    key: SigningKey,
    address: Address,
}

impl SessionKey {
    pub fn generate() -> Self {
        let key = SigningKey::random(&mut OsRng);
        let address = address_of(key.verifying_key());
        tracing::debug!("Generated session key {:?}", address);
        Self { key, address }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn sign_digest(&self, digest: &[u8; 32]) -> Result<Signature> {
        Signature::sign_prehash(&self.key, digest)
    }

    /// Sign an off-chain request payload: keccak256 over its JSON bytes.
    pub fn sign_payload(&self, payload: &[u8]) -> Result<Signature> {
        self.sign_digest(&keccak256(payload))
    }

    pub fn sign_state(&self, state: &ChannelState) -> Result<Signature> {
        self.sign_digest(&state.state_hash())
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKey")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_keys_are_distinct() {
        let a = SessionKey::generate();
        let b = SessionKey::generate();
        assert_ne!(a.address(), b.address());
    }

    #[test]
    fn test_debug_hides_secret() {
        let key = SessionKey::generate();
        let rendered = format!("{:?}", key);
        assert!(rendered.contains("address"));
        assert!(!rendered.contains("key:"));
    }
}
