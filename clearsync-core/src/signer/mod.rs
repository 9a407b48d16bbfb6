pub mod eip712;
pub mod local;
pub mod remote;
pub mod session;
pub mod transaction;

pub use eip712::{AuthAllowance, AuthPolicy, TypedData};
pub use local::LocalWallet;
pub use remote::RpcWallet;
pub use session::SessionKey;
pub use transaction::LegacyTransaction;

use crate::error::{ClearsyncError, Result};
use crate::types::Address;
use async_trait::async_trait;
use k256::ecdsa::{RecoveryId, SigningKey, VerifyingKey};
use sha3::{Digest, Keccak256};
use std::fmt;

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Ethereum address of a secp256k1 public key.
pub fn address_of(key: &VerifyingKey) -> Address {
    let point = key.to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);
    Address::from_slice(&hash[12..])
}

/// Recoverable secp256k1 signature, `v` in Ethereum form (27/28).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    pub r: [u8; 32],
    pub s: [u8; 32],
    pub v: u8,
}

impl Signature {
    pub(crate) fn sign_prehash(key: &SigningKey, digest: &[u8; 32]) -> Result<Self> {
        let (sig, recovery_id) = key
            .sign_prehash_recoverable(digest)
            .map_err(|e| ClearsyncError::signing(format!("Failed to sign digest: {}", e)))?;
        let bytes = sig.to_bytes();
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[..32]);
        s.copy_from_slice(&bytes[32..]);
        Ok(Self {
            r,
            s,
            v: 27 + recovery_id.to_byte(),
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 65 {
            return Err(ClearsyncError::signing(format!(
                "Signature must be 65 bytes, got {}",
                bytes.len()
            )));
        }
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[..32]);
        s.copy_from_slice(&bytes[32..64]);
        let v = match bytes[64] {
            0 | 1 => bytes[64] + 27,
            v => v,
        };
        Ok(Self { r, s, v })
    }

    pub fn from_hex(value: &str) -> Result<Self> {
        let bytes = hex::decode(value.strip_prefix("0x").unwrap_or(value))
            .map_err(|e| ClearsyncError::signing(format!("Invalid signature hex: {}", e)))?;
        Self::from_bytes(&bytes)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(65);
        out.extend_from_slice(&self.r);
        out.extend_from_slice(&self.s);
        out.push(self.v);
        out
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.to_bytes()))
    }

    pub fn recovery_byte(&self) -> u8 {
        self.v.saturating_sub(27)
    }

    /// Address whose key produced this signature over `digest`.
    pub fn recover(&self, digest: &[u8; 32]) -> Result<Address> {
        let mut rs = [0u8; 64];
        rs[..32].copy_from_slice(&self.r);
        rs[32..].copy_from_slice(&self.s);
        let sig = k256::ecdsa::Signature::from_slice(&rs)
            .map_err(|e| ClearsyncError::signing(format!("Malformed signature: {}", e)))?;
        let recovery_id = RecoveryId::from_byte(self.recovery_byte())
            .ok_or_else(|| ClearsyncError::signing(format!("Invalid recovery byte {}", self.v)))?;
        let key = VerifyingKey::recover_from_prehash(digest, &sig, recovery_id)
            .map_err(|e| ClearsyncError::signing(format!("Recovery failed: {}", e)))?;
        Ok(address_of(&key))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", self.to_hex())
    }
}

/// The user's long-lived wallet identity.
///
/// Used only for on-chain transactions and the one-time auth challenge;
/// every other message is signed by the [`SessionKey`].
#[async_trait]
pub trait WalletSigner: Send + Sync {
    fn address(&self) -> Address;

    async fn sign_typed_data(&self, data: &TypedData) -> Result<Signature>;

    /// Returns the RLP-encoded signed transaction, ready for broadcast.
    async fn sign_transaction(&self, tx: &LegacyTransaction) -> Result<Vec<u8>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keccak_empty() {
        assert_eq!(
            hex::encode(keccak256(b"")),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn test_signature_recovers_signer() {
        let key = SessionKey::generate();
        let digest = keccak256(b"clearsync");
        let sig = key.sign_digest(&digest).unwrap();
        assert_eq!(sig.recover(&digest).unwrap(), key.address());

        let parsed = Signature::from_hex(&sig.to_hex()).unwrap();
        assert_eq!(parsed, sig);
    }

    #[test]
    fn test_known_address_derivation() {
        // Well-known development key (anvil account #0)
        let wallet = LocalWallet::from_hex(
            "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80",
        )
        .unwrap();
        assert_eq!(
            format!("{:?}", wallet.address()),
            "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"
        );
    }
}
