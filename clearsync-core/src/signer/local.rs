use crate::error::{ClearsyncError, Result};
use crate::signer::{address_of, LegacyTransaction, Signature, TypedData, WalletSigner};
use crate::types::Address;
use async_trait::async_trait;
use k256::ecdsa::SigningKey;
use rand::rngs::OsRng;
use std::fmt;

/// Wallet key held in process memory.
pub struct LocalWallet {
    key: SigningKey,
    address: Address,
}

impl LocalWallet {
    pub fn random() -> Self {
        let key = SigningKey::random(&mut OsRng);
        let address = address_of(key.verifying_key());
        Self { key, address }
    }

    pub fn from_bytes(secret: &[u8]) -> Result<Self> {
        let key = SigningKey::from_slice(secret)
            .map_err(|e| ClearsyncError::signing(format!("Invalid private key: {}", e)))?;
        let address = address_of(key.verifying_key());
        Ok(Self { key, address })
    }

    pub fn from_hex(secret: &str) -> Result<Self> {
        let trimmed = secret.trim();
        let bytes = hex::decode(trimmed.strip_prefix("0x").unwrap_or(trimmed))
            .map_err(|e| ClearsyncError::signing(format!("Invalid private key hex: {}", e)))?;
        Self::from_bytes(&bytes)
    }

    /// Secret bytes, for writing into the encrypted keystore.
    pub fn secret_bytes(&self) -> Vec<u8> {
        self.key.to_bytes().to_vec()
    }
}

impl fmt::Debug for LocalWallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalWallet")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl WalletSigner for LocalWallet {
    fn address(&self) -> Address {
        self.address
    }

    async fn sign_typed_data(&self, data: &TypedData) -> Result<Signature> {
        Signature::sign_prehash(&self.key, &data.digest())
    }

    async fn sign_transaction(&self, tx: &LegacyTransaction) -> Result<Vec<u8>> {
        let signature = Signature::sign_prehash(&self.key, &tx.signing_hash())?;
        Ok(tx.encode_signed(&signature))
    }
}
