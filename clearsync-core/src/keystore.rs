//! Password-encrypted wallet key at rest.

use crate::error::{ClearsyncError, Result};
use crate::signer::{LocalWallet, WalletSigner};
use crate::types::Address;
use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

// ChaCha20Poly1305 for authenticated encryption
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};

const SALT_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const PBKDF2_ROUNDS: u32 = 100_000;
const KEYSTORE_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedKey {
    pub version: u32,
    pub address: Address,
    pub encryption_method: String,
    #[serde(with = "b64")]
    pub salt: Vec<u8>,
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

impl EncryptedKey {
    /// Encrypt the wallet's secret with `password`.
    pub fn encrypt(wallet: &LocalWallet, password: &str) -> Result<Self> {
        if password.is_empty() {
            return Err(ClearsyncError::validation("Password must not be empty"));
        }

        let mut salt = [0u8; SALT_SIZE];
        OsRng.fill_bytes(&mut salt);
        let key = derive_key(password, &salt);
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);

        let cipher = ChaCha20Poly1305::new(&key);
        let ciphertext = cipher
            .encrypt(&nonce, wallet.secret_bytes().as_slice())
            .map_err(|e| ClearsyncError::internal(format!("Encryption failed: {}", e)))?;

        Ok(Self {
            version: KEYSTORE_VERSION,
            address: wallet.address(),
            encryption_method: "ChaCha20Poly1305".to_string(),
            salt: salt.to_vec(),
            nonce: nonce.to_vec(),
            checksum: calculate_checksum(&ciphertext),
            ciphertext,
            created_at: Utc::now(),
        })
    }

    pub fn decrypt(&self, password: &str) -> Result<LocalWallet> {
        if self.version != KEYSTORE_VERSION {
            return Err(ClearsyncError::config(format!(
                "Unsupported keystore version {}",
                self.version
            )));
        }
        if calculate_checksum(&self.ciphertext) != self.checksum {
            return Err(ClearsyncError::internal(
                "Keystore checksum verification failed",
            ));
        }
        if self.nonce.len() != NONCE_SIZE {
            return Err(ClearsyncError::internal("Keystore nonce has wrong length"));
        }

        let key = derive_key(password, &self.salt);
        let cipher = ChaCha20Poly1305::new(&key);
        let secret = cipher
            .decrypt(Nonce::from_slice(&self.nonce), self.ciphertext.as_ref())
            .map_err(|_| ClearsyncError::signing("Wrong password or corrupt keystore"))?;

        let wallet = LocalWallet::from_bytes(&secret)?;
        if wallet.address() != self.address {
            return Err(ClearsyncError::signing(format!(
                "Keystore decrypted to {:?}, expected {:?}",
                wallet.address(),
                self.address
            )));
        }
        Ok(wallet)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, serde_json::to_vec_pretty(self)?).await?;
        tracing::info!("Wrote keystore for {:?} to {}", self.address, path.display());
        Ok(())
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            ClearsyncError::config(format!("Cannot read keystore {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Derive encryption key from password using PBKDF2
fn derive_key(password: &str, salt: &[u8]) -> Key {
    use pbkdf2::pbkdf2_hmac;

    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ROUNDS, &mut key);
    *Key::from_slice(&key)
}

fn calculate_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

mod b64 {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&general_purpose::STANDARD.encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(s.as_bytes())
            .map_err(de::Error::custom)
    }
}
