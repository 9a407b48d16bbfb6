pub mod channel;
pub mod config;
pub mod custody;
pub mod session;
pub mod wallet;

pub use channel::{handle_channel_command, ChannelCommands};
pub use config::{handle_config_command, ConfigCommands};
pub use custody::{handle_custody_command, CustodyCommands};
pub use session::{handle_session_command, SessionCommands};
pub use wallet::{handle_wallet_command, WalletCommands};

use crate::config::CliConfig;
use clearsync_core::{
    parse_units, ChannelClient, ClearsyncError, EncryptedKey, LocalWallet, Result, Storage, U256,
};
use dialoguer::Password;
use std::sync::Arc;

const PASSWORD_ENV: &str = "CLEARSYNC_PASSWORD";

/// What every command needs: the loaded config and a way to unlock the wallet.
pub struct Context {
    pub config: CliConfig,
}

impl Context {
    pub fn new(config: CliConfig) -> Self {
        Self { config }
    }

    pub fn parse_amount(&self, amount: &str) -> Result<U256> {
        parse_units(amount, self.config.client.token_decimals)
    }

    pub async fn unlock_wallet(&self) -> Result<LocalWallet> {
        let path = self.config.keystore_path();
        if !tokio::fs::try_exists(&path).await? {
            return Err(ClearsyncError::config(format!(
                "No wallet at {}; create one with 'clearsync wallet create'",
                path.display()
            )));
        }
        let keystore = EncryptedKey::load(&path).await?;
        let password = match std::env::var(PASSWORD_ENV) {
            Ok(password) => password,
            Err(_) => Password::new()
                .with_prompt(format!("Password for {:?}", keystore.address))
                .interact()
                .map_err(|e| ClearsyncError::dialog(e.to_string()))?,
        };
        keystore.decrypt(&password)
    }

    /// A client over the local database and the configured custody contract.
    pub async fn client(&self) -> Result<ChannelClient> {
        let wallet = Arc::new(self.unlock_wallet().await?);
        let storage = Arc::new(Storage::new(&self.config.database_path()).await?);
        ChannelClient::with_evm_custody(self.config.client.clone(), wallet, storage).await
    }

    /// As [`Context::client`], connected and authenticated.
    pub async fn connected_client(&self) -> Result<ChannelClient> {
        let client = self.client().await?;
        println!("Connecting to {}...", self.config.client.coordinator_url);
        let session = client.connect().await?;
        println!(
            "Authenticated {:?} (session key {:?})",
            session.wallet, session.session_key
        );
        Ok(client)
    }
}

pub fn new_password() -> Result<String> {
    if let Ok(password) = std::env::var(PASSWORD_ENV) {
        return Ok(password);
    }
    Password::new()
        .with_prompt("Enter keystore password")
        .with_confirmation("Confirm keystore password", "Passwords don't match")
        .interact()
        .map_err(|e| ClearsyncError::dialog(e.to_string()))
}
