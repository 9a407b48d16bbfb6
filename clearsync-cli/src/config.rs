use clearsync_core::{ClearsyncError, ClientConfig, Network, Result};
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "config.json";
const KEYSTORE_FILE: &str = "wallet.json";
const DATABASE_FILE: &str = "clearsync.db";

/// Per data-directory CLI settings. The client config is stored as JSON next
/// to the keystore and the database.
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub data_dir: PathBuf,
    pub client: ClientConfig,
}

impl CliConfig {
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("clearsync")
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join(CONFIG_FILE)
    }

    pub fn keystore_path(&self) -> PathBuf {
        self.data_dir.join(KEYSTORE_FILE)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE)
    }

    /// Load the saved config, or the network preset when there is none.
    /// An explicit `network` that differs from the saved one wins.
    pub async fn load(data_dir: &Path, network: Option<Network>) -> Result<Self> {
        let path = data_dir.join(CONFIG_FILE);
        let client = if tokio::fs::try_exists(&path).await? {
            let json = tokio::fs::read_to_string(&path).await?;
            let saved: ClientConfig = serde_json::from_str(&json)?;
            match network {
                Some(network) if network != saved.network => ClientConfig::new(network),
                _ => saved,
            }
        } else {
            ClientConfig::new(network.unwrap_or(Network::Local))
        };

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            client,
        })
    }

    pub async fn save(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.data_dir).await?;
        let json = serde_json::to_string_pretty(&self.client)?;
        tokio::fs::write(self.config_path(), json).await?;
        Ok(())
    }

    /// Apply `key=value` from the command line.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut json = serde_json::to_value(&self.client)?;
        let field = json
            .get_mut(key)
            .ok_or_else(|| ClearsyncError::config(format!("Unknown config key: {}", key)))?;
        *field = match field {
            serde_json::Value::Number(_) | serde_json::Value::Null => serde_json::from_str(value)
                .unwrap_or_else(|_| serde_json::Value::String(value.to_string())),
            serde_json::Value::Object(_) => serde_json::from_str(value)?,
            _ => serde_json::Value::String(value.to_string()),
        };
        self.client = serde_json::from_value(json)
            .map_err(|e| ClearsyncError::config(format!("Invalid value for {}: {}", key, e)))?;
        Ok(())
    }
}
