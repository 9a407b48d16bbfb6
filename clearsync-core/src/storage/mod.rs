pub mod app_session_store;
pub mod channel_store;

pub use app_session_store::AppSessionStore;
pub use channel_store::{ChannelRecord, ChannelStore};

use crate::error::{ClearsyncError, Result};
use rusqlite::Connection;
use std::path::Path;
use tokio::sync::Mutex;

pub struct Storage {
    conn: Mutex<Connection>,
}

impl Storage {
    pub async fn new(db_path: &Path) -> Result<Self> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                ClearsyncError::internal(format!("Failed to create directory: {}", e))
            })?;
        }

        let conn = Connection::open(db_path)?;
        Self::with_connection(conn).await
    }

    pub async fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?).await
    }

    async fn with_connection(conn: Connection) -> Result<Self> {
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema().await?;
        Ok(storage)
    }

    async fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().await;

        // Channels table; one row per channel id, rewritten on every transition
        conn.execute(
            "CREATE TABLE IF NOT EXISTS channels (
                channel_id TEXT PRIMARY KEY,
                wallet TEXT NOT NULL,
                token TEXT NOT NULL,
                status TEXT NOT NULL,
                version TEXT NOT NULL,
                allocations TEXT NOT NULL,
                definition TEXT NOT NULL,
                last_confirmed TEXT,
                pending_tx TEXT,
                phase TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_channels_wallet ON channels (wallet, status)",
            [],
        )?;

        // App sessions table
        conn.execute(
            "CREATE TABLE IF NOT EXISTS app_sessions (
                app_session_id TEXT PRIMARY KEY,
                channel_id TEXT NOT NULL,
                participants TEXT NOT NULL,
                allocations TEXT NOT NULL,
                version INTEGER NOT NULL,
                open INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (channel_id) REFERENCES channels(channel_id)
            )",
            [],
        )?;

        Ok(())
    }

    pub async fn get_connection(&self) -> tokio::sync::MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}
