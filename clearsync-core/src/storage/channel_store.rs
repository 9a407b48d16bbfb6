use crate::channel::LifecyclePhase;
use crate::error::{ClearsyncError, Result};
use crate::storage::Storage;
use crate::types::{
    dec_u256, Address, Allocation, Channel, ChannelDefinition, ChannelId, ChannelState,
    ChannelStatus, TxHash,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Everything needed to pick a channel back up after a crash or failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub channel: Channel,
    pub wallet: Address,
    /// Last state the contract is known to have accepted; the proof for the next one.
    pub last_confirmed: Option<ChannelState>,
    /// Broadcast but not yet confirmed.
    pub pending_tx: Option<TxHash>,
    pub phase: LifecyclePhase,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChannelRecord {
    pub fn channel_id(&self) -> ChannelId {
        self.channel.channel_id
    }

    pub fn status(&self) -> ChannelStatus {
        self.channel.status
    }
}

pub struct ChannelStore<'a> {
    storage: &'a Storage,
}

const COLUMNS: &str = "channel_id, wallet, token, status, version, allocations, definition, last_confirmed, pending_tx, phase, created_at, updated_at";

fn parse_hex<T: FromStr>(value: &str, what: &str) -> Result<T>
where
    T::Err: std::fmt::Debug,
{
    T::from_str(value)
        .map_err(|e| ClearsyncError::internal(format!("Corrupt {} {}: {:?}", what, value, e)))
}

struct RawRow {
    channel_id: String,
    wallet: String,
    token: String,
    status: String,
    version: String,
    allocations: String,
    definition: String,
    last_confirmed: Option<String>,
    pending_tx: Option<String>,
    phase: String,
    created_at: i64,
    updated_at: i64,
}

impl RawRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            channel_id: row.get(0)?,
            wallet: row.get(1)?,
            token: row.get(2)?,
            status: row.get(3)?,
            version: row.get(4)?,
            allocations: row.get(5)?,
            definition: row.get(6)?,
            last_confirmed: row.get(7)?,
            pending_tx: row.get(8)?,
            phase: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn into_record(self) -> Result<ChannelRecord> {
        let allocations: Vec<Allocation> = serde_json::from_str(&self.allocations)?;
        let definition: ChannelDefinition = serde_json::from_str(&self.definition)?;
        let last_confirmed = self
            .last_confirmed
            .map(|json| serde_json::from_str::<ChannelState>(&json))
            .transpose()?;
        let pending_tx = self
            .pending_tx
            .map(|tx| parse_hex::<TxHash>(&tx, "transaction hash"))
            .transpose()?;

        Ok(ChannelRecord {
            channel: Channel {
                channel_id: parse_hex(&self.channel_id, "channel id")?,
                definition,
                token: parse_hex(&self.token, "token")?,
                version: dec_u256::parse(&self.version).map_err(ClearsyncError::internal)?,
                allocations,
                status: ChannelStatus::from_str(&self.status)?,
            },
            wallet: parse_hex(&self.wallet, "wallet")?,
            last_confirmed,
            pending_tx,
            phase: serde_json::from_str(&self.phase)?,
            created_at: DateTime::from_timestamp(self.created_at, 0).unwrap_or_else(Utc::now),
            updated_at: DateTime::from_timestamp(self.updated_at, 0).unwrap_or_else(Utc::now),
        })
    }
}

impl<'a> ChannelStore<'a> {
    pub fn new(storage: &'a Storage) -> Self {
        Self { storage }
    }

    pub async fn save(&self, record: &ChannelRecord) -> Result<()> {
        let conn = self.storage.get_connection().await;

        let last_confirmed = record
            .last_confirmed
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        conn.execute(
            "INSERT OR REPLACE INTO channels
             (channel_id, wallet, token, status, version, allocations, definition,
              last_confirmed, pending_tx, phase, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                format!("{:?}", record.channel.channel_id),
                format!("{:?}", record.wallet),
                format!("{:?}", record.channel.token),
                record.channel.status.to_string(),
                record.channel.version.to_string(),
                serde_json::to_string(&record.channel.allocations)?,
                serde_json::to_string(&record.channel.definition)?,
                last_confirmed,
                record.pending_tx.map(|tx| format!("{:?}", tx)),
                serde_json::to_string(&record.phase)?,
                record.created_at.timestamp(),
                record.updated_at.timestamp(),
            ],
        )?;

        tracing::debug!(
            "Saved channel {:?} ({}, {})",
            record.channel.channel_id,
            record.channel.status,
            record.phase
        );
        Ok(())
    }

    pub async fn load(&self, channel_id: ChannelId) -> Result<Option<ChannelRecord>> {
        let conn = self.storage.get_connection().await;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM channels WHERE channel_id = ?1",
            COLUMNS
        ))?;
        let mut rows = stmt.query_map(params![format!("{:?}", channel_id)], RawRow::read)?;
        match rows.next() {
            Some(row) => Ok(Some(row?.into_record()?)),
            None => Ok(None),
        }
    }

    /// Most recently touched channel for `wallet` that is not closed.
    pub async fn latest_open(&self, wallet: Address) -> Result<Option<ChannelRecord>> {
        let conn = self.storage.get_connection().await;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM channels WHERE wallet = ?1 AND status != 'Closed'
             ORDER BY updated_at DESC, created_at DESC LIMIT 1",
            COLUMNS
        ))?;
        let mut rows = stmt.query_map(params![format!("{:?}", wallet)], RawRow::read)?;
        match rows.next() {
            Some(row) => Ok(Some(row?.into_record()?)),
            None => Ok(None),
        }
    }

    pub async fn list(&self, wallet: Address) -> Result<Vec<ChannelRecord>> {
        let conn = self.storage.get_connection().await;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM channels WHERE wallet = ?1 ORDER BY created_at DESC",
            COLUMNS
        ))?;
        let rows = stmt.query_map(params![format!("{:?}", wallet)], RawRow::read)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record()?);
        }
        Ok(records)
    }
}
