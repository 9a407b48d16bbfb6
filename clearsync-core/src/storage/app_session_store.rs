use crate::error::{ClearsyncError, Result};
use crate::storage::Storage;
use crate::types::{Address, AppAllocation, AppSession, ChannelId};
use chrono::{DateTime, Utc};
use primitive_types::{H256, U256};
use rusqlite::{params, Row};
use std::str::FromStr;

pub struct AppSessionStore<'a> {
    storage: &'a Storage,
}

type RawSession = (String, String, String, String, i64, i64, i64);

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawSession> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn into_session(raw: RawSession) -> Result<AppSession> {
    let (id, channel_id, participants, allocations, version, open, created_at) = raw;
    let app_session_id = H256::from_str(&id)
        .map_err(|e| ClearsyncError::internal(format!("Corrupt app session id {}: {:?}", id, e)))?;
    let channel_id = H256::from_str(&channel_id).map_err(|e| {
        ClearsyncError::internal(format!("Corrupt channel id {}: {:?}", channel_id, e))
    })?;
    let allocations: Vec<AppAllocation> = serde_json::from_str(&allocations)?;

    Ok(AppSession {
        app_session_id,
        channel_id,
        participants: serde_json::from_str(&participants)?,
        allocations,
        version: version as u64,
        open: open != 0,
        created_at: DateTime::from_timestamp(created_at, 0).unwrap_or_else(Utc::now),
    })
}

impl<'a> AppSessionStore<'a> {
    pub fn new(storage: &'a Storage) -> Self {
        Self { storage }
    }

    pub async fn save(&self, session: &AppSession) -> Result<()> {
        let conn = self.storage.get_connection().await;

        conn.execute(
            "INSERT OR REPLACE INTO app_sessions
             (app_session_id, channel_id, participants, allocations, version, open, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                format!("{:?}", session.app_session_id),
                format!("{:?}", session.channel_id),
                serde_json::to_string(&session.participants)?,
                serde_json::to_string(&session.allocations)?,
                session.version as i64,
                session.open as i64,
                session.created_at.timestamp(),
            ],
        )?;

        tracing::debug!(
            "Saved app session {:?} (version {}, open: {})",
            session.app_session_id,
            session.version,
            session.open
        );
        Ok(())
    }

    /// The open session funded from `channel_id`, if any.
    pub async fn load_open(&self, channel_id: ChannelId) -> Result<Option<AppSession>> {
        let conn = self.storage.get_connection().await;

        let mut stmt = conn.prepare(
            "SELECT app_session_id, channel_id, participants, allocations, version, open, created_at
             FROM app_sessions WHERE channel_id = ?1 AND open = 1
             ORDER BY created_at DESC LIMIT 1",
        )?;
        let mut rows = stmt.query_map(params![format!("{:?}", channel_id)], read_row)?;
        match rows.next() {
            Some(row) => Ok(Some(into_session(row?)?)),
            None => Ok(None),
        }
    }

    pub async fn list(&self, channel_id: ChannelId) -> Result<Vec<AppSession>> {
        let conn = self.storage.get_connection().await;

        let mut stmt = conn.prepare(
            "SELECT app_session_id, channel_id, participants, allocations, version, open, created_at
             FROM app_sessions WHERE channel_id = ?1 ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map(params![format!("{:?}", channel_id)], read_row)?;

        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(into_session(row?)?);
        }
        Ok(sessions)
    }

    /// Total that closed sessions of `channel_id` paid out from `owner` to
    /// other participants. The owner funds the whole stake, so anything it
    /// does not get back was paid out.
    pub async fn paid_out(&self, channel_id: ChannelId, owner: Address) -> Result<U256> {
        let sessions = self.list(channel_id).await?;
        Ok(sessions
            .iter()
            .filter(|s| !s.open)
            .fold(U256::zero(), |acc, s| {
                acc.saturating_add(s.total().saturating_sub(s.allocation_of(owner)))
            }))
    }
}
