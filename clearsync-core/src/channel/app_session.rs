use crate::channel::ChannelLifecycle;
use crate::error::{ClearsyncError, Result};
use crate::rpc::coordinator::AppAllocationWire;
use crate::rpc::Coordinator;
use crate::storage::{AppSessionStore, Storage};
use crate::types::{format_units, Address, AppAllocation, AppSession, Channel, ChannelStatus};
use chrono::Utc;
use primitive_types::U256;
use std::sync::Arc;

/// App sessions nested in the wallet's active channel. One may be open at a
/// time and it must be closed before the channel is.
pub struct AppSessions {
    storage: Arc<Storage>,
    asset: String,
    decimals: u8,
}

impl AppSessions {
    pub fn new(lifecycle: &ChannelLifecycle) -> Self {
        Self {
            storage: lifecycle.storage().clone(),
            asset: lifecycle.params().token_symbol.to_ascii_lowercase(),
            decimals: lifecycle.params().token_decimals,
        }
    }

    fn to_wire(&self, allocations: &[AppAllocation]) -> Vec<AppAllocationWire> {
        allocations
            .iter()
            .map(|a| AppAllocationWire {
                participant: a.participant,
                asset: self.asset.clone(),
                amount: format_units(a.amount, self.decimals),
            })
            .collect()
    }

    fn active_channel(lifecycle: &ChannelLifecycle) -> Result<Channel> {
        let record = lifecycle
            .record()
            .filter(|r| r.status() == ChannelStatus::Active && !r.phase.is_failed())
            .ok_or_else(|| ClearsyncError::invalid_state("App sessions need an active channel"))?;
        Ok(record.channel)
    }

    /// The open session of the current channel, if any.
    pub async fn current(&self, lifecycle: &ChannelLifecycle) -> Result<Option<AppSession>> {
        match lifecycle.channel_id() {
            Some(channel_id) => AppSessionStore::new(&self.storage).load_open(channel_id).await,
            None => Ok(None),
        }
    }

    async fn require_open(&self, lifecycle: &ChannelLifecycle) -> Result<AppSession> {
        self.current(lifecycle)
            .await?
            .ok_or_else(|| ClearsyncError::invalid_state("No open app session"))
    }

    /// Open a session with `counterparty`, staking `amount` of the wallet's
    /// channel balance.
    pub async fn create(
        &self,
        coordinator: &Coordinator,
        lifecycle: &ChannelLifecycle,
        counterparty: Address,
        amount: U256,
    ) -> Result<AppSession> {
        let _guard = lifecycle.begin("open an app session")?;
        let channel = Self::active_channel(lifecycle)?;
        let wallet = lifecycle.params().wallet;

        if let Some(open) = AppSessionStore::new(&self.storage)
            .load_open(channel.channel_id)
            .await?
        {
            return Err(ClearsyncError::invalid_state(format!(
                "App session {:?} is already open",
                open.app_session_id
            )));
        }
        if counterparty == wallet {
            return Err(ClearsyncError::validation(
                "Counterparty must differ from the wallet",
            ));
        }
        if amount.is_zero() {
            return Err(ClearsyncError::validation("Amount must be greater than 0"));
        }
        let paid_out = AppSessionStore::new(&self.storage)
            .paid_out(channel.channel_id, wallet)
            .await?;
        let available = channel.balance_of(wallet).min(channel.total().saturating_sub(paid_out));
        if amount > available {
            return Err(ClearsyncError::validation(format!(
                "Cannot stake {}, channel balance is {}",
                format_units(amount, self.decimals),
                format_units(available, self.decimals)
            )));
        }

        let participants = [wallet, counterparty];
        let allocations = vec![
            AppAllocation {
                participant: wallet,
                amount,
            },
            AppAllocation {
                participant: counterparty,
                amount: U256::zero(),
            },
        ];
        let nonce = Utc::now().timestamp_millis().max(0) as u64;
        let receipt = coordinator
            .create_app_session(participants, &self.to_wire(&allocations), nonce)
            .await?;

        let session = AppSession {
            app_session_id: receipt.app_session_id,
            channel_id: channel.channel_id,
            participants,
            allocations,
            version: receipt.version.max(1),
            open: true,
            created_at: Utc::now(),
        };
        AppSessionStore::new(&self.storage).save(&session).await?;
        tracing::info!(
            "Opened app session {:?} with {:?} staking {} {}",
            session.app_session_id,
            counterparty,
            format_units(amount, self.decimals),
            self.asset
        );
        Ok(session)
    }

    /// Redistribute the session's funds.
    pub async fn submit(
        &self,
        coordinator: &Coordinator,
        lifecycle: &ChannelLifecycle,
        allocations: Vec<AppAllocation>,
    ) -> Result<AppSession> {
        let _guard = lifecycle.begin("update the app session")?;
        let mut session = self.require_open(lifecycle).await?;
        validate_allocations(&session, &allocations)?;

        let version = session.version + 1;
        let receipt = coordinator
            .submit_app_state(session.app_session_id, version, &self.to_wire(&allocations))
            .await?;

        session.version = if receipt.version > 0 { receipt.version } else { version };
        session.allocations = allocations;
        AppSessionStore::new(&self.storage).save(&session).await?;
        tracing::debug!(
            "App session {:?} at version {}",
            session.app_session_id,
            session.version
        );
        Ok(session)
    }

    pub async fn close(
        &self,
        coordinator: &Coordinator,
        lifecycle: &ChannelLifecycle,
        allocations: Vec<AppAllocation>,
    ) -> Result<AppSession> {
        let _guard = lifecycle.begin("close the app session")?;
        let mut session = self.require_open(lifecycle).await?;
        validate_allocations(&session, &allocations)?;

        let receipt = coordinator
            .close_app_session(session.app_session_id, &self.to_wire(&allocations))
            .await?;

        session.version = if receipt.version > 0 {
            receipt.version
        } else {
            session.version + 1
        };
        session.allocations = allocations;
        session.open = false;
        AppSessionStore::new(&self.storage).save(&session).await?;
        tracing::info!("Closed app session {:?}", session.app_session_id);
        Ok(session)
    }
}

/// New allocations may only move the session's funds between its participants.
pub(crate) fn validate_allocations(session: &AppSession, allocations: &[AppAllocation]) -> Result<()> {
    for (i, allocation) in allocations.iter().enumerate() {
        if !session.participants.contains(&allocation.participant) {
            return Err(ClearsyncError::validation(format!(
                "{:?} is not a participant of app session {:?}",
                allocation.participant, session.app_session_id
            )));
        }
        if allocations[..i]
            .iter()
            .any(|a| a.participant == allocation.participant)
        {
            return Err(ClearsyncError::validation(format!(
                "{:?} is allocated twice",
                allocation.participant
            )));
        }
    }

    let total = allocations
        .iter()
        .fold(U256::zero(), |acc, a| acc.saturating_add(a.amount));
    if total != session.total() {
        return Err(ClearsyncError::validation(format!(
            "Allocations sum to {}, app session holds {}",
            total,
            session.total()
        )));
    }
    Ok(())
}
