use crate::channel::LifecyclePhase;
use crate::error::{ClearsyncError, Result, SettlementStep};
use crate::rpc::Coordinator;
use crate::settlement::{OnchainStatus, SettlementAdapter};
use crate::signer::{SessionKey, Signature};
use crate::storage::{AppSessionStore, ChannelRecord, ChannelStore, Storage};
use crate::types::{
    allocation_of, format_units, short_hex, Address, Channel, ChannelId, ChannelOpened,
    ChannelState, ChannelStatus, Intent, TxHash,
};
use chrono::Utc;
use parking_lot::RwLock;
use primitive_types::U256;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, MutexGuard};
use tracing::{info, warn};

/// Fixed inputs of the lifecycle for one wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleParams {
    pub chain_id: u64,
    pub wallet: Address,
    pub token: Address,
    pub token_symbol: String,
    pub token_decimals: u8,
}

/// Drives one channel through create, fund, resize and close.
///
/// Operations are serialized: a second call while one is running fails with
/// `Busy` instead of interleaving, because each step needs the state the
/// previous step confirmed on-chain as its proof. Every transition is
/// written to storage before the next external call, so a crash or failure
/// leaves the channel id and status behind for `resume`.
pub struct ChannelLifecycle {
    params: LifecycleParams,
    settlement: Arc<dyn SettlementAdapter>,
    storage: Arc<Storage>,
    record: RwLock<Option<ChannelRecord>>,
    phase: watch::Sender<LifecyclePhase>,
    op_lock: Mutex<()>,
}

fn settlement_error(step: SettlementStep, err: ClearsyncError) -> ClearsyncError {
    match err {
        e @ ClearsyncError::Settlement { .. } => e,
        other => ClearsyncError::settlement(step, other),
    }
}

/// The coordinator's signature must be over the exact state we are about to
/// countersign.
fn verify_coordinator_signature(method: &str, state: &ChannelState, coordinator: Address) -> Result<()> {
    let signer = Signature::from_bytes(&state.coordinator_signature)
        .and_then(|sig| sig.recover(&state.state_hash()))
        .map_err(|e| ClearsyncError::protocol(method, format!("bad coordinator signature: {}", e)))?;
    if signer != coordinator {
        return Err(ClearsyncError::protocol(
            method,
            format!("state signed by {:?}, expected {:?}", signer, coordinator),
        ));
    }
    Ok(())
}

fn check_progression(method: &str, previous: &ChannelState, next: &ChannelState, intent: Intent) -> Result<()> {
    if next.channel_id != previous.channel_id {
        return Err(ClearsyncError::protocol(
            method,
            format!("state is for channel {:?}", next.channel_id),
        ));
    }
    if next.intent != intent {
        return Err(ClearsyncError::protocol(
            method,
            format!("expected {:?} intent, got {:?}", intent, next.intent),
        ));
    }
    if next.version <= previous.version {
        return Err(ClearsyncError::protocol(
            method,
            format!(
                "version {} does not advance past {}",
                next.version, previous.version
            ),
        ));
    }
    Ok(())
}

fn check_token(method: &str, state: &ChannelState, token: Address) -> Result<()> {
    if let Some(other) = state.allocations.iter().find(|a| a.token != token) {
        return Err(ClearsyncError::protocol(
            method,
            format!("allocation in token {:?}, channel token is {:?}", other.token, token),
        ));
    }
    Ok(())
}

fn check_destinations(method: &str, state: &ChannelState, allowed: &[Address]) -> Result<()> {
    if let Some(other) = state
        .allocations
        .iter()
        .find(|a| !allowed.contains(&a.destination))
    {
        return Err(ClearsyncError::protocol(
            method,
            format!("allocation to unexpected destination {:?}", other.destination),
        ));
    }
    Ok(())
}

/// What the owner is owed out of a channel holding `total`, after closed app
/// sessions paid `paid_out` to other participants.
fn owner_share(method: &str, total: U256, paid_out: U256) -> Result<U256> {
    total.checked_sub(paid_out).ok_or_else(|| {
        ClearsyncError::protocol(
            method,
            format!("app sessions paid out {}, channel holds {}", paid_out, total),
        )
    })
}

/// Who a state may allocate to and what the owner is owed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Expected {
    pub owner: Address,
    pub coordinator: Address,
    pub token: Address,
    /// Paid out of the channel by closed app sessions.
    pub paid_out: U256,
}

/// A resize funded with `amount` must grow the total by exactly that much and
/// credit it to the owner.
pub(crate) fn validate_resize(
    previous: &ChannelState,
    next: &ChannelState,
    expected: &Expected,
    amount: U256,
) -> Result<()> {
    const METHOD: &str = "resize_channel";
    check_progression(METHOD, previous, next, Intent::Resize)?;
    check_token(METHOD, next, expected.token)?;
    check_destinations(METHOD, next, &[expected.owner, expected.coordinator])?;

    let expected_total = previous.total().saturating_add(amount);
    if next.total() != expected_total {
        return Err(ClearsyncError::protocol(
            METHOD,
            format!(
                "allocations sum to {}, expected {}",
                next.total(),
                expected_total
            ),
        ));
    }

    let expected_owner = owner_share(METHOD, expected_total, expected.paid_out)?;
    let owner_now = allocation_of(&next.allocations, expected.owner);
    if owner_now != expected_owner {
        return Err(ClearsyncError::protocol(
            METHOD,
            format!("owner allocation is {}, expected {}", owner_now, expected_owner),
        ));
    }
    Ok(())
}

/// A final state keeps the channel total and pays the owner's share to
/// `funds_destination` in a single allocation. Anything else may only go to
/// the coordinator.
pub(crate) fn validate_close(
    previous: &ChannelState,
    next: &ChannelState,
    expected: &Expected,
    funds_destination: Address,
) -> Result<()> {
    const METHOD: &str = "close_channel";
    check_progression(METHOD, previous, next, Intent::Finalize)?;
    check_token(METHOD, next, expected.token)?;
    check_destinations(METHOD, next, &[funds_destination, expected.coordinator])?;
    if next.total() != previous.total() {
        return Err(ClearsyncError::protocol(
            METHOD,
            format!(
                "final allocations sum to {}, channel holds {}",
                next.total(),
                previous.total()
            ),
        ));
    }

    let payouts: Vec<_> = next
        .allocations
        .iter()
        .filter(|a| a.destination == funds_destination)
        .collect();
    let [payout] = payouts.as_slice() else {
        return Err(ClearsyncError::protocol(
            METHOD,
            format!(
                "expected one allocation to {:?}, found {}",
                funds_destination,
                payouts.len()
            ),
        ));
    };

    let owed = owner_share(METHOD, previous.total(), expected.paid_out)?;
    if payout.amount != owed {
        return Err(ClearsyncError::protocol(
            METHOD,
            format!("final state pays out {}, owner is owed {}", payout.amount, owed),
        ));
    }
    Ok(())
}

/// Add the session key's signature; participant order is [wallet, coordinator].
fn countersign(session_key: &SessionKey, mut state: ChannelState) -> Result<ChannelState> {
    let own = session_key.sign_state(&state)?;
    state.signatures = vec![own.to_bytes(), state.coordinator_signature.clone()];
    Ok(state)
}

impl ChannelLifecycle {
    /// Picks up the wallet's most recent unclosed channel from storage.
    pub async fn new(
        params: LifecycleParams,
        settlement: Arc<dyn SettlementAdapter>,
        storage: Arc<Storage>,
    ) -> Result<Self> {
        let record = ChannelStore::new(&storage).latest_open(params.wallet).await?;
        let phase = match &record {
            Some(record) => {
                info!(
                    "Loaded channel {:?} ({}, {})",
                    record.channel_id(),
                    record.status(),
                    record.phase
                );
                record.phase.clone()
            }
            None => LifecyclePhase::Idle,
        };
        let (phase, _) = watch::channel(phase);

        Ok(Self {
            params,
            settlement,
            storage,
            record: RwLock::new(record),
            phase,
            op_lock: Mutex::new(()),
        })
    }

    pub fn params(&self) -> &LifecycleParams {
        &self.params
    }

    /// Id of the current channel; `None` once it is closed.
    pub fn channel_id(&self) -> Option<ChannelId> {
        self.record
            .read()
            .as_ref()
            .filter(|r| r.status() != ChannelStatus::Closed)
            .map(ChannelRecord::channel_id)
    }

    pub fn status(&self) -> Option<ChannelStatus> {
        self.record.read().as_ref().map(ChannelRecord::status)
    }

    pub fn channel(&self) -> Option<Channel> {
        self.record.read().as_ref().map(|r| r.channel.clone())
    }

    pub fn record(&self) -> Option<ChannelRecord> {
        self.record.read().clone()
    }

    pub fn last_confirmed_state(&self) -> Option<ChannelState> {
        self.record
            .read()
            .as_ref()
            .and_then(|r| r.last_confirmed.clone())
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.phase.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecyclePhase> {
        self.phase.subscribe()
    }

    /// One line for an operator or a UI status bar.
    pub fn status_line(&self) -> String {
        let phase = self.phase();
        let record = self.record.read();
        match record.as_ref() {
            None => format!("No channel ({})", phase),
            Some(record) => {
                let balance = format_units(
                    record.channel.balance_of(self.params.wallet),
                    self.params.token_decimals,
                );
                format!(
                    "Channel {} {}: {} {}, {}",
                    short_hex(&record.channel_id()),
                    record.status(),
                    balance,
                    self.params.token_symbol,
                    phase
                )
            }
        }
    }

    pub(crate) fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Claim the single operation slot.
    pub(crate) fn begin(&self, operation: &str) -> Result<MutexGuard<'_, ()>> {
        self.op_lock.try_lock().map_err(|_| {
            ClearsyncError::Busy(format!(
                "Cannot {} while {} is in progress",
                operation,
                self.phase()
            ))
        })
    }

    fn set_phase(&self, phase: LifecyclePhase) {
        info!("Channel lifecycle: {}", phase);
        self.phase.send_replace(phase);
    }

    /// Persist `record` at `phase`, then publish it.
    async fn commit(&self, record: &mut ChannelRecord, phase: LifecyclePhase) -> Result<()> {
        record.phase = phase.clone();
        record.updated_at = Utc::now();
        ChannelStore::new(&self.storage).save(record).await?;
        *self.record.write() = Some(record.clone());
        self.set_phase(phase);
        Ok(())
    }

    /// Record the failure on the channel, if one exists, and hand the error back.
    async fn fail(&self, err: ClearsyncError) -> ClearsyncError {
        let at = match self.phase() {
            LifecyclePhase::Failed { at, .. } => *at,
            other => other,
        };
        warn!("Channel operation failed while {}: {}", at, err);
        let failed = LifecyclePhase::Failed {
            at: Box::new(at),
            reason: err.to_string(),
        };

        let record = self.record.read().clone();
        match record {
            Some(mut record) if record.status() != ChannelStatus::Closed => {
                if let Err(e) = self.commit(&mut record, failed.clone()).await {
                    warn!(
                        "Could not persist failure of channel {:?}: {}",
                        record.channel_id(),
                        e
                    );
                    self.set_phase(failed);
                }
            }
            _ => self.set_phase(failed),
        }
        err
    }

    fn require_wallet(&self, coordinator: &Coordinator) -> Result<()> {
        let wallet = coordinator.session().wallet;
        if wallet != self.params.wallet {
            return Err(ClearsyncError::invalid_state(format!(
                "Coordinator session belongs to {:?}, lifecycle to {:?}",
                wallet, self.params.wallet
            )));
        }
        Ok(())
    }

    async fn expected(&self, record: &ChannelRecord) -> Result<Expected> {
        let paid_out = AppSessionStore::new(&self.storage)
            .paid_out(record.channel_id(), self.params.wallet)
            .await?;
        Ok(Expected {
            owner: self.params.wallet,
            coordinator: record.channel.definition.coordinator(),
            token: self.params.token,
            paid_out,
        })
    }

    /// The open channel, ready for the next operation.
    fn operable(&self, operation: &str) -> Result<ChannelRecord> {
        let record = self
            .record()
            .filter(|r| r.status() != ChannelStatus::Closed)
            .ok_or_else(|| ClearsyncError::invalid_state(format!("No open channel to {}", operation)))?;

        if record.phase.is_failed() {
            return Err(ClearsyncError::invalid_state(format!(
                "Channel {:?} {}; resume it before trying to {}",
                record.channel_id(),
                record.phase,
                operation
            )));
        }
        match record.status() {
            ChannelStatus::Active | ChannelStatus::Confirmed => Ok(record),
            other => Err(ClearsyncError::invalid_state(format!(
                "Cannot {} a channel in status {}",
                operation, other
            ))),
        }
    }

    /// Create a channel and, when `amount` is non-zero, fund it.
    ///
    /// Nothing else is sent on-chain for this wallet until the creation
    /// transaction is confirmed.
    pub async fn setup_channel(&self, coordinator: &Coordinator, amount: U256) -> Result<ChannelOpened> {
        let _guard = self.begin("set up a channel")?;
        self.require_wallet(coordinator)?;

        if let Some(existing) = self.record() {
            if existing.status() != ChannelStatus::Closed {
                return Err(ClearsyncError::invalid_state(format!(
                    "Channel {:?} is still open ({})",
                    existing.channel_id(),
                    existing.status()
                )));
            }
            *self.record.write() = None;
        }

        match self.run_setup(coordinator, amount).await {
            Ok(opened) => Ok(opened),
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn run_setup(&self, coordinator: &Coordinator, amount: U256) -> Result<ChannelOpened> {
        self.set_phase(LifecyclePhase::AwaitingTerms);
        let terms = coordinator
            .create_channel(self.params.chain_id, self.params.token)
            .await?;

        let definition = terms.definition()?;
        if definition.wallet() != self.params.wallet {
            return Err(ClearsyncError::protocol(
                "create_channel",
                format!("channel is for {:?}", definition.wallet()),
            ));
        }
        let channel_id = definition.channel_id(self.params.chain_id);
        if channel_id != terms.channel_id {
            return Err(ClearsyncError::protocol(
                "create_channel",
                format!(
                    "channel id {:?} does not match definition ({:?})",
                    terms.channel_id, channel_id
                ),
            ));
        }

        let initial = terms.state()?;
        if initial.intent != Intent::Initialize {
            return Err(ClearsyncError::protocol(
                "create_channel",
                format!("initial state has {:?} intent", initial.intent),
            ));
        }
        check_token("create_channel", &initial, self.params.token)?;
        verify_coordinator_signature("create_channel", &initial, definition.coordinator())?;
        let initial = countersign(coordinator.session_key(), initial)?;

        let now = Utc::now();
        let mut record = ChannelRecord {
            channel: Channel {
                channel_id,
                definition: definition.clone(),
                token: self.params.token,
                version: initial.version,
                allocations: initial.allocations.clone(),
                status: ChannelStatus::Proposed,
            },
            wallet: self.params.wallet,
            last_confirmed: None,
            pending_tx: None,
            phase: LifecyclePhase::OnchainSubmitting,
            created_at: now,
            updated_at: now,
        };
        self.commit(&mut record, LifecyclePhase::OnchainSubmitting).await?;

        let opened = self
            .settlement
            .create_channel(&definition, &initial)
            .await
            .map_err(|e| settlement_error(SettlementStep::Create, e))?;
        if opened.channel_id != channel_id {
            warn!(
                "Custody reported channel {:?}, expected {:?}",
                opened.channel_id, channel_id
            );
        }

        record.channel.status = ChannelStatus::Submitted;
        record.pending_tx = Some(opened.tx_hash);
        self.commit(&mut record, LifecyclePhase::OnchainConfirming).await?;

        self.settlement
            .wait_for_confirmation(opened.tx_hash)
            .await
            .map_err(|e| settlement_error(SettlementStep::Create, e))?;

        record.channel.status = ChannelStatus::Confirmed;
        record.pending_tx = None;
        record.last_confirmed = Some(initial);
        info!("Channel {:?} created in {:?}", channel_id, opened.tx_hash);

        if amount.is_zero() {
            self.commit(&mut record, LifecyclePhase::Active).await?;
        } else {
            self.commit(&mut record, LifecyclePhase::Depositing).await?;
            self.fund(coordinator, &mut record, amount).await?;
        }

        Ok(ChannelOpened {
            channel_id,
            tx_hash: opened.tx_hash,
        })
    }

    /// Deposit more of the token and move it into the channel.
    pub async fn add_funds(&self, coordinator: &Coordinator, amount: U256) -> Result<()> {
        let _guard = self.begin("add funds")?;
        self.require_wallet(coordinator)?;
        if amount.is_zero() {
            return Err(ClearsyncError::validation("Amount must be greater than 0"));
        }
        let mut record = self.operable("add funds to")?;

        match self.fund(coordinator, &mut record, amount).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// deposit -> confirm -> resize -> confirm
    async fn fund(&self, coordinator: &Coordinator, record: &mut ChannelRecord, amount: U256) -> Result<()> {
        let channel_id = record.channel_id();
        let previous = record.last_confirmed.clone().ok_or_else(|| {
            ClearsyncError::invalid_state(format!("Channel {:?} has no confirmed state", channel_id))
        })?;
        info!(
            "Funding channel {:?} with {} {}",
            channel_id,
            format_units(amount, self.params.token_decimals),
            self.params.token_symbol
        );

        record.channel.status = ChannelStatus::Resizing;
        self.commit(record, LifecyclePhase::Depositing).await?;
        let deposit_tx = self
            .settlement
            .deposit(self.params.token, amount)
            .await
            .map_err(|e| settlement_error(SettlementStep::Deposit, e))?;

        record.pending_tx = Some(deposit_tx);
        self.commit(record, LifecyclePhase::DepositConfirming).await?;
        self.settlement
            .wait_for_confirmation(deposit_tx)
            .await
            .map_err(|e| settlement_error(SettlementStep::Deposit, e))?;

        record.pending_tx = None;
        self.commit(record, LifecyclePhase::Resizing).await?;
        let terms = coordinator
            .resize_channel(channel_id, amount, U256::zero(), self.params.wallet)
            .await?;
        let next = terms.state()?;
        let expected = self.expected(record).await?;
        validate_resize(&previous, &next, &expected, amount)?;
        verify_coordinator_signature(
            "resize_channel",
            &next,
            record.channel.definition.coordinator(),
        )?;
        let next = countersign(coordinator.session_key(), next)?;

        let resize_tx = self
            .settlement
            .resize(&next, std::slice::from_ref(&previous))
            .await
            .map_err(|e| settlement_error(SettlementStep::Resize, e))?;
        record.pending_tx = Some(resize_tx);
        self.commit(record, LifecyclePhase::ResizeConfirming).await?;
        self.settlement
            .wait_for_confirmation(resize_tx)
            .await
            .map_err(|e| settlement_error(SettlementStep::Resize, e))?;

        record.channel.version = next.version;
        record.channel.allocations = next.allocations.clone();
        record.channel.status = ChannelStatus::Active;
        record.pending_tx = None;
        record.last_confirmed = Some(next);
        self.commit(record, LifecyclePhase::Active).await?;
        info!(
            "Channel {:?} active at version {} holding {} {}",
            channel_id,
            record.channel.version,
            format_units(record.channel.total(), self.params.token_decimals),
            self.params.token_symbol
        );
        Ok(())
    }

    /// Finalize the channel on-chain with the coordinator's final state.
    pub async fn close_channel(&self, coordinator: &Coordinator) -> Result<TxHash> {
        let _guard = self.begin("close the channel")?;
        self.require_wallet(coordinator)?;
        let mut record = self.operable("close")?;

        if let Some(session) = AppSessionStore::new(&self.storage)
            .load_open(record.channel_id())
            .await?
        {
            return Err(ClearsyncError::invalid_state(format!(
                "App session {:?} is still open",
                session.app_session_id
            )));
        }

        match self.run_close(coordinator, &mut record).await {
            Ok(tx) => Ok(tx),
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn run_close(&self, coordinator: &Coordinator, record: &mut ChannelRecord) -> Result<TxHash> {
        let channel_id = record.channel_id();
        let previous = record.last_confirmed.clone().ok_or_else(|| {
            ClearsyncError::invalid_state(format!("Channel {:?} has no confirmed state", channel_id))
        })?;

        record.channel.status = ChannelStatus::Closing;
        self.commit(record, LifecyclePhase::RequestingClose).await?;
        let terms = coordinator
            .close_channel(channel_id, self.params.wallet)
            .await?;
        let last = terms.state()?;
        let expected = self.expected(record).await?;
        validate_close(&previous, &last, &expected, self.params.wallet)?;
        verify_coordinator_signature(
            "close_channel",
            &last,
            record.channel.definition.coordinator(),
        )?;
        let last = countersign(coordinator.session_key(), last)?;

        let tx = self
            .settlement
            .close(&last, std::slice::from_ref(&previous))
            .await
            .map_err(|e| settlement_error(SettlementStep::Close, e))?;
        record.pending_tx = Some(tx);
        self.commit(record, LifecyclePhase::OnchainClosing).await?;
        self.settlement
            .wait_for_confirmation(tx)
            .await
            .map_err(|e| settlement_error(SettlementStep::Close, e))?;

        record.channel.version = last.version;
        record.channel.allocations = last.allocations.clone();
        record.channel.status = ChannelStatus::Closed;
        record.pending_tx = None;
        record.last_confirmed = Some(last);
        self.commit(record, LifecyclePhase::Closed).await?;
        info!("Channel {:?} closed in {:?}", channel_id, tx);
        Ok(tx)
    }

    /// Reconcile a stored channel with the custody contract.
    ///
    /// Waits for any transaction left pending, then adopts whatever the
    /// contract holds: open channels come back as `Active` or `Confirmed`,
    /// finalized or unknown ones as `Closed`.
    pub async fn resume(&self, channel_id: Option<ChannelId>) -> Result<Channel> {
        let _guard = self.begin("resume")?;

        let current = self.record();
        let record = match channel_id {
            Some(id) if current.as_ref().map(ChannelRecord::channel_id) == Some(id) => current,
            Some(id) => {
                if let Some(open) = current.as_ref().filter(|r| r.status() != ChannelStatus::Closed) {
                    return Err(ClearsyncError::invalid_state(format!(
                        "Channel {:?} is open; finish it before resuming {:?}",
                        open.channel_id(),
                        id
                    )));
                }
                ChannelStore::new(&self.storage).load(id).await?
            }
            None => current,
        };
        let mut record = record.ok_or_else(|| ClearsyncError::invalid_state("No channel to resume"))?;
        *self.record.write() = Some(record.clone());

        match self.reconcile(&mut record).await {
            Ok(()) => Ok(record.channel),
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn reconcile(&self, record: &mut ChannelRecord) -> Result<()> {
        let channel_id = record.channel_id();
        info!("Resuming channel {:?} ({}, {})", channel_id, record.status(), record.phase);

        if let Some(tx) = record.pending_tx {
            match self.settlement.wait_for_confirmation(tx).await {
                Ok(receipt) => info!("Pending {:?} confirmed in block {}", tx, receipt.block_number),
                Err(ClearsyncError::OnchainRevert { reason, .. }) => {
                    warn!("Pending {:?} reverted: {}", tx, reason)
                }
                Err(e) => return Err(settlement_error(SettlementStep::Query, e)),
            }
            record.pending_tx = None;
        }

        let onchain = self
            .settlement
            .query(channel_id)
            .await
            .map_err(|e| settlement_error(SettlementStep::Query, e))?;

        if let Some(state) = onchain.last_valid_state {
            if state.version >= record.channel.version || record.last_confirmed.is_none() {
                record.channel.version = state.version;
                record.channel.allocations = state.allocations.clone();
                record.last_confirmed = Some(state);
            }
        }

        match onchain.status {
            OnchainStatus::Void | OnchainStatus::Final => {
                record.channel.status = ChannelStatus::Closed;
                self.commit(record, LifecyclePhase::Closed).await?;
            }
            OnchainStatus::Active if !record.channel.total().is_zero() => {
                record.channel.status = ChannelStatus::Active;
                self.commit(record, LifecyclePhase::Active).await?;
            }
            OnchainStatus::Active | OnchainStatus::Initial => {
                record.channel.status = ChannelStatus::Confirmed;
                self.commit(record, LifecyclePhase::Active).await?;
            }
            OnchainStatus::Dispute => {
                return Err(ClearsyncError::invalid_state(format!(
                    "Channel {:?} is under dispute until {}",
                    channel_id, onchain.challenge_expiry
                )));
            }
        }
        info!("Channel {:?} resumed as {}", channel_id, record.status());
        Ok(())
    }

    /// Channel ids the custody contract still holds open for the wallet.
    pub async fn open_channels(&self) -> Result<Vec<ChannelId>> {
        self.settlement
            .open_channels(self.params.wallet)
            .await
            .map_err(|e| settlement_error(SettlementStep::Query, e))
    }

    pub async fn custody_balance(&self) -> Result<U256> {
        self.settlement
            .custody_balance(self.params.wallet, self.params.token)
            .await
            .map_err(|e| settlement_error(SettlementStep::Query, e))
    }

    /// Withdraw unlocked custody funds; everything when `amount` is `None`.
    pub async fn withdraw(&self, amount: Option<U256>) -> Result<TxHash> {
        let _guard = self.begin("withdraw")?;

        let available = self.custody_balance().await?;
        let amount = amount.unwrap_or(available);
        if amount.is_zero() {
            return Err(ClearsyncError::validation("Nothing to withdraw"));
        }
        if amount > available {
            return Err(ClearsyncError::validation(format!(
                "Cannot withdraw {} {}, custody holds {}",
                format_units(amount, self.params.token_decimals),
                self.params.token_symbol,
                format_units(available, self.params.token_decimals)
            )));
        }

        let tx = self
            .settlement
            .withdraw(self.params.token, amount)
            .await
            .map_err(|e| settlement_error(SettlementStep::Withdraw, e))?;
        self.settlement
            .wait_for_confirmation(tx)
            .await
            .map_err(|e| settlement_error(SettlementStep::Withdraw, e))?;
        info!(
            "Withdrew {} {} in {:?}",
            format_units(amount, self.params.token_decimals),
            self.params.token_symbol,
            tx
        );
        Ok(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Fixture, WALLET_FUNDS};
    use crate::types::Allocation;

    fn usdc(amount: u64) -> U256 {
        U256::from(amount) * U256::from(1_000_000u64)
    }

    #[tokio::test]
    async fn test_setup_confirms_create_before_deposit() {
        let f = Fixture::new().await;
        f.lifecycle.setup_channel(&f.coordinator, usdc(10)).await.unwrap();

        let calls = f.custody.calls();
        let confirmed = calls.iter().position(|c| c == "confirmed:create").unwrap();
        let deposit = calls.iter().position(|c| c == "deposit").unwrap();
        assert!(confirmed < deposit, "calls: {:?}", calls);

        let deposit_confirmed = calls.iter().position(|c| c == "confirmed:deposit").unwrap();
        let resize = calls.iter().position(|c| c == "resize").unwrap();
        assert!(deposit_confirmed < resize, "calls: {:?}", calls);
    }

    #[tokio::test]
    async fn test_versions_strictly_increase() {
        let f = Fixture::new().await;
        let mut versions = Vec::new();

        f.lifecycle.setup_channel(&f.coordinator, U256::zero()).await.unwrap();
        versions.push(f.lifecycle.channel().unwrap().version);
        for amount in [1u64, 2, 3] {
            f.lifecycle.add_funds(&f.coordinator, usdc(amount)).await.unwrap();
            versions.push(f.lifecycle.channel().unwrap().version);
        }
        f.lifecycle.close_channel(&f.coordinator).await.unwrap();
        versions.push(f.lifecycle.channel().unwrap().version);

        assert!(versions.windows(2).all(|w| w[0] < w[1]), "{:?}", versions);
        // Every submission was backed by the previous confirmed state.
        assert!(f.custody.proofs_were_latest());
    }

    #[tokio::test]
    async fn test_add_funds_then_close_conserves_deposits() {
        let f = Fixture::new().await;
        f.lifecycle.setup_channel(&f.coordinator, usdc(4)).await.unwrap();
        f.lifecycle.add_funds(&f.coordinator, usdc(6)).await.unwrap();

        let channel = f.lifecycle.channel().unwrap();
        assert_eq!(channel.total(), usdc(10));
        assert_eq!(channel.balance_of(f.wallet_address()), usdc(10));

        f.lifecycle.close_channel(&f.coordinator).await.unwrap();
        let last = f.lifecycle.last_confirmed_state().unwrap();
        assert_eq!(last.intent, Intent::Finalize);
        assert_eq!(last.total(), usdc(10));
        assert_eq!(
            f.custody.custody_of(f.wallet_address()),
            usdc(10),
            "closed funds return to custody"
        );
        assert_eq!(f.custody.wallet_token_balance(), WALLET_FUNDS - usdc(10));
    }

    #[tokio::test]
    async fn test_inflated_resize_is_rejected_before_submission() {
        let f = Fixture::new().await;
        f.lifecycle.setup_channel(&f.coordinator, U256::zero()).await.unwrap();
        f.fake.inflate_next_state(usdc(1));

        let err = f
            .lifecycle
            .add_funds(&f.coordinator, usdc(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ClearsyncError::Protocol { .. }), "{}", err);
        assert!(!f.custody.calls().contains(&"resize".to_string()));

        let record = f.lifecycle.record().unwrap();
        assert!(matches!(record.phase, LifecyclePhase::Failed { ref at, .. } if **at == LifecyclePhase::Resizing));
        assert!(f.lifecycle.channel_id().is_some());
    }

    #[tokio::test]
    async fn test_close_paying_the_wallet_share_elsewhere_is_rejected() {
        for to in [None, Some(Address::repeat_byte(0x77))] {
            let f = Fixture::new().await;
            f.lifecycle.setup_channel(&f.coordinator, usdc(10)).await.unwrap();
            f.fake
                .redirect_next_close(to.unwrap_or_else(|| f.fake.broker_address()));

            let err = f.lifecycle.close_channel(&f.coordinator).await.unwrap_err();
            assert!(matches!(err, ClearsyncError::Protocol { .. }), "{}", err);
            assert!(!f.custody.calls().contains(&"close".to_string()));
            assert!(f.lifecycle.channel_id().is_some());
            assert_eq!(f.custody.custody_of(f.wallet_address()), U256::zero());
        }
    }

    #[tokio::test]
    async fn test_failure_keeps_channel_addressable_and_resumable() {
        let f = Fixture::new().await;
        f.custody.revert_next("deposit");

        let err = f
            .lifecycle
            .setup_channel(&f.coordinator, usdc(10))
            .await
            .unwrap_err();
        assert!(
            matches!(err, ClearsyncError::Settlement { step: SettlementStep::Deposit, .. }),
            "{}",
            err
        );

        let channel_id = f.lifecycle.channel_id().expect("channel id survives failure");
        assert_eq!(f.lifecycle.status(), Some(ChannelStatus::Resizing));
        assert!(f.lifecycle.phase().is_failed());

        // A fresh process sees the same record.
        let reloaded = f.reload().await;
        assert_eq!(reloaded.channel_id(), Some(channel_id));
        assert!(reloaded.phase().is_failed());

        // Failed channels must be resumed before further operations.
        assert!(matches!(
            reloaded.add_funds(&f.coordinator, usdc(1)).await,
            Err(ClearsyncError::InvalidState(_))
        ));

        let channel = reloaded.resume(None).await.unwrap();
        assert_eq!(channel.status, ChannelStatus::Confirmed);
        assert_eq!(reloaded.phase(), LifecyclePhase::Active);

        reloaded.add_funds(&f.coordinator, usdc(10)).await.unwrap();
        assert_eq!(reloaded.status(), Some(ChannelStatus::Active));
        reloaded.close_channel(&f.coordinator).await.unwrap();
        assert_eq!(reloaded.channel_id(), None);
    }

    #[tokio::test]
    async fn test_resume_waits_for_pending_transaction() {
        let f = Fixture::new().await;
        f.custody.fail_next("wait:create");

        let err = f
            .lifecycle
            .setup_channel(&f.coordinator, U256::zero())
            .await
            .unwrap_err();
        assert!(matches!(err, ClearsyncError::Settlement { step: SettlementStep::Create, .. }));
        let record = f.lifecycle.record().unwrap();
        assert_eq!(record.status(), ChannelStatus::Submitted);
        assert!(record.pending_tx.is_some());

        let channel = f.lifecycle.resume(Some(record.channel_id())).await.unwrap();
        assert_eq!(channel.status, ChannelStatus::Confirmed);
        assert!(f.lifecycle.record().unwrap().pending_tx.is_none());
        assert!(f.lifecycle.last_confirmed_state().is_some());
    }

    #[tokio::test]
    async fn test_resume_of_closed_channel_marks_closed() {
        let f = Fixture::new().await;
        f.lifecycle.setup_channel(&f.coordinator, usdc(2)).await.unwrap();
        f.custody.fail_next("wait:close");
        assert!(f.lifecycle.close_channel(&f.coordinator).await.is_err());
        assert_eq!(f.lifecycle.status(), Some(ChannelStatus::Closing));

        let channel = f.lifecycle.resume(None).await.unwrap();
        assert_eq!(channel.status, ChannelStatus::Closed);
        assert_eq!(f.lifecycle.channel_id(), None);
        assert!(f.lifecycle.open_channels().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_operations_are_rejected() {
        let f = Fixture::new().await;
        let gate = f.custody.pause_confirmations();

        let lifecycle = f.lifecycle.clone();
        let coordinator = f.coordinator.clone();
        let setup = tokio::spawn(async move { lifecycle.setup_channel(&coordinator, usdc(1)).await });

        // Wait until the creation transaction is pending.
        let mut phases = f.lifecycle.subscribe();
        while *phases.borrow_and_update() != LifecyclePhase::OnchainConfirming {
            phases.changed().await.unwrap();
        }

        let busy = f.lifecycle.add_funds(&f.coordinator, usdc(1)).await;
        assert!(matches!(busy, Err(ClearsyncError::Busy(_))));
        let busy = f.lifecycle.close_channel(&f.coordinator).await;
        assert!(matches!(busy, Err(ClearsyncError::Busy(_))));

        gate.add_permits(16);
        setup.await.unwrap().unwrap();
        assert_eq!(f.lifecycle.status(), Some(ChannelStatus::Active));
    }

    #[tokio::test]
    async fn test_close_refused_while_app_session_open() {
        let f = Fixture::new().await;
        f.lifecycle.setup_channel(&f.coordinator, usdc(3)).await.unwrap();
        f.app_sessions
            .create(&f.coordinator, &f.lifecycle, f.fake.broker_address(), usdc(1))
            .await
            .unwrap();

        let err = f.lifecycle.close_channel(&f.coordinator).await.unwrap_err();
        assert!(matches!(err, ClearsyncError::InvalidState(_)));
        assert_eq!(f.lifecycle.status(), Some(ChannelStatus::Active));
        assert!(!f.lifecycle.phase().is_failed());
    }

    #[tokio::test]
    async fn test_withdraw_checks_custody_balance() {
        let f = Fixture::new().await;
        f.lifecycle.setup_channel(&f.coordinator, usdc(5)).await.unwrap();
        f.lifecycle.close_channel(&f.coordinator).await.unwrap();

        let too_much = f.lifecycle.withdraw(Some(usdc(6))).await;
        assert!(matches!(too_much, Err(ClearsyncError::Validation(_))));

        f.lifecycle.withdraw(None).await.unwrap();
        assert_eq!(f.lifecycle.custody_balance().await.unwrap(), U256::zero());
        assert_eq!(f.custody.wallet_token_balance(), WALLET_FUNDS);

        let nothing = f.lifecycle.withdraw(None).await;
        assert!(matches!(nothing, Err(ClearsyncError::Validation(_))));
    }

    #[test]
    fn test_validate_resize_rules() {
        let owner = Address::repeat_byte(0xaa);
        let broker = Address::repeat_byte(0xbb);
        let token = Address::repeat_byte(0x0c);
        let state = |version: u64, mine: u64, theirs: u64, intent: Intent| ChannelState {
            channel_id: ChannelId::repeat_byte(1),
            intent,
            version: U256::from(version),
            data: vec![],
            allocations: vec![
                Allocation { destination: owner, token, amount: U256::from(mine) },
                Allocation { destination: broker, token, amount: U256::from(theirs) },
            ],
            coordinator_signature: vec![],
            signatures: vec![],
        };

        let expected = Expected {
            owner,
            coordinator: broker,
            token,
            paid_out: U256::zero(),
        };

        let previous = state(1, 5, 0, Intent::Resize);
        let amount = U256::from(3u64);
        validate_resize(&previous, &state(2, 8, 0, Intent::Resize), &expected, amount).unwrap();

        // stale version
        assert!(validate_resize(&previous, &state(1, 8, 0, Intent::Resize), &expected, amount).is_err());
        // total grows by more than the deposit
        assert!(validate_resize(&previous, &state(2, 8, 1, Intent::Resize), &expected, amount).is_err());
        // deposit credited to the coordinator
        assert!(validate_resize(&previous, &state(2, 5, 3, Intent::Resize), &expected, amount).is_err());
        // wrong intent
        assert!(validate_resize(&previous, &state(2, 8, 0, Intent::Operate), &expected, amount).is_err());

        // an app session paid 2 to the coordinator's side
        let after_loss = Expected {
            paid_out: U256::from(2u64),
            ..expected
        };
        validate_resize(&previous, &state(2, 6, 2, Intent::Resize), &after_loss, amount).unwrap();
        assert!(validate_resize(&previous, &state(2, 8, 0, Intent::Resize), &after_loss, amount).is_err());
    }

    #[test]
    fn test_validate_close_rules() {
        let owner = Address::repeat_byte(0xaa);
        let broker = Address::repeat_byte(0xbb);
        let stranger = Address::repeat_byte(0x77);
        let token = Address::repeat_byte(0x0c);
        let allocation = |destination: Address, amount: u64| Allocation {
            destination,
            token,
            amount: U256::from(amount),
        };
        let state = |version: u64, intent: Intent, allocations: Vec<Allocation>| ChannelState {
            channel_id: ChannelId::repeat_byte(1),
            intent,
            version: U256::from(version),
            data: vec![],
            allocations,
            coordinator_signature: vec![],
            signatures: vec![],
        };
        let expected = Expected {
            owner,
            coordinator: broker,
            token,
            paid_out: U256::zero(),
        };
        let previous = state(2, Intent::Resize, vec![allocation(owner, 10), allocation(broker, 0)]);
        let close = |allocations| validate_close(&previous, &state(3, Intent::Finalize, allocations), &expected, owner);

        close(vec![allocation(owner, 10), allocation(broker, 0)]).unwrap();

        // owner's share handed to the coordinator
        assert!(close(vec![allocation(owner, 0), allocation(broker, 10)]).is_err());
        // owner's share handed to a third party
        assert!(close(vec![allocation(stranger, 10), allocation(broker, 0)]).is_err());
        // no payout to the funds destination at all
        assert!(close(vec![allocation(broker, 10)]).is_err());
        // payout split over two allocations
        assert!(close(vec![allocation(owner, 5), allocation(owner, 5)]).is_err());
        // total shrinks
        assert!(close(vec![allocation(owner, 9), allocation(broker, 0)]).is_err());
        // stale version
        assert!(validate_close(
            &previous,
            &state(2, Intent::Finalize, vec![allocation(owner, 10), allocation(broker, 0)]),
            &expected,
            owner
        )
        .is_err());

        // a separate funds destination receives the owner's share
        let destination = Address::repeat_byte(0xde);
        validate_close(
            &previous,
            &state(3, Intent::Finalize, vec![allocation(destination, 10), allocation(broker, 0)]),
            &expected,
            destination,
        )
        .unwrap();

        // a closed app session lost 3 to the counterparty
        let after_loss = Expected {
            paid_out: U256::from(3u64),
            ..expected
        };
        validate_close(
            &previous,
            &state(3, Intent::Finalize, vec![allocation(owner, 7), allocation(broker, 3)]),
            &after_loss,
            owner,
        )
        .unwrap();
        assert!(validate_close(
            &previous,
            &state(3, Intent::Finalize, vec![allocation(owner, 10), allocation(broker, 0)]),
            &after_loss,
            owner,
        )
        .is_err());
    }
}
