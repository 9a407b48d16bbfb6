use crate::auth::{AuthSession, AuthState, Authenticator};
use crate::channel::{AppSessions, ChannelLifecycle, LifecyclePhase};
use crate::config::ClientConfig;
use crate::error::{ClearsyncError, Result};
use crate::rpc::{Connection, Coordinator, CoordinatorConfig, Notification};
use crate::settlement::{EvmCustody, SettlementAdapter};
use crate::signer::{SessionKey, WalletSigner};
use crate::storage::Storage;
use crate::types::{
    Address, AppAllocation, AppSession, Channel, ChannelId, ChannelOpened, ChannelState,
    ChannelStatus, LedgerBalance, TxHash,
};
use parking_lot::{Mutex, RwLock};
use primitive_types::U256;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Everything a wallet needs to run channels against one coordinator.
///
/// Owns the coordinator connection, the auth handshake, the channel
/// lifecycle and the app sessions layered on top of it.
pub struct ChannelClient {
    config: ClientConfig,
    wallet: Arc<dyn WalletSigner>,
    authenticator: Arc<Authenticator>,
    lifecycle: Arc<ChannelLifecycle>,
    app_sessions: AppSessions,
    connection: Arc<RwLock<Option<Arc<Connection>>>>,
    coordinator: Arc<RwLock<Option<Arc<Coordinator>>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

fn is_current(current: &Option<Arc<Connection>>, connection: &Weak<Connection>) -> bool {
    current
        .as_ref()
        .is_some_and(|c| std::ptr::eq(Arc::as_ptr(c), connection.as_ptr()))
}

impl ChannelClient {
    pub async fn new(
        config: ClientConfig,
        wallet: Arc<dyn WalletSigner>,
        settlement: Arc<dyn SettlementAdapter>,
        storage: Arc<Storage>,
    ) -> Result<Self> {
        config.validate()?;
        let lifecycle = Arc::new(
            ChannelLifecycle::new(config.lifecycle_params(wallet.address()), settlement, storage)
                .await?,
        );
        let app_sessions = AppSessions::new(&lifecycle);

        Ok(Self {
            authenticator: Arc::new(Authenticator::new(config.auth_params())),
            config,
            wallet,
            lifecycle,
            app_sessions,
            connection: Arc::new(RwLock::new(None)),
            coordinator: Arc::new(RwLock::new(None)),
            listener: Mutex::new(None),
        })
    }

    /// Settle through the custody contract named in `config`.
    pub async fn with_evm_custody(
        config: ClientConfig,
        wallet: Arc<dyn WalletSigner>,
        storage: Arc<Storage>,
    ) -> Result<Self> {
        let custody = Arc::new(EvmCustody::new(config.custody_config(), wallet.clone())?);
        Self::new(config, wallet, custody, storage).await
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn wallet_address(&self) -> Address {
        self.wallet.address()
    }

    pub fn lifecycle(&self) -> &Arc<ChannelLifecycle> {
        &self.lifecycle
    }

    pub fn auth_state(&self) -> AuthState {
        self.authenticator.state()
    }

    pub fn session(&self) -> Option<AuthSession> {
        self.authenticator.session()
    }

    pub fn is_connected(&self) -> bool {
        self.connection
            .read()
            .as_ref()
            .map(|c| !c.is_closed())
            .unwrap_or(false)
    }

    /// Open the websocket and authenticate.
    pub async fn connect(&self) -> Result<AuthSession> {
        let connection =
            Connection::connect(&self.config.coordinator_url, self.config.request_timeout).await?;
        self.attach(Arc::new(connection));
        self.authenticate().await
    }

    /// Adopt an already open connection. Any previous session is dropped.
    pub fn attach(&self, connection: Arc<Connection>) {
        let previous = {
            let mut current = self.connection.write();
            if let Some(listener) = self.listener.lock().take() {
                listener.abort();
            }
            let previous = current.replace(connection.clone());
            self.coordinator.write().take();
            self.authenticator.mark_connected();
            previous
        };
        if let Some(previous) = previous {
            previous.close();
        }

        let mut notifications = connection.subscribe();
        let watched = Arc::downgrade(&connection);
        let current = self.connection.clone();
        let authenticator = self.authenticator.clone();
        let coordinator = self.coordinator.clone();
        let listener = tokio::spawn(async move {
            loop {
                match notifications.recv().await {
                    Ok(Notification::Disconnected(reason)) => {
                        // A replaced connection no longer owns the auth state.
                        let current = current.read();
                        if is_current(&current, &watched) {
                            tracing::warn!("Coordinator disconnected ({}); reconnect to continue", reason);
                            authenticator.mark_disconnected();
                            coordinator.write().take();
                        }
                        break;
                    }
                    Ok(Notification::BalanceUpdate(balances)) => {
                        for balance in balances {
                            tracing::info!("Ledger balance: {} {}", balance.amount, balance.asset);
                        }
                    }
                    Ok(Notification::AppSessionUpdate(update)) => {
                        tracing::debug!("App session update: {}", update);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!("Skipped {} coordinator notifications", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *self.listener.lock() = Some(listener);
    }

    /// Run the handshake with a fresh session key.
    pub async fn authenticate(&self) -> Result<AuthSession> {
        let connection = self
            .connection
            .read()
            .clone()
            .ok_or_else(|| ClearsyncError::invalid_state("Not connected to a coordinator"))?;

        let session_key = Arc::new(SessionKey::generate());
        let session = self
            .authenticator
            .authenticate(&connection, &session_key, self.wallet.as_ref())
            .await?;

        let current = self.connection.read();
        if !is_current(&current, &Arc::downgrade(&connection)) {
            return Err(ClearsyncError::invalid_state(
                "Connection was replaced during the handshake",
            ));
        }
        *self.coordinator.write() = Some(Arc::new(Coordinator::new(
            connection,
            session_key,
            session.clone(),
        )));
        Ok(session)
    }

    /// The authenticated coordinator handle.
    pub fn coordinator(&self) -> Result<Arc<Coordinator>> {
        let coordinator = self.coordinator.read().clone().ok_or_else(|| {
            ClearsyncError::auth(format!(
                "Not authenticated ({}); connect first",
                self.authenticator.state()
            ))
        })?;
        if coordinator.session().is_expired() {
            return Err(ClearsyncError::auth("Session expired; reconnect to authenticate again"));
        }
        Ok(coordinator)
    }

    pub fn disconnect(&self) {
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
        if let Some(connection) = self.connection.write().take() {
            connection.close();
        }
        self.coordinator.write().take();
        self.authenticator.mark_disconnected();
    }

    pub async fn coordinator_config(&self) -> Result<CoordinatorConfig> {
        self.coordinator()?.get_config().await
    }

    /// Off-chain ledger balances, fetched from the coordinator.
    pub async fn ledger_balances(&self) -> Result<Vec<LedgerBalance>> {
        self.coordinator()?.get_ledger_balances().await
    }

    pub async fn setup_channel(&self, amount: U256) -> Result<ChannelOpened> {
        let coordinator = self.coordinator()?;
        self.lifecycle.setup_channel(&coordinator, amount).await
    }

    pub async fn add_funds(&self, amount: U256) -> Result<()> {
        let coordinator = self.coordinator()?;
        self.lifecycle.add_funds(&coordinator, amount).await
    }

    pub async fn close_channel(&self) -> Result<TxHash> {
        let coordinator = self.coordinator()?;
        self.lifecycle.close_channel(&coordinator).await
    }

    /// Reconcile with the chain. Needs no coordinator session.
    pub async fn resume(&self, channel_id: Option<ChannelId>) -> Result<Channel> {
        self.lifecycle.resume(channel_id).await
    }

    pub async fn open_channels(&self) -> Result<Vec<ChannelId>> {
        self.lifecycle.open_channels().await
    }

    pub async fn custody_balance(&self) -> Result<U256> {
        self.lifecycle.custody_balance().await
    }

    pub async fn withdraw(&self, amount: Option<U256>) -> Result<TxHash> {
        self.lifecycle.withdraw(amount).await
    }

    pub fn channel(&self) -> Option<Channel> {
        self.lifecycle.channel()
    }

    pub fn channel_id(&self) -> Option<ChannelId> {
        self.lifecycle.channel_id()
    }

    pub fn last_confirmed_state(&self) -> Option<ChannelState> {
        self.lifecycle.last_confirmed_state()
    }

    pub fn channel_status(&self) -> Option<ChannelStatus> {
        self.lifecycle.status()
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.lifecycle.phase()
    }

    pub fn status_line(&self) -> String {
        self.lifecycle.status_line()
    }

    pub async fn app_session(&self) -> Result<Option<AppSession>> {
        self.app_sessions.current(&self.lifecycle).await
    }

    pub async fn open_app_session(&self, counterparty: Address, amount: U256) -> Result<AppSession> {
        let coordinator = self.coordinator()?;
        self.app_sessions
            .create(&coordinator, &self.lifecycle, counterparty, amount)
            .await
    }

    pub async fn submit_app_state(&self, allocations: Vec<AppAllocation>) -> Result<AppSession> {
        let coordinator = self.coordinator()?;
        self.app_sessions
            .submit(&coordinator, &self.lifecycle, allocations)
            .await
    }

    pub async fn close_app_session(&self, allocations: Vec<AppAllocation>) -> Result<AppSession> {
        let coordinator = self.coordinator()?;
        self.app_sessions
            .close(&coordinator, &self.lifecycle, allocations)
            .await
    }
}

impl Drop for ChannelClient {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().take() {
            listener.abort();
        }
        if let Some(connection) = self.connection.write().take() {
            connection.close();
        }
    }
}
