//! In-memory coordinator and custody contract for tests.

use crate::abi::{self, Token};
use crate::auth::{AuthParams, Authenticator};
use crate::channel::{AppSessions, ChannelLifecycle, LifecycleParams};
use crate::config::{ClientConfig, Network};
use crate::error::{ClearsyncError, Result};
use crate::rpc::{Connection, Coordinator};
use crate::settlement::{OnchainChannel, OnchainStatus, SettlementAdapter, TxReceipt};
use crate::signer::{
    keccak256, AuthAllowance, AuthPolicy, LocalWallet, SessionKey, Signature, TypedData,
    WalletSigner,
};
use crate::storage::Storage;
use crate::types::{
    format_units, parse_units, Address, Allocation, ChannelDefinition, ChannelId, ChannelOpened, ChannelState,
    Intent, TxHash,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use primitive_types::{H256, U256};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, Semaphore};

pub(crate) const CHAIN_ID: u64 = 8453;
/// 1000 USDC in base units.
pub(crate) const WALLET_FUNDS: U256 = U256([1_000_000_000, 0, 0, 0]);

fn adjudicator() -> Address {
    Address::repeat_byte(0xad)
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

fn amount_param(value: &Value) -> U256 {
    match value {
        Value::Number(n) => n.as_u64().map(U256::from).unwrap_or_default(),
        Value::String(s) => U256::from_dec_str(s).unwrap_or_default(),
        _ => U256::zero(),
    }
}

fn address_param(value: &Value) -> Option<Address> {
    value.as_str().and_then(|s| Address::from_str(s).ok())
}

struct FakeChannel {
    definition: ChannelDefinition,
    token: Address,
    version: U256,
    allocations: Vec<Allocation>,
}

#[derive(Default)]
struct CoordinatorState {
    reject_auth: bool,
    pending_auth: HashMap<String, Value>,
    sessions: HashMap<Address, Address>,
    channels: HashMap<ChannelId, FakeChannel>,
    app_sessions: HashMap<H256, u64>,
    nonce: u64,
    fail_next: HashMap<String, String>,
    inflate_next: Option<U256>,
    redirect_close: Option<Address>,
    requests: Vec<(String, Value)>,
}

/// Coordinator speaking the wire format over an in-process `Connection`.
///
/// Verifies every frame signature, runs the EIP-712 challenge check against
/// the parameters of the matching `auth_request`, and signs channel states
/// with its own broker key.
pub(crate) struct FakeCoordinator {
    pub connection: Arc<Connection>,
    broker: Arc<SessionKey>,
    state: Arc<Mutex<CoordinatorState>>,
    inbound: mpsc::UnboundedSender<String>,
}

impl FakeCoordinator {
    pub fn start() -> Self {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();
        let connection = Arc::new(Connection::from_channels(
            out_tx,
            in_rx,
            Duration::from_secs(5),
        ));
        let broker = Arc::new(SessionKey::generate());
        let state = Arc::new(Mutex::new(CoordinatorState::default()));

        let server = Server {
            broker: broker.clone(),
            state: state.clone(),
        };
        let replies = in_tx.clone();
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                for reply in server.handle(&text) {
                    if replies.send(reply).is_err() {
                        return;
                    }
                }
            }
        });

        Self {
            connection,
            broker,
            state,
            inbound: in_tx,
        }
    }

    pub fn broker_address(&self) -> Address {
        self.broker.address()
    }

    /// Answer the next `auth_verify` with `success: false`.
    pub fn reject_auth(&self) {
        self.state.lock().reject_auth = true;
    }

    /// Answer the next `method` request with an error frame.
    pub fn fail_next(&self, method: &str, message: &str) {
        self.state
            .lock()
            .fail_next
            .insert(method.to_string(), message.to_string());
    }

    /// Add `extra` to the coordinator's share of the next resize or close state.
    pub fn inflate_next_state(&self, extra: U256) {
        self.state.lock().inflate_next = Some(extra);
    }

    /// Pay the wallet's share of the next final state to `to` instead.
    pub fn redirect_next_close(&self, to: Address) {
        self.state.lock().redirect_close = Some(to);
    }

    pub fn push_raw(&self, frame: &str) {
        let _ = self.inbound.send(frame.to_string());
    }

    pub fn request_count(&self, method: &str) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|(m, _)| m == method)
            .count()
    }

    pub fn last_params(&self, method: &str) -> Value {
        self.state
            .lock()
            .requests
            .iter()
            .rev()
            .find(|(m, _)| m == method)
            .map(|(_, p)| p.clone())
            .unwrap_or(Value::Null)
    }

    /// Full handshake for `wallet`, returning a ready coordinator handle.
    pub async fn authenticate(&self, wallet: &LocalWallet, params: AuthParams) -> Coordinator {
        let session_key = Arc::new(SessionKey::generate());
        let auth = Authenticator::new(params);
        auth.mark_connected();
        let session = auth
            .authenticate(&self.connection, &session_key, wallet)
            .await
            .expect("fake coordinator handshake");
        Coordinator::new(self.connection.clone(), session_key, session)
    }
}

struct Server {
    broker: Arc<SessionKey>,
    state: Arc<Mutex<CoordinatorState>>,
}

impl Server {
    fn frame(&self, id: u64, method: &str, params: Value) -> String {
        let res = json!([id, method, params, now_ms()]);
        let payload = serde_json::to_vec(&res).unwrap_or_default();
        let sig = self
            .broker
            .sign_payload(&payload)
            .map(|s| s.to_hex())
            .unwrap_or_default();
        json!({ "res": res, "sig": [sig] }).to_string()
    }

    fn error(&self, id: u64, message: &str) -> String {
        self.frame(id, "error", json!({ "error": message }))
    }

    fn handle(&self, text: &str) -> Vec<String> {
        let frame: Value = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => return vec![self.error(0, &format!("malformed frame: {}", e))],
        };
        let req = frame["req"].clone();
        let id = req[0].as_u64().unwrap_or(0);
        let method = req[1].as_str().unwrap_or_default().to_string();
        let params = req[2].clone();

        let Some(signature) = frame["sig"][0]
            .as_str()
            .and_then(|s| Signature::from_hex(s).ok())
        else {
            return vec![self.error(id, "missing request signature")];
        };
        // auth_verify carries the wallet's EIP-712 signature instead.
        let signer = serde_json::to_vec(&req)
            .ok()
            .and_then(|payload| signature.recover(&keccak256(&payload)).ok());

        let mut state = self.state.lock();
        state.requests.push((method.clone(), params.clone()));
        if let Some(message) = state.fail_next.remove(&method) {
            return vec![self.error(id, &message)];
        }

        match method.as_str() {
            "auth_request" => {
                if signer.is_none() || address_param(&params["session_key"]) != signer {
                    return vec![self.error(id, "auth_request must be signed by the session key")];
                }
                let challenge = uuid::Uuid::new_v4().to_string();
                state.pending_auth.insert(challenge.clone(), params);
                vec![self.frame(id, "auth_challenge", json!({ "challenge_message": challenge }))]
            }
            "auth_verify" => self.verify(&mut state, id, &params, &signature),
            _ => {
                let Some(signer) = signer else {
                    return vec![self.error(id, "invalid request signature")];
                };
                let Some(wallet) = state.sessions.get(&signer).copied() else {
                    return vec![self.error(id, "session key is not authenticated")];
                };
                self.dispatch(&mut state, id, &method, &params, wallet)
            }
        }
    }

    fn verify(
        &self,
        state: &mut CoordinatorState,
        id: u64,
        params: &Value,
        signature: &Signature,
    ) -> Vec<String> {
        let challenge = params["challenge"].as_str().unwrap_or_default();
        let Some(request) = state.pending_auth.remove(challenge) else {
            return vec![self.error(id, "unknown challenge")];
        };
        if std::mem::take(&mut state.reject_auth) {
            return vec![self.frame(id, "auth_verify", json!({ "success": false }))];
        }

        let (Some(wallet), Some(session_key)) = (
            address_param(&request["address"]),
            address_param(&request["session_key"]),
        ) else {
            return vec![self.error(id, "malformed auth_request")];
        };
        let allowances: Vec<AuthAllowance> =
            serde_json::from_value(request["allowances"].clone()).unwrap_or_default();
        let typed = TypedData::new(
            request["application"].as_str().unwrap_or_default().to_string(),
            AuthPolicy {
                challenge: challenge.to_string(),
                scope: request["scope"].as_str().unwrap_or_default().to_string(),
                wallet,
                session_key,
                expires_at: request["expires_at"].as_u64().unwrap_or_default(),
                allowances,
            },
        );
        if signature.recover(&typed.digest()).ok() != Some(wallet) {
            return vec![self.error(id, "challenge signature does not match wallet")];
        }
        state.sessions.insert(session_key, wallet);
        vec![self.frame(
            id,
            "auth_verify",
            json!({
                "success": true,
                "address": format!("{:?}", wallet),
                "session_key": format!("{:?}", session_key),
            }),
        )]
    }

    fn sign(&self, state: &ChannelState) -> String {
        self.broker
            .sign_state(state)
            .map(|s| s.to_hex())
            .unwrap_or_default()
    }

    fn terms(&self, state: &ChannelState, definition: Option<&ChannelDefinition>) -> Value {
        let mut terms = json!({
            "channel_id": format!("{:?}", state.channel_id),
            "state": {
                "intent": u8::from(state.intent),
                "version": state.version.to_string(),
                "state_data": format!("0x{}", hex::encode(&state.data)),
                "allocations": state.allocations,
            },
            "server_signature": self.sign(state),
        });
        if let Some(definition) = definition {
            terms["channel"] = json!({
                "participants": definition.participants.iter().map(|p| format!("{:?}", p)).collect::<Vec<_>>(),
                "adjudicator": format!("{:?}", definition.adjudicator),
                "challenge": definition.challenge,
                "nonce": definition.nonce,
            });
        }
        terms
    }

    fn next_state(
        &self,
        state: &mut CoordinatorState,
        channel_id: ChannelId,
        intent: Intent,
        data: Vec<u8>,
        allocations: Vec<Allocation>,
    ) -> ChannelState {
        let mut allocations = allocations;
        if let Some(extra) = state.inflate_next.take() {
            if let Some(last) = allocations.last_mut() {
                last.amount = last.amount.saturating_add(extra);
            }
        }
        let channel = state.channels.get_mut(&channel_id);
        let version = channel
            .as_ref()
            .map(|c| c.version + U256::one())
            .unwrap_or_default();
        if let Some(channel) = channel {
            channel.version = version;
            channel.allocations = allocations.clone();
        }
        ChannelState {
            channel_id,
            intent,
            version,
            data,
            allocations,
            coordinator_signature: Vec::new(),
            signatures: Vec::new(),
        }
    }

    /// Whatever a closing session pays to others leaves the wallet's side of
    /// its newest channel and is held on the broker's side.
    fn settle_app_session(state: &mut CoordinatorState, wallet: Address, params: &Value) {
        let paid_out = params["allocations"]
            .as_array()
            .into_iter()
            .flatten()
            .filter(|a| address_param(&a["participant"]) != Some(wallet))
            .filter_map(|a| a["amount"].as_str().and_then(|s| parse_units(s, 6).ok()))
            .fold(U256::zero(), |acc, amount| acc + amount);
        let channel = state
            .channels
            .values_mut()
            .filter(|c| c.definition.wallet() == wallet)
            .max_by_key(|c| c.definition.nonce);
        if let Some(channel) = channel {
            channel.allocations[0].amount = channel.allocations[0].amount.saturating_sub(paid_out);
            channel.allocations[1].amount = channel.allocations[1].amount.saturating_add(paid_out);
        }
    }

    fn dispatch(
        &self,
        state: &mut CoordinatorState,
        id: u64,
        method: &str,
        params: &Value,
        wallet: Address,
    ) -> Vec<String> {
        let broker = self.broker.address();
        match method {
            "get_config" => vec![self.frame(
                id,
                method,
                json!({
                    "broker_address": format!("{:?}", broker),
                    "networks": [{
                        "chain_id": CHAIN_ID,
                        "custody_address": format!("{:?}", Address::repeat_byte(0xcc)),
                        "adjudicator_address": format!("{:?}", adjudicator()),
                    }],
                }),
            )],
            "get_ledger_balances" => {
                let total = state
                    .channels
                    .values()
                    .filter(|c| c.definition.wallet() == wallet)
                    .flat_map(|c| c.allocations.iter())
                    .filter(|a| a.destination == wallet)
                    .fold(U256::zero(), |acc, a| acc + a.amount);
                vec![self.frame(
                    id,
                    method,
                    json!({ "ledger_balances": [{ "asset": "usdc", "amount": format_units(total, 6) }] }),
                )]
            }
            "create_channel" => {
                let chain_id = params["chain_id"].as_u64().unwrap_or(CHAIN_ID);
                let Some(token) = address_param(&params["token"]) else {
                    return vec![self.error(id, "missing token")];
                };
                state.nonce += 1;
                let definition = ChannelDefinition {
                    participants: [wallet, broker],
                    adjudicator: adjudicator(),
                    challenge: 3600,
                    nonce: state.nonce,
                };
                let channel_id = definition.channel_id(chain_id);
                let allocations = vec![
                    Allocation { destination: wallet, token, amount: U256::zero() },
                    Allocation { destination: broker, token, amount: U256::zero() },
                ];
                let initial = ChannelState {
                    channel_id,
                    intent: Intent::Initialize,
                    version: U256::zero(),
                    data: Vec::new(),
                    allocations: allocations.clone(),
                    coordinator_signature: Vec::new(),
                    signatures: Vec::new(),
                };
                state.channels.insert(
                    channel_id,
                    FakeChannel {
                        definition: definition.clone(),
                        token,
                        version: U256::zero(),
                        allocations,
                    },
                );
                vec![self.frame(id, method, self.terms(&initial, Some(&definition)))]
            }
            "resize_channel" => {
                let Some(channel_id) = params["channel_id"].as_str().and_then(|s| H256::from_str(s).ok()) else {
                    return vec![self.error(id, "missing channel_id")];
                };
                let Some(channel) = state.channels.get(&channel_id) else {
                    return vec![self.error(id, "channel not found")];
                };
                let resize = amount_param(&params["resize_amount"]);
                let allocate = amount_param(&params["allocate_amount"]);
                let mut allocations = channel.allocations.clone();
                allocations[0].amount = allocations[0]
                    .amount
                    .saturating_add(resize)
                    .saturating_sub(allocate);
                let data = abi::encode(&[Token::Uint(resize), Token::Uint(allocate)]);
                let next = self.next_state(state, channel_id, Intent::Resize, data, allocations);
                let total = next.allocations[0].amount;

                vec![
                    self.frame(id, method, self.terms(&next, None)),
                    self.frame(
                        0,
                        "bu",
                        json!({ "balance_updates": [{ "asset": "usdc", "amount": format_units(total, 6) }] }),
                    ),
                ]
            }
            "close_channel" => {
                let Some(channel_id) = params["channel_id"].as_str().and_then(|s| H256::from_str(s).ok()) else {
                    return vec![self.error(id, "missing channel_id")];
                };
                let Some(channel) = state.channels.get(&channel_id) else {
                    return vec![self.error(id, "channel not found")];
                };
                let destination = state
                    .redirect_close
                    .take()
                    .or_else(|| address_param(&params["funds_destination"]))
                    .unwrap_or(wallet);
                let token = channel.token;
                let allocations = vec![
                    Allocation { destination, token, amount: channel.allocations[0].amount },
                    Allocation { destination: broker, token, amount: channel.allocations[1].amount },
                ];
                let last = self.next_state(state, channel_id, Intent::Finalize, Vec::new(), allocations);
                vec![self.frame(id, method, self.terms(&last, None))]
            }
            "create_app_session" => {
                let nonce = params["definition"]["nonce"].as_u64().unwrap_or_default();
                let mut seed = nonce.to_be_bytes().to_vec();
                seed.extend_from_slice(wallet.as_bytes());
                seed.extend_from_slice(&(state.app_sessions.len() as u64).to_be_bytes());
                let app_session_id = H256(keccak256(&seed));
                state.app_sessions.insert(app_session_id, 1);
                vec![
                    self.frame(
                        id,
                        method,
                        json!({ "app_session_id": format!("{:?}", app_session_id), "version": 1, "status": "open" }),
                    ),
                    self.frame(
                        0,
                        "asu",
                        json!({ "app_session_id": format!("{:?}", app_session_id), "status": "open" }),
                    ),
                ]
            }
            "submit_app_state" | "close_app_session" => {
                let Some(app_session_id) = params["app_session_id"].as_str().and_then(|s| H256::from_str(s).ok()) else {
                    return vec![self.error(id, "missing app_session_id")];
                };
                let Some(version) = state.app_sessions.get_mut(&app_session_id) else {
                    return vec![self.error(id, "app session not found")];
                };
                *version += 1;
                let version = *version;
                let status = if method == "close_app_session" {
                    Self::settle_app_session(state, wallet, params);
                    "closed"
                } else {
                    "open"
                };
                vec![self.frame(
                    id,
                    method,
                    json!({ "app_session_id": format!("{:?}", app_session_id), "version": version, "status": status }),
                )]
            }
            other => vec![self.error(id, &format!("unsupported method {}", other))],
        }
    }
}

enum Effect {
    Create(ChannelDefinition, ChannelState),
    Deposit(U256),
    Resize(ChannelState),
    Close(ChannelState),
    Withdraw(U256),
}

struct FakeTx {
    label: &'static str,
    effect: Effect,
    reverted: bool,
    applied: bool,
}

struct FakeOnchain {
    status: OnchainStatus,
    definition: ChannelDefinition,
    last: ChannelState,
    locked: U256,
}

struct ChainState {
    calls: Vec<String>,
    wallet_tokens: U256,
    custody: HashMap<Address, U256>,
    channels: HashMap<ChannelId, FakeOnchain>,
    txs: HashMap<TxHash, FakeTx>,
    next_tx: u64,
    block: u64,
    fail_next: HashSet<String>,
    revert_next: HashSet<String>,
    stale_proof_seen: bool,
}

/// Custody contract model. Effects land when a transaction is confirmed,
/// and every call is logged in order.
pub(crate) struct FakeCustody {
    chain_id: u64,
    wallet: Address,
    state: Mutex<ChainState>,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl FakeCustody {
    pub fn new(chain_id: u64, wallet: Address) -> Self {
        Self {
            chain_id,
            wallet,
            state: Mutex::new(ChainState {
                calls: Vec::new(),
                wallet_tokens: WALLET_FUNDS,
                custody: HashMap::new(),
                channels: HashMap::new(),
                txs: HashMap::new(),
                next_tx: 0,
                block: 100,
                fail_next: HashSet::new(),
                revert_next: HashSet::new(),
                stale_proof_seen: false,
            }),
            gate: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    /// Fail the next call labelled `label` (e.g. `deposit`, `wait:create`).
    pub fn fail_next(&self, label: &str) {
        self.state.lock().fail_next.insert(label.to_string());
    }

    /// Revert the next transaction of kind `label`.
    pub fn revert_next(&self, label: &str) {
        self.state.lock().revert_next.insert(label.to_string());
    }

    /// Hold confirmations until the returned semaphore gets permits.
    pub fn pause_confirmations(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock() = Some(gate.clone());
        gate
    }

    pub fn proofs_were_latest(&self) -> bool {
        !self.state.lock().stale_proof_seen
    }

    pub fn custody_of(&self, account: Address) -> U256 {
        self.state
            .lock()
            .custody
            .get(&account)
            .copied()
            .unwrap_or_default()
    }

    pub fn wallet_token_balance(&self) -> U256 {
        self.state.lock().wallet_tokens
    }

    fn submit(&self, label: &'static str, effect: Effect) -> Result<TxHash> {
        let mut state = self.state.lock();
        state.calls.push(label.to_string());
        if state.fail_next.remove(label) {
            return Err(ClearsyncError::rpc(format!("injected {} failure", label)));
        }
        state.next_tx += 1;
        let tx_hash = H256::from_low_u64_be(state.next_tx);
        let reverted = state.revert_next.remove(label);
        state.txs.insert(
            tx_hash,
            FakeTx {
                label,
                effect,
                reverted,
                applied: false,
            },
        );
        Ok(tx_hash)
    }

    fn check_progress(state: &mut ChainState, next: &ChannelState, proofs: &[ChannelState]) -> Result<()> {
        let channel = state
            .channels
            .get(&next.channel_id)
            .ok_or_else(|| ClearsyncError::rpc("execution reverted: unknown channel"))?;
        if !channel.status.is_open() {
            return Err(ClearsyncError::rpc("execution reverted: channel not open"));
        }
        if !next.is_countersigned() || next.signatures[1] != next.coordinator_signature {
            return Err(ClearsyncError::rpc("execution reverted: missing signatures"));
        }
        if next.version <= channel.last.version {
            return Err(ClearsyncError::rpc("execution reverted: stale version"));
        }
        let proof_ok = proofs.len() == 1 && proofs[0].version == channel.last.version;
        if !proof_ok {
            state.stale_proof_seen = true;
            return Err(ClearsyncError::rpc("execution reverted: invalid proof"));
        }
        Ok(())
    }

    fn apply(&self, state: &mut ChainState, effect: &Effect) {
        let wallet = self.wallet;
        match effect {
            Effect::Create(definition, initial) => {
                state.channels.insert(
                    initial.channel_id,
                    FakeOnchain {
                        status: OnchainStatus::Initial,
                        definition: definition.clone(),
                        last: initial.clone(),
                        locked: initial.total(),
                    },
                );
            }
            Effect::Deposit(amount) => {
                state.wallet_tokens = state.wallet_tokens.saturating_sub(*amount);
                *state.custody.entry(wallet).or_default() += *amount;
            }
            Effect::Resize(next) => {
                let locked = state
                    .channels
                    .get(&next.channel_id)
                    .map(|c| c.locked)
                    .unwrap_or_default();
                let added = next.total().saturating_sub(locked);
                let custody = state.custody.entry(wallet).or_default();
                *custody = custody.saturating_sub(added);
                if let Some(channel) = state.channels.get_mut(&next.channel_id) {
                    channel.status = OnchainStatus::Active;
                    channel.locked = next.total();
                    channel.last = next.clone();
                }
            }
            Effect::Close(last) => {
                for allocation in &last.allocations {
                    *state.custody.entry(allocation.destination).or_default() += allocation.amount;
                }
                if let Some(channel) = state.channels.get_mut(&last.channel_id) {
                    channel.status = OnchainStatus::Final;
                    channel.locked = U256::zero();
                    channel.last = last.clone();
                }
            }
            Effect::Withdraw(amount) => {
                let custody = state.custody.entry(wallet).or_default();
                *custody = custody.saturating_sub(*amount);
                state.wallet_tokens += *amount;
            }
        }
    }
}

#[async_trait]
impl SettlementAdapter for FakeCustody {
    async fn create_channel(
        &self,
        definition: &ChannelDefinition,
        initial: &ChannelState,
    ) -> Result<ChannelOpened> {
        if definition.channel_id(self.chain_id) != initial.channel_id || !initial.is_countersigned() {
            return Err(ClearsyncError::rpc("execution reverted: invalid initial state"));
        }
        let tx_hash = self.submit("create", Effect::Create(definition.clone(), initial.clone()))?;
        Ok(ChannelOpened {
            channel_id: initial.channel_id,
            tx_hash,
        })
    }

    async fn deposit(&self, _token: Address, amount: U256) -> Result<TxHash> {
        if self.state.lock().wallet_tokens < amount {
            return Err(ClearsyncError::rpc("execution reverted: insufficient balance"));
        }
        self.submit("deposit", Effect::Deposit(amount))
    }

    async fn resize(&self, state: &ChannelState, proofs: &[ChannelState]) -> Result<TxHash> {
        {
            let mut chain = self.state.lock();
            Self::check_progress(&mut chain, state, proofs)?;
            let locked = chain.channels.get(&state.channel_id).map(|c| c.locked).unwrap_or_default();
            let needed = state.total().saturating_sub(locked);
            if chain.custody.get(&self.wallet).copied().unwrap_or_default() < needed {
                return Err(ClearsyncError::rpc("execution reverted: insufficient custody balance"));
            }
        }
        self.submit("resize", Effect::Resize(state.clone()))
    }

    async fn close(&self, state: &ChannelState, proofs: &[ChannelState]) -> Result<TxHash> {
        Self::check_progress(&mut self.state.lock(), state, proofs)?;
        self.submit("close", Effect::Close(state.clone()))
    }

    async fn query(&self, channel_id: ChannelId) -> Result<OnchainChannel> {
        self.state.lock().calls.push("query".to_string());
        let state = self.state.lock();
        Ok(match state.channels.get(&channel_id) {
            Some(channel) => OnchainChannel {
                status: channel.status,
                wallets: channel.definition.participants.to_vec(),
                challenge_expiry: 0,
                last_valid_state: Some(channel.last.clone()),
                locked: channel.locked,
            },
            None => OnchainChannel {
                status: OnchainStatus::Void,
                wallets: Vec::new(),
                challenge_expiry: 0,
                last_valid_state: None,
                locked: U256::zero(),
            },
        })
    }

    async fn wait_for_confirmation(&self, tx_hash: TxHash) -> Result<TxReceipt> {
        let label = {
            let mut state = self.state.lock();
            let label = state
                .txs
                .get(&tx_hash)
                .map(|tx| tx.label)
                .ok_or_else(|| ClearsyncError::rpc(format!("unknown transaction {:?}", tx_hash)))?;
            let wait = format!("wait:{}", label);
            state.calls.push(wait.clone());
            if state.fail_next.remove(&wait) {
                return Err(ClearsyncError::rpc(format!("injected {} failure", wait)));
            }
            label
        };

        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.acquire()
                .await
                .map_err(|e| ClearsyncError::internal(e.to_string()))?
                .forget();
        }

        let mut state = self.state.lock();
        state.block += 1;
        let block_number = state.block;
        let Some(mut tx) = state.txs.remove(&tx_hash) else {
            return Err(ClearsyncError::rpc(format!("unknown transaction {:?}", tx_hash)));
        };
        let result = if tx.reverted {
            Err(ClearsyncError::OnchainRevert {
                tx_hash: format!("{:?}", tx_hash),
                reason: format!("{} reverted", label),
            })
        } else {
            if !tx.applied {
                self.apply(&mut state, &tx.effect);
                tx.applied = true;
            }
            state.calls.push(format!("confirmed:{}", label));
            Ok(TxReceipt {
                tx_hash,
                block_number,
            })
        };
        state.txs.insert(tx_hash, tx);
        result
    }

    async fn withdraw(&self, _token: Address, amount: U256) -> Result<TxHash> {
        if self.custody_of(self.wallet) < amount {
            return Err(ClearsyncError::rpc("execution reverted: insufficient custody balance"));
        }
        self.submit("withdraw", Effect::Withdraw(amount))
    }

    async fn custody_balance(&self, account: Address, _token: Address) -> Result<U256> {
        Ok(self.custody_of(account))
    }

    async fn open_channels(&self, account: Address) -> Result<Vec<ChannelId>> {
        Ok(self
            .state
            .lock()
            .channels
            .iter()
            .filter(|(_, c)| c.status.is_open() && c.definition.wallet() == account)
            .map(|(id, _)| *id)
            .collect())
    }
}

/// A wallet authenticated against a fake coordinator, with a lifecycle over
/// fake custody and a file-backed database.
pub(crate) struct Fixture {
    pub fake: FakeCoordinator,
    pub custody: Arc<FakeCustody>,
    pub storage: Arc<Storage>,
    pub wallet: LocalWallet,
    pub config: ClientConfig,
    pub coordinator: Arc<Coordinator>,
    pub lifecycle: Arc<ChannelLifecycle>,
    pub app_sessions: AppSessions,
    _dir: TempDir,
}

impl Fixture {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Arc::new(
            Storage::new(&dir.path().join("clearsync.db"))
                .await
                .expect("storage"),
        );
        let wallet = LocalWallet::from_hex(&"42".repeat(32)).expect("wallet key");
        let config = ClientConfig::new(Network::Base);

        let fake = FakeCoordinator::start();
        let coordinator = Arc::new(fake.authenticate(&wallet, config.auth_params()).await);
        let custody = Arc::new(FakeCustody::new(CHAIN_ID, wallet.address()));
        let lifecycle = Arc::new(
            ChannelLifecycle::new(
                config.lifecycle_params(wallet.address()),
                custody.clone(),
                storage.clone(),
            )
            .await
            .expect("lifecycle"),
        );
        let app_sessions = AppSessions::new(&lifecycle);

        Self {
            fake,
            custody,
            storage,
            wallet,
            config,
            coordinator,
            lifecycle,
            app_sessions,
            _dir: dir,
        }
    }

    pub fn wallet_address(&self) -> Address {
        self.wallet.address()
    }

    pub fn params(&self) -> LifecycleParams {
        self.config.lifecycle_params(self.wallet.address())
    }

    /// A second lifecycle over the same database, as after a restart.
    pub async fn reload(&self) -> ChannelLifecycle {
        ChannelLifecycle::new(self.params(), self.custody.clone(), self.storage.clone())
            .await
            .expect("reload lifecycle")
    }
}
