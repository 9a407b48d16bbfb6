use crate::auth::AuthSession;
use crate::error::{ClearsyncError, Result};
use crate::rpc::{Connection, RpcMethod};
use crate::signer::SessionKey;
use crate::types::{
    dec_u256, hex_bytes, Address, Allocation, ChannelDefinition, ChannelId, ChannelState, Intent,
    LedgerBalance,
};
use primitive_types::{H256, U256};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

pub const APP_PROTOCOL: &str = "NitroRPC/0.4";

/// Accepts `12` and `"12"`.
pub(crate) mod flex_u64 {
    use serde::{de, Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        match serde_json::Value::deserialize(deserializer)? {
            serde_json::Value::Number(n) => n
                .as_u64()
                .ok_or_else(|| de::Error::custom(format!("invalid integer {}", n))),
            serde_json::Value::String(s) => s.parse().map_err(de::Error::custom),
            other => Err(de::Error::custom(format!("expected integer, got {}", other))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireChannel {
    pub participants: Vec<Address>,
    pub adjudicator: Address,
    #[serde(with = "flex_u64")]
    pub challenge: u64,
    #[serde(with = "flex_u64")]
    pub nonce: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireState {
    pub intent: Intent,
    #[serde(with = "dec_u256")]
    pub version: U256,
    #[serde(default, alias = "stateData")]
    pub state_data: Option<String>,
    pub allocations: Vec<Allocation>,
}

/// Coordinator-signed state returned by `create_channel`, `resize_channel`
/// and `close_channel`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelTerms {
    pub channel_id: ChannelId,
    #[serde(default)]
    pub channel: Option<WireChannel>,
    pub state: WireState,
    #[serde(alias = "serverSignature")]
    pub server_signature: String,
}

impl ChannelTerms {
    pub fn definition(&self) -> Result<ChannelDefinition> {
        let channel = self.channel.as_ref().ok_or_else(|| {
            ClearsyncError::protocol("create_channel", "response carries no channel definition")
        })?;
        let participants: [Address; 2] = channel.participants.clone().try_into().map_err(|p: Vec<Address>| {
            ClearsyncError::protocol(
                "create_channel",
                format!("expected 2 participants, got {}", p.len()),
            )
        })?;

        Ok(ChannelDefinition {
            participants,
            adjudicator: channel.adjudicator,
            challenge: channel.challenge,
            nonce: channel.nonce,
        })
    }

    /// The proposed state, signed by the coordinator only.
    pub fn state(&self) -> Result<ChannelState> {
        let data = match self.state.state_data.as_deref() {
            Some(data) if !data.is_empty() => hex_bytes::decode(data)
                .map_err(|e| ClearsyncError::protocol("channel state", e))?,
            _ => Vec::new(),
        };
        let coordinator_signature = hex_bytes::decode(&self.server_signature)
            .map_err(|e| ClearsyncError::protocol("channel state", e))?;

        Ok(ChannelState {
            channel_id: self.channel_id,
            intent: self.state.intent,
            version: self.state.version,
            data,
            allocations: self.state.allocations.clone(),
            coordinator_signature,
            signatures: Vec::new(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInfo {
    #[serde(deserialize_with = "flex_u64::deserialize")]
    pub chain_id: u64,
    #[serde(alias = "custodyAddress")]
    pub custody_address: Address,
    #[serde(alias = "adjudicatorAddress")]
    pub adjudicator_address: Address,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(alias = "brokerAddress")]
    pub broker_address: Address,
    #[serde(default)]
    pub networks: Vec<NetworkInfo>,
}

impl CoordinatorConfig {
    pub fn network(&self, chain_id: u64) -> Option<&NetworkInfo> {
        self.networks.iter().find(|n| n.chain_id == chain_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppAllocationWire {
    pub participant: Address,
    pub asset: String,
    pub amount: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppSessionReceipt {
    #[serde(alias = "appSessionId")]
    pub app_session_id: H256,
    #[serde(default, deserialize_with = "flex_u64::deserialize")]
    pub version: u64,
    #[serde(default)]
    pub status: String,
}

#[derive(Deserialize)]
struct LedgerBalancesResponse {
    #[serde(default, alias = "ledgerBalances")]
    ledger_balances: Vec<LedgerBalance>,
}

/// Integers that fit travel as JSON numbers, larger ones as decimal strings.
fn amount_json(amount: U256) -> Value {
    if amount <= U256::from(u64::MAX) {
        json!(amount.as_u64())
    } else {
        json!(amount.to_string())
    }
}

/// Authenticated handle to the coordinator.
///
/// Every request is signed with the session key that the handshake
/// delegated wallet authority to.
pub struct Coordinator {
    connection: Arc<Connection>,
    session_key: Arc<SessionKey>,
    session: AuthSession,
}

impl Coordinator {
    pub fn new(connection: Arc<Connection>, session_key: Arc<SessionKey>, session: AuthSession) -> Self {
        Self {
            connection,
            session_key,
            session,
        }
    }

    pub fn session(&self) -> &AuthSession {
        &self.session
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Countersigns channel states on the wallet's behalf.
    pub fn session_key(&self) -> &SessionKey {
        &self.session_key
    }

    async fn call<R: serde::de::DeserializeOwned>(&self, method: RpcMethod, params: Value) -> Result<R> {
        if self.session.is_expired() {
            return Err(ClearsyncError::auth(format!(
                "Session for {:?} expired at {}",
                self.session.session_key, self.session.expires_at
            )));
        }
        let name = method.to_string();
        let result = self
            .connection
            .request(method, params, &self.session_key)
            .await?;
        serde_json::from_value(result).map_err(|e| {
            ClearsyncError::protocol(name, format!("unexpected response shape: {}", e))
        })
    }

    pub async fn get_config(&self) -> Result<CoordinatorConfig> {
        self.call(RpcMethod::GetConfig, json!({})).await
    }

    pub async fn get_ledger_balances(&self) -> Result<Vec<LedgerBalance>> {
        let response: LedgerBalancesResponse = self
            .call(
                RpcMethod::GetLedgerBalances,
                json!({ "participant": format!("{:?}", self.session.wallet) }),
            )
            .await?;
        Ok(response.ledger_balances)
    }

    pub async fn create_channel(&self, chain_id: u64, token: Address) -> Result<ChannelTerms> {
        self.call(
            RpcMethod::CreateChannel,
            json!({ "chain_id": chain_id, "token": format!("{:?}", token) }),
        )
        .await
    }

    /// Ask for a resize state. `resize_amount` moves custody funds into the
    /// channel; `allocate_amount` moves channel funds into the unified ledger.
    pub async fn resize_channel(
        &self,
        channel_id: ChannelId,
        resize_amount: U256,
        allocate_amount: U256,
        funds_destination: Address,
    ) -> Result<ChannelTerms> {
        let mut params = json!({
            "channel_id": format!("{:?}", channel_id),
            "funds_destination": format!("{:?}", funds_destination),
        });
        if !resize_amount.is_zero() {
            params["resize_amount"] = amount_json(resize_amount);
        }
        if !allocate_amount.is_zero() {
            params["allocate_amount"] = amount_json(allocate_amount);
        }
        self.call(RpcMethod::ResizeChannel, params).await
    }

    pub async fn close_channel(
        &self,
        channel_id: ChannelId,
        funds_destination: Address,
    ) -> Result<ChannelTerms> {
        self.call(
            RpcMethod::CloseChannel,
            json!({
                "channel_id": format!("{:?}", channel_id),
                "funds_destination": format!("{:?}", funds_destination),
            }),
        )
        .await
    }

    pub async fn create_app_session(
        &self,
        participants: [Address; 2],
        allocations: &[AppAllocationWire],
        nonce: u64,
    ) -> Result<AppSessionReceipt> {
        self.call(
            RpcMethod::CreateAppSession,
            json!({
                "definition": {
                    "protocol": APP_PROTOCOL,
                    "participants": participants.iter().map(|p| format!("{:?}", p)).collect::<Vec<_>>(),
                    "weights": [50, 50],
                    "quorum": 100,
                    "challenge": 0,
                    "nonce": nonce,
                    "application": self.session.application,
                },
                "allocations": allocations,
            }),
        )
        .await
    }

    pub async fn submit_app_state(
        &self,
        app_session_id: H256,
        version: u64,
        allocations: &[AppAllocationWire],
    ) -> Result<AppSessionReceipt> {
        self.call(
            RpcMethod::SubmitAppState,
            json!({
                "app_session_id": format!("{:?}", app_session_id),
                "intent": "operate",
                "version": version,
                "allocations": allocations,
            }),
        )
        .await
    }

    pub async fn close_app_session(
        &self,
        app_session_id: H256,
        allocations: &[AppAllocationWire],
    ) -> Result<AppSessionReceipt> {
        self.call(
            RpcMethod::CloseAppSession,
            json!({
                "app_session_id": format!("{:?}", app_session_id),
                "allocations": allocations,
            }),
        )
        .await
    }
}
