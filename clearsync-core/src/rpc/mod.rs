//! Coordinator wire protocol.
//!
//! Requests travel as `{"req":[id, method, params, ts], "sig":[..]}` and
//! replies as `{"res":[id, method, params, ts], "sig":[..]}`. The signature
//! covers keccak256 of the JSON-encoded `req` array.

pub mod connection;
pub mod coordinator;
pub mod correlator;

pub use connection::{Connection, Notification};
pub use coordinator::{ChannelTerms, Coordinator, CoordinatorConfig};
pub use correlator::Correlator;

use crate::error::{ClearsyncError, Result};
use crate::signer::Signature;
use crate::types::LedgerBalance;
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RpcMethod {
    AuthRequest,
    AuthChallenge,
    AuthVerify,
    GetConfig,
    GetLedgerBalances,
    CreateChannel,
    ResizeChannel,
    CloseChannel,
    CreateAppSession,
    SubmitAppState,
    CloseAppSession,
    BalanceUpdate,
    AppSessionUpdate,
    Ping,
    Pong,
    Error,
    Other(String),
}

impl RpcMethod {
    pub fn as_str(&self) -> &str {
        match self {
            RpcMethod::AuthRequest => "auth_request",
            RpcMethod::AuthChallenge => "auth_challenge",
            RpcMethod::AuthVerify => "auth_verify",
            RpcMethod::GetConfig => "get_config",
            RpcMethod::GetLedgerBalances => "get_ledger_balances",
            RpcMethod::CreateChannel => "create_channel",
            RpcMethod::ResizeChannel => "resize_channel",
            RpcMethod::CloseChannel => "close_channel",
            RpcMethod::CreateAppSession => "create_app_session",
            RpcMethod::SubmitAppState => "submit_app_state",
            RpcMethod::CloseAppSession => "close_app_session",
            RpcMethod::BalanceUpdate => "bu",
            RpcMethod::AppSessionUpdate => "asu",
            RpcMethod::Ping => "ping",
            RpcMethod::Pong => "pong",
            RpcMethod::Error => "error",
            RpcMethod::Other(name) => name,
        }
    }

    pub fn parse(name: &str) -> Self {
        match name {
            "auth_request" => RpcMethod::AuthRequest,
            "auth_challenge" => RpcMethod::AuthChallenge,
            "auth_verify" => RpcMethod::AuthVerify,
            "get_config" => RpcMethod::GetConfig,
            "get_ledger_balances" => RpcMethod::GetLedgerBalances,
            "create_channel" => RpcMethod::CreateChannel,
            "resize_channel" => RpcMethod::ResizeChannel,
            "close_channel" => RpcMethod::CloseChannel,
            "create_app_session" => RpcMethod::CreateAppSession,
            "submit_app_state" => RpcMethod::SubmitAppState,
            "close_app_session" => RpcMethod::CloseAppSession,
            "bu" | "balance_update" => RpcMethod::BalanceUpdate,
            "asu" | "app_session_update" => RpcMethod::AppSessionUpdate,
            "ping" => RpcMethod::Ping,
            "pong" => RpcMethod::Pong,
            "error" => RpcMethod::Error,
            other => RpcMethod::Other(other.to_string()),
        }
    }

    /// Method name the coordinator answers a request with.
    pub fn response_method(&self) -> RpcMethod {
        match self {
            RpcMethod::AuthRequest => RpcMethod::AuthChallenge,
            RpcMethod::Ping => RpcMethod::Pong,
            other => other.clone(),
        }
    }
}

impl fmt::Display for RpcMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the signed request frame text.
///
/// The signature is computed over exactly the bytes of the `req` array as
/// serialized here; re-serializing a parsed frame yields the same bytes.
pub fn encode_request(
    id: u64,
    method: &RpcMethod,
    params: &Value,
    timestamp_ms: u64,
    sign: impl FnOnce(&[u8]) -> Result<Signature>,
) -> Result<String> {
    let req = json!([id, method.as_str(), params, timestamp_ms]);
    let payload = serde_json::to_vec(&req)?;
    let signature = sign(&payload)?;
    let frame = json!({ "req": req, "sig": [signature.to_hex()] });
    Ok(serde_json::to_string(&frame)?)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseFrame {
    pub id: Option<u64>,
    pub method: RpcMethod,
    pub params: Value,
    pub timestamp: Option<u64>,
}

/// Every message the coordinator can push to us.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Response(ResponseFrame),
    Error { id: Option<u64>, message: String },
    BalanceUpdate(Vec<LedgerBalance>),
    AppSessionUpdate(Value),
}

#[derive(Deserialize)]
struct RawFrame {
    res: Vec<Value>,
}

#[derive(Deserialize)]
struct BalanceUpdateParams {
    #[serde(default)]
    balance_updates: Vec<LedgerBalance>,
}

/// Some coordinator versions wrap params in a one-element array.
fn unwrap_params(params: Value) -> Value {
    match params {
        Value::Array(mut items) if items.len() == 1 && items[0].is_object() => items.remove(0),
        other => other,
    }
}

impl Inbound {
    pub fn parse(text: &str) -> Result<Self> {
        let frame: RawFrame = serde_json::from_str(text)
            .map_err(|e| ClearsyncError::transport(format!("Malformed frame: {}", e)))?;
        let mut parts = frame.res.into_iter();

        let id = match parts.next() {
            Some(Value::Number(n)) => n.as_u64().filter(|id| *id != 0),
            Some(Value::Null) | None => None,
            Some(other) => {
                return Err(ClearsyncError::transport(format!(
                    "Frame id must be numeric, got {}",
                    other
                )))
            }
        };
        let method = match parts.next() {
            Some(Value::String(name)) => RpcMethod::parse(&name),
            _ => return Err(ClearsyncError::transport("Frame is missing its method")),
        };
        let params = unwrap_params(parts.next().unwrap_or(Value::Null));
        let timestamp = parts.next().and_then(|ts| ts.as_u64());

        Ok(match method {
            RpcMethod::Error => {
                let message = params
                    .get("error")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| params.to_string());
                Inbound::Error { id, message }
            }
            RpcMethod::BalanceUpdate => {
                let update: BalanceUpdateParams = serde_json::from_value(params)?;
                Inbound::BalanceUpdate(update.balance_updates)
            }
            RpcMethod::AppSessionUpdate => Inbound::AppSessionUpdate(params),
            method => Inbound::Response(ResponseFrame {
                id,
                method,
                params,
                timestamp,
            }),
        })
    }
}
