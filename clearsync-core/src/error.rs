use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClearsyncError>;

/// On-chain step that failed, carried by [`ClearsyncError::Settlement`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SettlementStep {
    Create,
    Approve,
    Deposit,
    Resize,
    Close,
    Withdraw,
    Query,
}

impl fmt::Display for SettlementStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SettlementStep::Create => "create",
            SettlementStep::Approve => "approve",
            SettlementStep::Deposit => "deposit",
            SettlementStep::Resize => "resize",
            SettlementStep::Close => "close",
            SettlementStep::Withdraw => "withdraw",
            SettlementStep::Query => "query",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum ClearsyncError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Coordinator rejected {method}: {message}")]
    Protocol { method: String, message: String },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Settlement failed during {step}: {cause}")]
    Settlement { step: SettlementStep, cause: String },

    #[error("Transaction {tx_hash} reverted: {reason}")]
    OnchainRevert { tx_hash: String, reason: String },

    #[error("Timed out after {after:?} waiting for {method}")]
    Timeout { method: String, after: Duration },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Channel operation already in progress: {0}")]
    Busy(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Chain RPC error: {0}")]
    Rpc(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Dialog error: {0}")]
    Dialog(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ClearsyncError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn protocol(method: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            method: method.into(),
            message: message.into(),
        }
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::AuthenticationFailed(msg.into())
    }

    pub fn settlement(step: SettlementStep, cause: impl fmt::Display) -> Self {
        Self::Settlement {
            step,
            cause: cause.to_string(),
        }
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn signing(msg: impl Into<String>) -> Self {
        Self::Signing(msg.into())
    }

    pub fn rpc(msg: impl Into<String>) -> Self {
        Self::Rpc(msg.into())
    }

    pub fn dialog(msg: impl Into<String>) -> Self {
        Self::Dialog(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Connection-level failures are cleared by reconnecting and running the
    /// full handshake again; sessions are never resumed.
    pub fn is_recoverable_by_reconnect(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<reqwest::Error> for ClearsyncError {
    fn from(err: reqwest::Error) -> Self {
        ClearsyncError::Rpc(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClearsyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ClearsyncError::Transport(err.to_string())
    }
}
