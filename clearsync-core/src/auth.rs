//! Challenge/response handshake that authorizes the session key.
//!
//! `auth_request` (session key) -> `auth_challenge` -> `auth_verify`
//! (EIP-712 signature by the wallet key).

use crate::error::{ClearsyncError, Result};
use crate::rpc::{Connection, RpcMethod};
use crate::signer::{AuthAllowance, AuthPolicy, SessionKey, TypedData, WalletSigner};
use crate::types::Address;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
    pub session_key: Address,
    pub wallet: Address,
    pub application: String,
    pub scope: String,
    /// Unix seconds.
    pub expires_at: u64,
}

impl AuthSession {
    pub fn is_expired_at(&self, now_secs: u64) -> bool {
        now_secs >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(unix_now())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    Disconnected,
    Connected,
    ChallengeIssued { challenge: String },
    Authenticated(AuthSession),
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthState::Disconnected => write!(f, "disconnected"),
            AuthState::Connected => write!(f, "connected"),
            AuthState::ChallengeIssued { .. } => write!(f, "challenge issued"),
            AuthState::Authenticated(session) => {
                write!(f, "authenticated until {}", session.expires_at)
            }
        }
    }
}

/// What the session key is allowed to do, fixed per client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthParams {
    pub application: String,
    pub scope: String,
    pub session_duration: Duration,
    pub allowances: Vec<AuthAllowance>,
}

/// A single handshake attempt.
///
/// `expires_at` is computed once here and every message of the attempt
/// reads it from this struct. The coordinator compares the expiry in the
/// request against the one inside the signed challenge response.
#[derive(Debug, Clone)]
pub struct AuthAttempt {
    wallet: Address,
    session_key: Address,
    application: String,
    scope: String,
    allowances: Vec<AuthAllowance>,
    expires_at: u64,
}

impl AuthAttempt {
    pub fn new(params: &AuthParams, wallet: Address, session_key: Address, now_secs: u64) -> Self {
        Self {
            wallet,
            session_key,
            application: params.application.clone(),
            scope: params.scope.clone(),
            allowances: params.allowances.clone(),
            expires_at: now_secs + params.session_duration.as_secs(),
        }
    }

    pub fn expires_at(&self) -> u64 {
        self.expires_at
    }

    pub fn request_params(&self) -> Value {
        json!({
            "address": format!("{:?}", self.wallet),
            "session_key": format!("{:?}", self.session_key),
            "application": self.application,
            "allowances": self.allowances,
            "expires_at": self.expires_at,
            "scope": self.scope,
        })
    }

    pub fn typed_data(&self, challenge: &str) -> TypedData {
        TypedData::new(
            self.application.clone(),
            AuthPolicy {
                challenge: challenge.to_string(),
                scope: self.scope.clone(),
                wallet: self.wallet,
                session_key: self.session_key,
                expires_at: self.expires_at,
                allowances: self.allowances.clone(),
            },
        )
    }

    fn into_session(self) -> AuthSession {
        AuthSession {
            session_key: self.session_key,
            wallet: self.wallet,
            application: self.application,
            scope: self.scope,
            expires_at: self.expires_at,
        }
    }
}

#[derive(Deserialize)]
struct ChallengeParams {
    #[serde(alias = "challengeMessage")]
    challenge_message: String,
}

/// Drives the handshake and tracks where it stands.
pub struct Authenticator {
    params: AuthParams,
    state: RwLock<AuthState>,
}

impl Authenticator {
    pub fn new(params: AuthParams) -> Self {
        Self {
            params,
            state: RwLock::new(AuthState::Disconnected),
        }
    }

    pub fn state(&self) -> AuthState {
        self.state.read().clone()
    }

    pub fn session(&self) -> Option<AuthSession> {
        match &*self.state.read() {
            AuthState::Authenticated(session) if !session.is_expired() => Some(session.clone()),
            _ => None,
        }
    }

    pub fn mark_connected(&self) {
        *self.state.write() = AuthState::Connected;
    }

    pub fn mark_disconnected(&self) {
        *self.state.write() = AuthState::Disconnected;
    }

    fn transition(&self, next: AuthState) {
        let mut state = self.state.write();
        tracing::debug!("auth: {} -> {}", *state, next);
        *state = next;
    }

    /// Run the three-message exchange. Any failure leaves the state at
    /// `Disconnected`; the caller must reconnect before trying again.
    pub async fn authenticate(
        &self,
        connection: &Connection,
        session_key: &SessionKey,
        wallet: &dyn WalletSigner,
    ) -> Result<AuthSession> {
        match self.state() {
            AuthState::Connected => {}
            AuthState::Authenticated(_) => {
                return Err(ClearsyncError::invalid_state("Already authenticated on this connection"))
            }
            other => {
                return Err(ClearsyncError::invalid_state(format!(
                    "Cannot authenticate while {}",
                    other
                )))
            }
        }

        match self.run(connection, session_key, wallet).await {
            Ok(session) => {
                tracing::info!(
                    "Authenticated {:?} with session key {:?} until {}",
                    session.wallet,
                    session.session_key,
                    session.expires_at
                );
                self.transition(AuthState::Authenticated(session.clone()));
                Ok(session)
            }
            Err(e) => {
                tracing::warn!("Authentication failed: {}", e);
                self.transition(AuthState::Disconnected);
                Err(match e {
                    ClearsyncError::AuthenticationFailed(_) => e,
                    other => ClearsyncError::auth(other.to_string()),
                })
            }
        }
    }

    async fn run(
        &self,
        connection: &Connection,
        session_key: &SessionKey,
        wallet: &dyn WalletSigner,
    ) -> Result<AuthSession> {
        let attempt = AuthAttempt::new(
            &self.params,
            wallet.address(),
            session_key.address(),
            unix_now(),
        );

        let challenge = connection
            .request(RpcMethod::AuthRequest, attempt.request_params(), session_key)
            .await?;
        let challenge: ChallengeParams = serde_json::from_value(challenge)
            .map_err(|e| ClearsyncError::auth(format!("Malformed challenge: {}", e)))?;
        self.transition(AuthState::ChallengeIssued {
            challenge: challenge.challenge_message.clone(),
        });

        let typed = attempt.typed_data(&challenge.challenge_message);
        let signature = wallet.sign_typed_data(&typed).await?;

        let verdict = connection
            .request_presigned(
                RpcMethod::AuthVerify,
                json!({ "challenge": challenge.challenge_message }),
                signature,
            )
            .await?;
        if verdict.get("success").and_then(Value::as_bool) == Some(false) {
            return Err(ClearsyncError::auth("Coordinator rejected the challenge response"));
        }

        Ok(attempt.into_session())
    }
}

pub(crate) fn unix_now() -> u64 {
    Utc::now().timestamp().max(0) as u64
}
