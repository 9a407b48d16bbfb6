use crate::auth::AuthParams;
use crate::channel::LifecycleParams;
use crate::error::{ClearsyncError, Result};
use crate::settlement::CustodyConfig;
use crate::signer::AuthAllowance;
use crate::types::Address;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Base,
    Local,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Base => write!(f, "base"),
            Network::Local => write!(f, "local"),
        }
    }
}

impl FromStr for Network {
    type Err = ClearsyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "base" | "mainnet" => Ok(Network::Base),
            "local" | "localhost" | "anvil" => Ok(Network::Local),
            other => Err(ClearsyncError::config(format!("Unknown network: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub network: Network,
    pub coordinator_url: String,
    pub rpc_url: String,
    pub chain_id: u64,
    pub custody_address: Address,
    pub adjudicator_address: Address,
    pub token_address: Address,
    pub token_symbol: String,
    pub token_decimals: u8,
    pub application: String,
    pub scope: String,
    pub session_duration: Duration,
    /// Spending allowance granted to the session key, in token units.
    pub allowance: String,
    pub request_timeout: Duration,
    pub confirmation_poll_interval: Duration,
    pub confirmations: u64,
    pub challenge_duration: u64,
    pub gas_limit: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            network: Network::Local,
            coordinator_url: "ws://localhost:8000/ws".to_string(),
            rpc_url: "http://localhost:8545".to_string(),
            chain_id: 31337,
            custody_address: Address::zero(),
            adjudicator_address: Address::zero(),
            token_address: Address::zero(),
            token_symbol: "USDC".to_string(),
            token_decimals: 6,
            application: "clearsync".to_string(),
            scope: "game.session".to_string(),
            session_duration: Duration::from_secs(3600), // 1 hour
            allowance: "1000".to_string(),
            request_timeout: Duration::from_secs(30),
            confirmation_poll_interval: Duration::from_secs(2),
            confirmations: 1,
            challenge_duration: 3600,
            gas_limit: None,
        }
    }
}

fn address(value: &str) -> Address {
    Address::from_str(value).unwrap_or_default()
}

impl ClientConfig {
    pub fn new(network: Network) -> Self {
        let mut config = Self::default();
        config.network = network;

        match network {
            Network::Base => {
                config.coordinator_url = "wss://clearnet.yellow.com/ws".to_string();
                config.rpc_url = "https://mainnet.base.org".to_string();
                config.chain_id = 8453;
                config.custody_address = address("0x490fb189DdE3a01B00be9BA5F41e3447FbC838b6");
                config.adjudicator_address =
                    address("0x7de4A0736Cf5740fD3Ca2F2e9cc85c9AC223eF0C");
                config.token_address = address("0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913");
                config.confirmation_poll_interval = Duration::from_secs(2);
            }
            Network::Local => {
                // keep defaults; contract addresses come from the operator
                config.confirmation_poll_interval = Duration::from_millis(500);
            }
        }

        config
    }

    pub fn validate(&self) -> Result<()> {
        if self.coordinator_url.is_empty() {
            return Err(ClearsyncError::config("Coordinator URL cannot be empty"));
        }

        if self.rpc_url.is_empty() {
            return Err(ClearsyncError::config("RPC URL cannot be empty"));
        }

        if self.custody_address.is_zero() {
            return Err(ClearsyncError::config("Custody address must be set"));
        }

        if self.token_address.is_zero() {
            return Err(ClearsyncError::config("Token address must be set"));
        }

        if self.token_decimals > 36 {
            return Err(ClearsyncError::config(format!(
                "Token decimals {} out of range",
                self.token_decimals
            )));
        }

        if self.request_timeout.is_zero() || self.confirmation_poll_interval.is_zero() {
            return Err(ClearsyncError::config("Timeouts must be greater than 0"));
        }

        if self.session_duration.is_zero() {
            return Err(ClearsyncError::config(
                "Session duration must be greater than 0",
            ));
        }

        if self.confirmations == 0 {
            return Err(ClearsyncError::config(
                "Confirmations must be greater than 0",
            ));
        }

        Ok(())
    }

    /// Allowances are keyed by lowercase asset symbol on the coordinator.
    pub fn asset(&self) -> String {
        self.token_symbol.to_ascii_lowercase()
    }

    pub fn auth_params(&self) -> AuthParams {
        AuthParams {
            application: self.application.clone(),
            scope: self.scope.clone(),
            session_duration: self.session_duration,
            allowances: vec![AuthAllowance {
                asset: self.asset(),
                amount: self.allowance.clone(),
            }],
        }
    }

    pub fn custody_config(&self) -> CustodyConfig {
        CustodyConfig {
            rpc_url: self.rpc_url.clone(),
            chain_id: self.chain_id,
            custody_address: self.custody_address,
            confirmations: self.confirmations,
            poll_interval: self.confirmation_poll_interval,
            gas_limit: self.gas_limit,
            rpc_timeout: self.request_timeout,
        }
    }

    pub fn lifecycle_params(&self, wallet: Address) -> LifecycleParams {
        LifecycleParams {
            chain_id: self.chain_id,
            wallet,
            token: self.token_address,
            token_symbol: self.token_symbol.clone(),
            token_decimals: self.token_decimals,
        }
    }
}
