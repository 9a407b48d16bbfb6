//! On-chain custody contract access.
//!
//! [`SettlementAdapter`] is the only component that talks to the chain.

pub mod custody;
pub mod rpc;

pub use custody::{CustodyConfig, EvmCustody};

use crate::error::Result;
use crate::types::{Address, ChannelDefinition, ChannelId, ChannelOpened, ChannelState, TxHash};
use async_trait::async_trait;
use primitive_types::U256;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Channel status as recorded by the custody contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OnchainStatus {
    Void,
    Initial,
    Active,
    Dispute,
    Final,
}

impl OnchainStatus {
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(OnchainStatus::Void),
            1 => Some(OnchainStatus::Initial),
            2 => Some(OnchainStatus::Active),
            3 => Some(OnchainStatus::Dispute),
            4 => Some(OnchainStatus::Final),
            _ => None,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(
            self,
            OnchainStatus::Initial | OnchainStatus::Active | OnchainStatus::Dispute
        )
    }
}

impl fmt::Display for OnchainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnchainChannel {
    pub status: OnchainStatus,
    pub wallets: Vec<Address>,
    pub challenge_expiry: u64,
    pub last_valid_state: Option<ChannelState>,
    /// Funds the contract still holds for this channel.
    pub locked: U256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: TxHash,
    pub block_number: u64,
}

#[async_trait]
pub trait SettlementAdapter: Send + Sync {
    /// Submit the countersigned initial state.
    async fn create_channel(
        &self,
        definition: &ChannelDefinition,
        initial: &ChannelState,
    ) -> Result<ChannelOpened>;

    async fn deposit(&self, token: Address, amount: U256) -> Result<TxHash>;

    async fn resize(&self, state: &ChannelState, proofs: &[ChannelState]) -> Result<TxHash>;

    async fn close(&self, state: &ChannelState, proofs: &[ChannelState]) -> Result<TxHash>;

    async fn query(&self, channel_id: ChannelId) -> Result<OnchainChannel>;

    /// Resolves once the transaction is included, or fails with
    /// `OnchainRevert`. Bounded by chain finality, not by a timeout.
    async fn wait_for_confirmation(&self, tx_hash: TxHash) -> Result<TxReceipt>;

    async fn withdraw(&self, token: Address, amount: U256) -> Result<TxHash>;

    /// Unlocked custody balance of `account` for `token`.
    async fn custody_balance(&self, account: Address, token: Address) -> Result<U256>;

    async fn open_channels(&self, account: Address) -> Result<Vec<ChannelId>>;
}
