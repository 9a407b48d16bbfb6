//! clearsync - two-party payment channels against a clearing coordinator
//!
//! The wallet opens one channel with the coordinator, funds it through an
//! on-chain custody contract and then moves value off-chain through signed
//! state updates. A session key authorized by an EIP-712 handshake signs
//! every off-chain message; the wallet key only signs the handshake and
//! on-chain transactions.

pub mod abi;
pub mod auth;
pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod keystore;
pub mod rpc;
pub mod settlement;
pub mod signer;
pub mod storage;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use auth::{AuthParams, AuthSession, AuthState};
pub use channel::{AppSessions, ChannelLifecycle, LifecyclePhase};
pub use client::ChannelClient;
pub use config::{ClientConfig, Network};
pub use error::{ClearsyncError, Result, SettlementStep};
pub use keystore::EncryptedKey;
pub use settlement::{EvmCustody, SettlementAdapter};
pub use signer::{LocalWallet, RpcWallet, SessionKey, WalletSigner};
pub use storage::Storage;
pub use types::{
    format_units, parse_units, Address, AppAllocation, AppSession, Channel, ChannelId,
    ChannelOpened, ChannelState, ChannelStatus, TxHash,
};

pub use primitive_types::U256;
