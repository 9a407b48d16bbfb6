use crate::abi::{self, Token};
use crate::error::{ClearsyncError, Result};
use chrono::{DateTime, Utc};
use primitive_types::{H160, H256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type Address = H160;
pub type ChannelId = H256;
pub type TxHash = H256;

/// What a signed channel state asks the custody contract to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Intent {
    Operate,
    Initialize,
    Resize,
    Finalize,
}

impl From<Intent> for u8 {
    fn from(intent: Intent) -> u8 {
        match intent {
            Intent::Operate => 0,
            Intent::Initialize => 1,
            Intent::Resize => 2,
            Intent::Finalize => 3,
        }
    }
}

impl TryFrom<u8> for Intent {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Intent::Operate),
            1 => Ok(Intent::Initialize),
            2 => Ok(Intent::Resize),
            3 => Ok(Intent::Finalize),
            other => Err(format!("unknown state intent {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub destination: Address,
    pub token: Address,
    #[serde(with = "dec_u256")]
    pub amount: U256,
}

impl Allocation {
    pub(crate) fn to_token(&self) -> Token {
        Token::Tuple(vec![
            Token::Address(self.destination),
            Token::Address(self.token),
            Token::Uint(self.amount),
        ])
    }
}

/// Sum of all allocations; the channel's total funded balance.
pub fn allocation_total(allocations: &[Allocation]) -> U256 {
    allocations
        .iter()
        .fold(U256::zero(), |acc, a| acc.saturating_add(a.amount))
}

/// Amount allocated to `participant`, zero when absent.
pub fn allocation_of(allocations: &[Allocation], participant: Address) -> U256 {
    allocations
        .iter()
        .filter(|a| a.destination == participant)
        .fold(U256::zero(), |acc, a| acc.saturating_add(a.amount))
}

/// Fixed parameters of a channel as agreed with the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDefinition {
    pub participants: [Address; 2],
    pub adjudicator: Address,
    pub challenge: u64,
    pub nonce: u64,
}

impl ChannelDefinition {
    pub fn wallet(&self) -> Address {
        self.participants[0]
    }

    pub fn coordinator(&self) -> Address {
        self.participants[1]
    }

    /// keccak256(abi.encode(participants, adjudicator, challenge, nonce, chainId))
    pub fn channel_id(&self, chain_id: u64) -> ChannelId {
        let encoded = abi::encode(&[
            Token::Array(self.participants.iter().map(|p| Token::Address(*p)).collect()),
            Token::Address(self.adjudicator),
            Token::Uint(U256::from(self.challenge)),
            Token::Uint(U256::from(self.nonce)),
            Token::Uint(U256::from(chain_id)),
        ]);
        H256(crate::signer::keccak256(&encoded))
    }

    pub(crate) fn to_token(&self) -> Token {
        Token::Tuple(vec![
            Token::Array(self.participants.iter().map(|p| Token::Address(*p)).collect()),
            Token::Address(self.adjudicator),
            Token::Uint(U256::from(self.challenge)),
            Token::Uint(U256::from(self.nonce)),
        ])
    }
}

/// A snapshot of a channel at one version, signed by the coordinator and
/// (once countersigned) by the wallet's session key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelState {
    pub channel_id: ChannelId,
    pub intent: Intent,
    #[serde(with = "dec_u256")]
    pub version: U256,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
    pub allocations: Vec<Allocation>,
    #[serde(with = "hex_bytes")]
    pub coordinator_signature: Vec<u8>,
    /// Signatures in participant order, as the contract records them.
    #[serde(default, with = "hex_bytes_vec")]
    pub signatures: Vec<Vec<u8>>,
}

impl ChannelState {
    /// Digest both participants sign.
    pub fn state_hash(&self) -> [u8; 32] {
        let encoded = abi::encode(&[
            Token::FixedBytes(self.channel_id.as_bytes().to_vec()),
            Token::Uint(U256::from(u8::from(self.intent))),
            Token::Uint(self.version),
            Token::Bytes(self.data.clone()),
            Token::Array(self.allocations.iter().map(Allocation::to_token).collect()),
        ]);
        crate::signer::keccak256(&encoded)
    }

    pub fn total(&self) -> U256 {
        allocation_total(&self.allocations)
    }

    pub fn is_countersigned(&self) -> bool {
        self.signatures.len() == 2
    }

    pub(crate) fn to_token(&self) -> Token {
        Token::Tuple(vec![
            Token::Uint(U256::from(u8::from(self.intent))),
            Token::Uint(self.version),
            Token::Bytes(self.data.clone()),
            Token::Array(self.allocations.iter().map(Allocation::to_token).collect()),
            Token::Array(self.signatures.iter().cloned().map(Token::Bytes).collect()),
        ])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelStatus {
    Proposed,
    Submitted,
    Confirmed,
    Resizing,
    Active,
    Closing,
    Closed,
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl std::str::FromStr for ChannelStatus {
    type Err = ClearsyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Proposed" => Ok(ChannelStatus::Proposed),
            "Submitted" => Ok(ChannelStatus::Submitted),
            "Confirmed" => Ok(ChannelStatus::Confirmed),
            "Resizing" => Ok(ChannelStatus::Resizing),
            "Active" => Ok(ChannelStatus::Active),
            "Closing" => Ok(ChannelStatus::Closing),
            "Closed" => Ok(ChannelStatus::Closed),
            other => Err(ClearsyncError::internal(format!(
                "Unknown channel status {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub channel_id: ChannelId,
    pub definition: ChannelDefinition,
    pub token: Address,
    #[serde(with = "dec_u256")]
    pub version: U256,
    pub allocations: Vec<Allocation>,
    pub status: ChannelStatus,
}

impl Channel {
    pub fn total(&self) -> U256 {
        allocation_total(&self.allocations)
    }

    pub fn balance_of(&self, participant: Address) -> U256 {
        allocation_of(&self.allocations, participant)
    }
}

/// Result of a successful `setup_channel`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelOpened {
    pub channel_id: ChannelId,
    pub tx_hash: TxHash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppAllocation {
    pub participant: Address,
    #[serde(with = "dec_u256")]
    pub amount: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSession {
    pub app_session_id: H256,
    pub channel_id: ChannelId,
    pub participants: [Address; 2],
    pub allocations: Vec<AppAllocation>,
    pub version: u64,
    pub open: bool,
    pub created_at: DateTime<Utc>,
}

impl AppSession {
    pub fn total(&self) -> U256 {
        self.allocations
            .iter()
            .fold(U256::zero(), |acc, a| acc.saturating_add(a.amount))
    }

    pub fn allocation_of(&self, participant: Address) -> U256 {
        self.allocations
            .iter()
            .filter(|a| a.participant == participant)
            .fold(U256::zero(), |acc, a| acc.saturating_add(a.amount))
    }
}

/// Unified (off-chain ledger) balance reported by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerBalance {
    pub asset: String,
    pub amount: String,
}

/// Parse a human decimal amount ("10.00") into base units.
pub fn parse_units(value: &str, decimals: u8) -> Result<U256> {
    let value = value.trim();
    let (whole, fraction) = match value.split_once('.') {
        Some((w, f)) => (w, f),
        None => (value, ""),
    };

    if whole.is_empty() && fraction.is_empty() {
        return Err(ClearsyncError::validation("Empty amount"));
    }
    if fraction.len() > decimals as usize {
        return Err(ClearsyncError::validation(format!(
            "Amount {} has more than {} decimal places",
            value, decimals
        )));
    }
    if !whole.chars().chain(fraction.chars()).all(|c| c.is_ascii_digit()) {
        return Err(ClearsyncError::validation(format!(
            "Invalid amount: {}",
            value
        )));
    }

    let digits = format!(
        "{}{:0<width$}",
        if whole.is_empty() { "0" } else { whole },
        fraction,
        width = decimals as usize
    );
    U256::from_dec_str(&digits)
        .map_err(|e| ClearsyncError::validation(format!("Invalid amount {}: {:?}", value, e)))
}

/// Render base units as a decimal string, keeping at least two fraction digits.
pub fn format_units(value: U256, decimals: u8) -> String {
    let digits = value.to_string();
    let decimals = decimals as usize;
    if decimals == 0 {
        return digits;
    }

    let padded = format!("{:0>width$}", digits, width = decimals + 1);
    let (whole, fraction) = padded.split_at(padded.len() - decimals);
    let trimmed = fraction.trim_end_matches('0');
    let fraction = if trimmed.len() < 2 {
        &fraction[..2.min(fraction.len())]
    } else {
        trimmed
    };
    format!("{}.{}", whole, fraction)
}

/// Debug-formatted fixed hashes print in full; `Display` abbreviates them.
pub fn short_hex(value: &H256) -> String {
    let full = format!("{:?}", value);
    format!("{}...", &full[..10])
}

pub(crate) mod dec_u256 {
    use primitive_types::U256;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        match serde_json::Value::deserialize(deserializer)? {
            serde_json::Value::String(s) => parse(&s).map_err(de::Error::custom),
            serde_json::Value::Number(n) => n
                .as_u64()
                .map(U256::from)
                .ok_or_else(|| de::Error::custom(format!("invalid integer {}", n))),
            other => Err(de::Error::custom(format!("expected integer, got {}", other))),
        }
    }

    pub fn parse(s: &str) -> Result<U256, String> {
        if let Some(hex) = s.strip_prefix("0x") {
            U256::from_str_radix(hex, 16).map_err(|e| format!("invalid hex integer {}: {:?}", s, e))
        } else {
            U256::from_dec_str(s).map_err(|e| format!("invalid integer {}: {:?}", s, e))
        }
    }
}

pub(crate) mod hex_bytes {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(value)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        decode(&s).map_err(de::Error::custom)
    }

    pub fn decode(s: &str) -> Result<Vec<u8>, String> {
        let stripped = s.strip_prefix("0x").unwrap_or(s);
        hex::decode(stripped).map_err(|e| format!("invalid hex {}: {}", s, e))
    }
}

pub(crate) mod hex_bytes_vec {
    use serde::{de, ser::SerializeSeq, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(value.len()))?;
        for item in value {
            seq.serialize_element(&format!("0x{}", hex::encode(item)))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<Vec<u8>>, D::Error> {
        let items = Vec::<String>::deserialize(deserializer)?;
        items
            .iter()
            .map(|s| super::hex_bytes::decode(s).map_err(de::Error::custom))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_units() {
        assert_eq!(parse_units("10.00", 6).unwrap(), U256::from(10_000_000u64));
        assert_eq!(parse_units("0.5", 6).unwrap(), U256::from(500_000u64));
        assert_eq!(parse_units("3", 6).unwrap(), U256::from(3_000_000u64));
        assert_eq!(parse_units(".25", 2).unwrap(), U256::from(25u64));
        assert!(parse_units("1.0000001", 6).is_err());
        assert!(parse_units("1,5", 6).is_err());
        assert!(parse_units("", 6).is_err());
    }

    #[test]
    fn test_format_units() {
        assert_eq!(format_units(U256::from(10_000_000u64), 6), "10.00");
        assert_eq!(format_units(U256::from(1_234_500u64), 6), "1.2345");
        assert_eq!(format_units(U256::zero(), 6), "0.00");
        assert_eq!(format_units(U256::from(42u64), 0), "42");
    }

    #[test]
    fn test_intent_wire_format() {
        let json = serde_json::to_string(&Intent::Resize).unwrap();
        assert_eq!(json, "2");
        let parsed: Intent = serde_json::from_str("3").unwrap();
        assert_eq!(parsed, Intent::Finalize);
        assert!(serde_json::from_str::<Intent>("9").is_err());
    }

    #[test]
    fn test_allocation_amount_accepts_strings_and_numbers() {
        let json = r#"{"destination":"0x0000000000000000000000000000000000000001","token":"0x0000000000000000000000000000000000000002","amount":"10000000"}"#;
        let a: Allocation = serde_json::from_str(json).unwrap();
        assert_eq!(a.amount, U256::from(10_000_000u64));

        let json = r#"{"destination":"0x0000000000000000000000000000000000000001","token":"0x0000000000000000000000000000000000000002","amount":7}"#;
        let a: Allocation = serde_json::from_str(json).unwrap();
        assert_eq!(a.amount, U256::from(7u64));
    }

    #[test]
    fn test_channel_id_depends_on_nonce() {
        let definition = ChannelDefinition {
            participants: [H160::repeat_byte(1), H160::repeat_byte(2)],
            adjudicator: H160::repeat_byte(3),
            challenge: 3600,
            nonce: 1,
        };
        let mut other = definition.clone();
        other.nonce = 2;

        assert_eq!(definition.channel_id(8453), definition.channel_id(8453));
        assert_ne!(definition.channel_id(8453), other.channel_id(8453));
        assert_ne!(definition.channel_id(8453), definition.channel_id(1));
    }
}
