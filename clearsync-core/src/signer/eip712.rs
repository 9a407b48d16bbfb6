//! EIP-712 typed data for the auth challenge.
//!
//! The coordinator verifies a `Policy` message under the domain
//! `EIP712Domain(string name)`, where `name` is the application name.

use crate::signer::keccak256;
use crate::types::Address;
use primitive_types::U256;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

const DOMAIN_TYPE: &str = "EIP712Domain(string name)";
const ALLOWANCE_TYPE: &str = "Allowance(string asset,string amount)";
const POLICY_TYPE: &str = "Policy(string challenge,string scope,address wallet,address session_key,uint64 expires_at,Allowance[] allowances)";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthAllowance {
    pub asset: String,
    pub amount: String,
}

impl AuthAllowance {
    fn hash_struct(&self) -> [u8; 32] {
        let mut buf = Vec::with_capacity(96);
        buf.extend_from_slice(&keccak256(ALLOWANCE_TYPE.as_bytes()));
        buf.extend_from_slice(&keccak256(self.asset.as_bytes()));
        buf.extend_from_slice(&keccak256(self.amount.as_bytes()));
        keccak256(&buf)
    }
}

/// Delegation of wallet authority to a session key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthPolicy {
    pub challenge: String,
    pub scope: String,
    pub wallet: Address,
    pub session_key: Address,
    pub expires_at: u64,
    pub allowances: Vec<AuthAllowance>,
}

impl AuthPolicy {
    fn type_hash() -> [u8; 32] {
        keccak256(format!("{}{}", POLICY_TYPE, ALLOWANCE_TYPE).as_bytes())
    }

    fn hash_struct(&self) -> [u8; 32] {
        let allowances: Vec<u8> = self
            .allowances
            .iter()
            .flat_map(|a| a.hash_struct())
            .collect();

        let mut buf = Vec::with_capacity(32 * 7);
        buf.extend_from_slice(&Self::type_hash());
        buf.extend_from_slice(&keccak256(self.challenge.as_bytes()));
        buf.extend_from_slice(&keccak256(self.scope.as_bytes()));
        buf.extend_from_slice(&address_word(self.wallet));
        buf.extend_from_slice(&address_word(self.session_key));
        buf.extend_from_slice(&uint_word(self.expires_at));
        buf.extend_from_slice(&keccak256(&allowances));
        keccak256(&buf)
    }
}

fn address_word(address: Address) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(address.as_bytes());
    word
}

fn uint_word(value: u64) -> [u8; 32] {
    let mut word = [0u8; 32];
    U256::from(value).to_big_endian(&mut word);
    word
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypedData {
    pub domain_name: String,
    pub message: AuthPolicy,
}

impl TypedData {
    pub fn new(domain_name: impl Into<String>, message: AuthPolicy) -> Self {
        Self {
            domain_name: domain_name.into(),
            message,
        }
    }

    pub fn domain_separator(&self) -> [u8; 32] {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&keccak256(DOMAIN_TYPE.as_bytes()));
        buf.extend_from_slice(&keccak256(self.domain_name.as_bytes()));
        keccak256(&buf)
    }

    /// keccak256(0x19 0x01 ‖ domainSeparator ‖ hashStruct(message))
    pub fn digest(&self) -> [u8; 32] {
        let mut buf = Vec::with_capacity(66);
        buf.extend_from_slice(&[0x19, 0x01]);
        buf.extend_from_slice(&self.domain_separator());
        buf.extend_from_slice(&self.message.hash_struct());
        keccak256(&buf)
    }

    /// JSON form accepted by `eth_signTypedData_v4`.
    pub fn to_json(&self) -> Value {
        json!({
            "types": {
                "EIP712Domain": [{ "name": "name", "type": "string" }],
                "Policy": [
                    { "name": "challenge", "type": "string" },
                    { "name": "scope", "type": "string" },
                    { "name": "wallet", "type": "address" },
                    { "name": "session_key", "type": "address" },
                    { "name": "expires_at", "type": "uint64" },
                    { "name": "allowances", "type": "Allowance[]" }
                ],
                "Allowance": [
                    { "name": "asset", "type": "string" },
                    { "name": "amount", "type": "string" }
                ]
            },
            "primaryType": "Policy",
            "domain": { "name": self.domain_name },
            "message": {
                "challenge": self.message.challenge,
                "scope": self.message.scope,
                "wallet": format!("{:?}", self.message.wallet),
                "session_key": format!("{:?}", self.message.session_key),
                "expires_at": self.message.expires_at,
                "allowances": self.message.allowances,
            }
        })
    }
}
