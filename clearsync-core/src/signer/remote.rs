use crate::error::{ClearsyncError, Result};
use crate::settlement::rpc::{parse_data, to_quantity, JsonRpcClient};
use crate::signer::{LegacyTransaction, Signature, TypedData, WalletSigner};
use crate::types::Address;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

/// Wallet key held by an external signer (node keystore, clef, a hardware
/// bridge) reached over JSON-RPC.
///
/// Calls can block for as long as the user takes to approve, so the HTTP
/// timeout is generous.
pub struct RpcWallet {
    client: JsonRpcClient,
    address: Address,
}

impl RpcWallet {
    pub fn new(url: impl Into<String>, address: Address) -> Result<Self> {
        Ok(Self {
            client: JsonRpcClient::new(url, Duration::from_secs(300))?,
            address,
        })
    }
}

#[async_trait]
impl WalletSigner for RpcWallet {
    fn address(&self) -> Address {
        self.address
    }

    async fn sign_typed_data(&self, data: &TypedData) -> Result<Signature> {
        let payload = serde_json::to_string(&data.to_json())?;
        let result: String = self
            .client
            .call(
                "eth_signTypedData_v4",
                json!([format!("{:?}", self.address), payload]),
            )
            .await?;
        let signature = Signature::from_hex(&result)?;

        // Catch signers that hash the payload differently before it reaches the coordinator.
        let signer = signature.recover(&data.digest())?;
        if signer != self.address {
            return Err(ClearsyncError::signing(format!(
                "Remote signer produced a signature for {:?}, expected {:?}",
                signer, self.address
            )));
        }
        Ok(signature)
    }

    async fn sign_transaction(&self, tx: &LegacyTransaction) -> Result<Vec<u8>> {
        let request = json!({
            "from": format!("{:?}", self.address),
            "to": format!("{:?}", tx.to),
            "nonce": to_quantity(tx.nonce),
            "gas": to_quantity(tx.gas_limit),
            "gasPrice": to_quantity(tx.gas_price),
            "value": to_quantity(tx.value),
            "data": format!("0x{}", hex::encode(&tx.data)),
            "chainId": format!("0x{:x}", tx.chain_id),
        });

        let result = self
            .client
            .call_raw("eth_signTransaction", json!([request]))
            .await?;

        // Geth returns {raw, tx}; most other signers return the raw hex directly.
        let raw = match &result {
            Value::String(raw) => raw.as_str(),
            Value::Object(fields) => fields
                .get("raw")
                .and_then(Value::as_str)
                .ok_or_else(|| ClearsyncError::signing("eth_signTransaction result has no raw field"))?,
            other => {
                return Err(ClearsyncError::signing(format!(
                    "Unexpected eth_signTransaction result: {}",
                    other
                )))
            }
        };
        parse_data(raw)
    }
}
