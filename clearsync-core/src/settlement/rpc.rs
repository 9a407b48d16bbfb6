//! JSON-RPC over HTTP for the chain endpoint and remote signers.

use crate::error::{ClearsyncError, Result};
use primitive_types::U256;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: Value,
    id: u64,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

pub struct JsonRpcClient {
    http: reqwest::Client,
    url: String,
    request_id: AtomicU64,
}

impl JsonRpcClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClearsyncError::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            url: url.into(),
            request_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Call `method` and return the raw `result` field. A `null` result is
    /// returned as `Value::Null`; callers decide whether that means pending.
    pub async fn call_raw(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id,
        };

        tracing::debug!("chain rpc -> {} (id {})", method, id);
        let response = self.http.post(&self.url).json(&request).send().await?;
        if !response.status().is_success() {
            return Err(ClearsyncError::rpc(format!(
                "{} returned HTTP {}",
                method,
                response.status()
            )));
        }

        let body: JsonRpcResponse = response.json().await?;
        if let Some(error) = body.error {
            let detail = error
                .data
                .map(|d| format!(" ({})", d))
                .unwrap_or_default();
            return Err(ClearsyncError::rpc(format!(
                "{} failed with {}: {}{}",
                method, error.code, error.message, detail
            )));
        }

        Ok(body.result.unwrap_or(Value::Null))
    }

    pub async fn call<R: DeserializeOwned>(&self, method: &str, params: Value) -> Result<R> {
        let result = self.call_raw(method, params).await?;
        serde_json::from_value(result).map_err(|e| {
            ClearsyncError::rpc(format!("Unexpected {} result shape: {}", method, e))
        })
    }
}

pub fn parse_quantity(value: &str) -> Result<U256> {
    let digits = value
        .strip_prefix("0x")
        .ok_or_else(|| ClearsyncError::rpc(format!("Expected hex quantity, got {}", value)))?;
    if digits.is_empty() {
        return Ok(U256::zero());
    }
    U256::from_str_radix(digits, 16)
        .map_err(|e| ClearsyncError::rpc(format!("Invalid quantity {}: {:?}", value, e)))
}

pub fn parse_quantity_u64(value: &str) -> Result<u64> {
    let quantity = parse_quantity(value)?;
    if quantity > U256::from(u64::MAX) {
        return Err(ClearsyncError::rpc(format!("Quantity {} overflows u64", value)));
    }
    Ok(quantity.as_u64())
}

pub fn to_quantity(value: U256) -> String {
    format!("0x{:x}", value)
}

pub fn parse_data(value: &str) -> Result<Vec<u8>> {
    let stripped = value.strip_prefix("0x").unwrap_or(value);
    hex::decode(stripped).map_err(|e| ClearsyncError::rpc(format!("Invalid hex data: {}", e)))
}
