use crate::abi::{self, ParamType, Token};
use crate::error::{ClearsyncError, Result, SettlementStep};
use crate::settlement::rpc::{parse_data, parse_quantity, parse_quantity_u64, JsonRpcClient};
use crate::settlement::{OnchainChannel, OnchainStatus, SettlementAdapter, TxReceipt};
use crate::signer::{LegacyTransaction, WalletSigner};
use crate::types::{
    Address, Allocation, ChannelDefinition, ChannelId, ChannelOpened, ChannelState, Intent, TxHash,
};
use async_trait::async_trait;
use primitive_types::{H256, U256};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

const STATE: &str = "(uint8,uint256,bytes,(address,address,uint256)[],bytes[])";
const CHANNEL: &str = "(address[],address,uint64,uint64)";

fn state_type() -> ParamType {
    ParamType::Tuple(vec![
        ParamType::Uint,
        ParamType::Uint,
        ParamType::Bytes,
        ParamType::Array(Box::new(ParamType::Tuple(vec![
            ParamType::Address,
            ParamType::Address,
            ParamType::Uint,
        ]))),
        ParamType::Array(Box::new(ParamType::Bytes)),
    ])
}

fn channel_type() -> ParamType {
    ParamType::Tuple(vec![
        ParamType::Array(Box::new(ParamType::Address)),
        ParamType::Address,
        ParamType::Uint,
        ParamType::Uint,
    ])
}

fn state_from_token(channel_id: ChannelId, token: Token) -> Result<ChannelState> {
    let mut fields = token.into_tuple()?.into_iter();
    let mut next = || {
        fields
            .next()
            .ok_or_else(|| ClearsyncError::rpc("ABI: state tuple too short"))
    };

    let intent_code = next()?.into_uint()?;
    let intent = u8::try_from(intent_code.low_u64())
        .ok()
        .filter(|_| intent_code.bits() <= 64)
        .ok_or_else(|| ClearsyncError::rpc(format!("unknown state intent {}", intent_code)))?;
    let intent = Intent::try_from(intent).map_err(ClearsyncError::rpc)?;
    let version = next()?.into_uint()?;
    let data = next()?.into_bytes()?;
    let allocations = next()?
        .into_array()?
        .into_iter()
        .map(|item| {
            let mut parts = item.into_tuple()?.into_iter();
            let mut part = || {
                parts
                    .next()
                    .ok_or_else(|| ClearsyncError::rpc("ABI: allocation tuple too short"))
            };
            Ok(Allocation {
                destination: part()?.into_address()?,
                token: part()?.into_address()?,
                amount: part()?.into_uint()?,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let signatures = next()?
        .into_array()?
        .into_iter()
        .map(Token::into_bytes)
        .collect::<Result<Vec<_>>>()?;

    let coordinator_signature = signatures.get(1).cloned().unwrap_or_default();
    Ok(ChannelState {
        channel_id,
        intent,
        version,
        data,
        allocations,
        coordinator_signature,
        signatures,
    })
}

#[derive(Debug, Clone)]
pub struct CustodyConfig {
    pub rpc_url: String,
    pub chain_id: u64,
    pub custody_address: Address,
    pub confirmations: u64,
    pub poll_interval: Duration,
    pub gas_limit: Option<u64>,
    pub rpc_timeout: Duration,
}

/// Custody contract on an EVM chain, reached over JSON-RPC.
///
/// Transactions are signed by the wallet signer and broadcast raw. Nonces are
/// read from the `pending` block tag under a local lock, so two submissions
/// from this process never race for the same nonce.
pub struct EvmCustody {
    rpc: JsonRpcClient,
    wallet: Arc<dyn WalletSigner>,
    config: CustodyConfig,
    send_lock: tokio::sync::Mutex<()>,
}

impl EvmCustody {
    pub fn new(config: CustodyConfig, wallet: Arc<dyn WalletSigner>) -> Result<Self> {
        if config.custody_address.is_zero() {
            return Err(ClearsyncError::config("Custody address is not set"));
        }
        Ok(Self {
            rpc: JsonRpcClient::new(config.rpc_url.clone(), config.rpc_timeout)?,
            wallet,
            config,
            send_lock: tokio::sync::Mutex::new(()),
        })
    }

    async fn eth_call(&self, to: Address, data: Vec<u8>) -> Result<Vec<u8>> {
        let result: String = self
            .rpc
            .call(
                "eth_call",
                json!([
                    { "to": format!("{:?}", to), "data": format!("0x{}", hex::encode(data)) },
                    "latest"
                ]),
            )
            .await?;
        parse_data(&result)
    }

    async fn send_transaction(&self, step: SettlementStep, to: Address, data: Vec<u8>) -> Result<TxHash> {
        self.submit(to, data)
            .await
            .map_err(|e| match e {
                ClearsyncError::Settlement { .. } => e,
                other => ClearsyncError::settlement(step, other),
            })
            .map(|tx_hash| {
                tracing::info!("Broadcast {} transaction {:?}", step, tx_hash);
                tx_hash
            })
    }

    async fn submit(&self, to: Address, data: Vec<u8>) -> Result<TxHash> {
        let _guard = self.send_lock.lock().await;
        let from = format!("{:?}", self.wallet.address());

        let nonce: String = self
            .rpc
            .call("eth_getTransactionCount", json!([from, "pending"]))
            .await?;
        let gas_price: String = self.rpc.call("eth_gasPrice", json!([])).await?;
        let gas_limit = match self.config.gas_limit {
            Some(limit) => U256::from(limit),
            None => {
                let estimate: String = self
                    .rpc
                    .call(
                        "eth_estimateGas",
                        json!([{
                            "from": from,
                            "to": format!("{:?}", to),
                            "data": format!("0x{}", hex::encode(&data)),
                        }]),
                    )
                    .await?;
                // 20% headroom over the estimate
                parse_quantity(&estimate)? * U256::from(6u64) / U256::from(5u64)
            }
        };

        let tx = LegacyTransaction {
            nonce: parse_quantity(&nonce)?,
            gas_price: parse_quantity(&gas_price)?,
            gas_limit,
            to,
            value: U256::zero(),
            data,
            chain_id: self.config.chain_id,
        };
        let raw = self.wallet.sign_transaction(&tx).await?;
        let hash: H256 = self
            .rpc
            .call(
                "eth_sendRawTransaction",
                json!([format!("0x{}", hex::encode(raw))]),
            )
            .await?;
        Ok(hash)
    }

    async fn allowance(&self, token: Address) -> Result<U256> {
        let data = abi::encode_call(
            "allowance(address,address)",
            &[
                Token::Address(self.wallet.address()),
                Token::Address(self.config.custody_address),
            ],
        );
        let output = self.eth_call(token, data).await?;
        abi::decode(&[ParamType::Uint], &output)?
            .remove(0)
            .into_uint()
    }

    async fn receipt(&self, tx_hash: TxHash) -> Result<Option<Value>> {
        let receipt = self
            .rpc
            .call_raw("eth_getTransactionReceipt", json!([format!("{:?}", tx_hash)]))
            .await?;
        Ok(if receipt.is_null() { None } else { Some(receipt) })
    }

    async fn channel_balance(&self, channel_id: ChannelId, token: Address) -> Result<U256> {
        let data = abi::encode_call(
            "getChannelBalances(bytes32,address[])",
            &[
                Token::FixedBytes(channel_id.as_bytes().to_vec()),
                Token::Array(vec![Token::Address(token)]),
            ],
        );
        let output = self.eth_call(self.config.custody_address, data).await?;
        let balances = abi::decode(&[ParamType::Array(Box::new(ParamType::Uint))], &output)?
            .remove(0)
            .into_array()?;
        match balances.into_iter().next() {
            Some(token) => token.into_uint(),
            None => Ok(U256::zero()),
        }
    }
}

fn query_error(e: ClearsyncError) -> ClearsyncError {
    match e {
        ClearsyncError::Settlement { .. } => e,
        other => ClearsyncError::settlement(SettlementStep::Query, other),
    }
}

#[async_trait]
impl SettlementAdapter for EvmCustody {
    async fn create_channel(
        &self,
        definition: &ChannelDefinition,
        initial: &ChannelState,
    ) -> Result<ChannelOpened> {
        let data = abi::encode_call(
            &format!("create({},{})", CHANNEL, STATE),
            &[definition.to_token(), initial.to_token()],
        );
        let tx_hash = self
            .send_transaction(SettlementStep::Create, self.config.custody_address, data)
            .await?;
        Ok(ChannelOpened {
            channel_id: definition.channel_id(self.config.chain_id),
            tx_hash,
        })
    }

    async fn deposit(&self, token: Address, amount: U256) -> Result<TxHash> {
        let allowance = self
            .allowance(token)
            .await
            .map_err(|e| ClearsyncError::settlement(SettlementStep::Approve, e))?;
        if allowance < amount {
            tracing::info!("Approving custody to spend {} of {:?}", amount, token);
            let data = abi::encode_call(
                "approve(address,uint256)",
                &[Token::Address(self.config.custody_address), Token::Uint(amount)],
            );
            let approval = self
                .send_transaction(SettlementStep::Approve, token, data)
                .await?;
            // The deposit spends the allowance, so it must not be mined first.
            self.wait_for_confirmation(approval)
                .await
                .map_err(|e| ClearsyncError::settlement(SettlementStep::Approve, e))?;
        }

        let data = abi::encode_call(
            "deposit(address,address,uint256)",
            &[
                Token::Address(self.wallet.address()),
                Token::Address(token),
                Token::Uint(amount),
            ],
        );
        self.send_transaction(SettlementStep::Deposit, self.config.custody_address, data)
            .await
    }

    async fn resize(&self, state: &ChannelState, proofs: &[ChannelState]) -> Result<TxHash> {
        let data = abi::encode_call(
            &format!("resize(bytes32,{},{}[])", STATE, STATE),
            &[
                Token::FixedBytes(state.channel_id.as_bytes().to_vec()),
                state.to_token(),
                Token::Array(proofs.iter().map(ChannelState::to_token).collect()),
            ],
        );
        self.send_transaction(SettlementStep::Resize, self.config.custody_address, data)
            .await
    }

    async fn close(&self, state: &ChannelState, proofs: &[ChannelState]) -> Result<TxHash> {
        let data = abi::encode_call(
            &format!("close(bytes32,{},{}[])", STATE, STATE),
            &[
                Token::FixedBytes(state.channel_id.as_bytes().to_vec()),
                state.to_token(),
                Token::Array(proofs.iter().map(ChannelState::to_token).collect()),
            ],
        );
        self.send_transaction(SettlementStep::Close, self.config.custody_address, data)
            .await
    }

    async fn query(&self, channel_id: ChannelId) -> Result<OnchainChannel> {
        let data = abi::encode_call(
            "getChannelData(bytes32)",
            &[Token::FixedBytes(channel_id.as_bytes().to_vec())],
        );
        let output = self
            .eth_call(self.config.custody_address, data)
            .await
            .map_err(query_error)?;
        let mut tokens = abi::decode(
            &[
                channel_type(),
                ParamType::Uint,
                ParamType::Array(Box::new(ParamType::Address)),
                ParamType::Uint,
                state_type(),
            ],
            &output,
        )
        .map_err(query_error)?
        .into_iter()
        .skip(1);

        let mut next = || {
            tokens
                .next()
                .ok_or_else(|| ClearsyncError::settlement(SettlementStep::Query, "short getChannelData output"))
        };
        let code = next()?.into_uint()?;
        let status = OnchainStatus::from_code(code.low_u64()).ok_or_else(|| {
            ClearsyncError::settlement(SettlementStep::Query, format!("unknown status {}", code))
        })?;
        let wallets = next()?
            .into_array()?
            .into_iter()
            .map(Token::into_address)
            .collect::<Result<Vec<_>>>()?;
        let challenge_expiry = next()?.into_uint()?.low_u64();
        let state = state_from_token(channel_id, next()?)?;

        let last_valid_state = if status == OnchainStatus::Void { None } else { Some(state) };
        let locked = match last_valid_state
            .as_ref()
            .and_then(|s| s.allocations.first().map(|a| a.token))
        {
            Some(token) => self
                .channel_balance(channel_id, token)
                .await
                .map_err(query_error)?,
            None => U256::zero(),
        };

        Ok(OnchainChannel {
            status,
            wallets,
            challenge_expiry,
            last_valid_state,
            locked,
        })
    }

    async fn wait_for_confirmation(&self, tx_hash: TxHash) -> Result<TxReceipt> {
        tracing::info!(
            "Waiting for {:?} ({} confirmation(s))",
            tx_hash,
            self.config.confirmations
        );
        loop {
            if let Some(receipt) = self.receipt(tx_hash).await? {
                let status = receipt.get("status").and_then(Value::as_str).unwrap_or("0x1");
                if parse_quantity(status)?.is_zero() {
                    return Err(ClearsyncError::OnchainRevert {
                        tx_hash: format!("{:?}", tx_hash),
                        reason: "execution reverted".to_string(),
                    });
                }

                let block = receipt
                    .get("blockNumber")
                    .and_then(Value::as_str)
                    .map(parse_quantity_u64)
                    .transpose()?;
                if let Some(block) = block {
                    let head: String = self.rpc.call("eth_blockNumber", json!([])).await?;
                    let depth = parse_quantity_u64(&head)?.saturating_sub(block) + 1;
                    if depth >= self.config.confirmations {
                        tracing::info!("{:?} confirmed in block {}", tx_hash, block);
                        return Ok(TxReceipt {
                            tx_hash,
                            block_number: block,
                        });
                    }
                }
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    async fn withdraw(&self, token: Address, amount: U256) -> Result<TxHash> {
        let data = abi::encode_call(
            "withdraw(address,uint256)",
            &[Token::Address(token), Token::Uint(amount)],
        );
        self.send_transaction(SettlementStep::Withdraw, self.config.custody_address, data)
            .await
    }

    async fn custody_balance(&self, account: Address, token: Address) -> Result<U256> {
        let data = abi::encode_call(
            "getAccountsBalances(address[],address[])",
            &[
                Token::Array(vec![Token::Address(account)]),
                Token::Array(vec![Token::Address(token)]),
            ],
        );
        let output = self
            .eth_call(self.config.custody_address, data)
            .await
            .map_err(query_error)?;
        let rows = abi::decode(
            &[ParamType::Array(Box::new(ParamType::Array(Box::new(ParamType::Uint))))],
            &output,
        )
        .map_err(query_error)?
        .remove(0)
        .into_array()?;

        match rows.into_iter().next() {
            Some(row) => match row.into_array()?.into_iter().next() {
                Some(balance) => balance.into_uint(),
                None => Ok(U256::zero()),
            },
            None => Ok(U256::zero()),
        }
    }

    async fn open_channels(&self, account: Address) -> Result<Vec<ChannelId>> {
        let data = abi::encode_call(
            "getOpenChannels(address[])",
            &[Token::Array(vec![Token::Address(account)])],
        );
        let output = self
            .eth_call(self.config.custody_address, data)
            .await
            .map_err(query_error)?;
        let rows = abi::decode(
            &[ParamType::Array(Box::new(ParamType::Array(Box::new(
                ParamType::FixedBytes(32),
            ))))],
            &output,
        )
        .map_err(query_error)?
        .remove(0)
        .into_array()?;

        let mut ids = Vec::new();
        for row in rows {
            for id in row.into_array()? {
                ids.push(H256::from_slice(&id.into_fixed_bytes()?));
            }
        }
        Ok(ids)
    }
}
