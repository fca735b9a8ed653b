//! Ethereum JSON-RPC chain client.
//!
//! Native ETH transfers are read from the transaction value; USDT transfers from
//! the ERC-20 `Transfer` log emitted by the token contract. Payouts are sent with
//! `eth_sendTransaction` from the platform account, which the node must manage.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use super::{from_chain_units, parse_hex_u128, to_chain_units, ChainClient, ChainError};
use crate::config::Config;
use crate::types::{Currency, TransferFact};

/// keccak256("Transfer(address,address,uint256)")
const TRANSFER_TOPIC: &str = "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";
/// transfer(address,uint256)
const TRANSFER_SELECTOR: &str = "a9059cbb";
/// balanceOf(address)
const BALANCE_OF_SELECTOR: &str = "70a08231";

const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct EthRpcChainClient {
    client: reqwest::Client,
    rpc_url: String,
    platform_address: String,
    usdt_contract: String,
    required_confirmations: u64,
    request_timeout: Duration,
    next_id: AtomicU64,
}

/// JSON-RPC request structure
#[derive(Serialize)]
struct JsonRpcRequest<T> {
    jsonrpc: &'static str,
    method: &'static str,
    params: T,
    id: u64,
}

/// JSON-RPC response structure
#[derive(Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct EthTransaction {
    from: String,
    to: Option<String>,
    value: String,
    block_number: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct EthReceipt {
    status: Option<String>,
    block_number: Option<String>,
    #[serde(default)]
    logs: Vec<EthLog>,
}

#[derive(Deserialize, Debug)]
struct EthLog {
    address: String,
    topics: Vec<String>,
    data: String,
}

impl EthReceipt {
    fn succeeded(&self) -> bool {
        self.status.as_deref() == Some("0x1")
    }
}

impl EthRpcChainClient {
    pub fn new(config: &Config) -> Result<Self, ChainError> {
        info!("Initializing chain client at {}", config.chain_rpc_url);

        let client = reqwest::Client::builder()
            .timeout(config.chain_timeout())
            .build()
            .map_err(|e| ChainError::Rpc(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            rpc_url: config.chain_rpc_url.clone(),
            platform_address: config.platform_address.to_lowercase(),
            usdt_contract: config.usdt_contract.to_lowercase(),
            required_confirmations: config.required_confirmations.max(1),
            request_timeout: config.chain_timeout(),
            next_id: AtomicU64::new(1),
        })
    }

    /// Make a JSON-RPC call. A `null` result is returned as `None`.
    async fn rpc_call<T, R>(&self, method: &'static str, params: T) -> Result<Option<R>, ChainError>
    where
        T: Serialize,
        R: for<'de> Deserialize<'de>,
    {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        };

        let send = self.client.post(&self.rpc_url).json(&request).send();
        let response = tokio::time::timeout(self.request_timeout, send)
            .await
            .map_err(|_| ChainError::Timeout(method.to_string()))?
            .map_err(|e| ChainError::Rpc(format!("HTTP request failed: {}", e)))?;

        let rpc_response: JsonRpcResponse<R> = response
            .json()
            .await
            .map_err(|e| ChainError::InvalidResponse(format!("Failed to parse {} response: {}", method, e)))?;

        if let Some(error) = rpc_response.error {
            return Err(ChainError::Rpc(format!("RPC error {}: {}", error.code, error.message)));
        }
        Ok(rpc_response.result)
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        let result: String = self
            .rpc_call("eth_blockNumber", ())
            .await?
            .ok_or_else(|| ChainError::InvalidResponse("eth_blockNumber returned null".to_string()))?;
        let height = parse_hex_u128(&result)?;
        u64::try_from(height).map_err(|_| ChainError::InvalidResponse(format!("block number {}", result)))
    }

    async fn receipt(&self, tx_hash: &str) -> Result<Option<EthReceipt>, ChainError> {
        self.rpc_call("eth_getTransactionReceipt", [tx_hash]).await
    }

    async fn confirmations(&self, receipt: &EthReceipt) -> Result<u64, ChainError> {
        let Some(mined_at) = receipt.block_number.as_deref() else {
            return Ok(0);
        };
        let mined_at = u64::try_from(parse_hex_u128(mined_at)?)
            .map_err(|_| ChainError::InvalidResponse(format!("block number {}", mined_at)))?;
        let latest = self.block_number().await?;
        Ok(latest.saturating_sub(mined_at) + 1)
    }

    /// First ERC-20 Transfer log from the USDT contract, preferring one paid to the platform.
    fn usdt_transfer(&self, receipt: &EthReceipt) -> Result<Option<(String, String, u128)>, ChainError> {
        let mut first = None;
        for log in &receipt.logs {
            if log.address.to_lowercase() != self.usdt_contract
                || log.topics.len() < 3
                || log.topics[0].to_lowercase() != TRANSFER_TOPIC
            {
                continue;
            }
            let from = topic_address(&log.topics[1]);
            let to = topic_address(&log.topics[2]);
            let amount = parse_hex_u128(&log.data)?;
            if to == self.platform_address {
                return Ok(Some((from, to, amount)));
            }
            if first.is_none() {
                first = Some((from, to, amount));
            }
        }
        Ok(first)
    }
}

#[async_trait]
impl ChainClient for EthRpcChainClient {
    async fn get_confirmed_transfer(
        &self,
        tx_hash: &str,
        currency: Currency,
    ) -> Result<Option<TransferFact>, ChainError> {
        let Some(tx) = self
            .rpc_call::<_, EthTransaction>("eth_getTransactionByHash", [tx_hash])
            .await?
        else {
            return Ok(None);
        };

        let sender = tx.from.to_lowercase();
        let recipient = tx.to.clone().unwrap_or_default().to_lowercase();

        let receipt = match tx.block_number {
            Some(_) => self.receipt(tx_hash).await?,
            None => None,
        };
        let Some(receipt) = receipt else {
            debug!("Transaction {} not mined yet", tx_hash);
            return Ok(Some(TransferFact { from: sender, to: recipient, amount: Decimal::ZERO, confirmed: false }));
        };

        let confirmed = self.confirmations(&receipt).await? >= self.required_confirmations;

        // A reverted transaction moved nothing
        if !receipt.succeeded() {
            warn!("Transaction {} reverted on chain", tx_hash);
            return Ok(Some(TransferFact { from: sender, to: recipient, amount: Decimal::ZERO, confirmed }));
        }

        let fact = match currency {
            Currency::Eth => TransferFact {
                from: sender,
                to: recipient,
                amount: from_chain_units(parse_hex_u128(&tx.value)?, Currency::Eth)?,
                confirmed,
            },
            Currency::Usdt => match self.usdt_transfer(&receipt)? {
                Some((from, to, units)) => TransferFact {
                    from,
                    to,
                    amount: from_chain_units(units, Currency::Usdt)?,
                    confirmed,
                },
                None => TransferFact { from: sender, to: recipient, amount: Decimal::ZERO, confirmed },
            },
        };
        Ok(Some(fact))
    }

    async fn send_transfer(&self, to: &str, amount: Decimal, currency: Currency) -> Result<String, ChainError> {
        if !self.validate_address(to) {
            return Err(ChainError::InvalidAddress(to.to_string()));
        }
        let units = to_chain_units(amount, currency)?;

        let tx = match currency {
            Currency::Eth => json!({
                "from": self.platform_address,
                "to": to,
                "value": format!("0x{:x}", units),
            }),
            Currency::Usdt => json!({
                "from": self.platform_address,
                "to": self.usdt_contract,
                "data": format!("0x{}{}{:064x}", TRANSFER_SELECTOR, pad_address(to), units),
            }),
        };

        let hash: String = self
            .rpc_call("eth_sendTransaction", [tx])
            .await?
            .ok_or_else(|| ChainError::InvalidResponse("eth_sendTransaction returned null".to_string()))?;

        info!("Broadcast {} {} payout to {} in {}", amount, currency, to, hash);
        Ok(hash.to_lowercase())
    }

    async fn wait_for_confirmation(&self, tx_hash: &str, timeout: Duration) -> Result<bool, ChainError> {
        let poll = async {
            loop {
                if let Some(receipt) = self.receipt(tx_hash).await? {
                    if self.confirmations(&receipt).await? >= self.required_confirmations {
                        return Ok::<bool, ChainError>(receipt.succeeded());
                    }
                }
                tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
            }
        };

        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| ChainError::Timeout(format!("confirmation of {}", tx_hash)))?
    }

    async fn platform_balance(&self, currency: Currency) -> Result<Decimal, ChainError> {
        let raw: Option<String> = match currency {
            Currency::Eth => {
                self.rpc_call("eth_getBalance", (self.platform_address.as_str(), "latest"))
                    .await?
            }
            Currency::Usdt => {
                let call = json!({
                    "to": self.usdt_contract,
                    "data": format!("0x{}{}", BALANCE_OF_SELECTOR, pad_address(&self.platform_address)),
                });
                self.rpc_call("eth_call", (call, "latest")).await?
            }
        };
        let raw = raw.ok_or_else(|| ChainError::InvalidResponse("balance query returned null".to_string()))?;
        from_chain_units(parse_hex_u128(&raw)?, currency)
    }
}

/// Last 20 bytes of an indexed address topic.
fn topic_address(topic: &str) -> String {
    let body = topic.trim_start_matches("0x").to_lowercase();
    let start = body.len().saturating_sub(40);
    format!("0x{}", &body[start..])
}

/// Address left-padded to a 32-byte ABI word.
fn pad_address(address: &str) -> String {
    format!("{:0>64}", address.trim_start_matches("0x").to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            platform_address: "0x1111111111111111111111111111111111111111".to_string(),
            ..Config::default()
        }
    }

    #[test]
    fn test_client_creation() {
        let client = EthRpcChainClient::new(&test_config()).unwrap();
        assert_eq!(client.required_confirmations, 3);
        assert_eq!(client.platform_address, "0x1111111111111111111111111111111111111111");
    }

    #[test]
    fn test_abi_helpers() {
        let topic = format!("0x{:0>64}", "d8da6bf26964af9d7eed9e03e53415d37aa96045");
        assert_eq!(topic_address(&topic), "0xd8da6bf26964af9d7eed9e03e53415d37aa96045");
        assert_eq!(pad_address("0xABCDEF0000000000000000000000000000000001").len(), 64);
    }

    #[test]
    fn test_usdt_log_extraction_prefers_platform_recipient() {
        let client = EthRpcChainClient::new(&test_config()).unwrap();
        let word = |addr: &str| format!("0x{:0>64}", addr.trim_start_matches("0x"));
        let log = |to: &str, amount: u128| EthLog {
            address: client.usdt_contract.clone(),
            topics: vec![
                TRANSFER_TOPIC.to_string(),
                word("0x2222222222222222222222222222222222222222"),
                word(to),
            ],
            data: format!("0x{:064x}", amount),
        };
        let receipt = EthReceipt {
            status: Some("0x1".to_string()),
            block_number: Some("0x10".to_string()),
            logs: vec![
                log("0x3333333333333333333333333333333333333333", 1),
                log("0x1111111111111111111111111111111111111111", 5_000_000),
            ],
        };

        let (from, to, units) = client.usdt_transfer(&receipt).unwrap().unwrap();
        assert_eq!(from, "0x2222222222222222222222222222222222222222");
        assert_eq!(to, "0x1111111111111111111111111111111111111111");
        assert_eq!(units, 5_000_000);
    }
}
