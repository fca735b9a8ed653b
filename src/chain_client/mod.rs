//! Chain access: transfer lookups for deposits and payouts for withdrawals.

pub mod eth;

use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::types::{Currency, TransferFact};

pub use eth::EthRpcChainClient;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("RPC request failed: {0}")]
    Rpc(String),

    #[error("RPC call timed out: {0}")]
    Timeout(String),

    #[error("Unexpected RPC response: {0}")]
    InvalidResponse(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Amount not representable on chain: {0}")]
    InvalidAmount(String),
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Look up a transfer. `Ok(None)` when the chain does not know the hash.
    async fn get_confirmed_transfer(
        &self,
        tx_hash: &str,
        currency: Currency,
    ) -> Result<Option<TransferFact>, ChainError>;

    /// Broadcast a payout from the platform wallet and return its hash.
    async fn send_transfer(&self, to: &str, amount: Decimal, currency: Currency) -> Result<String, ChainError>;

    /// Wait until the transaction is confirmed. `Ok(false)` means it was mined but reverted.
    async fn wait_for_confirmation(&self, tx_hash: &str, timeout: Duration) -> Result<bool, ChainError>;

    /// Liquidity held by the platform wallet.
    async fn platform_balance(&self, currency: Currency) -> Result<Decimal, ChainError>;

    fn validate_address(&self, address: &str) -> bool {
        is_valid_address(address)
    }
}

/// `0x` followed by 40 hex digits.
pub fn is_valid_address(address: &str) -> bool {
    match address.strip_prefix("0x").or_else(|| address.strip_prefix("0X")) {
        Some(body) => body.len() == 40 && body.chars().all(|c| c.is_ascii_hexdigit()),
        None => false,
    }
}

/// Lowercased address, or `None` when malformed.
pub fn normalize_address(address: &str) -> Option<String> {
    let trimmed = address.trim();
    is_valid_address(trimmed).then(|| trimmed.to_lowercase())
}

/// Lowercased `0x`-prefixed 32-byte hash, or `None` when malformed.
pub fn normalize_tx_hash(tx_hash: &str) -> Option<String> {
    let trimmed = tx_hash.trim().to_lowercase();
    let body = trimmed.strip_prefix("0x").unwrap_or(&trimmed);
    match hex::decode(body) {
        Ok(bytes) if bytes.len() == 32 => Some(format!("0x{}", body)),
        _ => None,
    }
}

/// Decimal amount to integer chain units (wei, token base units). Sub-unit dust is truncated.
pub fn to_chain_units(amount: Decimal, currency: Currency) -> Result<u128, ChainError> {
    if amount.is_sign_negative() {
        return Err(ChainError::InvalidAmount(amount.to_string()));
    }
    let scale = Decimal::from(10u64.pow(currency.decimals()));
    amount
        .checked_mul(scale)
        .and_then(|units| units.trunc().to_u128())
        .ok_or_else(|| ChainError::InvalidAmount(amount.to_string()))
}

/// Integer chain units back to a decimal amount.
pub fn from_chain_units(units: u128, currency: Currency) -> Result<Decimal, ChainError> {
    let signed = i128::try_from(units).map_err(|_| ChainError::InvalidAmount(units.to_string()))?;
    Decimal::try_from_i128_with_scale(signed, currency.decimals())
        .map(|d| d.normalize())
        .map_err(|_| ChainError::InvalidAmount(units.to_string()))
}

/// Parse a `0x` quantity (or a 32-byte word) into u128.
pub fn parse_hex_u128(value: &str) -> Result<u128, ChainError> {
    let digits = value.trim_start_matches("0x").trim_start_matches('0');
    if digits.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(digits, 16).map_err(|e| ChainError::InvalidResponse(format!("bad quantity {}: {}", value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_address_validation() {
        assert!(is_valid_address("0xd8dA6BF26964aF9D7eEd9e03E53415D37aA96045"));
        assert!(!is_valid_address("d8dA6BF26964aF9D7eEd9e03E53415D37aA96045"));
        assert!(!is_valid_address("0xd8dA6BF26964aF9D7eEd9e03E53415D37aA9604"));
        assert!(!is_valid_address("0xz8dA6BF26964aF9D7eEd9e03E53415D37aA96045"));
        assert_eq!(
            normalize_address(" 0xD8DA6BF26964AF9D7EED9E03E53415D37AA96045 ").as_deref(),
            Some("0xd8da6bf26964af9d7eed9e03e53415d37aa96045")
        );
    }

    #[test]
    fn test_tx_hash_normalization() {
        let hash = format!("0x{}", "AB".repeat(32));
        assert_eq!(normalize_tx_hash(&hash), Some(format!("0x{}", "ab".repeat(32))));
        assert_eq!(normalize_tx_hash(&"ab".repeat(32)), Some(format!("0x{}", "ab".repeat(32))));
        assert_eq!(normalize_tx_hash("0x1234"), None);
        assert_eq!(normalize_tx_hash(&format!("0x{}", "zz".repeat(32))), None);
    }

    #[test]
    fn test_unit_conversion() {
        assert_eq!(to_chain_units(dec!(1), Currency::Eth).unwrap(), 1_000_000_000_000_000_000);
        assert_eq!(to_chain_units(dec!(0.0015), Currency::Eth).unwrap(), 1_500_000_000_000_000);
        assert_eq!(to_chain_units(dec!(5.25), Currency::Usdt).unwrap(), 5_250_000);
        assert_eq!(to_chain_units(dec!(0.0000001), Currency::Usdt).unwrap(), 0);
        assert!(to_chain_units(dec!(-1), Currency::Eth).is_err());

        assert_eq!(from_chain_units(500_000_000_000_000_000, Currency::Eth).unwrap(), dec!(0.5));
        assert_eq!(from_chain_units(5_000_000, Currency::Usdt).unwrap(), dec!(5));
    }

    #[test]
    fn test_hex_quantities() {
        assert_eq!(parse_hex_u128("0x0").unwrap(), 0);
        assert_eq!(parse_hex_u128("0x").unwrap(), 0);
        assert_eq!(parse_hex_u128("0x1bc16d674ec80000").unwrap(), 2_000_000_000_000_000_000);
        let word = format!("0x{:064x}", 5_000_000u128);
        assert_eq!(parse_hex_u128(&word).unwrap(), 5_000_000);
        assert!(parse_hex_u128(&format!("0x{}", "f".repeat(64))).is_err());
    }
}
