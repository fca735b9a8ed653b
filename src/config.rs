//! Service configuration loaded from environment variables (and `.env` via dotenv).

use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;

use crate::types::Currency;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// HTTP listen address.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL URL; in-memory storage is used when absent.
    #[serde(default)]
    pub database_url: Option<String>,

    /// Directory for the rolling log file.
    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    // === Battles ===
    #[serde(default = "default_stake_eth")]
    pub stake_eth: Decimal,

    #[serde(default = "default_stake_usdt")]
    pub stake_usdt: Decimal,

    #[serde(default = "default_battle_duration_secs")]
    pub battle_duration_secs: i64,

    #[serde(default = "default_battle_sweep_interval_secs")]
    pub battle_sweep_interval_secs: u64,

    // === Price oracle ===
    #[serde(default = "default_oracle_timeout_ms")]
    pub oracle_timeout_ms: u64,

    /// How old a cached price may be before it is no longer served.
    #[serde(default = "default_price_max_staleness_secs")]
    pub price_max_staleness_secs: i64,

    // === Chain ===
    #[serde(default = "default_chain_rpc_url")]
    pub chain_rpc_url: String,

    /// Platform wallet: deposit recipient and withdrawal sender.
    #[serde(default)]
    pub platform_address: String,

    #[serde(default = "default_usdt_contract")]
    pub usdt_contract: String,

    #[serde(default = "default_required_confirmations")]
    pub required_confirmations: u64,

    #[serde(default = "default_chain_timeout_ms")]
    pub chain_timeout_ms: u64,

    /// How long a withdrawal payout waits for its receipt.
    #[serde(default = "default_withdrawal_confirm_timeout_secs")]
    pub withdrawal_confirm_timeout_secs: u64,

    // === Deposit scanner ===
    #[serde(default = "default_deposit_scan_interval_secs")]
    pub deposit_scan_interval_secs: u64,

    #[serde(default = "default_deposit_max_pending_age_secs")]
    pub deposit_max_pending_age_secs: i64,

    /// Unconfirmed submissions remembered per user for the scanner.
    #[serde(default = "default_deposit_max_pending_per_user")]
    pub deposit_max_pending_per_user: usize,

    #[serde(default = "default_deposit_max_pending_total")]
    pub deposit_max_pending_total: usize,

    // === Sessions ===
    /// HMAC secret for session tokens. A random per-process secret is used when unset.
    #[serde(default)]
    pub session_secret: Option<String>,

    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: i64,

    // === Admin ===
    /// Shared secret for admin endpoints; admin calls are refused when unset.
    #[serde(default)]
    pub admin_token: Option<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_stake_eth() -> Decimal {
    dec!(0.0015)
}

fn default_stake_usdt() -> Decimal {
    dec!(5)
}

fn default_battle_duration_secs() -> i64 {
    60
}

fn default_battle_sweep_interval_secs() -> u64 {
    10
}

fn default_oracle_timeout_ms() -> u64 {
    3_000
}

fn default_price_max_staleness_secs() -> i64 {
    120
}

fn default_chain_rpc_url() -> String {
    "http://127.0.0.1:8545".to_string()
}

fn default_usdt_contract() -> String {
    "0xdac17f958d2ee523a2206206994597c13d831ec7".to_string()
}

fn default_required_confirmations() -> u64 {
    3
}

fn default_chain_timeout_ms() -> u64 {
    10_000
}

fn default_withdrawal_confirm_timeout_secs() -> u64 {
    90
}

fn default_deposit_scan_interval_secs() -> u64 {
    30
}

fn default_deposit_max_pending_age_secs() -> i64 {
    3_600
}

fn default_deposit_max_pending_per_user() -> usize {
    5
}

fn default_deposit_max_pending_total() -> usize {
    1_000
}

fn default_session_ttl_secs() -> i64 {
    86_400
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            database_url: None,
            log_dir: default_log_dir(),
            stake_eth: default_stake_eth(),
            stake_usdt: default_stake_usdt(),
            battle_duration_secs: default_battle_duration_secs(),
            battle_sweep_interval_secs: default_battle_sweep_interval_secs(),
            oracle_timeout_ms: default_oracle_timeout_ms(),
            price_max_staleness_secs: default_price_max_staleness_secs(),
            chain_rpc_url: default_chain_rpc_url(),
            platform_address: String::new(),
            usdt_contract: default_usdt_contract(),
            required_confirmations: default_required_confirmations(),
            chain_timeout_ms: default_chain_timeout_ms(),
            withdrawal_confirm_timeout_secs: default_withdrawal_confirm_timeout_secs(),
            deposit_scan_interval_secs: default_deposit_scan_interval_secs(),
            deposit_max_pending_age_secs: default_deposit_max_pending_age_secs(),
            deposit_max_pending_per_user: default_deposit_max_pending_per_user(),
            deposit_max_pending_total: default_deposit_max_pending_total(),
            session_secret: None,
            session_ttl_secs: default_session_ttl_secs(),
            admin_token: None,
        }
    }
}

impl Config {
    /// Load `.env` (if present) and then the process environment.
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenv::dotenv().ok();
        let config: Config = envy::from_env()?;
        Ok(config.normalized())
    }

    fn normalized(mut self) -> Self {
        self.platform_address = self.platform_address.trim().to_lowercase();
        self.usdt_contract = self.usdt_contract.trim().to_lowercase();
        self
    }

    /// Fixed per-battle stake for a currency.
    pub fn stake_for(&self, currency: Currency) -> Decimal {
        match currency {
            Currency::Eth => self.stake_eth,
            Currency::Usdt => self.stake_usdt,
        }
    }

    pub fn battle_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.battle_duration_secs)
    }

    pub fn battle_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.battle_sweep_interval_secs)
    }

    pub fn oracle_timeout(&self) -> Duration {
        Duration::from_millis(self.oracle_timeout_ms)
    }

    pub fn price_max_staleness(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.price_max_staleness_secs)
    }

    pub fn chain_timeout(&self) -> Duration {
        Duration::from_millis(self.chain_timeout_ms)
    }

    pub fn withdrawal_confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.withdrawal_confirm_timeout_secs)
    }

    pub fn deposit_scan_interval(&self) -> Duration {
        Duration::from_secs(self.deposit_scan_interval_secs)
    }

    pub fn deposit_max_pending_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.deposit_max_pending_age_secs)
    }

    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.session_ttl_secs)
    }
}
