// Database factory for switching between in-memory and PostgreSQL implementations

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{BattleResolution, Database, MatchRecord, SimplePostgresDatabase, WithdrawalSettlement};
use crate::config::Config;
use crate::error::StorageError;
use crate::types::{Battle, Currency, FundsGuard, QueueEntry, Side, Transaction, User};

pub enum DatabaseType {
    InMemory,
    PostgreSQL,
}

// Trait that both implementations satisfy. Every multi-row write is atomic:
// either all of it lands or none of it does.
#[async_trait::async_trait]
pub trait DatabaseTrait: Send + Sync {
    // User operations
    async fn insert_user(&self, user: &User) -> Result<(), StorageError>;
    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>, StorageError>;
    async fn get_user_by_wallet(&self, wallet_address: &str) -> Result<Option<User>, StorageError>;
    async fn set_auth_nonce(&self, user_id: Uuid, nonce: &str) -> Result<(), StorageError>;
    async fn update_legacy_balance(&self, user_id: Uuid, balance: Decimal) -> Result<(), StorageError>;

    // Ledger operations
    /// Append entries after checking txHash uniqueness and every funds guard
    async fn append_transactions(&self, entries: &[Transaction], guards: &[FundsGuard]) -> Result<(), StorageError>;
    async fn get_transaction(&self, id: Uuid) -> Result<Option<Transaction>, StorageError>;
    async fn find_transaction_by_hash(&self, tx_hash: &str) -> Result<Option<Transaction>, StorageError>;
    /// Newest first
    async fn get_transactions_for_user(&self, user_id: Uuid) -> Result<Vec<Transaction>, StorageError>;

    // Withdrawal operations
    async fn get_pending_withdrawals(&self) -> Result<Vec<Transaction>, StorageError>;
    /// Moves a pending withdrawal to its terminal status. `Ok(None)` when it was no longer pending.
    async fn settle_withdrawal(
        &self,
        withdrawal_id: Uuid,
        settlement: &WithdrawalSettlement,
        now: DateTime<Utc>,
    ) -> Result<Option<Transaction>, StorageError>;

    // Queue operations
    /// Stores the entry and returns it with its assigned sequence
    async fn insert_queue_entry(&self, entry: &QueueEntry) -> Result<QueueEntry, StorageError>;
    async fn get_queue_entry(&self, user_id: Uuid) -> Result<Option<QueueEntry>, StorageError>;
    async fn oldest_queue_entry(&self, currency: Currency, side: Side) -> Result<Option<QueueEntry>, StorageError>;
    async fn remove_queue_entries(&self, user_ids: &[Uuid]) -> Result<usize, StorageError>;

    // Battle operations
    /// Claims the queue rows, appends the stake entries and stores the battle
    async fn record_match(&self, record: &MatchRecord) -> Result<(), StorageError>;
    async fn get_battle(&self, battle_id: Uuid) -> Result<Option<Battle>, StorageError>;
    async fn get_active_battle_for_user(&self, user_id: Uuid) -> Result<Option<Battle>, StorageError>;
    async fn get_latest_battle_for_user(&self, user_id: Uuid) -> Result<Option<Battle>, StorageError>;
    async fn get_active_battles(&self) -> Result<Vec<Battle>, StorageError>;
    /// Sets the start price only while it is still zero
    async fn anchor_start_price(&self, battle_id: Uuid, price: Decimal) -> Result<bool, StorageError>;
    /// Applies the resolution and its payout only while the battle is active
    async fn resolve_battle(&self, resolution: &BattleResolution) -> Result<bool, StorageError>;
}

pub async fn create_database(config: &Config) -> Result<Arc<dyn DatabaseTrait>> {
    match determine_database_type(config) {
        DatabaseType::PostgreSQL => {
            info!("🐘 Initializing PostgreSQL database connection...");
            let url = config.database_url.as_deref().unwrap_or_default();
            match SimplePostgresDatabase::new(url).await {
                Ok(postgres_db) => {
                    info!("✅ PostgreSQL database connected - USING POSTGRESQL");
                    Ok(Arc::new(postgres_db) as Arc<dyn DatabaseTrait>)
                }
                Err(e) => {
                    error!("❌ PostgreSQL connection failed: {}", e);
                    warn!("🔄 Falling back to in-memory database");
                    let in_memory_db = Database::new().await?;
                    Ok(Arc::new(in_memory_db) as Arc<dyn DatabaseTrait>)
                }
            }
        }
        DatabaseType::InMemory => {
            info!("💾 Using in-memory database");
            let in_memory_db = Database::new().await?;
            Ok(Arc::new(in_memory_db) as Arc<dyn DatabaseTrait>)
        }
    }
}

pub async fn create_test_database() -> Result<Arc<dyn DatabaseTrait>> {
    // For tests, prefer in-memory but allow PostgreSQL if configured
    let use_postgres = std::env::var("USE_POSTGRES_FOR_TESTS")
        .unwrap_or_else(|_| "false".to_string())
        .parse::<bool>()
        .unwrap_or(false);

    if use_postgres {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            info!("🧪 Using PostgreSQL for tests");
            match SimplePostgresDatabase::new_test(&url).await {
                Ok(postgres_db) => return Ok(Arc::new(postgres_db)),
                Err(e) => warn!("Test PostgreSQL connection failed: {}, using in-memory", e),
            }
        }
    }

    let in_memory_db = Database::new_test().await?;
    Ok(Arc::new(in_memory_db))
}

fn determine_database_type(config: &Config) -> DatabaseType {
    match config.database_url.as_deref() {
        Some(url) if !url.trim().is_empty() => DatabaseType::PostgreSQL,
        _ => DatabaseType::InMemory,
    }
}
