// Storage layer: users, append-only transactions, queue entries and battles

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::StorageError;
use crate::ledger::balance::derive_balance;
use crate::types::{
    Battle, BattleStatus, Currency, FundsGuard, QueueEntry, Side, Transaction, TransactionStatus,
    TransactionType, User,
};

// PostgreSQL implementation (runtime queries)
pub mod simple_postgres;
pub use simple_postgres::SimplePostgresDatabase;

// Database factory and trait
pub mod factory;
pub use factory::{create_database, create_test_database, DatabaseTrait};

/// Everything a successful match writes, committed as one unit.
#[derive(Debug, Clone)]
pub struct MatchRecord {
    pub battle: Battle,
    pub entries: Vec<Transaction>,
    pub guards: Vec<FundsGuard>,
    /// Queue rows claimed (and deleted) by this match
    pub dequeued: Vec<Uuid>,
}

/// Terminal write for a battle, applied only while it is still active.
#[derive(Debug, Clone)]
pub struct BattleResolution {
    pub battle_id: Uuid,
    pub winner: Side,
    pub end_price: Decimal,
    pub resolved_at: DateTime<Utc>,
    pub payout: Transaction,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WithdrawalSettlement {
    Complete { tx_hash: String },
    Reject { reason: Option<String> },
    Cancel,
}

impl WithdrawalSettlement {
    pub fn target_status(&self) -> TransactionStatus {
        match self {
            WithdrawalSettlement::Complete { .. } => TransactionStatus::Completed,
            WithdrawalSettlement::Reject { .. } => TransactionStatus::Rejected,
            WithdrawalSettlement::Cancel => TransactionStatus::Canceled,
        }
    }

    /// Rejections and cancellations hand the escrowed fee back
    pub fn refunds_fee(&self) -> bool {
        !matches!(self, WithdrawalSettlement::Complete { .. })
    }
}

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    wallets: HashMap<String, Uuid>,
    transactions: HashMap<Uuid, Transaction>,
    user_transactions: HashMap<Uuid, Vec<Uuid>>, // append order per user
    tx_hashes: HashMap<String, Uuid>,
    queue: HashMap<Uuid, QueueEntry>,
    next_sequence: i64,
    battles: HashMap<Uuid, Battle>,
}

impl Tables {
    fn entries_for(&self, user_id: Uuid) -> impl Iterator<Item = &Transaction> {
        self.user_transactions
            .get(&user_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.transactions.get(id))
    }

    fn check_guards(&self, guards: &[FundsGuard]) -> Result<(), StorageError> {
        for guard in guards {
            let available = derive_balance(self.entries_for(guard.user_id), guard.user_id, guard.currency);
            if available < guard.required {
                return Err(StorageError::InsufficientFunds {
                    user_id: guard.user_id,
                    currency: guard.currency,
                    required: guard.required,
                    available,
                });
            }
        }
        Ok(())
    }

    fn check_hashes(&self, entries: &[Transaction]) -> Result<(), StorageError> {
        let mut seen: HashMap<&str, Uuid> = HashMap::new();
        for entry in entries {
            if let Some(hash) = entry.tx_hash.as_deref() {
                if let Some(existing) = self.tx_hashes.get(hash) {
                    let owner = self.transactions.get(existing).map(|t| t.user_id).unwrap_or(entry.user_id);
                    return Err(StorageError::DuplicateTxHash { tx_hash: hash.to_string(), owner });
                }
                if seen.insert(hash, entry.user_id).is_some() {
                    return Err(StorageError::DuplicateTxHash { tx_hash: hash.to_string(), owner: entry.user_id });
                }
            }
        }
        Ok(())
    }

    fn insert_entries(&mut self, entries: &[Transaction]) {
        for entry in entries {
            if let Some(hash) = &entry.tx_hash {
                self.tx_hashes.insert(hash.clone(), entry.id);
            }
            self.user_transactions.entry(entry.user_id).or_default().push(entry.id);
            self.transactions.insert(entry.id, entry.clone());
        }
    }
}

// In-memory database; a single lock over all tables makes every multi-row write atomic
pub struct Database {
    tables: RwLock<Tables>,
}

impl Database {
    pub async fn new() -> anyhow::Result<Self> {
        Ok(Self { tables: RwLock::new(Tables::default()) })
    }

    pub async fn new_test() -> anyhow::Result<Self> {
        Self::new().await
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, StorageError> {
        self.tables
            .read()
            .map_err(|e| StorageError::Backend(anyhow!("Failed to acquire read lock on tables: {}", e)))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, StorageError> {
        self.tables
            .write()
            .map_err(|e| StorageError::Backend(anyhow!("Failed to acquire write lock on tables: {}", e)))
    }
}

#[async_trait::async_trait]
impl DatabaseTrait for Database {
    async fn insert_user(&self, user: &User) -> Result<(), StorageError> {
        let mut tables = self.write()?;
        if tables.wallets.contains_key(&user.wallet_address) {
            return Err(StorageError::DuplicateWallet(user.wallet_address.clone()));
        }
        tables.wallets.insert(user.wallet_address.clone(), user.id);
        tables.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>, StorageError> {
        Ok(self.read()?.users.get(&user_id).cloned())
    }

    async fn get_user_by_wallet(&self, wallet_address: &str) -> Result<Option<User>, StorageError> {
        let tables = self.read()?;
        Ok(tables
            .wallets
            .get(wallet_address)
            .and_then(|id| tables.users.get(id))
            .cloned())
    }

    async fn set_auth_nonce(&self, user_id: Uuid, nonce: &str) -> Result<(), StorageError> {
        let mut tables = self.write()?;
        let user = tables
            .users
            .get_mut(&user_id)
            .ok_or_else(|| StorageError::NotFound(format!("user {}", user_id)))?;
        user.auth_nonce = Some(nonce.to_string());
        Ok(())
    }

    async fn update_legacy_balance(&self, user_id: Uuid, balance: Decimal) -> Result<(), StorageError> {
        let mut tables = self.write()?;
        if let Some(user) = tables.users.get_mut(&user_id) {
            user.legacy_balance = balance;
        }
        Ok(())
    }

    async fn append_transactions(
        &self,
        entries: &[Transaction],
        guards: &[FundsGuard],
    ) -> Result<(), StorageError> {
        let mut tables = self.write()?;
        tables.check_hashes(entries)?;
        tables.check_guards(guards)?;
        tables.insert_entries(entries);
        Ok(())
    }

    async fn get_transaction(&self, id: Uuid) -> Result<Option<Transaction>, StorageError> {
        Ok(self.read()?.transactions.get(&id).cloned())
    }

    async fn find_transaction_by_hash(&self, tx_hash: &str) -> Result<Option<Transaction>, StorageError> {
        let tables = self.read()?;
        Ok(tables
            .tx_hashes
            .get(tx_hash)
            .and_then(|id| tables.transactions.get(id))
            .cloned())
    }

    async fn get_transactions_for_user(&self, user_id: Uuid) -> Result<Vec<Transaction>, StorageError> {
        let tables = self.read()?;
        let mut entries: Vec<Transaction> = tables.entries_for(user_id).cloned().collect();
        entries.reverse(); // newest first
        Ok(entries)
    }

    async fn get_pending_withdrawals(&self) -> Result<Vec<Transaction>, StorageError> {
        let tables = self.read()?;
        let mut pending: Vec<Transaction> = tables
            .transactions
            .values()
            .filter(|t| t.tx_type == TransactionType::Withdrawal && t.status == TransactionStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|t| t.created_at);
        Ok(pending)
    }

    async fn settle_withdrawal(
        &self,
        withdrawal_id: Uuid,
        settlement: &WithdrawalSettlement,
        now: DateTime<Utc>,
    ) -> Result<Option<Transaction>, StorageError> {
        let mut tables = self.write()?;

        let current = tables
            .transactions
            .get(&withdrawal_id)
            .filter(|t| t.tx_type == TransactionType::Withdrawal)
            .ok_or_else(|| StorageError::NotFound(format!("withdrawal {}", withdrawal_id)))?;
        if current.status != TransactionStatus::Pending {
            return Ok(None);
        }
        let owner = current.user_id;

        if let WithdrawalSettlement::Complete { tx_hash } = settlement {
            if let Some(existing) = tables.tx_hashes.get(tx_hash) {
                let owner = tables.transactions.get(existing).map(|t| t.user_id).unwrap_or(owner);
                return Err(StorageError::DuplicateTxHash { tx_hash: tx_hash.clone(), owner });
            }
            tables.tx_hashes.insert(tx_hash.clone(), withdrawal_id);
        }

        if settlement.refunds_fee() {
            let fee_ids: Vec<Uuid> = tables
                .entries_for(owner)
                .filter(|t| {
                    t.tx_type == TransactionType::Fee
                        && t.related_transaction_id == Some(withdrawal_id)
                        && t.status == TransactionStatus::Completed
                })
                .map(|t| t.id)
                .collect();
            for id in fee_ids {
                if let Some(fee) = tables.transactions.get_mut(&id) {
                    fee.status = TransactionStatus::Refunded;
                    fee.updated_at = now;
                }
            }
        }

        let withdrawal = tables
            .transactions
            .get_mut(&withdrawal_id)
            .ok_or_else(|| StorageError::NotFound(format!("withdrawal {}", withdrawal_id)))?;
        withdrawal.status = settlement.target_status();
        withdrawal.updated_at = now;
        match settlement {
            WithdrawalSettlement::Complete { tx_hash } => withdrawal.tx_hash = Some(tx_hash.clone()),
            WithdrawalSettlement::Reject { reason } => withdrawal.note = reason.clone(),
            WithdrawalSettlement::Cancel => {}
        }
        Ok(Some(withdrawal.clone()))
    }

    async fn insert_queue_entry(&self, entry: &QueueEntry) -> Result<QueueEntry, StorageError> {
        let mut tables = self.write()?;
        if tables.queue.contains_key(&entry.user_id) {
            return Err(StorageError::AlreadyQueued(entry.user_id));
        }
        tables.next_sequence += 1;
        let stored = QueueEntry { sequence: tables.next_sequence, ..entry.clone() };
        tables.queue.insert(stored.user_id, stored.clone());
        Ok(stored)
    }

    async fn get_queue_entry(&self, user_id: Uuid) -> Result<Option<QueueEntry>, StorageError> {
        Ok(self.read()?.queue.get(&user_id).cloned())
    }

    async fn oldest_queue_entry(&self, currency: Currency, side: Side) -> Result<Option<QueueEntry>, StorageError> {
        let tables = self.read()?;
        Ok(tables
            .queue
            .values()
            .filter(|e| e.currency == currency && e.side == side)
            .min_by_key(|e| (e.joined_at, e.sequence))
            .cloned())
    }

    async fn remove_queue_entries(&self, user_ids: &[Uuid]) -> Result<usize, StorageError> {
        let mut tables = self.write()?;
        Ok(user_ids.iter().filter(|id| tables.queue.remove(*id).is_some()).count())
    }

    async fn record_match(&self, record: &MatchRecord) -> Result<(), StorageError> {
        let mut tables = self.write()?;
        for user_id in &record.dequeued {
            if !tables.queue.contains_key(user_id) {
                return Err(StorageError::QueueEntryMissing(*user_id));
            }
        }
        tables.check_hashes(&record.entries)?;
        tables.check_guards(&record.guards)?;

        for user_id in &record.dequeued {
            tables.queue.remove(user_id);
        }
        tables.insert_entries(&record.entries);
        tables.battles.insert(record.battle.id, record.battle.clone());
        Ok(())
    }

    async fn get_battle(&self, battle_id: Uuid) -> Result<Option<Battle>, StorageError> {
        Ok(self.read()?.battles.get(&battle_id).cloned())
    }

    async fn get_active_battle_for_user(&self, user_id: Uuid) -> Result<Option<Battle>, StorageError> {
        let tables = self.read()?;
        Ok(tables
            .battles
            .values()
            .filter(|b| b.status == BattleStatus::Active && b.side_of(user_id).is_some())
            .max_by_key(|b| b.start_time)
            .cloned())
    }

    async fn get_latest_battle_for_user(&self, user_id: Uuid) -> Result<Option<Battle>, StorageError> {
        let tables = self.read()?;
        Ok(tables
            .battles
            .values()
            .filter(|b| b.side_of(user_id).is_some())
            .max_by_key(|b| b.start_time)
            .cloned())
    }

    async fn get_active_battles(&self) -> Result<Vec<Battle>, StorageError> {
        let tables = self.read()?;
        let mut active: Vec<Battle> = tables
            .battles
            .values()
            .filter(|b| b.status == BattleStatus::Active)
            .cloned()
            .collect();
        active.sort_by_key(|b| b.start_time);
        Ok(active)
    }

    async fn anchor_start_price(&self, battle_id: Uuid, price: Decimal) -> Result<bool, StorageError> {
        let mut tables = self.write()?;
        match tables.battles.get_mut(&battle_id) {
            Some(battle) if !battle.is_anchored() => {
                battle.start_price = price;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StorageError::NotFound(format!("battle {}", battle_id))),
        }
    }

    async fn resolve_battle(&self, resolution: &BattleResolution) -> Result<bool, StorageError> {
        let mut tables = self.write()?;
        let still_active = match tables.battles.get(&resolution.battle_id) {
            Some(battle) => battle.status == BattleStatus::Active,
            None => return Err(StorageError::NotFound(format!("battle {}", resolution.battle_id))),
        };
        if !still_active {
            return Ok(false);
        }

        let payout = std::slice::from_ref(&resolution.payout);
        tables.check_hashes(payout)?;
        tables.insert_entries(payout);

        if let Some(battle) = tables.battles.get_mut(&resolution.battle_id) {
            battle.status = BattleStatus::Resolved;
            battle.winner = Some(resolution.winner);
            battle.end_price = Some(resolution.end_price);
            battle.resolved_at = Some(resolution.resolved_at);
        }
        Ok(true)
    }
}
