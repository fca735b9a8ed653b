// Deposit verification: exactly-once crediting of on-chain transfers

pub mod scanner;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::chain_client::{normalize_tx_hash, ChainClient};
use crate::clock::Clock;
use crate::error::{LedgerError, LedgerResult};
use crate::ledger::Ledger;
use crate::locks::KeyedLocks;
use crate::matching::fee_for;
use crate::metrics;
use crate::storage::DatabaseTrait;
use crate::types::{Currency, Transaction, TransactionStatus, TransactionType, User};

pub use scanner::{DepositScanner, ScanReport};

#[derive(Debug, Clone, Serialize)]
pub struct DepositCredit {
    pub transaction: Transaction,
    pub user_amount: Decimal,
    pub fee: Decimal,
    /// False when this hash had already been credited to the same user.
    pub newly_credited: bool,
}

impl DepositCredit {
    fn from_existing(transaction: Transaction) -> Self {
        Self {
            user_amount: transaction.amount,
            fee: transaction.fee_amount.unwrap_or(Decimal::ZERO),
            transaction,
            newly_credited: false,
        }
    }
}

/// A submission the chain did not confirm yet; retried by the scanner.
#[derive(Debug, Clone)]
pub struct PendingDeposit {
    pub user_id: Uuid,
    pub currency: Currency,
    pub first_seen: DateTime<Utc>,
}

pub struct DepositVerifier {
    database: Arc<dyn DatabaseTrait>,
    ledger: Ledger,
    chain: Arc<dyn ChainClient>,
    clock: Arc<dyn Clock>,
    platform_address: String,
    tx_locks: KeyedLocks,
    pending: DashMap<String, PendingDeposit>,
    max_pending_per_user: usize,
    max_pending_total: usize,
}

impl DepositVerifier {
    pub fn new(
        ledger: Ledger,
        chain: Arc<dyn ChainClient>,
        clock: Arc<dyn Clock>,
        platform_address: &str,
        max_pending_per_user: usize,
        max_pending_total: usize,
    ) -> Self {
        Self {
            database: ledger.database().clone(),
            ledger,
            chain,
            clock,
            platform_address: platform_address.trim().to_lowercase(),
            tx_locks: KeyedLocks::new(),
            pending: DashMap::new(),
            max_pending_per_user,
            max_pending_total,
        }
    }

    pub fn locks(&self) -> &KeyedLocks {
        &self.tx_locks
    }

    pub fn pending_submissions(&self) -> Vec<(String, PendingDeposit)> {
        self.pending
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn forget_pending(&self, tx_hash: &str) {
        self.pending.remove(tx_hash);
    }

    /// Track a seen but unconfirmed transfer for the scanner. Returns false when a limit is reached.
    fn remember_pending(&self, tx_hash: &str, user_id: Uuid, currency: Currency) -> bool {
        if self.pending.contains_key(tx_hash) {
            return true;
        }
        let per_user = self.pending.iter().filter(|entry| entry.value().user_id == user_id).count();
        if per_user >= self.max_pending_per_user || self.pending.len() >= self.max_pending_total {
            warn!(
                "Not tracking deposit {} for user {}: {} pending for the user, {} in total",
                tx_hash,
                user_id,
                per_user,
                self.pending.len()
            );
            return false;
        }

        let now = self.clock.now();
        self.pending
            .entry(tx_hash.to_string())
            .or_insert_with(|| PendingDeposit { user_id, currency, first_seen: now });
        true
    }

    /// Verify a user-supplied transaction hash against the chain and credit it once.
    pub async fn check_transaction_for_user(
        &self,
        user_id: Uuid,
        tx_hash: &str,
        currency: Currency,
    ) -> LedgerResult<DepositCredit> {
        let user = self
            .database
            .get_user(user_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("user {}", user_id)))?;

        let tx_hash = normalize_tx_hash(tx_hash)
            .ok_or_else(|| LedgerError::Validation("transaction hash must be 32 bytes of hex".to_string()))?;

        // One verification per hash at a time in this process
        let _guard = self.tx_locks.lock(&tx_hash).await;

        if let Some(prior) = self.prior_outcome(&user, &tx_hash).await? {
            return Ok(prior);
        }

        let fact = match self.chain.get_confirmed_transfer(&tx_hash, currency).await {
            Ok(Some(fact)) if fact.confirmed => fact,
            Ok(Some(_)) => {
                let message = if self.remember_pending(&tx_hash, user_id, currency) {
                    "transaction is awaiting confirmations"
                } else {
                    "transaction is awaiting confirmations; resubmit it once confirmed"
                };
                return Err(LedgerError::NotYetEligible(message.to_string()));
            }
            // Unknown hashes are not remembered; the user resubmits once it is mined
            Ok(None) => {
                return Err(LedgerError::NotYetEligible("transaction not found on chain yet".to_string()));
            }
            Err(e) => {
                error!("Chain lookup for deposit {} failed: {}", tx_hash, e);
                return Err(e.into());
            }
        };

        if fact.to.to_lowercase() != self.platform_address {
            warn!(
                target: "security",
                "Deposit {} by user {} paid {} instead of the platform address", tx_hash, user_id, fact.to
            );
            return self.reject(&tx_hash, "recipient_mismatch", "transaction was not sent to the platform deposit address");
        }
        if fact.from.to_lowercase() != user.wallet_address {
            warn!(
                target: "security",
                "Deposit {} claimed by user {} ({}) was sent from {}", tx_hash, user_id, user.wallet_address, fact.from
            );
            return self.reject(&tx_hash, "sender_mismatch", "transaction was not sent from your registered wallet");
        }
        if fact.amount <= Decimal::ZERO {
            return self.reject(&tx_hash, "zero_amount", "transaction carries no value");
        }

        let fee = fee_for(fact.amount);
        let user_amount = fact.amount - fee;

        // A concurrent submission (another process) may have landed meanwhile
        if let Some(prior) = self.prior_outcome(&user, &tx_hash).await? {
            return Ok(prior);
        }

        let deposit = Transaction::new(
            user_id,
            TransactionType::Deposit,
            user_amount,
            currency,
            TransactionStatus::Completed,
            self.clock.now(),
        )
        .with_fee(fee)
        .with_tx_hash(tx_hash.clone());
        let mut entries = vec![deposit.clone()];
        entries.extend(deposit.mirrored_fee());

        match self.ledger.append(&entries, &[]).await {
            Ok(()) => {}
            Err(LedgerError::DuplicateReference(_)) => {
                // Storage uniqueness won the race; report whatever is recorded now
                return match self.prior_outcome(&user, &tx_hash).await? {
                    Some(prior) => Ok(prior),
                    None => Err(LedgerError::DuplicateReference(tx_hash)),
                };
            }
            Err(e) => return Err(e),
        }

        self.forget_pending(&tx_hash);
        info!("💰 Credited deposit {} to user {}: {} {} (fee {})", tx_hash, user_id, user_amount, currency, fee);
        metrics::inc_deposits_credited(currency);
        if currency == Currency::Eth {
            self.ledger.refresh_legacy_balance(user_id).await;
        }

        Ok(DepositCredit { transaction: deposit, user_amount, fee, newly_credited: true })
    }

    /// Idempotent replay for the owner, hard rejection for anyone else.
    async fn prior_outcome(&self, user: &User, tx_hash: &str) -> LedgerResult<Option<DepositCredit>> {
        let Some(existing) = self.database.find_transaction_by_hash(tx_hash).await? else {
            return Ok(None);
        };

        if existing.user_id == user.id && existing.tx_type == TransactionType::Deposit {
            self.forget_pending(tx_hash);
            return Ok(Some(DepositCredit::from_existing(existing)));
        }

        warn!(
            target: "security",
            "Transaction hash {} submitted by user {} is already recorded for user {} ({})",
            tx_hash,
            user.id,
            existing.user_id,
            existing.tx_type.as_str()
        );
        metrics::inc_deposits_rejected("duplicate_reference");
        self.forget_pending(tx_hash);
        Err(LedgerError::DuplicateReference(tx_hash.to_string()))
    }

    fn reject(&self, tx_hash: &str, reason: &'static str, message: &str) -> LedgerResult<DepositCredit> {
        self.forget_pending(tx_hash);
        metrics::inc_deposits_rejected(reason);
        Err(LedgerError::Validation(message.to_string()))
    }
}
