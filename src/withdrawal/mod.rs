// Withdrawal workflow: escrowed request, admin approve/reject, owner cancel

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rust_decimal::Decimal;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::chain_client::{normalize_address, ChainClient, ChainError};
use crate::clock::Clock;
use crate::error::{LedgerError, LedgerResult};
use crate::ledger::Ledger;
use crate::locks::KeyedLocks;
use crate::matching::fee_for;
use crate::metrics;
use crate::storage::{DatabaseTrait, WithdrawalSettlement};
use crate::types::{Currency, FundsGuard, Transaction, TransactionStatus, TransactionType};

pub struct WithdrawalWorkflow {
    database: Arc<dyn DatabaseTrait>,
    ledger: Ledger,
    chain: Arc<dyn ChainClient>,
    clock: Arc<dyn Clock>,
    confirm_timeout: Duration,
    locks: KeyedLocks,
    /// Payouts broadcast without a recorded completion, by withdrawal id.
    unrecorded_payouts: DashMap<Uuid, String>,
}

impl WithdrawalWorkflow {
    pub fn new(
        ledger: Ledger,
        chain: Arc<dyn ChainClient>,
        clock: Arc<dyn Clock>,
        confirm_timeout: Duration,
    ) -> Self {
        Self {
            database: ledger.database().clone(),
            ledger,
            chain,
            clock,
            confirm_timeout,
            locks: KeyedLocks::new(),
            unrecorded_payouts: DashMap::new(),
        }
    }

    pub fn locks(&self) -> &KeyedLocks {
        &self.locks
    }

    /// Debit `amount + fee` into a pending withdrawal. The hold is what reduces the balance.
    pub async fn request(
        &self,
        user_id: Uuid,
        amount: Decimal,
        currency: Currency,
        destination_address: &str,
    ) -> LedgerResult<Transaction> {
        if self.database.get_user(user_id).await?.is_none() {
            return Err(LedgerError::NotFound(format!("user {}", user_id)));
        }
        if amount <= Decimal::ZERO {
            return Err(LedgerError::Validation("withdrawal amount must be positive".to_string()));
        }
        let destination = normalize_address(destination_address)
            .ok_or_else(|| LedgerError::Validation("destination must be a 0x-prefixed 20-byte address".to_string()))?;

        let fee = fee_for(amount);
        let total = amount + fee;

        let withdrawal = Transaction::new(
            user_id,
            TransactionType::Withdrawal,
            total,
            currency,
            TransactionStatus::Pending,
            self.clock.now(),
        )
        .with_fee(fee)
        .with_destination(destination.clone());
        let mut entries = vec![withdrawal.clone()];
        entries.extend(withdrawal.mirrored_fee());

        self.ledger
            .append(&entries, &[FundsGuard { user_id, currency, required: total }])
            .await?;

        info!(
            "🏧 Withdrawal {} requested by {}: {} {} to {} (fee {})",
            withdrawal.id, user_id, amount, currency, destination, fee
        );
        metrics::inc_withdrawals_requested(currency);
        self.after_transition(&withdrawal).await;
        Ok(withdrawal)
    }

    /// Send the payout on chain and complete the withdrawal. Any failure before broadcast leaves it pending.
    pub async fn approve(&self, withdrawal_id: Uuid) -> LedgerResult<Transaction> {
        let _guard = self.locks.lock(&withdrawal_id.to_string()).await;

        self.ensure_payout_recorded(withdrawal_id)?;
        let withdrawal = self.pending_withdrawal(withdrawal_id).await?;
        let destination = withdrawal
            .destination_address
            .as_deref()
            .filter(|address| self.chain.validate_address(address))
            .ok_or_else(|| LedgerError::Validation(format!("withdrawal {} has no valid destination address", withdrawal_id)))?
            .to_string();

        let fee = withdrawal.fee_amount.unwrap_or(Decimal::ZERO);
        let payout = withdrawal.amount - fee;

        let liquidity = self.chain.platform_balance(withdrawal.currency).await?;
        if liquidity < payout {
            warn!(
                "Withdrawal {} needs {} {} but the platform wallet holds {}",
                withdrawal_id, payout, withdrawal.currency, liquidity
            );
            return Err(LedgerError::InsufficientFunds { required: payout, available: liquidity });
        }

        let tx_hash = self.chain.send_transfer(&destination, payout, withdrawal.currency).await?;

        match self.chain.wait_for_confirmation(&tx_hash, self.confirm_timeout).await {
            Ok(true) => {}
            Ok(false) => {
                error!("Payout {} for withdrawal {} reverted; withdrawal stays pending", tx_hash, withdrawal_id);
                return Err(LedgerError::ExternalUnavailable(format!("payout {} reverted", tx_hash)));
            }
            // Broadcast already happened; completing avoids a second send on retry
            Err(ChainError::Timeout(_)) => {
                warn!("Payout {} for withdrawal {} not confirmed in time, recording it anyway", tx_hash, withdrawal_id);
            }
            Err(e) => {
                warn!("Could not confirm payout {} for withdrawal {}: {}, recording it anyway", tx_hash, withdrawal_id, e);
            }
        }

        let completed = match self
            .settle(withdrawal_id, WithdrawalSettlement::Complete { tx_hash: tx_hash.clone() })
            .await
        {
            Ok(completed) => completed,
            Err(e) => {
                error!(
                    target: "security",
                    "Payout {} for withdrawal {} was broadcast but completing it failed: {}. Reconcile before any further action",
                    tx_hash, withdrawal_id, e
                );
                self.unrecorded_payouts.insert(withdrawal_id, tx_hash.clone());
                return Err(LedgerError::PayoutUnrecorded { withdrawal_id, tx_hash });
            }
        };
        info!("✅ Withdrawal {} completed: {} {} sent in {}", withdrawal_id, payout, completed.currency, tx_hash);
        Ok(completed)
    }

    pub async fn reject(&self, withdrawal_id: Uuid, reason: Option<String>) -> LedgerResult<Transaction> {
        let _guard = self.locks.lock(&withdrawal_id.to_string()).await;

        self.ensure_payout_recorded(withdrawal_id)?;
        self.pending_withdrawal(withdrawal_id).await?;
        let rejected = self.settle(withdrawal_id, WithdrawalSettlement::Reject { reason: reason.clone() }).await?;
        info!("Withdrawal {} rejected: {}", withdrawal_id, reason.as_deref().unwrap_or("no reason given"));
        Ok(rejected)
    }

    pub async fn cancel(&self, withdrawal_id: Uuid, user_id: Uuid) -> LedgerResult<Transaction> {
        let _guard = self.locks.lock(&withdrawal_id.to_string()).await;

        self.ensure_payout_recorded(withdrawal_id)?;
        let withdrawal = self.pending_withdrawal(withdrawal_id).await?;
        if withdrawal.user_id != user_id {
            warn!(target: "security", "User {} tried to cancel withdrawal {} owned by {}", user_id, withdrawal_id, withdrawal.user_id);
            return Err(LedgerError::NotAuthorized("only the owner can cancel a withdrawal".to_string()));
        }

        let canceled = self.settle(withdrawal_id, WithdrawalSettlement::Cancel).await?;
        info!("Withdrawal {} canceled by its owner", withdrawal_id);
        Ok(canceled)
    }

    /// Oldest first.
    pub async fn list_pending(&self) -> LedgerResult<Vec<Transaction>> {
        Ok(self.database.get_pending_withdrawals().await?)
    }

    /// Payouts that left the platform wallet without a recorded completion, as `(withdrawal_id, tx_hash)`.
    pub fn unrecorded_payouts(&self) -> Vec<(Uuid, String)> {
        self.unrecorded_payouts
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    /// A withdrawal whose payout may already be on chain must not be paid, refunded or rejected again.
    fn ensure_payout_recorded(&self, withdrawal_id: Uuid) -> LedgerResult<()> {
        match self.unrecorded_payouts.get(&withdrawal_id) {
            Some(tx_hash) => Err(LedgerError::PayoutUnrecorded { withdrawal_id, tx_hash: tx_hash.value().clone() }),
            None => Ok(()),
        }
    }

    async fn pending_withdrawal(&self, withdrawal_id: Uuid) -> LedgerResult<Transaction> {
        let withdrawal = self
            .database
            .get_transaction(withdrawal_id)
            .await?
            .filter(|t| t.tx_type == TransactionType::Withdrawal)
            .ok_or_else(|| LedgerError::NotFound(format!("withdrawal {}", withdrawal_id)))?;

        if withdrawal.status != TransactionStatus::Pending {
            return Err(LedgerError::AlreadyProcessed(format!(
                "withdrawal {} is already {}",
                withdrawal_id,
                withdrawal.status.as_str()
            )));
        }
        Ok(withdrawal)
    }

    async fn settle(&self, withdrawal_id: Uuid, settlement: WithdrawalSettlement) -> LedgerResult<Transaction> {
        let updated = self
            .database
            .settle_withdrawal(withdrawal_id, &settlement, self.clock.now())
            .await?
            .ok_or_else(|| LedgerError::AlreadyProcessed(format!("withdrawal {} is no longer pending", withdrawal_id)))?;

        metrics::inc_withdrawals_settled(updated.status);
        self.after_transition(&updated).await;
        Ok(updated)
    }

    async fn after_transition(&self, withdrawal: &Transaction) {
        if withdrawal.currency == Currency::Eth {
            self.ledger.refresh_legacy_balance(withdrawal.user_id).await;
        }
    }
}
