// Ledger service: the only writer of transactions, and the source of every balance

pub mod balance;

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::LedgerResult;
use crate::storage::DatabaseTrait;
use crate::types::{Currency, FundsGuard, Transaction};

pub use balance::{balance_effect, derive_balance, raw_balance};

#[derive(Clone)]
pub struct Ledger {
    database: Arc<dyn DatabaseTrait>,
}

impl Ledger {
    pub fn new(database: Arc<dyn DatabaseTrait>) -> Self {
        Self { database }
    }

    pub fn database(&self) -> &Arc<dyn DatabaseTrait> {
        &self.database
    }

    /// Append entries atomically. Each guard must hold against the balance before the append.
    pub async fn append(&self, entries: &[Transaction], guards: &[FundsGuard]) -> LedgerResult<()> {
        self.database.append_transactions(entries, guards).await?;
        debug!(count = entries.len(), guards = guards.len(), "ledger entries appended");
        Ok(())
    }

    /// Derived balance for one currency, floored at zero.
    pub async fn balance_of(&self, user_id: Uuid, currency: Currency) -> LedgerResult<Decimal> {
        let entries = self.database.get_transactions_for_user(user_id).await?;
        Ok(derive_balance(&entries, user_id, currency))
    }

    pub async fn balances(&self, user_id: Uuid) -> LedgerResult<Vec<(Currency, Decimal)>> {
        let entries = self.database.get_transactions_for_user(user_id).await?;
        Ok(Currency::ALL
            .iter()
            .map(|currency| (*currency, derive_balance(&entries, user_id, *currency)))
            .collect())
    }

    /// Newest first.
    pub async fn history(&self, user_id: Uuid) -> LedgerResult<Vec<Transaction>> {
        Ok(self.database.get_transactions_for_user(user_id).await?)
    }

    /// Rewrite the deprecated ETH balance column. Failures only warn.
    pub async fn refresh_legacy_balance(&self, user_id: Uuid) {
        let balance = match self.balance_of(user_id, Currency::Eth).await {
            Ok(balance) => balance,
            Err(e) => {
                warn!(%user_id, error = %e, "legacy balance refresh skipped");
                return;
            }
        };
        if let Err(e) = self.database.update_legacy_balance(user_id, balance).await {
            warn!(%user_id, error = %e, "legacy balance refresh failed");
        }
    }
}
