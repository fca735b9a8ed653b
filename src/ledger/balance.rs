// Derived balance: a fold over the transaction log

use rust_decimal::Decimal;
use uuid::Uuid;

use crate::types::{Currency, Transaction, TransactionStatus, TransactionType};

/// Signed effect of one entry on its owner's balance.
///
/// deposits and wins count once completed; withdrawals count while pending or
/// completed (pending is the escrow hold, rejected/canceled release it); stakes
/// count with their fee. Fee and commission entries are platform bookkeeping and
/// never touch the user balance.
pub fn balance_effect(entry: &Transaction) -> Decimal {
    match (entry.tx_type, entry.status) {
        (TransactionType::Deposit, TransactionStatus::Completed)
        | (TransactionType::Win, TransactionStatus::Completed) => entry.amount,
        (TransactionType::Withdrawal, TransactionStatus::Completed)
        | (TransactionType::Withdrawal, TransactionStatus::Pending) => -entry.amount,
        (TransactionType::Stake, TransactionStatus::Completed) => {
            -(entry.amount + entry.fee_amount.unwrap_or(Decimal::ZERO))
        }
        _ => Decimal::ZERO,
    }
}

/// Unfloored sum, useful for audits.
pub fn raw_balance<'a, I>(entries: I, user_id: Uuid, currency: Currency) -> Decimal
where
    I: IntoIterator<Item = &'a Transaction>,
{
    entries
        .into_iter()
        .filter(|t| t.user_id == user_id && t.currency == currency)
        .map(balance_effect)
        .sum()
}

/// Balance formula, floored at zero.
pub fn derive_balance<'a, I>(entries: I, user_id: Uuid, currency: Currency) -> Decimal
where
    I: IntoIterator<Item = &'a Transaction>,
{
    raw_balance(entries, user_id, currency).max(Decimal::ZERO)
}
