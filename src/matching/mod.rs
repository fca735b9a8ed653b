// FIFO battle matching engine

use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::battle::PriceAnchor;
use crate::clock::Clock;
use crate::config::Config;
use crate::error::{LedgerError, LedgerResult, StorageError};
use crate::ledger::Ledger;
use crate::locks::KeyedLocks;
use crate::metrics;
use crate::storage::{DatabaseTrait, MatchRecord};
use crate::types::{
    Battle, BattleStatus, Currency, FundsGuard, QueueEntry, Side, Transaction, TransactionStatus,
    TransactionType, WebSocketMessage,
};

/// Platform fee taken on stakes, deposits and withdrawals.
pub const FEE_RATE: Decimal = dec!(0.05);

pub fn fee_for(amount: Decimal) -> Decimal {
    amount * FEE_RATE
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EnterQueueOutcome {
    Matched { battle: Battle },
    Queued { entry: QueueEntry },
    /// The caller's entry was dropped because a balance no longer covered stake plus fee.
    Evicted,
}

/// Result of one pairing attempt at the head of a currency's queue.
enum PairOutcome {
    Matched(Battle),
    Evicted([Uuid; 2]),
    Raced,
}

pub struct MatchingEngine {
    database: Arc<dyn DatabaseTrait>,
    ledger: Ledger,
    anchor: PriceAnchor,
    clock: Arc<dyn Clock>,
    config: Arc<Config>,
    currency_locks: KeyedLocks,
    ws_broadcaster: broadcast::Sender<WebSocketMessage>,
}

impl MatchingEngine {
    pub fn new(
        ledger: Ledger,
        anchor: PriceAnchor,
        clock: Arc<dyn Clock>,
        config: Arc<Config>,
        ws_broadcaster: broadcast::Sender<WebSocketMessage>,
    ) -> Self {
        Self {
            database: ledger.database().clone(),
            ledger,
            anchor,
            clock,
            config,
            currency_locks: KeyedLocks::new(),
            ws_broadcaster,
        }
    }

    pub fn locks(&self) -> &KeyedLocks {
        &self.currency_locks
    }

    pub async fn enter_queue(&self, user_id: Uuid, side: Side, currency: Currency) -> LedgerResult<EnterQueueOutcome> {
        self.check_preconditions(user_id, currency).await?;

        let stake = self.config.stake_for(currency);
        let (outcome, created) = {
            // Single writer per currency for the queue head
            let _guard = self.currency_locks.lock(currency.as_str()).await;

            let entry = self
                .database
                .insert_queue_entry(&QueueEntry {
                    user_id,
                    side,
                    stake_amount: stake,
                    currency,
                    joined_at: self.clock.now(),
                    sequence: 0,
                })
                .await?;
            metrics::inc_queue_entries(currency);
            info!("📋 User {} queued {} for {} {}", user_id, side.as_str(), stake, currency);

            self.drain_pairs(user_id, entry, currency).await?
        };

        // Anchor outside the currency lock so a slow oracle does not stall matching
        let mut outcome = outcome;
        for battle in created {
            // The match is committed; an unanchored battle is anchored later by its readers
            let anchored = match self.anchor.ensure_anchored(battle.clone()).await {
                Ok(anchored) => anchored,
                Err(e) => {
                    warn!("Battle {} created but anchoring failed: {}", battle.id, e);
                    battle
                }
            };
            if let EnterQueueOutcome::Matched { battle } = &mut outcome {
                if battle.id == anchored.id {
                    *battle = anchored.clone();
                }
            }
            self.ledger.refresh_legacy_balance(anchored.long_player).await;
            self.ledger.refresh_legacy_balance(anchored.short_player).await;
            let _ = self.ws_broadcaster.send(WebSocketMessage::BattleCreated { battle: anchored });
        }

        Ok(outcome)
    }

    async fn check_preconditions(&self, user_id: Uuid, currency: Currency) -> LedgerResult<()> {
        if self.database.get_user(user_id).await?.is_none() {
            return Err(LedgerError::NotFound(format!("user {}", user_id)));
        }
        if self.database.get_queue_entry(user_id).await?.is_some() {
            return Err(LedgerError::Validation("already waiting in the battle queue".to_string()));
        }
        if self.database.get_active_battle_for_user(user_id).await?.is_some() {
            return Err(LedgerError::Validation("already in an active battle".to_string()));
        }

        let stake = self.config.stake_for(currency);
        let available = self.ledger.balance_of(user_id, currency).await?;
        if available < stake {
            return Err(LedgerError::InsufficientFunds { required: stake, available });
        }
        Ok(())
    }

    /// Pair queue heads until no pair remains or the caller's entry has been consumed.
    async fn drain_pairs(
        &self,
        caller: Uuid,
        entry: QueueEntry,
        currency: Currency,
    ) -> LedgerResult<(EnterQueueOutcome, Vec<Battle>)> {
        let mut created = Vec::new();

        loop {
            let long = self.database.oldest_queue_entry(currency, Side::Long).await?;
            let short = self.database.oldest_queue_entry(currency, Side::Short).await?;
            let (Some(long), Some(short)) = (long, short) else {
                break;
            };

            match self.try_pair(&long, &short).await? {
                PairOutcome::Matched(battle) => {
                    let mine = battle.side_of(caller).is_some();
                    created.push(battle.clone());
                    if mine {
                        return Ok((EnterQueueOutcome::Matched { battle }, created));
                    }
                }
                PairOutcome::Evicted(users) => {
                    if users.contains(&caller) {
                        return Ok((EnterQueueOutcome::Evicted, created));
                    }
                }
                PairOutcome::Raced => continue,
            }
        }

        Ok((EnterQueueOutcome::Queued { entry }, created))
    }

    async fn try_pair(&self, long: &QueueEntry, short: &QueueEntry) -> LedgerResult<PairOutcome> {
        let currency = long.currency;
        let stake = long.stake_amount.min(short.stake_amount);
        let fee = fee_for(stake);
        let required = stake + fee;

        // Balances may have moved since the entries were queued
        let long_balance = self.ledger.balance_of(long.user_id, currency).await?;
        let short_balance = self.ledger.balance_of(short.user_id, currency).await?;
        if long_balance < required || short_balance < required {
            return self.evict(long, short, required).await;
        }

        let now = self.clock.now();
        let battle = Battle {
            id: Uuid::new_v4(),
            long_player: long.user_id,
            short_player: short.user_id,
            start_price: Decimal::ZERO,
            end_price: None,
            start_time: now,
            stake_amount: stake,
            currency,
            status: BattleStatus::Active,
            winner: None,
            resolved_at: None,
        };

        let mut entries = Vec::with_capacity(4);
        for player in [long.user_id, short.user_id] {
            let stake_entry = Transaction::new(player, TransactionType::Stake, stake, currency, TransactionStatus::Completed, now)
                .with_fee(fee)
                .with_battle(battle.id);
            let fee_entry = stake_entry.mirrored_fee();
            entries.push(stake_entry);
            entries.extend(fee_entry);
        }

        let record = MatchRecord {
            battle: battle.clone(),
            entries,
            guards: vec![
                FundsGuard { user_id: long.user_id, currency, required },
                FundsGuard { user_id: short.user_id, currency, required },
            ],
            dequeued: vec![long.user_id, short.user_id],
        };

        match self.database.record_match(&record).await {
            Ok(()) => {
                info!(
                    "⚔️ Battle {} created: {} (long) vs {} (short), stake {} {} + fee {}",
                    battle.id, long.user_id, short.user_id, stake, currency, fee
                );
                metrics::inc_battles_created(currency);
                Ok(PairOutcome::Matched(battle))
            }
            // A withdrawal landed between the balance read and the commit
            Err(StorageError::InsufficientFunds { .. }) => self.evict(long, short, required).await,
            Err(StorageError::QueueEntryMissing(user_id)) => {
                debug!("Queue entry for {} claimed elsewhere, re-reading queue", user_id);
                Ok(PairOutcome::Raced)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn evict(&self, long: &QueueEntry, short: &QueueEntry, required: Decimal) -> LedgerResult<PairOutcome> {
        let removed = self.database.remove_queue_entries(&[long.user_id, short.user_id]).await?;
        warn!(
            "Evicted queue pair {} (long) / {} (short): balance below {} {}",
            long.user_id, short.user_id, required, long.currency
        );
        metrics::inc_queue_evictions(long.currency, removed as u64);
        Ok(PairOutcome::Evicted([long.user_id, short.user_id]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fee_is_five_percent() {
        assert_eq!(fee_for(dec!(0.0015)), dec!(0.000075));
        assert_eq!(dec!(0.0015) + fee_for(dec!(0.0015)), dec!(0.001575));
        assert_eq!(fee_for(dec!(1)), dec!(0.05));
    }
}
