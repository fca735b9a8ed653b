// Battle lifecycle: start price anchoring, resolution and the expiry sweep

pub mod sweeper;

use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{LedgerError, LedgerResult};
use crate::ledger::Ledger;
use crate::metrics;
use crate::oracle::PriceOracle;
use crate::storage::{BattleResolution, DatabaseTrait};
use crate::types::{
    Battle, BattleStatus, CurrentBattleView, Side, Transaction, TransactionStatus, TransactionType,
    WebSocketMessage,
};

pub use sweeper::BattleSweeper;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ResolutionOutcome {
    Resolved { battle: Battle },
    /// Someone else resolved it first. Benign.
    AlreadyResolved { battle: Battle },
    NotYetEligible { battle_id: Uuid, seconds_remaining: i64, reason: String },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub resolved: usize,
    pub already_resolved: usize,
    pub deferred: usize,
    pub failed: usize,
}

/// Long wins ties.
pub fn winning_side(start_price: rust_decimal::Decimal, end_price: rust_decimal::Decimal) -> Side {
    if end_price < start_price {
        Side::Short
    } else {
        Side::Long
    }
}

/// Sets a battle's start price exactly once.
#[derive(Clone)]
pub struct PriceAnchor {
    database: Arc<dyn DatabaseTrait>,
    oracle: Arc<dyn PriceOracle>,
}

impl PriceAnchor {
    pub fn new(database: Arc<dyn DatabaseTrait>, oracle: Arc<dyn PriceOracle>) -> Self {
        Self { database, oracle }
    }

    /// Returns the battle with its start price anchored when possible.
    /// An oracle failure leaves the battle unanchored for a later reader to retry.
    pub async fn ensure_anchored(&self, battle: Battle) -> LedgerResult<Battle> {
        if battle.is_anchored() {
            return Ok(battle);
        }

        let quote = match self.oracle.get_price().await {
            Ok(quote) => quote,
            Err(e) => {
                warn!("Could not anchor battle {}: {}", battle.id, e);
                return Ok(battle);
            }
        };

        if self.database.anchor_start_price(battle.id, quote.price).await? {
            info!("⚓ Battle {} anchored at {} ({})", battle.id, quote.price, quote.source);
            return Ok(Battle { start_price: quote.price, ..battle });
        }

        // Lost the compare-and-set; the stored price is authoritative
        debug!("Battle {} was anchored concurrently", battle.id);
        self.database
            .get_battle(battle.id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("battle {}", battle.id)))
    }
}

pub struct BattleManager {
    database: Arc<dyn DatabaseTrait>,
    ledger: Ledger,
    oracle: Arc<dyn PriceOracle>,
    anchor: PriceAnchor,
    clock: Arc<dyn Clock>,
    duration: Duration,
    ws_broadcaster: broadcast::Sender<WebSocketMessage>,
}

impl BattleManager {
    pub fn new(
        ledger: Ledger,
        oracle: Arc<dyn PriceOracle>,
        clock: Arc<dyn Clock>,
        duration: Duration,
        ws_broadcaster: broadcast::Sender<WebSocketMessage>,
    ) -> Self {
        let database = ledger.database().clone();
        Self {
            anchor: PriceAnchor::new(database.clone(), oracle.clone()),
            database,
            ledger,
            oracle,
            clock,
            duration,
            ws_broadcaster,
        }
    }

    pub fn anchor(&self) -> &PriceAnchor {
        &self.anchor
    }

    fn seconds_remaining(&self, battle: &Battle) -> i64 {
        (battle.expires_at(self.duration) - self.clock.now()).num_seconds().max(0)
    }

    /// The user's active battle (anchored lazily), else their most recent one, plus any queue entry.
    pub async fn get_current_battle(&self, user_id: Uuid) -> LedgerResult<CurrentBattleView> {
        let queued = self.database.get_queue_entry(user_id).await?;

        if let Some(active) = self.database.get_active_battle_for_user(user_id).await? {
            let battle = self.anchor.ensure_anchored(active).await?;
            let seconds_remaining = Some(self.seconds_remaining(&battle));
            return Ok(CurrentBattleView { battle: Some(battle), queued, seconds_remaining });
        }

        let battle = self.database.get_latest_battle_for_user(user_id).await?;
        Ok(CurrentBattleView { battle, queued, seconds_remaining: None })
    }

    /// Resolve an expired battle. Safe to race: only one caller writes the outcome.
    /// `requester` is the acting user for manual triggers, `None` for the sweep.
    pub async fn resolve_battle(&self, battle_id: Uuid, requester: Option<Uuid>) -> LedgerResult<ResolutionOutcome> {
        let battle = self
            .database
            .get_battle(battle_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("battle {}", battle_id)))?;

        if let Some(user_id) = requester {
            if battle.side_of(user_id).is_none() {
                warn!(target: "security", "User {} tried to resolve battle {} they are not part of", user_id, battle_id);
                return Err(LedgerError::NotAuthorized("only battle participants can resolve it".to_string()));
            }
        }

        if battle.status != BattleStatus::Active {
            return Ok(ResolutionOutcome::AlreadyResolved { battle });
        }

        let seconds_remaining = self.seconds_remaining(&battle);
        if self.clock.now() < battle.expires_at(self.duration) {
            return Ok(ResolutionOutcome::NotYetEligible {
                battle_id,
                seconds_remaining,
                reason: "battle window still open".to_string(),
            });
        }

        if !battle.is_anchored() {
            // Never resolve against a fabricated start price
            let battle = self.anchor.ensure_anchored(battle).await?;
            if !battle.is_anchored() {
                metrics::inc_oracle_failures();
            }
            return Ok(ResolutionOutcome::NotYetEligible {
                battle_id,
                seconds_remaining: 0,
                reason: "start price not anchored yet".to_string(),
            });
        }

        let quote = self.oracle.get_price().await.map_err(|e| {
            metrics::inc_oracle_failures();
            LedgerError::from(e)
        })?;

        let winner = winning_side(battle.start_price, quote.price);
        let now = self.clock.now();
        let payout = Transaction::new(
            battle.player(winner),
            TransactionType::Win,
            battle.payout(),
            battle.currency,
            TransactionStatus::Completed,
            now,
        )
        .with_battle(battle.id);

        let resolution = BattleResolution {
            battle_id,
            winner,
            end_price: quote.price,
            resolved_at: now,
            payout,
        };

        if !self.database.resolve_battle(&resolution).await? {
            debug!("Battle {} already resolved by another trigger", battle_id);
            let battle = self
                .database
                .get_battle(battle_id)
                .await?
                .ok_or_else(|| LedgerError::NotFound(format!("battle {}", battle_id)))?;
            return Ok(ResolutionOutcome::AlreadyResolved { battle });
        }

        let resolved = Battle {
            status: BattleStatus::Resolved,
            winner: Some(winner),
            end_price: Some(quote.price),
            resolved_at: Some(now),
            ..battle
        };

        info!(
            "🏁 Battle {} resolved: {} -> {} ({}), {} wins {} {}",
            battle_id,
            resolved.start_price,
            quote.price,
            quote.source,
            winner.as_str(),
            resolved.payout(),
            resolved.currency
        );
        metrics::inc_battles_resolved(winner.as_str());
        self.ledger.refresh_legacy_balance(resolved.player(winner)).await;
        let _ = self.ws_broadcaster.send(WebSocketMessage::BattleResolved { battle: resolved.clone() });

        Ok(ResolutionOutcome::Resolved { battle: resolved })
    }

    /// One pass over active battles past expiry.
    pub async fn sweep_once(&self) -> LedgerResult<SweepReport> {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        for battle in self.database.get_active_battles().await? {
            if battle.expires_at(self.duration) > now {
                continue;
            }
            match self.resolve_battle(battle.id, None).await {
                Ok(ResolutionOutcome::Resolved { .. }) => report.resolved += 1,
                Ok(ResolutionOutcome::AlreadyResolved { .. }) => report.already_resolved += 1,
                Ok(ResolutionOutcome::NotYetEligible { .. }) => report.deferred += 1,
                Err(e) => {
                    warn!("Sweep could not resolve battle {}: {}", battle.id, e);
                    report.failed += 1;
                }
            }
        }

        if report != SweepReport::default() {
            info!("Battle sweep: {:?}", report);
        }
        Ok(report)
    }
}
