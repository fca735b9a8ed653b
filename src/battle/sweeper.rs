// Periodic battle resolution task

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};

use super::BattleManager;

pub struct BattleSweeper {
    manager: Arc<BattleManager>,
    interval: Duration,
}

impl BattleSweeper {
    pub fn new(manager: Arc<BattleManager>, interval: Duration) -> Self {
        Self { manager, interval }
    }

    /// Sweep on every tick until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Battle sweeper started (every {:?})", self.interval);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.manager.sweep_once().await {
                        error!("Battle sweep failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Battle sweeper stopped");
    }
}
