// Background retry of deposit submissions the chain had not confirmed yet

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use super::DepositVerifier;
use crate::clock::Clock;
use crate::error::LedgerError;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    pub credited: usize,
    pub still_pending: usize,
    pub dropped: usize,
}

pub struct DepositScanner {
    verifier: Arc<DepositVerifier>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    max_pending_age: chrono::Duration,
}

impl DepositScanner {
    pub fn new(
        verifier: Arc<DepositVerifier>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        max_pending_age: chrono::Duration,
    ) -> Self {
        Self { verifier, clock, interval, max_pending_age }
    }

    /// Retry every remembered submission once.
    pub async fn sweep_once(&self) -> ScanReport {
        let mut report = ScanReport::default();
        let now = self.clock.now();

        for (tx_hash, pending) in self.verifier.pending_submissions() {
            if now - pending.first_seen > self.max_pending_age {
                info!("Dropping deposit {} for user {}: unconfirmed since {}", tx_hash, pending.user_id, pending.first_seen);
                self.verifier.forget_pending(&tx_hash);
                report.dropped += 1;
                continue;
            }

            match self
                .verifier
                .check_transaction_for_user(pending.user_id, &tx_hash, pending.currency)
                .await
            {
                Ok(credit) if credit.newly_credited => report.credited += 1,
                Ok(_) => report.dropped += 1,
                Err(LedgerError::NotYetEligible(_)) | Err(LedgerError::ExternalUnavailable(_)) => {
                    report.still_pending += 1
                }
                Err(e) => {
                    debug!("Deposit {} will not be retried: {}", tx_hash, e);
                    self.verifier.forget_pending(&tx_hash);
                    report.dropped += 1;
                }
            }
        }

        if report != ScanReport::default() {
            info!("Deposit scan: {:?}", report);
        }
        report
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Deposit scanner started (every {:?})", self.interval);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.sweep_once().await;
                    if report.still_pending > 0 {
                        debug!("{} deposits still awaiting confirmation", report.still_pending);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Deposit scanner stopped");
    }
}
