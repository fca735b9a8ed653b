// Re-export main modules for the battle service library

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::broadcast;

pub mod api;
pub mod battle;
pub mod chain_client;
pub mod clock;
pub mod config;
pub mod deposit;
pub mod error;
pub mod ledger;
pub mod locks;
pub mod matching;
pub mod metrics;
pub mod oracle;
pub mod storage;
pub mod types;
pub mod users;
pub mod withdrawal;

pub use error::{LedgerError, LedgerResult, StorageError};
pub use types::*;

use crate::battle::BattleManager;
use crate::chain_client::ChainClient;
use crate::clock::Clock;
use crate::config::Config;
use crate::deposit::DepositVerifier;
use crate::ledger::Ledger;
use crate::matching::MatchingEngine;
use crate::oracle::PriceOracle;
use crate::storage::DatabaseTrait;
use crate::users::UserRegistry;
use crate::withdrawal::WithdrawalWorkflow;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub ledger: Ledger,
    pub users: Arc<UserRegistry>,
    pub matching: Arc<MatchingEngine>,
    pub battles: Arc<BattleManager>,
    pub deposits: Arc<DepositVerifier>,
    pub withdrawals: Arc<WithdrawalWorkflow>,
    pub clock: Arc<dyn Clock>,
    pub metrics_handle: Option<PrometheusHandle>,
    pub ws_broadcaster: broadcast::Sender<WebSocketMessage>,
}

impl AppState {
    /// Wire every service over one storage backend and one event channel.
    pub fn build(
        config: Arc<Config>,
        database: Arc<dyn DatabaseTrait>,
        oracle: Arc<dyn PriceOracle>,
        chain: Arc<dyn ChainClient>,
        clock: Arc<dyn Clock>,
        metrics_handle: Option<PrometheusHandle>,
    ) -> Self {
        let (ws_tx, _ws_rx) = broadcast::channel::<WebSocketMessage>(1000);
        let ledger = Ledger::new(database.clone());

        let battles = Arc::new(BattleManager::new(
            ledger.clone(),
            oracle,
            clock.clone(),
            config.battle_duration(),
            ws_tx.clone(),
        ));
        let matching = Arc::new(MatchingEngine::new(
            ledger.clone(),
            battles.anchor().clone(),
            clock.clone(),
            config.clone(),
            ws_tx.clone(),
        ));
        let deposits = Arc::new(DepositVerifier::new(
            ledger.clone(),
            chain.clone(),
            clock.clone(),
            &config.platform_address,
            config.deposit_max_pending_per_user,
            config.deposit_max_pending_total,
        ));
        let withdrawals = Arc::new(WithdrawalWorkflow::new(
            ledger.clone(),
            chain,
            clock.clone(),
            config.withdrawal_confirm_timeout(),
        ));
        let users = Arc::new(UserRegistry::new(
            database,
            clock.clone(),
            config.session_secret.as_deref(),
            config.session_ttl(),
        ));

        Self {
            config,
            ledger,
            users,
            matching,
            battles,
            deposits,
            withdrawals,
            clock,
            metrics_handle,
            ws_broadcaster: ws_tx,
        }
    }

    /// Drop idle entries from the per-key lock tables.
    pub fn prune_locks(&self) -> usize {
        self.matching.locks().prune() + self.deposits.locks().prune() + self.withdrawals.locks().prune()
    }
}
