// Shared fixtures: in-memory storage, a manual clock and scripted oracle/chain clients
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use k256::ecdsa::SigningKey;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

use battle_service::chain_client::{ChainClient, ChainError};
use battle_service::clock::{Clock, ManualClock};
use battle_service::config::Config;
use battle_service::oracle::{OracleError, PriceOracle};
use battle_service::storage::{
    create_test_database, BattleResolution, DatabaseTrait, MatchRecord, WithdrawalSettlement,
};
use battle_service::users::{address_of, personal_message_hash};
use battle_service::{
    AppState, Battle, Currency, FundsGuard, PriceQuote, QueueEntry, Side, StorageError, Transaction,
    TransactionStatus, TransactionType, TransferFact, User,
};

pub const PLATFORM: &str = "0x00000000000000000000000000000000000000aa";
pub const ADMIN_TOKEN: &str = "test-admin-token";

pub fn wallet(n: u8) -> String {
    format!("0x{:040x}", n)
}

pub fn tx_hash(n: u8) -> String {
    format!("0x{:064x}", n)
}

/// A wallet with a known key, for signed logins.
pub struct TestWallet {
    key: SigningKey,
    pub address: String,
}

impl TestWallet {
    pub fn new(n: u8) -> Self {
        let mut secret = [0u8; 32];
        secret[31] = n;
        let key = SigningKey::from_slice(&secret).unwrap();
        let address = address_of(key.verifying_key());
        Self { key, address }
    }

    /// `personal_sign` over the message, as a 0x hex `r || s || v` string.
    pub fn sign(&self, message: &str) -> String {
        let (signature, recovery_id) = self.key.sign_prehash_recoverable(&personal_message_hash(message)).unwrap();
        let mut bytes = signature.to_bytes().to_vec();
        bytes.push(recovery_id.to_byte() + 27);
        format!("0x{}", hex::encode(bytes))
    }
}

pub struct MockPriceOracle {
    price: Mutex<Option<Decimal>>,
    calls: AtomicUsize,
}

impl MockPriceOracle {
    pub fn new(price: Decimal) -> Self {
        Self { price: Mutex::new(Some(price)), calls: AtomicUsize::new(0) }
    }

    pub fn set_price(&self, price: Decimal) {
        *self.price.lock().unwrap() = Some(price);
    }

    /// Every call fails until a price is set again.
    pub fn go_down(&self) {
        *self.price.lock().unwrap() = None;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PriceOracle for MockPriceOracle {
    async fn get_price(&self) -> Result<PriceQuote, OracleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match *self.price.lock().unwrap() {
            Some(price) => Ok(PriceQuote { price, timestamp: Utc::now(), source: "mock".to_string() }),
            None => Err(OracleError::Unavailable),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmMode {
    Confirmed,
    Reverted,
    TimedOut,
}

pub struct MockChainClient {
    transfers: Mutex<HashMap<String, TransferFact>>,
    sent: Mutex<Vec<(String, Decimal, Currency)>>,
    liquidity: Mutex<Decimal>,
    confirm_mode: Mutex<ConfirmMode>,
    lookup_fails: Mutex<bool>,
    lookups: AtomicUsize,
}

impl MockChainClient {
    pub fn new() -> Self {
        Self {
            transfers: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            liquidity: Mutex::new(dec!(1000)),
            confirm_mode: Mutex::new(ConfirmMode::Confirmed),
            lookup_fails: Mutex::new(false),
            lookups: AtomicUsize::new(0),
        }
    }

    pub fn add_transfer(&self, tx_hash: &str, from: &str, to: &str, amount: Decimal, confirmed: bool) {
        self.transfers.lock().unwrap().insert(
            tx_hash.to_lowercase(),
            TransferFact { from: from.to_string(), to: to.to_string(), amount, confirmed },
        );
    }

    pub fn set_liquidity(&self, amount: Decimal) {
        *self.liquidity.lock().unwrap() = amount;
    }

    pub fn set_confirm_mode(&self, mode: ConfirmMode) {
        *self.confirm_mode.lock().unwrap() = mode;
    }

    pub fn set_lookup_fails(&self, fails: bool) {
        *self.lookup_fails.lock().unwrap() = fails;
    }

    pub fn sent(&self) -> Vec<(String, Decimal, Currency)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn get_confirmed_transfer(
        &self,
        tx_hash: &str,
        _currency: Currency,
    ) -> Result<Option<TransferFact>, ChainError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if *self.lookup_fails.lock().unwrap() {
            return Err(ChainError::Rpc("node unreachable".to_string()));
        }
        Ok(self.transfers.lock().unwrap().get(tx_hash).cloned())
    }

    async fn send_transfer(&self, to: &str, amount: Decimal, currency: Currency) -> Result<String, ChainError> {
        let mut sent = self.sent.lock().unwrap();
        sent.push((to.to_string(), amount, currency));
        Ok(format!("0x{:064x}", 0xfeed_0000 + sent.len()))
    }

    async fn wait_for_confirmation(&self, tx_hash: &str, _timeout: Duration) -> Result<bool, ChainError> {
        match *self.confirm_mode.lock().unwrap() {
            ConfirmMode::Confirmed => Ok(true),
            ConfirmMode::Reverted => Ok(false),
            ConfirmMode::TimedOut => Err(ChainError::Timeout(tx_hash.to_string())),
        }
    }

    async fn platform_balance(&self, _currency: Currency) -> Result<Decimal, ChainError> {
        Ok(*self.liquidity.lock().unwrap())
    }
}

/// In-memory storage that can be told to fail specific writes.
pub struct FlakyDatabase {
    inner: Arc<dyn DatabaseTrait>,
    fail_anchoring: AtomicBool,
    fail_withdrawal_settlement: AtomicBool,
}

impl FlakyDatabase {
    pub fn new(inner: Arc<dyn DatabaseTrait>) -> Self {
        Self { inner, fail_anchoring: AtomicBool::new(false), fail_withdrawal_settlement: AtomicBool::new(false) }
    }

    pub fn fail_anchoring(&self, fail: bool) {
        self.fail_anchoring.store(fail, Ordering::SeqCst);
    }

    pub fn fail_withdrawal_settlement(&self, fail: bool) {
        self.fail_withdrawal_settlement.store(fail, Ordering::SeqCst);
    }

    fn outage() -> StorageError {
        StorageError::Backend(anyhow::anyhow!("connection reset"))
    }
}

#[async_trait]
impl DatabaseTrait for FlakyDatabase {
    async fn insert_user(&self, user: &User) -> Result<(), StorageError> {
        self.inner.insert_user(user).await
    }

    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>, StorageError> {
        self.inner.get_user(user_id).await
    }

    async fn get_user_by_wallet(&self, wallet_address: &str) -> Result<Option<User>, StorageError> {
        self.inner.get_user_by_wallet(wallet_address).await
    }

    async fn set_auth_nonce(&self, user_id: Uuid, nonce: &str) -> Result<(), StorageError> {
        self.inner.set_auth_nonce(user_id, nonce).await
    }

    async fn update_legacy_balance(&self, user_id: Uuid, balance: Decimal) -> Result<(), StorageError> {
        self.inner.update_legacy_balance(user_id, balance).await
    }

    async fn append_transactions(&self, entries: &[Transaction], guards: &[FundsGuard]) -> Result<(), StorageError> {
        self.inner.append_transactions(entries, guards).await
    }

    async fn get_transaction(&self, id: Uuid) -> Result<Option<Transaction>, StorageError> {
        self.inner.get_transaction(id).await
    }

    async fn find_transaction_by_hash(&self, tx_hash: &str) -> Result<Option<Transaction>, StorageError> {
        self.inner.find_transaction_by_hash(tx_hash).await
    }

    async fn get_transactions_for_user(&self, user_id: Uuid) -> Result<Vec<Transaction>, StorageError> {
        self.inner.get_transactions_for_user(user_id).await
    }

    async fn get_pending_withdrawals(&self) -> Result<Vec<Transaction>, StorageError> {
        self.inner.get_pending_withdrawals().await
    }

    async fn settle_withdrawal(
        &self,
        withdrawal_id: Uuid,
        settlement: &WithdrawalSettlement,
        now: DateTime<Utc>,
    ) -> Result<Option<Transaction>, StorageError> {
        if self.fail_withdrawal_settlement.load(Ordering::SeqCst) {
            return Err(Self::outage());
        }
        self.inner.settle_withdrawal(withdrawal_id, settlement, now).await
    }

    async fn insert_queue_entry(&self, entry: &QueueEntry) -> Result<QueueEntry, StorageError> {
        self.inner.insert_queue_entry(entry).await
    }

    async fn get_queue_entry(&self, user_id: Uuid) -> Result<Option<QueueEntry>, StorageError> {
        self.inner.get_queue_entry(user_id).await
    }

    async fn oldest_queue_entry(&self, currency: Currency, side: Side) -> Result<Option<QueueEntry>, StorageError> {
        self.inner.oldest_queue_entry(currency, side).await
    }

    async fn remove_queue_entries(&self, user_ids: &[Uuid]) -> Result<usize, StorageError> {
        self.inner.remove_queue_entries(user_ids).await
    }

    async fn record_match(&self, record: &MatchRecord) -> Result<(), StorageError> {
        self.inner.record_match(record).await
    }

    async fn get_battle(&self, battle_id: Uuid) -> Result<Option<Battle>, StorageError> {
        self.inner.get_battle(battle_id).await
    }

    async fn get_active_battle_for_user(&self, user_id: Uuid) -> Result<Option<Battle>, StorageError> {
        self.inner.get_active_battle_for_user(user_id).await
    }

    async fn get_latest_battle_for_user(&self, user_id: Uuid) -> Result<Option<Battle>, StorageError> {
        self.inner.get_latest_battle_for_user(user_id).await
    }

    async fn get_active_battles(&self) -> Result<Vec<Battle>, StorageError> {
        self.inner.get_active_battles().await
    }

    async fn anchor_start_price(&self, battle_id: Uuid, price: Decimal) -> Result<bool, StorageError> {
        if self.fail_anchoring.load(Ordering::SeqCst) {
            return Err(Self::outage());
        }
        self.inner.anchor_start_price(battle_id, price).await
    }

    async fn resolve_battle(&self, resolution: &BattleResolution) -> Result<bool, StorageError> {
        self.inner.resolve_battle(resolution).await
    }
}

pub struct Harness {
    pub state: AppState,
    pub database: Arc<dyn DatabaseTrait>,
    pub storage: Arc<FlakyDatabase>,
    pub oracle: Arc<MockPriceOracle>,
    pub chain: Arc<MockChainClient>,
    pub clock: Arc<ManualClock>,
    pub config: Arc<Config>,
}

impl Harness {
    pub async fn new() -> Self {
        let config = Arc::new(Config {
            platform_address: PLATFORM.to_string(),
            admin_token: Some(ADMIN_TOKEN.to_string()),
            ..Config::default()
        });
        let storage = Arc::new(FlakyDatabase::new(create_test_database().await.unwrap()));
        let database: Arc<dyn DatabaseTrait> = storage.clone();
        let oracle = Arc::new(MockPriceOracle::new(dec!(50000)));
        let chain = Arc::new(MockChainClient::new());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()));

        let state = AppState::build(
            config.clone(),
            database.clone(),
            oracle.clone(),
            chain.clone(),
            clock.clone() as Arc<dyn Clock>,
            None,
        );

        Self { state, database, storage, oracle, chain, clock, config }
    }

    /// Register a wallet through the login challenge.
    pub async fn user(&self, n: u8) -> User {
        let wallet = wallet(n);
        self.state.users.challenge(&wallet).await.unwrap();
        self.state.users.require_user(&wallet).await.unwrap()
    }

    /// Credit a completed deposit straight into the ledger.
    pub async fn fund(&self, user_id: Uuid, amount: Decimal, currency: Currency) -> Transaction {
        let deposit = Transaction::new(
            user_id,
            TransactionType::Deposit,
            amount,
            currency,
            TransactionStatus::Completed,
            self.clock.now(),
        );
        self.state.ledger.append(&[deposit.clone()], &[]).await.unwrap();
        deposit
    }

    pub async fn funded_user(&self, n: u8, amount: Decimal) -> User {
        let user = self.user(n).await;
        self.fund(user.id, amount, Currency::Eth).await;
        user
    }

    /// Register a signing wallet and open a session for it; returns the user and the bearer token.
    pub async fn login(&self, wallet: &TestWallet) -> (User, String) {
        let challenge = self.state.users.challenge(&wallet.address).await.unwrap();
        let session = self.state.users.verify(&wallet.address, &wallet.sign(&challenge.message)).await.unwrap();
        let user = self.state.users.require_user(&wallet.address).await.unwrap();
        (user, session.token)
    }

    pub async fn balance(&self, user_id: Uuid) -> Decimal {
        self.state.ledger.balance_of(user_id, Currency::Eth).await.unwrap()
    }
}
