// Core types for the battle ledger service

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Currency {
    #[serde(rename = "ETH", alias = "eth")]
    Eth,
    #[serde(rename = "USDT", alias = "usdt")]
    Usdt,
}

impl Currency {
    pub const ALL: [Currency; 2] = [Currency::Eth, Currency::Usdt];

    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Eth => "ETH",
            Currency::Usdt => "USDT",
        }
    }

    /// On-chain decimal places (wei for ETH, 6 for the USDT token)
    pub fn decimals(&self) -> u32 {
        match self {
            Currency::Eth => 18,
            Currency::Usdt => 6,
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Currency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ETH" => Ok(Currency::Eth),
            "USDT" => Ok(Currency::Usdt),
            other => Err(format!("unsupported currency: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Deposit,
    Withdrawal,
    Stake,
    Win,
    Fee,
    Commission,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Deposit => "deposit",
            TransactionType::Withdrawal => "withdrawal",
            TransactionType::Stake => "stake",
            TransactionType::Win => "win",
            TransactionType::Fee => "fee",
            TransactionType::Commission => "commission",
        }
    }
}

impl FromStr for TransactionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deposit" => Ok(TransactionType::Deposit),
            "withdrawal" => Ok(TransactionType::Withdrawal),
            "stake" => Ok(TransactionType::Stake),
            "win" => Ok(TransactionType::Win),
            "fee" => Ok(TransactionType::Fee),
            "commission" => Ok(TransactionType::Commission),
            other => Err(format!("unknown transaction type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Canceled,
    Rejected,
    Refunded,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Canceled => "canceled",
            TransactionStatus::Rejected => "rejected",
            TransactionStatus::Refunded => "refunded",
        }
    }
}

impl FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TransactionStatus::Pending),
            "completed" => Ok(TransactionStatus::Completed),
            "failed" => Ok(TransactionStatus::Failed),
            "canceled" => Ok(TransactionStatus::Canceled),
            "rejected" => Ok(TransactionStatus::Rejected),
            "refunded" => Ok(TransactionStatus::Refunded),
            other => Err(format!("unknown transaction status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "long" => Ok(Side::Long),
            "short" => Ok(Side::Short),
            other => Err(format!("unknown side: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BattleStatus {
    Active,
    Resolved,
    // Reserved for eviction-safe cancellation; no flow produces it yet
    Cancelled,
}

impl BattleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BattleStatus::Active => "active",
            BattleStatus::Resolved => "resolved",
            BattleStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for BattleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(BattleStatus::Active),
            "resolved" => Ok(BattleStatus::Resolved),
            "cancelled" => Ok(BattleStatus::Cancelled),
            other => Err(format!("unknown battle status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub wallet_address: String,   // lowercased 0x address
    /// Deprecated cache of the ETH balance kept for older readers.
    /// Written after ledger mutations, never read for decisions.
    pub legacy_balance: Decimal,
    #[serde(skip_serializing)]
    pub auth_nonce: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Ledger entry. Only `status` (and `tx_hash` on withdrawal completion) ever changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub tx_type: TransactionType,
    pub amount: Decimal,
    pub currency: Currency,
    pub status: TransactionStatus,
    pub tx_hash: Option<String>,
    pub fee_amount: Option<Decimal>,
    pub related_battle_id: Option<Uuid>,
    pub related_transaction_id: Option<Uuid>,
    pub destination_address: Option<String>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    pub fn new(
        user_id: Uuid,
        tx_type: TransactionType,
        amount: Decimal,
        currency: Currency,
        status: TransactionStatus,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            tx_type,
            amount,
            currency,
            status,
            tx_hash: None,
            fee_amount: None,
            related_battle_id: None,
            related_transaction_id: None,
            destination_address: None,
            note: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_fee(mut self, fee: Decimal) -> Self {
        self.fee_amount = Some(fee);
        self
    }

    pub fn with_tx_hash(mut self, tx_hash: impl Into<String>) -> Self {
        self.tx_hash = Some(tx_hash.into());
        self
    }

    pub fn with_battle(mut self, battle_id: Uuid) -> Self {
        self.related_battle_id = Some(battle_id);
        self
    }

    pub fn with_related(mut self, transaction_id: Uuid) -> Self {
        self.related_transaction_id = Some(transaction_id);
        self
    }

    pub fn with_destination(mut self, address: impl Into<String>) -> Self {
        self.destination_address = Some(address.into());
        self
    }

    /// Fee entry mirroring this transaction's `fee_amount`
    pub fn mirrored_fee(&self) -> Option<Transaction> {
        let fee = self.fee_amount?;
        let mut entry = Transaction::new(
            self.user_id,
            TransactionType::Fee,
            fee,
            self.currency,
            TransactionStatus::Completed,
            self.created_at,
        )
        .with_related(self.id);
        entry.related_battle_id = self.related_battle_id;
        Some(entry)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueEntry {
    pub user_id: Uuid,
    pub side: Side,
    pub stake_amount: Decimal,
    pub currency: Currency,
    pub joined_at: DateTime<Utc>,
    pub sequence: i64,          // insertion order, FIFO tie-break
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Battle {
    pub id: Uuid,
    pub long_player: Uuid,
    pub short_player: Uuid,
    pub start_price: Decimal,   // zero until anchored
    pub end_price: Option<Decimal>,
    pub start_time: DateTime<Utc>,
    pub stake_amount: Decimal,
    pub currency: Currency,
    pub status: BattleStatus,
    pub winner: Option<Side>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Battle {
    pub fn is_anchored(&self) -> bool {
        !self.start_price.is_zero()
    }

    pub fn player(&self, side: Side) -> Uuid {
        match side {
            Side::Long => self.long_player,
            Side::Short => self.short_player,
        }
    }

    pub fn side_of(&self, user_id: Uuid) -> Option<Side> {
        if self.long_player == user_id {
            Some(Side::Long)
        } else if self.short_player == user_id {
            Some(Side::Short)
        } else {
            None
        }
    }

    pub fn winner_id(&self) -> Option<Uuid> {
        self.winner.map(|side| self.player(side))
    }

    pub fn expires_at(&self, duration: Duration) -> DateTime<Utc> {
        self.start_time + duration
    }

    pub fn payout(&self) -> Decimal {
        self.stake_amount * Decimal::TWO
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceQuote {
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
    pub source: String,
}

/// What the chain reports about a transfer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferFact {
    pub from: String,
    pub to: String,
    pub amount: Decimal,
    pub confirmed: bool,
}

/// Requires `user_id`'s derived balance in `currency` to cover `required` at commit time
#[derive(Debug, Clone, PartialEq)]
pub struct FundsGuard {
    pub user_id: Uuid,
    pub currency: Currency,
    pub required: Decimal,
}

// API Request/Response types
#[derive(Debug, Deserialize)]
pub struct ChallengeRequest {
    pub wallet_address: String,
}

#[derive(Debug, Serialize)]
pub struct ChallengeResponse {
    pub user_id: Uuid,
    pub wallet_address: String,
    pub message: String,
}

/// Proof of wallet ownership: the challenge message signed with `personal_sign`.
#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub wallet_address: String,
    pub signature: String,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub token: String,
    pub user_id: Uuid,
    pub wallet_address: String,
    pub expires_at: DateTime<Utc>,
}

// The acting user of the requests below comes from the session token
#[derive(Debug, Deserialize)]
pub struct EnterQueueRequest {
    pub side: Side,
    pub currency: Currency,
}

#[derive(Debug, Deserialize)]
pub struct CheckDepositRequest {
    pub tx_hash: String,
    pub currency: Currency,
}

#[derive(Debug, Deserialize)]
pub struct WithdrawalRequest {
    pub amount: Decimal,
    pub currency: Currency,
    pub destination_address: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct RejectWithdrawalRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BalanceView {
    pub wallet_address: String,
    pub balances: Vec<CurrencyBalance>,
}

#[derive(Debug, Serialize)]
pub struct CurrencyBalance {
    pub currency: Currency,
    pub balance: Decimal,
}

#[derive(Debug, Serialize)]
pub struct CurrentBattleView {
    pub battle: Option<Battle>,
    pub queued: Option<QueueEntry>,
    pub seconds_remaining: Option<i64>,
}

// WebSocket message types. The feed is public, so it only carries battle events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum WebSocketMessage {
    BattleCreated {
        battle: Battle,
    },
    BattleResolved {
        battle: Battle,
    },
}
