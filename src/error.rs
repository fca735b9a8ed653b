//! Error taxonomy shared by the ledger, matching, battle, deposit and withdrawal services.

use axum::http::StatusCode;
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use crate::types::Currency;

/// Failures raised by a storage backend.
#[derive(Error, Debug)]
pub enum StorageError {
    /// A transaction with this hash already exists (owned by `owner`).
    #[error("transaction hash {tx_hash} already recorded")]
    DuplicateTxHash { tx_hash: String, owner: Uuid },

    /// A funds guard failed at commit time.
    #[error("insufficient {currency} funds for user {user_id}: need {required}, have {available}")]
    InsufficientFunds {
        user_id: Uuid,
        currency: Currency,
        required: Decimal,
        available: Decimal,
    },

    #[error("user {0} already has a queue entry")]
    AlreadyQueued(Uuid),

    /// A queue row was claimed by a concurrent match before this one committed.
    #[error("queue entry for user {0} is gone")]
    QueueEntryMissing(Uuid),

    #[error("wallet {0} is already registered")]
    DuplicateWallet(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("storage backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Service-level error taxonomy.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Bad input shape or range, rejected before any side effect.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("insufficient funds: need {required}, have {available}")]
    InsufficientFunds { required: Decimal, available: Decimal },

    /// Reuse of a transaction reference owned by someone else.
    #[error("transaction reference {0} was already used")]
    DuplicateReference(String),

    /// Try again later (battle not expired, transfer not confirmed).
    #[error("not yet eligible: {0}")]
    NotYetEligible(String),

    #[error("already processed: {0}")]
    AlreadyProcessed(String),

    #[error("external service unavailable: {0}")]
    ExternalUnavailable(String),

    /// Missing, malformed or expired credentials.
    #[error("not authenticated: {0}")]
    Unauthenticated(String),

    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// A payout left the platform wallet but its withdrawal could not be marked completed.
    #[error("payout {tx_hash} for withdrawal {withdrawal_id} was broadcast but not recorded")]
    PayoutUnrecorded { withdrawal_id: Uuid, tx_hash: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Storage(StorageError),
}

impl From<StorageError> for LedgerError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::DuplicateTxHash { tx_hash, .. } => LedgerError::DuplicateReference(tx_hash),
            StorageError::InsufficientFunds { required, available, .. } => {
                LedgerError::InsufficientFunds { required, available }
            }
            StorageError::AlreadyQueued(_) => {
                LedgerError::Validation("already waiting in the battle queue".to_string())
            }
            StorageError::QueueEntryMissing(user_id) => {
                LedgerError::AlreadyProcessed(format!("queue entry for {} was already matched", user_id))
            }
            StorageError::DuplicateWallet(wallet) => {
                LedgerError::Validation(format!("wallet {} is already registered", wallet))
            }
            StorageError::NotFound(what) => LedgerError::NotFound(what),
            other => LedgerError::Storage(other),
        }
    }
}

impl LedgerError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            LedgerError::Validation(_) => StatusCode::BAD_REQUEST,
            LedgerError::InsufficientFunds { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            LedgerError::DuplicateReference(_) => StatusCode::CONFLICT,
            LedgerError::NotYetEligible(_) => StatusCode::ACCEPTED,
            LedgerError::AlreadyProcessed(_) => StatusCode::OK,
            LedgerError::ExternalUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            LedgerError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            LedgerError::NotAuthorized(_) => StatusCode::FORBIDDEN,
            LedgerError::PayoutUnrecorded { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
            LedgerError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to return to end users. Backend and chain details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            LedgerError::ExternalUnavailable(_) => {
                "Upstream service unavailable, please try again shortly".to_string()
            }
            LedgerError::Storage(_) => "Internal error".to_string(),
            other => other.to_string(),
        }
    }

    /// Short machine-readable kind for API bodies and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerError::Validation(_) => "validation",
            LedgerError::InsufficientFunds { .. } => "insufficient_funds",
            LedgerError::DuplicateReference(_) => "duplicate_reference",
            LedgerError::NotYetEligible(_) => "not_yet_eligible",
            LedgerError::AlreadyProcessed(_) => "already_processed",
            LedgerError::ExternalUnavailable(_) => "external_unavailable",
            LedgerError::Unauthenticated(_) => "unauthenticated",
            LedgerError::NotAuthorized(_) => "not_authorized",
            LedgerError::PayoutUnrecorded { .. } => "payout_unrecorded",
            LedgerError::NotFound(_) => "not_found",
            LedgerError::Storage(_) => "storage",
        }
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

impl From<crate::oracle::OracleError> for LedgerError {
    fn from(err: crate::oracle::OracleError) -> Self {
        LedgerError::ExternalUnavailable(format!("price oracle: {}", err))
    }
}

impl From<crate::chain_client::ChainError> for LedgerError {
    fn from(err: crate::chain_client::ChainError) -> Self {
        LedgerError::ExternalUnavailable(format!("chain client: {}", err))
    }
}
