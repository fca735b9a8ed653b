// PostgreSQL implementation without compile-time query verification
// Same contract as the in-memory Database; multi-row writes run in one SQL transaction

use std::str::FromStr;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{postgres::PgPoolOptions, PgConnection, PgPool, Row};
use tracing::{debug, info};
use uuid::Uuid;

use super::{BattleResolution, DatabaseTrait, MatchRecord, WithdrawalSettlement};
use crate::error::StorageError;
use crate::ledger::balance::derive_balance;
use crate::types::{
    Battle, BattleStatus, Currency, FundsGuard, QueueEntry, Side, Transaction, TransactionStatus,
    TransactionType, User,
};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id UUID PRIMARY KEY,
        wallet_address TEXT NOT NULL UNIQUE,
        legacy_balance NUMERIC NOT NULL DEFAULT 0,
        auth_nonce TEXT,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS transactions (
        seq BIGSERIAL,
        id UUID PRIMARY KEY,
        user_id UUID NOT NULL,
        tx_type TEXT NOT NULL,
        amount NUMERIC NOT NULL,
        currency TEXT NOT NULL,
        status TEXT NOT NULL,
        tx_hash TEXT UNIQUE,
        fee_amount NUMERIC,
        related_battle_id UUID,
        related_transaction_id UUID,
        destination_address TEXT,
        note TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_transactions_user ON transactions (user_id, seq)",
    "CREATE INDEX IF NOT EXISTS idx_transactions_pending ON transactions (tx_type, status)",
    r#"
    CREATE TABLE IF NOT EXISTS queue_entries (
        user_id UUID PRIMARY KEY,
        side TEXT NOT NULL,
        stake_amount NUMERIC NOT NULL,
        currency TEXT NOT NULL,
        joined_at TIMESTAMPTZ NOT NULL,
        seq BIGSERIAL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS battles (
        id UUID PRIMARY KEY,
        long_player UUID NOT NULL,
        short_player UUID NOT NULL,
        start_price NUMERIC NOT NULL,
        end_price NUMERIC,
        start_time TIMESTAMPTZ NOT NULL,
        stake_amount NUMERIC NOT NULL,
        currency TEXT NOT NULL,
        status TEXT NOT NULL,
        winner TEXT,
        resolved_at TIMESTAMPTZ
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_battles_status ON battles (status)",
];

pub struct SimplePostgresDatabase {
    pool: PgPool,
}

impl SimplePostgresDatabase {
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        info!("🐘 Connecting to PostgreSQL database...");

        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .idle_timeout(std::time::Duration::from_secs(300))
            .max_lifetime(std::time::Duration::from_secs(1800))
            .connect(database_url)
            .await
            .map_err(|e| anyhow!("Failed to connect to database: {}", e))?;

        // Test the connection
        sqlx::query("SELECT 1 as test")
            .fetch_one(&pool)
            .await
            .map_err(|e| anyhow!("Database connection test failed: {}", e))?;

        let db = Self { pool };
        db.ensure_schema().await?;

        info!("✅ PostgreSQL database connected successfully");
        Ok(db)
    }

    pub async fn new_test(database_url: &str) -> anyhow::Result<Self> {
        Self::new(database_url).await
    }

    async fn ensure_schema(&self) -> anyhow::Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| anyhow!("Schema setup failed: {}", e))?;
        }
        Ok(())
    }

    // ================================
    // HELPERS (shared by pool and transaction paths)
    // ================================

    async fn insert_transaction(conn: &mut PgConnection, entry: &Transaction) -> Result<(), StorageError> {
        let query = r#"
            INSERT INTO transactions (
                id, user_id, tx_type, amount, currency, status, tx_hash, fee_amount,
                related_battle_id, related_transaction_id, destination_address, note,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        "#;

        let result = sqlx::query(query)
            .bind(entry.id)
            .bind(entry.user_id)
            .bind(entry.tx_type.as_str())
            .bind(entry.amount)
            .bind(entry.currency.as_str())
            .bind(entry.status.as_str())
            .bind(&entry.tx_hash)
            .bind(entry.fee_amount)
            .bind(entry.related_battle_id)
            .bind(entry.related_transaction_id)
            .bind(&entry.destination_address)
            .bind(&entry.note)
            .bind(entry.created_at)
            .bind(entry.updated_at)
            .execute(conn)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(StorageError::DuplicateTxHash {
                tx_hash: entry.tx_hash.clone().unwrap_or_default(),
                owner: entry.user_id,
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn check_hashes(conn: &mut PgConnection, entries: &[Transaction]) -> Result<(), StorageError> {
        let hashes: Vec<String> = entries.iter().filter_map(|t| t.tx_hash.clone()).collect();
        if hashes.is_empty() {
            return Ok(());
        }

        let existing = sqlx::query("SELECT tx_hash, user_id FROM transactions WHERE tx_hash = ANY($1) LIMIT 1")
            .bind(&hashes)
            .fetch_optional(conn)
            .await?;

        match existing {
            Some(row) => Err(StorageError::DuplicateTxHash {
                tx_hash: row.try_get("tx_hash")?,
                owner: row.try_get("user_id")?,
            }),
            None => Ok(()),
        }
    }

    // Locks the guarded users' rows, then folds their entries with the same balance formula
    async fn check_guards(conn: &mut PgConnection, guards: &[FundsGuard]) -> Result<(), StorageError> {
        if guards.is_empty() {
            return Ok(());
        }

        let mut user_ids: Vec<Uuid> = guards.iter().map(|g| g.user_id).collect();
        user_ids.sort();
        user_ids.dedup();
        sqlx::query("SELECT id FROM users WHERE id = ANY($1) ORDER BY id FOR UPDATE")
            .bind(&user_ids)
            .fetch_all(&mut *conn)
            .await?;

        for guard in guards {
            let rows = sqlx::query("SELECT * FROM transactions WHERE user_id = $1 AND currency = $2")
                .bind(guard.user_id)
                .bind(guard.currency.as_str())
                .fetch_all(&mut *conn)
                .await?;
            let entries = rows.into_iter().map(row_to_transaction).collect::<Result<Vec<_>, _>>()?;
            let available = derive_balance(&entries, guard.user_id, guard.currency);
            if available < guard.required {
                return Err(StorageError::InsufficientFunds {
                    user_id: guard.user_id,
                    currency: guard.currency,
                    required: guard.required,
                    available,
                });
            }
        }
        Ok(())
    }

    async fn battle_exists(&self, battle_id: Uuid) -> Result<bool, StorageError> {
        let row = sqlx::query("SELECT 1 AS present FROM battles WHERE id = $1")
            .bind(battle_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn fetch_battles(&self, query: &str, user_id: Uuid) -> Result<Option<Battle>, StorageError> {
        let row = sqlx::query(query).bind(user_id).fetch_optional(&self.pool).await?;
        row.map(row_to_battle).transpose()
    }
}

#[async_trait::async_trait]
impl DatabaseTrait for SimplePostgresDatabase {
    // ================================
    // USER OPERATIONS
    // ================================

    async fn insert_user(&self, user: &User) -> Result<(), StorageError> {
        let result = sqlx::query(
            "INSERT INTO users (id, wallet_address, legacy_balance, auth_nonce, created_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(user.id)
        .bind(&user.wallet_address)
        .bind(user.legacy_balance)
        .bind(&user.auth_nonce)
        .bind(user.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                info!("📝 Inserted user {} ({})", user.id, user.wallet_address);
                Ok(())
            }
            Err(e) if is_unique_violation(&e) => Err(StorageError::DuplicateWallet(user.wallet_address.clone())),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>, StorageError> {
        let row = sqlx::query("SELECT * FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_user).transpose()
    }

    async fn get_user_by_wallet(&self, wallet_address: &str) -> Result<Option<User>, StorageError> {
        let row = sqlx::query("SELECT * FROM users WHERE wallet_address = $1")
            .bind(wallet_address)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_user).transpose()
    }

    async fn set_auth_nonce(&self, user_id: Uuid, nonce: &str) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE users SET auth_nonce = $1 WHERE id = $2")
            .bind(nonce)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("user {}", user_id)));
        }
        Ok(())
    }

    async fn update_legacy_balance(&self, user_id: Uuid, balance: Decimal) -> Result<(), StorageError> {
        sqlx::query("UPDATE users SET legacy_balance = $1 WHERE id = $2")
            .bind(balance)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ================================
    // LEDGER OPERATIONS
    // ================================

    async fn append_transactions(&self, entries: &[Transaction], guards: &[FundsGuard]) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;

        Self::check_guards(&mut *tx, guards).await?;
        Self::check_hashes(&mut *tx, entries).await?;
        for entry in entries {
            Self::insert_transaction(&mut *tx, entry).await?;
        }

        tx.commit().await?;
        debug!("📝 Appended {} ledger entries", entries.len());
        Ok(())
    }

    async fn get_transaction(&self, id: Uuid) -> Result<Option<Transaction>, StorageError> {
        let row = sqlx::query("SELECT * FROM transactions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_transaction).transpose()
    }

    async fn find_transaction_by_hash(&self, tx_hash: &str) -> Result<Option<Transaction>, StorageError> {
        let row = sqlx::query("SELECT * FROM transactions WHERE tx_hash = $1")
            .bind(tx_hash)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_transaction).transpose()
    }

    async fn get_transactions_for_user(&self, user_id: Uuid) -> Result<Vec<Transaction>, StorageError> {
        let rows = sqlx::query("SELECT * FROM transactions WHERE user_id = $1 ORDER BY seq DESC")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_transaction).collect()
    }

    // ================================
    // WITHDRAWAL OPERATIONS
    // ================================

    async fn get_pending_withdrawals(&self) -> Result<Vec<Transaction>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM transactions WHERE tx_type = 'withdrawal' AND status = 'pending' ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_transaction).collect()
    }

    async fn settle_withdrawal(
        &self,
        withdrawal_id: Uuid,
        settlement: &WithdrawalSettlement,
        now: DateTime<Utc>,
    ) -> Result<Option<Transaction>, StorageError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM transactions WHERE id = $1 AND tx_type = 'withdrawal' FOR UPDATE")
            .bind(withdrawal_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("withdrawal {}", withdrawal_id)))?;
        let current = row_to_transaction(row)?;
        if current.status != TransactionStatus::Pending {
            return Ok(None);
        }

        let (tx_hash, note) = match settlement {
            WithdrawalSettlement::Complete { tx_hash } => (Some(tx_hash.clone()), None),
            WithdrawalSettlement::Reject { reason } => (None, reason.clone()),
            WithdrawalSettlement::Cancel => (None, None),
        };

        let updated = sqlx::query(
            r#"
            UPDATE transactions SET
                status = $1,
                tx_hash = COALESCE($2, tx_hash),
                note = COALESCE($3, note),
                updated_at = $4
            WHERE id = $5
            RETURNING *
            "#,
        )
        .bind(settlement.target_status().as_str())
        .bind(&tx_hash)
        .bind(&note)
        .bind(now)
        .bind(withdrawal_id)
        .fetch_one(&mut *tx)
        .await;

        let updated = match updated {
            Ok(row) => row_to_transaction(row)?,
            Err(e) if is_unique_violation(&e) => {
                return Err(StorageError::DuplicateTxHash {
                    tx_hash: tx_hash.unwrap_or_default(),
                    owner: current.user_id,
                })
            }
            Err(e) => return Err(e.into()),
        };

        if settlement.refunds_fee() {
            sqlx::query(
                r#"
                UPDATE transactions SET status = 'refunded', updated_at = $1
                WHERE related_transaction_id = $2 AND tx_type = 'fee' AND status = 'completed'
                "#,
            )
            .bind(now)
            .bind(withdrawal_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        info!("📝 Withdrawal {} -> {}", withdrawal_id, updated.status.as_str());
        Ok(Some(updated))
    }

    // ================================
    // QUEUE OPERATIONS
    // ================================

    async fn insert_queue_entry(&self, entry: &QueueEntry) -> Result<QueueEntry, StorageError> {
        let result = sqlx::query(
            r#"
            INSERT INTO queue_entries (user_id, side, stake_amount, currency, joined_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING seq
            "#,
        )
        .bind(entry.user_id)
        .bind(entry.side.as_str())
        .bind(entry.stake_amount)
        .bind(entry.currency.as_str())
        .bind(entry.joined_at)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => Ok(QueueEntry { sequence: row.try_get("seq")?, ..entry.clone() }),
            Err(e) if is_unique_violation(&e) => Err(StorageError::AlreadyQueued(entry.user_id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_queue_entry(&self, user_id: Uuid) -> Result<Option<QueueEntry>, StorageError> {
        let row = sqlx::query("SELECT * FROM queue_entries WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_queue_entry).transpose()
    }

    async fn oldest_queue_entry(&self, currency: Currency, side: Side) -> Result<Option<QueueEntry>, StorageError> {
        let row = sqlx::query(
            "SELECT * FROM queue_entries WHERE currency = $1 AND side = $2 ORDER BY joined_at ASC, seq ASC LIMIT 1",
        )
        .bind(currency.as_str())
        .bind(side.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_queue_entry).transpose()
    }

    async fn remove_queue_entries(&self, user_ids: &[Uuid]) -> Result<usize, StorageError> {
        let result = sqlx::query("DELETE FROM queue_entries WHERE user_id = ANY($1)")
            .bind(user_ids)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    // ================================
    // BATTLE OPERATIONS
    // ================================

    async fn record_match(&self, record: &MatchRecord) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;

        // Claim both queue rows; a concurrent claim leaves one of them missing
        let claimed: Vec<Uuid> = sqlx::query("DELETE FROM queue_entries WHERE user_id = ANY($1) RETURNING user_id")
            .bind(&record.dequeued)
            .fetch_all(&mut *tx)
            .await?
            .into_iter()
            .map(|row| row.try_get("user_id"))
            .collect::<Result<_, _>>()?;
        if let Some(missing) = record.dequeued.iter().find(|id| !claimed.contains(id)) {
            return Err(StorageError::QueueEntryMissing(*missing));
        }

        Self::check_guards(&mut *tx, &record.guards).await?;
        Self::check_hashes(&mut *tx, &record.entries).await?;
        for entry in &record.entries {
            Self::insert_transaction(&mut *tx, entry).await?;
        }

        let battle = &record.battle;
        sqlx::query(
            r#"
            INSERT INTO battles (
                id, long_player, short_player, start_price, end_price, start_time,
                stake_amount, currency, status, winner, resolved_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(battle.id)
        .bind(battle.long_player)
        .bind(battle.short_player)
        .bind(battle.start_price)
        .bind(battle.end_price)
        .bind(battle.start_time)
        .bind(battle.stake_amount)
        .bind(battle.currency.as_str())
        .bind(battle.status.as_str())
        .bind(battle.winner.map(|s| s.as_str()))
        .bind(battle.resolved_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!("📝 Recorded battle {} ({})", battle.id, battle.currency);
        Ok(())
    }

    async fn get_battle(&self, battle_id: Uuid) -> Result<Option<Battle>, StorageError> {
        let row = sqlx::query("SELECT * FROM battles WHERE id = $1")
            .bind(battle_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_battle).transpose()
    }

    async fn get_active_battle_for_user(&self, user_id: Uuid) -> Result<Option<Battle>, StorageError> {
        self.fetch_battles(
            r#"
            SELECT * FROM battles
            WHERE status = 'active' AND (long_player = $1 OR short_player = $1)
            ORDER BY start_time DESC LIMIT 1
            "#,
            user_id,
        )
        .await
    }

    async fn get_latest_battle_for_user(&self, user_id: Uuid) -> Result<Option<Battle>, StorageError> {
        self.fetch_battles(
            r#"
            SELECT * FROM battles
            WHERE long_player = $1 OR short_player = $1
            ORDER BY start_time DESC LIMIT 1
            "#,
            user_id,
        )
        .await
    }

    async fn get_active_battles(&self) -> Result<Vec<Battle>, StorageError> {
        let rows = sqlx::query("SELECT * FROM battles WHERE status = 'active' ORDER BY start_time ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_battle).collect()
    }

    async fn anchor_start_price(&self, battle_id: Uuid, price: Decimal) -> Result<bool, StorageError> {
        let result = sqlx::query("UPDATE battles SET start_price = $1 WHERE id = $2 AND start_price = 0")
            .bind(price)
            .bind(battle_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if self.battle_exists(battle_id).await? {
            Ok(false)
        } else {
            Err(StorageError::NotFound(format!("battle {}", battle_id)))
        }
    }

    async fn resolve_battle(&self, resolution: &BattleResolution) -> Result<bool, StorageError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE battles SET status = 'resolved', winner = $1, end_price = $2, resolved_at = $3
            WHERE id = $4 AND status = 'active'
            "#,
        )
        .bind(resolution.winner.as_str())
        .bind(resolution.end_price)
        .bind(resolution.resolved_at)
        .bind(resolution.battle_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            drop(tx);
            return if self.battle_exists(resolution.battle_id).await? {
                Ok(false)
            } else {
                Err(StorageError::NotFound(format!("battle {}", resolution.battle_id)))
            };
        }

        Self::insert_transaction(&mut *tx, &resolution.payout).await?;
        tx.commit().await?;

        info!("📝 Resolved battle {} winner={}", resolution.battle_id, resolution.winner.as_str());
        Ok(true)
    }
}

// ================================
// ROW MAPPING
// ================================

fn is_unique_violation(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}

fn parse_column<T: FromStr<Err = String>>(value: String) -> Result<T, StorageError> {
    T::from_str(&value).map_err(|e| StorageError::Backend(anyhow!(e)))
}

fn row_to_user(r: sqlx::postgres::PgRow) -> Result<User, StorageError> {
    Ok(User {
        id: r.try_get("id")?,
        wallet_address: r.try_get("wallet_address")?,
        legacy_balance: r.try_get("legacy_balance")?,
        auth_nonce: r.try_get("auth_nonce")?,
        created_at: r.try_get("created_at")?,
    })
}

fn row_to_transaction(r: sqlx::postgres::PgRow) -> Result<Transaction, StorageError> {
    Ok(Transaction {
        id: r.try_get("id")?,
        user_id: r.try_get("user_id")?,
        tx_type: parse_column::<TransactionType>(r.try_get("tx_type")?)?,
        amount: r.try_get("amount")?,
        currency: parse_column::<Currency>(r.try_get("currency")?)?,
        status: parse_column::<TransactionStatus>(r.try_get("status")?)?,
        tx_hash: r.try_get("tx_hash")?,
        fee_amount: r.try_get("fee_amount")?,
        related_battle_id: r.try_get("related_battle_id")?,
        related_transaction_id: r.try_get("related_transaction_id")?,
        destination_address: r.try_get("destination_address")?,
        note: r.try_get("note")?,
        created_at: r.try_get("created_at")?,
        updated_at: r.try_get("updated_at")?,
    })
}

fn row_to_queue_entry(r: sqlx::postgres::PgRow) -> Result<QueueEntry, StorageError> {
    Ok(QueueEntry {
        user_id: r.try_get("user_id")?,
        side: parse_column::<Side>(r.try_get("side")?)?,
        stake_amount: r.try_get("stake_amount")?,
        currency: parse_column::<Currency>(r.try_get("currency")?)?,
        joined_at: r.try_get("joined_at")?,
        sequence: r.try_get("seq")?,
    })
}

fn row_to_battle(r: sqlx::postgres::PgRow) -> Result<Battle, StorageError> {
    let winner: Option<String> = r.try_get("winner")?;
    Ok(Battle {
        id: r.try_get("id")?,
        long_player: r.try_get("long_player")?,
        short_player: r.try_get("short_player")?,
        start_price: r.try_get("start_price")?,
        end_price: r.try_get("end_price")?,
        start_time: r.try_get("start_time")?,
        stake_amount: r.try_get("stake_amount")?,
        currency: parse_column::<Currency>(r.try_get("currency")?)?,
        status: parse_column::<BattleStatus>(r.try_get("status")?)?,
        winner: winner.map(parse_column::<Side>).transpose()?,
        resolved_at: r.try_get("resolved_at")?,
    })
}
