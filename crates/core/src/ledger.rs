use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Purchase,
    Subscription,
    WorkflowExecution,
    Refund,
    Bonus,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Purchase => "purchase",
            Self::Subscription => "subscription",
            Self::WorkflowExecution => "workflow_execution",
            Self::Refund => "refund",
            Self::Bonus => "bonus",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "purchase" => Some(Self::Purchase),
            "subscription" => Some(Self::Subscription),
            "workflow_execution" => Some(Self::WorkflowExecution),
            "refund" => Some(Self::Refund),
            "bonus" => Some(Self::Bonus),
            _ => None,
        }
    }
}

/// Immutable ledger row. Positive amounts add credits, negative amounts spend them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub id: String,
    pub user_id: String,
    pub amount: i64,
    pub transaction_type: TransactionType,
    pub description: String,
    pub execution_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl CreditTransaction {
    fn new(
        user_id: &str,
        amount: i64,
        transaction_type: TransactionType,
        description: impl Into<String>,
        execution_id: Option<&str>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            amount,
            transaction_type,
            description: description.into(),
            execution_id: execution_id.map(str::to_string),
            created_at: Utc::now(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Insufficient credits. Required: {required}, Available: {available}")]
    InsufficientCredits { required: i64, available: i64 },

    #[error("amount must be positive, got {0}")]
    InvalidAmount(i64),

    #[error("credit ledger storage error: {0}")]
    Storage(String),
}

impl From<rusqlite::Error> for LedgerError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Per-user credit balances backed by an append-only transaction log.
///
/// `deduct` checks and debits atomically per user: concurrent deductions never drive a
/// balance negative.
pub trait CreditLedger: Send + Sync {
    /// Current balance. Users the ledger has never seen have zero credits.
    fn balance(&self, user_id: &str) -> Result<i64, LedgerError>;

    fn deduct(
        &self,
        user_id: &str,
        amount: i64,
        description: &str,
        execution_id: Option<&str>,
    ) -> Result<CreditTransaction, LedgerError>;

    /// Give back what an execution was charged. Returns `None` when nothing was deducted for
    /// it or it has already been refunded.
    fn refund(&self, execution_id: &str) -> Result<Option<CreditTransaction>, LedgerError>;

    fn grant(
        &self,
        user_id: &str,
        amount: i64,
        transaction_type: TransactionType,
        description: &str,
    ) -> Result<CreditTransaction, LedgerError>;

    /// Newest first.
    fn transactions(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CreditTransaction>, LedgerError>;
}

fn refund_description(execution_id: &str) -> String {
    format!("Refund for failed execution {execution_id}")
}

#[derive(Debug, Default)]
struct Account {
    balance: i64,
    transactions: Vec<CreditTransaction>,
}

/// In-process ledger. Each account sits behind its map entry's lock.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    accounts: DashMap<String, Account>,
    execution_owner: DashMap<String, String>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CreditLedger for MemoryLedger {
    fn balance(&self, user_id: &str) -> Result<i64, LedgerError> {
        Ok(self
            .accounts
            .get(user_id)
            .map(|account| account.balance)
            .unwrap_or(0))
    }

    fn deduct(
        &self,
        user_id: &str,
        amount: i64,
        description: &str,
        execution_id: Option<&str>,
    ) -> Result<CreditTransaction, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }

        let mut account = self.accounts.entry(user_id.to_string()).or_default();
        if account.balance < amount {
            return Err(LedgerError::InsufficientCredits {
                required: amount,
                available: account.balance,
            });
        }

        let tx = CreditTransaction::new(
            user_id,
            -amount,
            TransactionType::WorkflowExecution,
            description,
            execution_id,
        );
        account.balance -= amount;
        account.transactions.push(tx.clone());
        drop(account);

        if let Some(execution_id) = execution_id {
            self.execution_owner
                .insert(execution_id.to_string(), user_id.to_string());
        }
        Ok(tx)
    }

    fn refund(&self, execution_id: &str) -> Result<Option<CreditTransaction>, LedgerError> {
        let Some(user_id) = self
            .execution_owner
            .get(execution_id)
            .map(|owner| owner.clone())
        else {
            return Ok(None);
        };
        let Some(mut account) = self.accounts.get_mut(&user_id) else {
            return Ok(None);
        };

        let for_execution = |tx: &&CreditTransaction| tx.execution_id.as_deref() == Some(execution_id);
        let already_refunded = account
            .transactions
            .iter()
            .filter(for_execution)
            .any(|tx| tx.transaction_type == TransactionType::Refund);
        let deducted: i64 = account
            .transactions
            .iter()
            .filter(for_execution)
            .filter(|tx| tx.amount < 0)
            .map(|tx| -tx.amount)
            .sum();
        if already_refunded || deducted == 0 {
            return Ok(None);
        }

        let tx = CreditTransaction::new(
            &user_id,
            deducted,
            TransactionType::Refund,
            refund_description(execution_id),
            Some(execution_id),
        );
        account.balance += deducted;
        account.transactions.push(tx.clone());
        Ok(Some(tx))
    }

    fn grant(
        &self,
        user_id: &str,
        amount: i64,
        transaction_type: TransactionType,
        description: &str,
    ) -> Result<CreditTransaction, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }

        let mut account = self.accounts.entry(user_id.to_string()).or_default();
        let tx = CreditTransaction::new(user_id, amount, transaction_type, description, None);
        account.balance += amount;
        account.transactions.push(tx.clone());
        Ok(tx)
    }

    fn transactions(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CreditTransaction>, LedgerError> {
        Ok(self
            .accounts
            .get(user_id)
            .map(|account| {
                account
                    .transactions
                    .iter()
                    .rev()
                    .skip(offset)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Credits promised to runs that passed pre-flight but have not been settled yet.
///
/// Admission compares `balance - held` against the estimate while holding the user's entry, so
/// two concurrent runs are never admitted against the same credits.
#[derive(Debug, Default)]
pub struct CreditReservations {
    held: DashMap<String, i64>,
}

impl CreditReservations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve(
        self: &Arc<Self>,
        ledger: &dyn CreditLedger,
        user_id: &str,
        amount: i64,
    ) -> Result<CreditHold, LedgerError> {
        let admitted = {
            let mut held = self.held.entry(user_id.to_string()).or_insert(0);
            let available = ledger.balance(user_id).map(|balance| balance - *held);
            match available {
                Ok(available) if available >= amount => {
                    *held += amount;
                    Ok(())
                }
                Ok(available) => Err(LedgerError::InsufficientCredits {
                    required: amount,
                    available: available.max(0),
                }),
                Err(err) => Err(err),
            }
        };

        if let Err(err) = admitted {
            self.held.remove_if(user_id, |_, held| *held == 0);
            return Err(err);
        }
        Ok(CreditHold {
            reservations: Arc::clone(self),
            user_id: user_id.to_string(),
            amount,
        })
    }

    /// Credits currently held for `user_id`.
    pub fn held(&self, user_id: &str) -> i64 {
        self.held.get(user_id).map(|held| *held).unwrap_or(0)
    }

    fn release(&self, user_id: &str, amount: i64) {
        if let Some(mut held) = self.held.get_mut(user_id) {
            *held -= amount;
        }
        self.held.remove_if(user_id, |_, held| *held <= 0);
    }
}

/// Released on drop. Settle the run before dropping it.
#[derive(Debug)]
pub struct CreditHold {
    reservations: Arc<CreditReservations>,
    user_id: String,
    amount: i64,
}

impl CreditHold {
    pub fn amount(&self) -> i64 {
        self.amount
    }
}

impl Drop for CreditHold {
    fn drop(&mut self) {
        self.reservations.release(&self.user_id, self.amount);
    }
}

/// SQLite-backed ledger: a balance counter per user plus the transaction log, updated in one
/// `BEGIN IMMEDIATE` transaction.
#[derive(Debug, Clone)]
pub struct SqliteLedger {
    db_path: PathBuf,
}

impl SqliteLedger {
    pub fn open(db_path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                LedgerError::Storage(format!(
                    "failed to create ledger directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let ledger = Self {
            db_path: db_path.to_path_buf(),
        };
        ledger.initialize_schema()?;
        Ok(ledger)
    }

    fn initialize_schema(&self) -> Result<(), LedgerError> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE IF NOT EXISTS user_credits (
                    user_id TEXT PRIMARY KEY,
                    balance INTEGER NOT NULL CHECK (balance >= 0),
                    updated_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS credit_transactions (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    amount INTEGER NOT NULL,
                    transaction_type TEXT NOT NULL,
                    description TEXT NOT NULL,
                    execution_id TEXT,
                    created_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_credit_tx_user ON credit_transactions(user_id, created_at DESC);
                 CREATE INDEX IF NOT EXISTS idx_credit_tx_execution ON credit_transactions(execution_id);",
            )?;
            Ok(())
        })
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let mut conn = Connection::open(&self.db_path).map_err(|e| {
            LedgerError::Storage(format!(
                "failed to open ledger db {}: {e}",
                self.db_path.display()
            ))
        })?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        op(&mut conn)
    }

    fn current_balance(conn: &Connection, user_id: &str) -> Result<i64, LedgerError> {
        let balance = conn
            .query_row(
                "SELECT balance FROM user_credits WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(balance.unwrap_or(0))
    }

    fn apply(conn: &Connection, tx: &CreditTransaction) -> Result<(), LedgerError> {
        let now = timestamp(&Utc::now());
        // An upsert would check `balance >= 0` against the negative insert row first.
        let updated = conn.execute(
            "UPDATE user_credits SET balance = balance + ?2, updated_at = ?3 WHERE user_id = ?1",
            params![tx.user_id, tx.amount, now],
        )?;
        if updated == 0 {
            conn.execute(
                "INSERT INTO user_credits (user_id, balance, updated_at) VALUES (?1, ?2, ?3)",
                params![tx.user_id, tx.amount, now],
            )?;
        }
        conn.execute(
            "INSERT INTO credit_transactions
                (id, user_id, amount, transaction_type, description, execution_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                tx.id,
                tx.user_id,
                tx.amount,
                tx.transaction_type.as_str(),
                tx.description,
                tx.execution_id,
                timestamp(&tx.created_at),
            ],
        )?;
        Ok(())
    }
}

impl CreditLedger for SqliteLedger {
    fn balance(&self, user_id: &str) -> Result<i64, LedgerError> {
        self.with_connection(|conn| Self::current_balance(conn, user_id))
    }

    fn deduct(
        &self,
        user_id: &str,
        amount: i64,
        description: &str,
        execution_id: Option<&str>,
    ) -> Result<CreditTransaction, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }

        self.with_connection(|conn| {
            let db_tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let available = Self::current_balance(&db_tx, user_id)?;
            if available < amount {
                return Err(LedgerError::InsufficientCredits {
                    required: amount,
                    available,
                });
            }

            let tx = CreditTransaction::new(
                user_id,
                -amount,
                TransactionType::WorkflowExecution,
                description,
                execution_id,
            );
            Self::apply(&db_tx, &tx)?;
            db_tx.commit()?;

            info!(user_id, amount, balance = available - amount, "Credits deducted");
            Ok(tx)
        })
    }

    fn refund(&self, execution_id: &str) -> Result<Option<CreditTransaction>, LedgerError> {
        self.with_connection(|conn| {
            let db_tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let refunded: i64 = db_tx.query_row(
                "SELECT COUNT(*) FROM credit_transactions
                 WHERE execution_id = ?1 AND transaction_type = ?2",
                params![execution_id, TransactionType::Refund.as_str()],
                |row| row.get(0),
            )?;
            if refunded > 0 {
                return Ok(None);
            }

            let deduction: Option<(String, i64)> = db_tx
                .query_row(
                    "SELECT user_id, -SUM(amount) FROM credit_transactions
                     WHERE execution_id = ?1 AND amount < 0
                     GROUP BY user_id",
                    params![execution_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((user_id, amount)) = deduction.filter(|(_, amount)| *amount > 0) else {
                return Ok(None);
            };

            let tx = CreditTransaction::new(
                &user_id,
                amount,
                TransactionType::Refund,
                refund_description(execution_id),
                Some(execution_id),
            );
            Self::apply(&db_tx, &tx)?;
            db_tx.commit()?;

            info!(user_id = %user_id, execution_id, amount, "Credits refunded");
            Ok(Some(tx))
        })
    }

    fn grant(
        &self,
        user_id: &str,
        amount: i64,
        transaction_type: TransactionType,
        description: &str,
    ) -> Result<CreditTransaction, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }

        self.with_connection(|conn| {
            let db_tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let tx = CreditTransaction::new(user_id, amount, transaction_type, description, None);
            Self::apply(&db_tx, &tx)?;
            db_tx.commit()?;
            Ok(tx)
        })
    }

    fn transactions(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CreditTransaction>, LedgerError> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, amount, transaction_type, description, execution_id, created_at
                 FROM credit_transactions
                 WHERE user_id = ?1
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT ?2 OFFSET ?3",
            )?;

            let rows = stmt.query_map(params![user_id, limit as i64, offset as i64], |row| {
                let type_raw: String = row.get(3)?;
                let created_raw: String = row.get(6)?;
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    type_raw,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    created_raw,
                ))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (id, user_id, amount, type_raw, description, execution_id, created_raw) = row?;
                let transaction_type = TransactionType::parse(&type_raw).ok_or_else(|| {
                    LedgerError::Storage(format!("unknown transaction type: {type_raw}"))
                })?;
                let created_at = DateTime::parse_from_rfc3339(&created_raw)
                    .map_err(|e| LedgerError::Storage(format!("invalid timestamp {created_raw}: {e}")))?
                    .with_timezone(&Utc);
                out.push(CreditTransaction {
                    id,
                    user_id,
                    amount,
                    transaction_type,
                    description,
                    execution_id,
                    created_at,
                });
            }
            Ok(out)
        })
    }
}

/// Fixed-width RFC 3339 so that text ordering matches time ordering.
pub(crate) fn timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}
