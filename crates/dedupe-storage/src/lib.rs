//! Transactional store abstraction for consolidation runs, plus the
//! PostgreSQL and in-memory backends and store-error retry classification.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use dedupe_core::{
    ConsolidationMapping, EntityRow, EntitySpec, Ident, PlanError, Referrer, MAX_IDENT_LEN,
};

pub use dedupe_core::GuardOutcome;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub mod memory;
pub mod postgres;

pub use memory::{Faults, MemoryRow, MemoryStore, Value};
pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(
        "foreign key violation on {}: {message}",
        .table.as_deref().unwrap_or("<unknown table>")
    )]
    ForeignKeyViolation {
        table: Option<String>,
        constraint: Option<String>,
        message: String,
    },
    #[error(
        "unique violation on {}: {message}",
        .constraint.as_deref().unwrap_or("<unknown constraint>")
    )]
    UniqueViolation {
        constraint: Option<String>,
        message: String,
    },
    #[error("transient store failure: {message}")]
    Transient { message: String },
    #[error("unknown table {0}")]
    UnknownTable(String),
    #[error("unknown column {table}.{column}")]
    UnknownColumn { table: String, column: String },
    #[error("unexpected value in {table}.{column}: {message}")]
    InvalidValue {
        table: String,
        column: String,
        message: String,
    },
    #[error(transparent)]
    Database(sqlx::Error),
    #[error("{0}")]
    Other(String),
}

impl StoreError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            StoreError::Transient { .. } => RetryDisposition::Retryable,
            _ => RetryDisposition::NonRetryable,
        }
    }

    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            StoreError::ForeignKeyViolation { .. } | StoreError::UniqueViolation { .. }
        )
    }

    /// The table a constraint violation was reported against, when known.
    pub fn table(&self) -> Option<&str> {
        match self {
            StoreError::ForeignKeyViolation { table, .. } => table.as_deref(),
            StoreError::UnknownTable(table)
            | StoreError::UnknownColumn { table, .. }
            | StoreError::InvalidValue { table, .. } => Some(table),
            _ => None,
        }
    }
}

/// SQLSTATE codes that abort a transaction without implying bad data.
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const LOCK_NOT_AVAILABLE: &str = "55P03";
const FOREIGN_KEY_VIOLATION: &str = "23503";
const UNIQUE_VIOLATION: &str = "23505";

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            let code = db_err.code().map(|code| code.into_owned());
            match code.as_deref() {
                Some(FOREIGN_KEY_VIOLATION) => {
                    return StoreError::ForeignKeyViolation {
                        table: db_err.table().map(ToString::to_string),
                        constraint: db_err.constraint().map(ToString::to_string),
                        message: db_err.message().to_string(),
                    }
                }
                Some(UNIQUE_VIOLATION) => {
                    return StoreError::UniqueViolation {
                        constraint: db_err.constraint().map(ToString::to_string),
                        message: db_err.message().to_string(),
                    }
                }
                Some(SERIALIZATION_FAILURE | DEADLOCK_DETECTED | LOCK_NOT_AVAILABLE) => {
                    return StoreError::Transient {
                        message: db_err.message().to_string(),
                    }
                }
                _ => {}
            }
        }
        if matches!(err, sqlx::Error::PoolTimedOut | sqlx::Error::Io(_)) {
            return StoreError::Transient {
                message: err.to_string(),
            };
        }
        StoreError::Database(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IsolationLevel {
    RepeatableRead,
    #[default]
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(self) -> &'static str {
        match self {
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

impl FromStr for IsolationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "repeatable-read" => Ok(IsolationLevel::RepeatableRead),
            "serializable" => Ok(IsolationLevel::Serializable),
            other => Err(format!("unknown isolation level {other:?}")),
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxOptions {
    pub isolation: IsolationLevel,
    pub read_only: bool,
    pub lock_timeout: Option<Duration>,
    pub statement_timeout: Option<Duration>,
}

impl TxOptions {
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// Candidate rows for grouping plus table-wide counts.
///
/// Backends may pre-filter `candidates` to rows whose key occurs more than
/// once, but never drop a row that belongs to a duplicate group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityScan {
    pub candidates: Vec<EntityRow>,
    pub total_rows: u64,
    pub null_key_rows: u64,
}

#[async_trait]
pub trait StoreTransaction: Send {
    async fn scan_entity(&mut self, entity: &EntitySpec) -> Result<EntityScan, StoreError>;

    /// Rows in the referrer holding a non-null foreign-key value.
    async fn count_references(&mut self, referrer: &Referrer) -> Result<u64, StoreError>;

    async fn count_references_to(
        &mut self,
        referrer: &Referrer,
        ids: &[i64],
    ) -> Result<u64, StoreError>;

    /// Rewrites every loser reference to its survivor; returns rows updated.
    async fn repoint(
        &mut self,
        referrer: &Referrer,
        mapping: &ConsolidationMapping,
    ) -> Result<u64, StoreError>;

    async fn delete_rows(&mut self, entity: &EntitySpec, ids: &[i64]) -> Result<u64, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Injected store handle. Dropping a transaction without committing rolls
/// it back.
#[async_trait]
pub trait ConsolidationStore: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn begin(&self, options: &TxOptions) -> Result<Box<dyn StoreTransaction>, StoreError>;

    async fn table_exists(&self, table: &Ident) -> Result<bool, StoreError>;

    async fn column_exists(&self, table: &Ident, column: &Ident) -> Result<bool, StoreError>;

    /// Single-column foreign keys the store declares against the entity id.
    async fn declared_referrers(&self, entity: &EntitySpec) -> Result<Vec<Referrer>, StoreError>;

    /// Installs a unique index on the natural key without blocking writers.
    async fn ensure_unique_index(
        &self,
        entity: &EntitySpec,
        index: &Ident,
    ) -> Result<GuardOutcome, StoreError>;
}

/// `<table>_<key columns>_uniq`, shortened with a hash suffix when it would
/// exceed the identifier limit.
pub fn unique_index_name(entity: &EntitySpec) -> Result<Ident, PlanError> {
    if let Some(name) = &entity.unique_index {
        return Ok(name.clone());
    }
    let columns = entity
        .natural_key
        .iter()
        .map(Ident::name)
        .collect::<Vec<_>>()
        .join("_");
    let full = format!("{}_{}_uniq", entity.table.name(), columns);
    let name = if full.len() <= MAX_IDENT_LEN {
        full
    } else {
        let digest = hex::encode(Sha256::digest(full.as_bytes()));
        let keep = MAX_IDENT_LEN - 9;
        format!("{}_{}", &full[..keep], &digest[..8])
    };
    Ident::parse(&name)
}
