//! Persistent exchange state on embedded SQLite
//!
//! Handles:
//! - Schema bootstrap and version migration
//! - Redemption and deposit ledgers
//! - Account directory (foreign address <-> native account)
//! - Foreign-chain block index and reorg purge

pub mod account;
pub mod blocks;
pub mod deposit;
pub mod redemption;
pub mod schema;

pub use account::{AccountBinding, AccountDirectory};
pub use blocks::{BlockIndex, ChainBlockRecord};
pub use deposit::{DepositLedger, DepositRecord};
pub use redemption::{RedemptionLedger, RedemptionRecord};
pub use schema::{SchemaManager, SCHEMA_VERSION};

use crate::config::DatabaseConfig;
use crate::error::ExchangeResult;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

/// Foreign-chain transaction identifier (32-byte hash)
pub type ForeignTxId = [u8; 32];

/// Foreign-chain block identifier (32-byte hash)
pub type BlockId = [u8; 32];

/// Open the connection pool for the exchange database
pub async fn connect(config: &DatabaseConfig) -> ExchangeResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&config.url)?.create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// What a chain rollback may remove from a ledger.
///
/// The redemption ledger keeps settled rows through any native reorg: a
/// foreign payout that already happened cannot be un-happened. The deposit
/// ledger purges unconditionally, because the foreign chain is the
/// chain-of-record for those rows and a retracted block retracts its
/// bookkeeping with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackPolicy {
    /// Remove every row in the reorged range, settled or not
    PurgeAll,
    /// Remove only unsettled rows; settled rows are permanent
    KeepSettled,
}

impl RollbackPolicy {
    /// Predicate appended to a purge statement's WHERE clause
    pub(crate) fn settled_filter(self) -> &'static str {
        match self {
            RollbackPolicy::PurgeAll => "",
            RollbackPolicy::KeepSettled => " AND settled = FALSE",
        }
    }
}

/// Check whether a storage error is a unique-index violation.
///
/// Duplicate transaction identifiers are benign re-observations, so callers
/// turn this case into a success-no-op instead of an error.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.kind() == sqlx::error::ErrorKind::UniqueViolation,
        _ => false,
    }
}

/// Widen a stored hash column back to its fixed-size form
pub(crate) fn hash_from_bytes(bytes: Vec<u8>) -> [u8; 32] {
    let mut hash = [0u8; 32];
    let len = bytes.len().min(32);
    hash[..len].copy_from_slice(&bytes[..len]);
    hash
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use rust_decimal::Decimal;

    /// Open a fresh in-memory database with the full schema applied.
    ///
    /// A single connection keeps the in-memory database alive and shared
    /// for the whole test.
    pub(crate) async fn memory_pool() -> SqlitePool {
        let config = DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            min_connections: 1,
        };
        let pool = connect(&config).await.expect("connect in-memory database");
        SchemaManager::new(pool.clone(), default_rate())
            .initialize()
            .await
            .expect("bootstrap schema");
        pool
    }

    /// Rate used throughout the store tests: 0.005 foreign units per token
    pub(crate) fn default_rate() -> Decimal {
        Decimal::new(5, 3)
    }

    /// Fixed-size test identifier from a short tag
    pub(crate) fn test_hash(tag: &[u8]) -> [u8; 32] {
        hash_from_bytes(tag.to_vec())
    }
}
