//! Schema bootstrap and version migration
//!
//! The schema version lives in the sentinel redemption row (native_txid = 0)
//! together with the persisted exchange rate and a description string. A
//! fresh database is bootstrapped at the current version in one shot; an
//! older database is upgraded by applying one migration step per version,
//! oldest first, each step guarded so a crashed migration can simply be
//! re-run.

use crate::error::{ExchangeError, ExchangeResult};
use crate::rate;

use rust_decimal::Decimal;
use sqlx::sqlite::SqlitePool;
use sqlx::{Row, SqliteConnection};
use tracing::info;

/// Current schema version
pub const SCHEMA_VERSION: u32 = 4;

/// Owns table layout and in-place upgrades
pub struct SchemaManager {
    pool: SqlitePool,
    default_rate: Decimal,
}

impl SchemaManager {
    /// Create a schema manager.
    ///
    /// `default_rate` seeds the sentinel row on a fresh database; it is
    /// ignored when a persisted rate already exists.
    pub fn new(pool: SqlitePool, default_rate: Decimal) -> Self {
        Self { pool, default_rate }
    }

    /// Bootstrap or upgrade the database, once at startup.
    ///
    /// Runs inside a single transaction. Fails fatally when the stored
    /// version is newer than [`SCHEMA_VERSION`]: running against an unknown
    /// layout risks silent corruption.
    pub async fn initialize(&self) -> ExchangeResult<()> {
        let mut tx = self.pool.begin().await?;

        match stored_version(&mut *tx).await? {
            None => {
                info!("Creating new exchange database at version {}", SCHEMA_VERSION);
                self.bootstrap(&mut *tx).await?;
            }
            Some(stored) if stored > SCHEMA_VERSION => {
                return Err(ExchangeError::UnsupportedVersion {
                    stored,
                    supported: SCHEMA_VERSION,
                });
            }
            Some(stored) => {
                for target in (stored + 1)..=SCHEMA_VERSION {
                    info!("Migrating exchange database to version {}", target);
                    apply_step(&mut *tx, target).await?;
                    stamp_version(&mut *tx, target).await?;
                }
                info!("Using version {} exchange database", SCHEMA_VERSION);
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Create all tables and indexes and insert the sentinel row
    async fn bootstrap(&self, conn: &mut SqliteConnection) -> ExchangeResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS redemption (
                db_id INTEGER PRIMARY KEY AUTOINCREMENT,
                native_txid INTEGER NOT NULL,
                sender INTEGER NOT NULL,
                height INTEGER NOT NULL,
                settled BOOLEAN NOT NULL,
                native_amount INTEGER NOT NULL,
                foreign_amount INTEGER NOT NULL,
                foreign_address TEXT NOT NULL,
                foreign_txid BLOB
            )
            "#,
        )
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS redemption_idx1 ON redemption (native_txid)",
        )
        .execute(&mut *conn)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS redemption_idx2 ON redemption (settled)")
            .execute(&mut *conn)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS account (
                db_id INTEGER PRIMARY KEY AUTOINCREMENT,
                foreign_address TEXT NOT NULL,
                account_id INTEGER NOT NULL,
                public_key BLOB
            )
            "#,
        )
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS account_idx1 ON account (foreign_address)",
        )
        .execute(&mut *conn)
        .await?;

        sqlx::query("CREATE UNIQUE INDEX IF NOT EXISTS account_idx2 ON account (account_id)")
            .execute(&mut *conn)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS deposit (
                db_id INTEGER PRIMARY KEY AUTOINCREMENT,
                foreign_txid BLOB NOT NULL,
                height INTEGER NOT NULL,
                timestamp DATETIME NOT NULL,
                foreign_address TEXT NOT NULL,
                account_id INTEGER NOT NULL,
                foreign_amount INTEGER NOT NULL,
                native_amount INTEGER NOT NULL,
                settled BOOLEAN NOT NULL,
                native_txid INTEGER NOT NULL
            )
            "#,
        )
        .execute(&mut *conn)
        .await?;

        sqlx::query("CREATE UNIQUE INDEX IF NOT EXISTS deposit_idx1 ON deposit (foreign_txid)")
            .execute(&mut *conn)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS deposit_idx2 ON deposit (settled)")
            .execute(&mut *conn)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS deposit_idx3 ON deposit (height)")
            .execute(&mut *conn)
            .await?;

        create_block_table(&mut *conn).await?;

        let raw_rate = rate::encode(self.default_rate)
            .ok_or(ExchangeError::InvalidRate(self.default_rate))?;

        sqlx::query(
            r#"
            INSERT INTO redemption
                (native_txid, sender, height, settled, native_amount, foreign_amount, foreign_address)
            VALUES (0, 0, 0, FALSE, ?, ?, '')
            "#,
        )
        .bind(SCHEMA_VERSION as i64)
        .bind(raw_rate)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }
}

/// Read the version stamped in the sentinel row.
///
/// `None` means a fresh database: either the redemption table does not
/// exist yet or it has no sentinel row.
async fn stored_version(conn: &mut SqliteConnection) -> ExchangeResult<Option<u32>> {
    let table: Option<(String,)> = sqlx::query_as(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'redemption'",
    )
    .fetch_optional(&mut *conn)
    .await?;

    if table.is_none() {
        return Ok(None);
    }

    let row = sqlx::query("SELECT native_amount FROM redemption WHERE native_txid = 0")
        .fetch_optional(&mut *conn)
        .await?;

    Ok(row.map(|r| r.get::<i64, _>("native_amount") as u32))
}

/// Advance the version stamp in the sentinel row
async fn stamp_version(conn: &mut SqliteConnection, version: u32) -> ExchangeResult<()> {
    sqlx::query("UPDATE redemption SET native_amount = ? WHERE native_txid = 0")
        .bind(version as i64)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Apply the migration step that upgrades to `target`.
///
/// Steps are additive and re-runnable; none of them touches settled data.
async fn apply_step(conn: &mut SqliteConnection, target: u32) -> ExchangeResult<()> {
    match target {
        // v2: index the foreign chain's accepted blocks for reorg detection
        2 => create_block_table(&mut *conn).await?,
        // v3: carry the foreign transaction timestamp on deposits
        3 => {
            if !column_exists(&mut *conn, "deposit", "timestamp").await? {
                sqlx::query("ALTER TABLE deposit ADD COLUMN timestamp DATETIME NOT NULL DEFAULT 0")
                    .execute(&mut *conn)
                    .await?;
            }
        }
        // v4: the reorg purge scans deposits by height
        4 => {
            sqlx::query("CREATE INDEX IF NOT EXISTS deposit_idx3 ON deposit (height)")
                .execute(&mut *conn)
                .await?;
        }
        other => {
            return Err(ExchangeError::InvariantViolation(format!(
                "no migration step for version {}",
                other
            )));
        }
    }
    Ok(())
}

async fn create_block_table(conn: &mut SqliteConnection) -> ExchangeResult<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS block (
            db_id INTEGER PRIMARY KEY AUTOINCREMENT,
            height INTEGER NOT NULL,
            block_id BLOB NOT NULL
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query("CREATE UNIQUE INDEX IF NOT EXISTS block_idx1 ON block (height)")
        .execute(&mut *conn)
        .await?;

    Ok(())
}

async fn column_exists(
    conn: &mut SqliteConnection,
    table: &str,
    column: &str,
) -> ExchangeResult<bool> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pragma_table_info(?) WHERE name = ?")
        .bind(table)
        .bind(column)
        .fetch_one(&mut *conn)
        .await?;
    Ok(count > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::{default_rate, memory_pool};
    use crate::store::RedemptionLedger;

    async fn count(pool: &SqlitePool, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn fresh_bootstrap_creates_only_the_sentinel() {
        let pool = memory_pool().await;

        assert_eq!(count(&pool, "redemption").await, 1);
        assert_eq!(count(&pool, "account").await, 0);
        assert_eq!(count(&pool, "deposit").await, 0);
        assert_eq!(count(&pool, "block").await, 0);

        let version: i64 =
            sqlx::query_scalar("SELECT native_amount FROM redemption WHERE native_txid = 0")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(version as u32, SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn bootstrap_seeds_the_default_rate() {
        let pool = memory_pool().await;
        let ledger = RedemptionLedger::new(pool);
        assert_eq!(ledger.stored_rate().await.unwrap(), Some(default_rate()));
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let pool = memory_pool().await;
        SchemaManager::new(pool.clone(), default_rate())
            .initialize()
            .await
            .unwrap();
        assert_eq!(count(&pool, "redemption").await, 1);
    }

    #[tokio::test]
    async fn newer_stored_version_is_fatal() {
        let pool = memory_pool().await;
        sqlx::query("UPDATE redemption SET native_amount = ? WHERE native_txid = 0")
            .bind((SCHEMA_VERSION + 1) as i64)
            .execute(&pool)
            .await
            .unwrap();

        let err = SchemaManager::new(pool, default_rate())
            .initialize()
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::UnsupportedVersion { .. }));
        assert!(err.is_fatal());
    }

    /// Lay out the tables exactly as a version-2 store had them: block table
    /// present, deposit table without the timestamp column or height index.
    async fn build_version_2_store(pool: &SqlitePool) {
        for ddl in [
            "CREATE TABLE redemption (
                db_id INTEGER PRIMARY KEY AUTOINCREMENT,
                native_txid INTEGER NOT NULL,
                sender INTEGER NOT NULL,
                height INTEGER NOT NULL,
                settled BOOLEAN NOT NULL,
                native_amount INTEGER NOT NULL,
                foreign_amount INTEGER NOT NULL,
                foreign_address TEXT NOT NULL,
                foreign_txid BLOB
            )",
            "CREATE UNIQUE INDEX redemption_idx1 ON redemption (native_txid)",
            "CREATE TABLE account (
                db_id INTEGER PRIMARY KEY AUTOINCREMENT,
                foreign_address TEXT NOT NULL,
                account_id INTEGER NOT NULL,
                public_key BLOB
            )",
            "CREATE TABLE deposit (
                db_id INTEGER PRIMARY KEY AUTOINCREMENT,
                foreign_txid BLOB NOT NULL,
                height INTEGER NOT NULL,
                foreign_address TEXT NOT NULL,
                account_id INTEGER NOT NULL,
                foreign_amount INTEGER NOT NULL,
                native_amount INTEGER NOT NULL,
                settled BOOLEAN NOT NULL,
                native_txid INTEGER NOT NULL
            )",
            "CREATE UNIQUE INDEX deposit_idx1 ON deposit (foreign_txid)",
            "CREATE TABLE block (
                db_id INTEGER PRIMARY KEY AUTOINCREMENT,
                height INTEGER NOT NULL,
                block_id BLOB NOT NULL
            )",
            "CREATE UNIQUE INDEX block_idx1 ON block (height)",
            "INSERT INTO redemption
                (native_txid, sender, height, settled, native_amount, foreign_amount, foreign_address)
             VALUES (0, 0, 0, FALSE, 2, 500000, '')",
            "INSERT INTO redemption
                (native_txid, sender, height, settled, native_amount, foreign_amount, foreign_address, foreign_txid)
             VALUES (77, 42, 120, TRUE, 1000, 500000000, '1abc', x'11')",
        ] {
            sqlx::query(ddl).execute(pool).await.unwrap();
        }
    }

    #[tokio::test]
    async fn migrates_version_2_store_through_3_and_4() {
        let config = crate::config::DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            min_connections: 1,
        };
        let pool = crate::store::connect(&config).await.unwrap();
        build_version_2_store(&pool).await;

        SchemaManager::new(pool.clone(), default_rate())
            .initialize()
            .await
            .unwrap();

        let version: i64 =
            sqlx::query_scalar("SELECT native_amount FROM redemption WHERE native_txid = 0")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(version as u32, SCHEMA_VERSION);

        let mut conn = pool.acquire().await.unwrap();
        assert!(column_exists(&mut conn, "deposit", "timestamp").await.unwrap());
        drop(conn);

        let indexes: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pragma_index_list('deposit')")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert!(indexes >= 2);

        // the settled redemption row survived the upgrade untouched
        let ledger = RedemptionLedger::new(pool);
        let survivor = ledger.get(77).await.unwrap().expect("settled row kept");
        assert!(survivor.settled);
        assert_eq!(survivor.foreign_amount, 500_000_000);
    }
}
