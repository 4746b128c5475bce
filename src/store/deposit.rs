//! Deposit ledger: foreign-chain deposits awaiting native issuance
//!
//! One row per foreign deposit transaction, keyed by the foreign transaction
//! id; the unique index is what prevents issuing twice for the same deposit.
//! Rows are purged together with their enclosing blocks on a foreign reorg
//! (see the block index), so the ledger itself has no rollback operation.

use crate::error::ExchangeResult;
use crate::store::{hash_from_bytes, is_unique_violation, ForeignTxId, RollbackPolicy};

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::{Row, SqliteConnection};

/// One foreign-chain deposit destined for native issuance
#[derive(Debug, Clone)]
pub struct DepositRecord {
    pub foreign_txid: ForeignTxId,
    pub height: u32,
    pub timestamp: DateTime<Utc>,
    pub foreign_address: String,
    pub account_id: u64,
    /// Deposited foreign amount in 8-fractional-digit minor units
    pub foreign_amount: i64,
    /// Token units to issue, frozen at the rate in effect at observation
    pub native_amount: i64,
    pub settled: bool,
    /// Native issuance transaction, 0 until settled
    pub native_txid: u64,
}

impl DepositRecord {
    fn from_row(row: &SqliteRow) -> Self {
        Self {
            foreign_txid: hash_from_bytes(row.get("foreign_txid")),
            height: row.get::<i64, _>("height") as u32,
            timestamp: row.get("timestamp"),
            foreign_address: row.get("foreign_address"),
            account_id: row.get::<i64, _>("account_id") as u64,
            foreign_amount: row.get("foreign_amount"),
            native_amount: row.get("native_amount"),
            settled: row.get("settled"),
            native_txid: row.get::<i64, _>("native_txid") as u64,
        }
    }
}

const COLUMNS: &str = "foreign_txid, height, timestamp, foreign_address, account_id, \
                       foreign_amount, native_amount, settled, native_txid";

/// Deposit ledger over the shared pool
pub struct DepositLedger {
    pool: SqlitePool,
}

impl DepositLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record a new unsettled deposit.
    ///
    /// Returns `Ok(false)` when the foreign transaction id is already
    /// recorded (re-observation by the poller).
    #[allow(clippy::too_many_arguments)]
    pub async fn record(
        &self,
        foreign_txid: &ForeignTxId,
        height: u32,
        timestamp: DateTime<Utc>,
        foreign_address: &str,
        foreign_amount: i64,
        native_amount: i64,
        account_id: u64,
    ) -> ExchangeResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO deposit
                (foreign_txid, height, timestamp, foreign_address, account_id,
                 foreign_amount, native_amount, settled, native_txid)
            VALUES (?, ?, ?, ?, ?, ?, ?, FALSE, 0)
            "#,
        )
        .bind(&foreign_txid[..])
        .bind(height as i64)
        .bind(timestamp)
        .bind(foreign_address)
        .bind(account_id as i64)
        .bind(foreign_amount)
        .bind(native_amount)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Mark a deposit settled: attach the native issuance transaction and
    /// move the row to the confirming block height. Idempotent.
    pub async fn mark_settled(
        &self,
        foreign_txid: &ForeignTxId,
        native_txid: u64,
        new_height: u32,
    ) -> ExchangeResult<bool> {
        let result = sqlx::query(
            "UPDATE deposit SET settled = TRUE, native_txid = ?, height = ? WHERE foreign_txid = ?",
        )
        .bind(native_txid as i64)
        .bind(new_height as i64)
        .bind(&foreign_txid[..])
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn exists(&self, foreign_txid: &ForeignTxId) -> ExchangeResult<bool> {
        let row = sqlx::query("SELECT 1 FROM deposit WHERE foreign_txid = ?")
            .bind(&foreign_txid[..])
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn get(&self, foreign_txid: &ForeignTxId) -> ExchangeResult<Option<DepositRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM deposit WHERE foreign_txid = ?",
            COLUMNS
        ))
        .bind(&foreign_txid[..])
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| DepositRecord::from_row(&r)))
    }

    /// List deposits in stable creation order, optionally filtered to one
    /// foreign address; with `include_settled` false only unsettled rows.
    pub async fn list(
        &self,
        address: Option<&str>,
        include_settled: bool,
    ) -> ExchangeResult<Vec<DepositRecord>> {
        let filter = match (address.is_some(), include_settled) {
            (true, true) => "WHERE foreign_address = ? ",
            (true, false) => "WHERE foreign_address = ? AND settled = FALSE ",
            (false, true) => "",
            (false, false) => "WHERE settled = FALSE ",
        };
        let sql = format!("SELECT {} FROM deposit {}ORDER BY db_id", COLUMNS, filter);

        let mut query = sqlx::query(&sql);
        if let Some(address) = address {
            query = query.bind(address);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.iter().map(DepositRecord::from_row).collect())
    }
}

/// Purge deposits at or above a reorged foreign height.
///
/// Runs on the caller's transaction so the deletion commits or fails
/// together with the block-index purge. The policy here is
/// [`RollbackPolicy::PurgeAll`]: the foreign chain is the chain-of-record
/// for deposit rows, so settlement state does not protect them.
pub(crate) async fn purge_at_or_above(
    conn: &mut SqliteConnection,
    policy: RollbackPolicy,
    height: u32,
) -> ExchangeResult<u64> {
    let sql = format!(
        "DELETE FROM deposit WHERE height >= ?{}",
        policy.settled_filter()
    );
    let result = sqlx::query(&sql).bind(height as i64).execute(conn).await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::{memory_pool, test_hash};
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    async fn ledger() -> DepositLedger {
        DepositLedger::new(memory_pool().await)
    }

    #[tokio::test]
    async fn duplicate_deposit_is_rejected() {
        let ledger = ledger().await;
        let b1 = test_hash(b"B1");
        assert!(ledger
            .record(&b1, 10, ts(1_500_000_000), "1abc", 500_000_000, 1000, 42)
            .await
            .unwrap());
        assert!(!ledger
            .record(&b1, 10, ts(1_500_000_000), "1abc", 500_000_000, 1000, 42)
            .await
            .unwrap());
        assert_eq!(ledger.list(None, true).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mark_settled_attaches_issuance_and_moves_height() {
        let ledger = ledger().await;
        let b1 = test_hash(b"B1");
        ledger
            .record(&b1, 10, ts(1_500_000_000), "1abc", 500_000_000, 1000, 42)
            .await
            .unwrap();

        assert!(ledger.mark_settled(&b1, 99, 12).await.unwrap());
        assert!(ledger.mark_settled(&b1, 99, 12).await.unwrap());

        let record = ledger.get(&b1).await.unwrap().unwrap();
        assert!(record.settled);
        assert_eq!(record.native_txid, 99);
        assert_eq!(record.height, 12);
        assert_eq!(record.timestamp, ts(1_500_000_000));

        assert!(!ledger.mark_settled(&test_hash(b"nope"), 1, 1).await.unwrap());
    }

    #[tokio::test]
    async fn list_filters_by_address_and_settlement() {
        let ledger = ledger().await;
        ledger
            .record(&test_hash(b"a1"), 5, ts(1), "1abc", 100, 1, 42)
            .await
            .unwrap();
        ledger
            .record(&test_hash(b"a2"), 6, ts(2), "1abc", 200, 2, 42)
            .await
            .unwrap();
        ledger
            .record(&test_hash(b"b1"), 7, ts(3), "1def", 300, 3, 43)
            .await
            .unwrap();
        ledger.mark_settled(&test_hash(b"a1"), 90, 5).await.unwrap();

        assert_eq!(ledger.list(None, true).await.unwrap().len(), 3);
        assert_eq!(ledger.list(None, false).await.unwrap().len(), 2);
        assert_eq!(ledger.list(Some("1abc"), true).await.unwrap().len(), 2);

        let pending_abc = ledger.list(Some("1abc"), false).await.unwrap();
        assert_eq!(pending_abc.len(), 1);
        assert_eq!(pending_abc[0].foreign_txid, test_hash(b"a2"));

        // creation order, not height order
        let all = ledger.list(None, true).await.unwrap();
        assert_eq!(all[0].foreign_txid, test_hash(b"a1"));
        assert_eq!(all[2].foreign_txid, test_hash(b"b1"));
    }
}
