//! Redemption ledger: native-chain redemptions awaiting foreign payout
//!
//! One row per observed native redemption transaction, keyed by the native
//! transaction id. The row with native_txid = 0 is the sentinel: it is never
//! a real redemption and carries the schema version, the persisted exchange
//! rate, and a description string.

use crate::error::ExchangeResult;
use crate::rate;
use crate::store::{hash_from_bytes, is_unique_violation, ForeignTxId, RollbackPolicy};

use rust_decimal::Decimal;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use tracing::debug;

/// One native-chain redemption request
#[derive(Debug, Clone)]
pub struct RedemptionRecord {
    pub native_txid: u64,
    pub sender: u64,
    pub height: u32,
    pub settled: bool,
    pub native_amount: i64,
    /// Foreign payout amount in 8-fractional-digit minor units, frozen at
    /// the rate in effect when the redemption was observed
    pub foreign_amount: i64,
    pub foreign_address: String,
    /// Foreign settlement transaction, present only once settled
    pub foreign_txid: Option<ForeignTxId>,
}

impl RedemptionRecord {
    fn from_row(row: &SqliteRow) -> Self {
        Self {
            native_txid: row.get::<i64, _>("native_txid") as u64,
            sender: row.get::<i64, _>("sender") as u64,
            height: row.get::<i64, _>("height") as u32,
            settled: row.get("settled"),
            native_amount: row.get("native_amount"),
            foreign_amount: row.get("foreign_amount"),
            foreign_address: row.get("foreign_address"),
            foreign_txid: row
                .get::<Option<Vec<u8>>, _>("foreign_txid")
                .map(hash_from_bytes),
        }
    }
}

const COLUMNS: &str =
    "native_txid, sender, height, settled, native_amount, foreign_amount, foreign_address, foreign_txid";

/// Redemption ledger over the shared pool
pub struct RedemptionLedger {
    pool: SqlitePool,
    policy: RollbackPolicy,
}

impl RedemptionLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            // a payout already executed must survive any native reorg
            policy: RollbackPolicy::KeepSettled,
        }
    }

    /// Record a new unsettled redemption.
    ///
    /// Returns `Ok(false)` when the native transaction id is already
    /// recorded; the native chain re-delivers transactions and that is not
    /// an error.
    pub async fn record(
        &self,
        native_txid: u64,
        sender: u64,
        height: u32,
        native_amount: i64,
        foreign_amount: i64,
        foreign_address: &str,
    ) -> ExchangeResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO redemption
                (native_txid, sender, height, settled, native_amount, foreign_amount, foreign_address)
            VALUES (?, ?, ?, FALSE, ?, ?, ?)
            "#,
        )
        .bind(native_txid as i64)
        .bind(sender as i64)
        .bind(height as i64)
        .bind(native_amount)
        .bind(foreign_amount)
        .bind(foreign_address)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Mark a redemption settled and attach the foreign payout transaction.
    ///
    /// Idempotent: repeating the call with the same arguments leaves the
    /// same final state. There is no path back to unsettled. Returns
    /// `Ok(false)` when the record does not exist.
    pub async fn mark_settled(
        &self,
        native_txid: u64,
        foreign_txid: &ForeignTxId,
    ) -> ExchangeResult<bool> {
        let result = sqlx::query(
            "UPDATE redemption SET settled = TRUE, foreign_txid = ? WHERE native_txid = ? AND native_txid <> 0",
        )
        .bind(&foreign_txid[..])
        .bind(native_txid as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn exists(&self, native_txid: u64) -> ExchangeResult<bool> {
        let row = sqlx::query("SELECT 1 FROM redemption WHERE native_txid = ?")
            .bind(native_txid as i64)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn get(&self, native_txid: u64) -> ExchangeResult<Option<RedemptionRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM redemption WHERE native_txid = ?",
            COLUMNS
        ))
        .bind(native_txid as i64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| RedemptionRecord::from_row(&r)))
    }

    /// List redemptions above the given height, ascending.
    ///
    /// The floor is at least 1 so the sentinel row never appears. With
    /// `include_settled` false only unsettled records are returned.
    pub async fn list_above(
        &self,
        height: u32,
        include_settled: bool,
    ) -> ExchangeResult<Vec<RedemptionRecord>> {
        let sql = format!(
            "SELECT {} FROM redemption WHERE {}height > ? ORDER BY height ASC",
            COLUMNS,
            if include_settled { "" } else { "settled = FALSE AND " }
        );
        let rows = sqlx::query(&sql)
            .bind(std::cmp::max(1, height) as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(RedemptionRecord::from_row).collect())
    }

    /// List unsettled redemptions at or below the given height, ascending.
    ///
    /// These are the redemptions with enough native confirmations to be
    /// paid out on the foreign side.
    pub async fn list_pending_at_or_below(
        &self,
        height: u32,
    ) -> ExchangeResult<Vec<RedemptionRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM redemption
             WHERE settled = FALSE AND height > 0 AND height <= ?
             ORDER BY height ASC",
            COLUMNS
        ))
        .bind(height as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(RedemptionRecord::from_row).collect())
    }

    /// Delete a single redemption. Refuses the sentinel.
    pub async fn delete(&self, native_txid: u64) -> ExchangeResult<bool> {
        if native_txid == 0 {
            return Ok(false);
        }
        let result = sqlx::query("DELETE FROM redemption WHERE native_txid = ?")
            .bind(native_txid as i64)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Roll the ledger back after a native-chain reorg.
    ///
    /// Removes unsettled records above `height`; settled records are never
    /// touched, whatever their height. `rollback(0)` is the total-reset
    /// form under the same protection. Returns the number of rows removed.
    pub async fn rollback(&self, height: u32) -> ExchangeResult<u64> {
        let sql = format!(
            "DELETE FROM redemption WHERE height > ?{}",
            self.policy.settled_filter()
        );
        let result = sqlx::query(&sql)
            .bind(height as i64)
            .execute(&self.pool)
            .await?;

        let removed = result.rows_affected();
        if removed > 0 {
            debug!("Rolled back {} unsettled redemptions above height {}", removed, height);
        }
        Ok(removed)
    }

    /// Read the persisted exchange rate from the sentinel row.
    ///
    /// A stored zero means no rate has been persisted yet and the caller's
    /// compiled-in default applies.
    pub async fn stored_rate(&self) -> ExchangeResult<Option<Decimal>> {
        let raw: Option<i64> =
            sqlx::query_scalar("SELECT foreign_amount FROM redemption WHERE native_txid = 0")
                .fetch_optional(&self.pool)
                .await?;
        Ok(raw.filter(|&r| r != 0).map(rate::decode))
    }

    /// Persist the exchange rate into the sentinel row
    pub async fn store_rate(&self, raw_rate: i64) -> ExchangeResult<bool> {
        let result = sqlx::query("UPDATE redemption SET foreign_amount = ? WHERE native_txid = 0")
            .bind(raw_rate)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Read the sentinel's description text
    pub async fn description(&self) -> ExchangeResult<Option<String>> {
        let text: Option<String> =
            sqlx::query_scalar("SELECT foreign_address FROM redemption WHERE native_txid = 0")
                .fetch_optional(&self.pool)
                .await?;
        Ok(text)
    }

    /// Set the sentinel's description text
    pub async fn set_description(&self, text: &str) -> ExchangeResult<bool> {
        let result = sqlx::query("UPDATE redemption SET foreign_address = ? WHERE native_txid = 0")
            .bind(text)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
