//! Foreign-chain block index and reorg purge
//!
//! Tracks the foreign chain's accepted block sequence so the poller can
//! tell how far it has indexed and where a reorg begins. The purge path
//! owns deposit cleanup too: deposits are keyed by foreign block height and
//! must disappear together with their enclosing blocks.

use crate::error::ExchangeResult;
use crate::store::{deposit, hash_from_bytes, is_unique_violation, BlockId, RollbackPolicy};

use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use tracing::info;

/// One accepted foreign-chain block
#[derive(Debug, Clone)]
pub struct ChainBlockRecord {
    pub height: u32,
    pub block_id: BlockId,
}

impl ChainBlockRecord {
    fn from_row(row: &SqliteRow) -> Self {
        Self {
            height: row.get::<i64, _>("height") as u32,
            block_id: hash_from_bytes(row.get("block_id")),
        }
    }
}

/// Foreign-chain block index over the shared pool
pub struct BlockIndex {
    pool: SqlitePool,
    purge_policy: RollbackPolicy,
}

impl BlockIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            // the foreign chain is the chain-of-record: a retracted block
            // retracts its deposits, settled or not
            purge_policy: RollbackPolicy::PurgeAll,
        }
    }

    /// Highest indexed height, or 0 when nothing has been indexed.
    ///
    /// A query failure is returned as the error; callers must treat that as
    /// indeterminate and not proceed.
    pub async fn current_height(&self) -> ExchangeResult<u32> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(height) FROM block")
            .fetch_one(&self.pool)
            .await?;
        Ok(max.unwrap_or(0) as u32)
    }

    pub async fn block_id_at(&self, height: u32) -> ExchangeResult<Option<BlockId>> {
        let row = sqlx::query("SELECT height, block_id FROM block WHERE height = ?")
            .bind(height as i64)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| ChainBlockRecord::from_row(&r).block_id))
    }

    /// Append the next accepted block.
    ///
    /// Height continuity is the caller's responsibility; the index only
    /// rejects a duplicate height (`Ok(false)`).
    pub async fn record_block(&self, height: u32, block_id: &BlockId) -> ExchangeResult<bool> {
        let result = sqlx::query("INSERT INTO block (height, block_id) VALUES (?, ?)")
            .bind(height as i64)
            .bind(&block_id[..])
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Unwind a foreign-chain reorg starting at `height`.
    ///
    /// Deletes every deposit with height >= `height` and every indexed
    /// block with height >= `height` in one transaction; either both
    /// deletions commit or neither does.
    ///
    /// Unlike the redemption rollback this purge is unconditional: a
    /// settled deposit is removed too, even though the tokens it issued
    /// remain issued on the native chain. The retracted foreign branch is
    /// the higher truth for these rows.
    pub async fn pop_from(&self, height: u32) -> ExchangeResult<()> {
        let mut tx = self.pool.begin().await?;

        let deposits = deposit::purge_at_or_above(&mut *tx, self.purge_policy, height).await?;

        let blocks = sqlx::query("DELETE FROM block WHERE height >= ?")
            .bind(height as i64)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;

        info!(
            "Foreign rollback to height {}: removed {} blocks and {} deposits",
            height, blocks, deposits
        );
        Ok(())
    }
}
