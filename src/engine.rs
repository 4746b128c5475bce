//! Reconciliation engine for the two exchange directions
//!
//! Coordinates the cross-component rules the individual ledgers cannot
//! enforce alone: amounts are computed at the rate in effect at ingestion
//! and frozen into the record, unmapped deposits are dropped rather than
//! stored, reorgs on either chain are routed to the right rollback policy,
//! and at most one foreign payout is initiated per redemption.
//!
//! The engine is driven by two external, independently serialized callers:
//! the native-chain block processor (`on_block_pushed` / `on_block_popped`)
//! and the foreign-chain poller (`on_foreign_block_accepted` /
//! `on_foreign_reorg`).

use crate::config::{ExchangeConfig, Settings};
use crate::error::{ExchangeError, ExchangeResult};
use crate::rate;
use crate::store::{
    self, AccountDirectory, BlockId, BlockIndex, DepositLedger, DepositRecord, ForeignTxId,
    RedemptionLedger, RedemptionRecord, SchemaManager,
};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqlitePool;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// A redemption transaction observed in a pushed native block
#[derive(Debug, Clone)]
pub struct RedemptionRequest {
    pub native_txid: u64,
    pub sender: u64,
    /// Token units being redeemed
    pub native_amount: i64,
    /// Foreign address the payout goes to
    pub foreign_address: String,
}

/// A deposit transaction observed in an accepted foreign block
#[derive(Debug, Clone)]
pub struct DepositNotice {
    pub foreign_txid: ForeignTxId,
    pub foreign_address: String,
    /// Deposited amount in 8-fractional-digit minor units
    pub foreign_amount: i64,
    pub timestamp: DateTime<Utc>,
}

/// Cross-chain exchange reconciliation engine
pub struct ReconciliationEngine {
    pool: SqlitePool,
    redemptions: RedemptionLedger,
    deposits: DepositLedger,
    accounts: AccountDirectory,
    blocks: BlockIndex,
    config: ExchangeConfig,
    /// Cached exchange rate, mirrored from the sentinel row. Every update
    /// writes storage first and touches this only on confirmed persistence.
    rate: RwLock<Decimal>,
}

impl ReconciliationEngine {
    /// Open the exchange database, bootstrap or migrate the schema, and
    /// load the persisted exchange rate.
    ///
    /// Errors here are fatal to the caller: the system must not run
    /// against an unknown or unreachable layout.
    pub async fn open(settings: &Settings) -> ExchangeResult<Self> {
        let pool = store::connect(&settings.database).await?;

        SchemaManager::new(pool.clone(), settings.exchange.default_rate)
            .initialize()
            .await?;

        let redemptions = RedemptionLedger::new(pool.clone());
        let stored = redemptions.stored_rate().await?;
        let rate = stored.unwrap_or(settings.exchange.default_rate);
        info!("Exchange rate at startup: {} ({})", rate,
            if stored.is_some() { "persisted" } else { "default" });

        Ok(Self {
            deposits: DepositLedger::new(pool.clone()),
            accounts: AccountDirectory::new(pool.clone()),
            blocks: BlockIndex::new(pool.clone()),
            pool,
            redemptions,
            config: settings.exchange.clone(),
            rate: RwLock::new(rate),
        })
    }

    /// Current exchange rate (foreign units per token unit)
    pub async fn exchange_rate(&self) -> Decimal {
        *self.rate.read().await
    }

    /// Update the exchange rate.
    ///
    /// The rate must be strictly positive. Storage is written first; the
    /// cached rate changes only once persistence is confirmed, so a failed
    /// write leaves the previous rate in effect.
    pub async fn set_exchange_rate(&self, new_rate: Decimal) -> ExchangeResult<()> {
        if new_rate <= Decimal::ZERO {
            return Err(ExchangeError::InvalidRate(new_rate));
        }
        let raw = rate::encode(new_rate).ok_or(ExchangeError::InvalidRate(new_rate))?;

        if !self.redemptions.store_rate(raw).await? {
            return Err(ExchangeError::InvariantViolation(
                "sentinel row missing, cannot persist exchange rate".to_string(),
            ));
        }

        *self.rate.write().await = new_rate.normalize();
        info!("Exchange rate set to {}", new_rate);
        Ok(())
    }

    /// Ingest the redemption transactions of a pushed native block.
    ///
    /// The foreign payout amount is computed at the current rate and frozen
    /// into the record. A duplicate native transaction id is a benign
    /// re-observation, not an error.
    pub async fn on_block_pushed(
        &self,
        height: u32,
        redemptions: &[RedemptionRequest],
    ) -> ExchangeResult<()> {
        let rate = *self.rate.read().await;

        for tx in redemptions {
            let foreign_amount = rate::foreign_amount(tx.native_amount, rate)
                .ok_or(ExchangeError::InvalidRate(rate))?;

            let stored = self
                .redemptions
                .record(
                    tx.native_txid,
                    tx.sender,
                    height,
                    tx.native_amount,
                    foreign_amount,
                    &tx.foreign_address,
                )
                .await?;

            if stored {
                info!(
                    "Redemption {} at height {}: {} units -> {} to {}",
                    tx.native_txid, height, tx.native_amount, foreign_amount, tx.foreign_address
                );
            } else {
                debug!("Redemption {} already recorded", tx.native_txid);
            }
        }
        Ok(())
    }

    /// Unwind a native-chain reorg down to `height`.
    ///
    /// Unsettled redemptions above the height are removed; settled ones are
    /// permanent. The host's block-application lock serializes this against
    /// redemption ingestion.
    pub async fn on_block_popped(&self, height: u32) -> ExchangeResult<()> {
        let removed = self.redemptions.rollback(height).await?;
        if removed > 0 {
            info!("Native rollback to height {}: removed {} pending redemptions", height, removed);
        }
        Ok(())
    }

    /// Index an accepted foreign block and ingest its deposits.
    ///
    /// Deposits from addresses with no directory binding are dropped: an
    /// unmapped deposit must never become a stored obligation for nobody.
    pub async fn on_foreign_block_accepted(
        &self,
        height: u32,
        block_id: &BlockId,
        deposits: &[DepositNotice],
    ) -> ExchangeResult<()> {
        let rate = *self.rate.read().await;

        if !self.blocks.record_block(height, block_id).await? {
            debug!("Foreign block {} already indexed", height);
        }

        for dep in deposits {
            let binding = match self.accounts.lookup_by_address(&dep.foreign_address).await? {
                Some(binding) => binding,
                None => {
                    warn!(
                        "Deposit {} from unbound address {}, ignored",
                        hex::encode(dep.foreign_txid),
                        dep.foreign_address
                    );
                    continue;
                }
            };

            let native_amount = rate::native_amount(dep.foreign_amount, rate)
                .ok_or(ExchangeError::InvalidRate(rate))?;

            let stored = self
                .deposits
                .record(
                    &dep.foreign_txid,
                    height,
                    dep.timestamp,
                    &dep.foreign_address,
                    dep.foreign_amount,
                    native_amount,
                    binding.account_id,
                )
                .await?;

            if stored {
                info!(
                    "Deposit {} at height {}: {} -> {} units for account {}",
                    hex::encode(dep.foreign_txid),
                    height,
                    dep.foreign_amount,
                    native_amount,
                    binding.account_id
                );
            } else {
                debug!("Deposit {} already recorded", hex::encode(dep.foreign_txid));
            }
        }
        Ok(())
    }

    /// Unwind a foreign-chain reorg starting at `height`: the indexed
    /// blocks and their deposits, settled or not, go together.
    pub async fn on_foreign_reorg(&self, height: u32) -> ExchangeResult<()> {
        self.blocks.pop_from(height).await
    }

    /// Redemptions with enough native confirmations to be paid out,
    /// oldest first
    pub async fn payable_redemptions(
        &self,
        chain_height: u32,
    ) -> ExchangeResult<Vec<RedemptionRecord>> {
        let horizon = chain_height.saturating_sub(self.config.native_confirmations);
        self.redemptions.list_pending_at_or_below(horizon).await
    }

    /// Record a confirmed foreign payout for a redemption.
    ///
    /// The settled check before the write is what keeps payouts
    /// at-most-once: a redemption that is already settled reports success
    /// without touching the stored payout transaction, so a retrying caller
    /// never initiates a second payout.
    pub async fn settle_redemption(
        &self,
        native_txid: u64,
        foreign_txid: &ForeignTxId,
    ) -> ExchangeResult<bool> {
        match self.redemptions.get(native_txid).await? {
            None => {
                warn!("Cannot settle unknown redemption {}", native_txid);
                Ok(false)
            }
            Some(record) if record.settled => {
                debug!("Redemption {} already settled", native_txid);
                Ok(true)
            }
            Some(_) => {
                let updated = self.redemptions.mark_settled(native_txid, foreign_txid).await?;
                if updated {
                    info!(
                        "Redemption {} settled by foreign tx {}",
                        native_txid,
                        hex::encode(foreign_txid)
                    );
                }
                Ok(updated)
            }
        }
    }

    /// Deposits still awaiting native issuance, in creation order
    pub async fn pending_issuances(&self) -> ExchangeResult<Vec<DepositRecord>> {
        self.deposits.list(None, false).await
    }

    /// Record a completed native issuance for a deposit
    pub async fn settle_deposit(
        &self,
        foreign_txid: &ForeignTxId,
        native_txid: u64,
        height: u32,
    ) -> ExchangeResult<bool> {
        let updated = self.deposits.mark_settled(foreign_txid, native_txid, height).await?;
        if updated {
            info!(
                "Deposit {} settled by native tx {} at height {}",
                hex::encode(foreign_txid),
                native_txid,
                height
            );
        } else {
            warn!("Cannot settle unknown deposit {}", hex::encode(foreign_txid));
        }
        Ok(updated)
    }

    /// Highest foreign height whose deposits have enough confirmations
    pub async fn confirmed_foreign_height(&self) -> ExchangeResult<u32> {
        let indexed = self.blocks.current_height().await?;
        Ok(indexed.saturating_sub(self.config.foreign_confirmations))
    }

    pub fn accounts(&self) -> &AccountDirectory {
        &self.accounts
    }

    pub fn redemptions(&self) -> &RedemptionLedger {
        &self.redemptions
    }

    pub fn deposits(&self) -> &DepositLedger {
        &self.deposits
    }

    pub fn blocks(&self) -> &BlockIndex {
        &self.blocks
    }

    /// Close the underlying pool. Pending operations fail afterwards.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
