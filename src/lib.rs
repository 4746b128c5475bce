//! Token exchange reconciliation core
//!
//! Bridges a token ledger (the native chain) and a Bitcoin-style ledger
//! (the foreign chain) so that value redeemed on one side is paid out or
//! issued on the other exactly once, even when either chain later
//! reorganizes. The crate owns the persistent record model for pending and
//! settled exchanges, the reorg-safe rollback protocol, the account
//! directory, and the schema migration sequence.
//!
//! The host blockchain engine, wallet RPC clients, and the chain-following
//! poller are external collaborators: the native block processor drives
//! [`ReconciliationEngine::on_block_pushed`] / `on_block_popped`, the
//! foreign poller drives `on_foreign_block_accepted` / `on_foreign_reorg`,
//! and whatever broadcasts settlement transactions reports back through
//! `settle_redemption` / `settle_deposit`.
//!
//! The two rollback directions are deliberately asymmetric: a native reorg
//! never removes a settled redemption (the foreign payout already
//! happened), while a foreign reorg removes deposits unconditionally
//! because the foreign chain is the chain-of-record for those rows. See
//! [`store::RollbackPolicy`].

pub mod config;
pub mod engine;
pub mod error;
pub mod rate;
pub mod store;

pub use config::{DatabaseConfig, ExchangeConfig, Settings};
pub use engine::{DepositNotice, ReconciliationEngine, RedemptionRequest};
pub use error::{ExchangeError, ExchangeResult};
pub use store::{
    AccountBinding, AccountDirectory, BlockId, BlockIndex, ChainBlockRecord, DepositLedger,
    DepositRecord, ForeignTxId, RedemptionLedger, RedemptionRecord, RollbackPolicy, SchemaManager,
    SCHEMA_VERSION,
};
