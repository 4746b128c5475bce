//! Error types for the exchange reconciliation core

use thiserror::Error;

/// Main error type for exchange operations
#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Exchange database version {stored} is newer than supported version {supported}")]
    UnsupportedVersion { stored: u32, supported: u32 },

    #[error("Invalid exchange rate: {0}")]
    InvalidRate(rust_decimal::Decimal),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

impl ExchangeError {
    /// Check if the error must abort the process.
    ///
    /// Ledger operations degrade to a reported failure on storage trouble,
    /// but an unknown schema layout or a broken caller contract cannot be
    /// recovered from at runtime.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ExchangeError::UnsupportedVersion { .. } | ExchangeError::InvariantViolation(_)
        )
    }
}

/// Result type for exchange operations
pub type ExchangeResult<T> = Result<T, ExchangeError>;
