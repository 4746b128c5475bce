//! Account directory: foreign address <-> native account bindings
//!
//! A binding is a one-way, permanent commitment. Both keys are unique, the
//! uniqueness is enforced by the storage indexes rather than pre-checked,
//! and there is no update or delete path.

use crate::error::ExchangeResult;
use crate::store::{hash_from_bytes, is_unique_violation};

use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;

/// One foreign address bound to one native account
#[derive(Debug, Clone)]
pub struct AccountBinding {
    pub foreign_address: String,
    pub account_id: u64,
    /// Native account public key captured at binding time, if known
    pub public_key: Option<[u8; 32]>,
}

impl AccountBinding {
    fn from_row(row: &SqliteRow) -> Self {
        Self {
            foreign_address: row.get("foreign_address"),
            account_id: row.get::<i64, _>("account_id") as u64,
            public_key: row
                .get::<Option<Vec<u8>>, _>("public_key")
                .map(hash_from_bytes),
        }
    }
}

/// Account directory over the shared pool
pub struct AccountDirectory {
    pool: SqlitePool,
}

impl AccountDirectory {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a binding.
    ///
    /// Returns `Ok(false)` without mutation when either the address or the
    /// account id is already bound elsewhere.
    pub async fn bind(
        &self,
        account_id: u64,
        foreign_address: &str,
        public_key: Option<[u8; 32]>,
    ) -> ExchangeResult<bool> {
        let result = sqlx::query(
            "INSERT INTO account (foreign_address, account_id, public_key) VALUES (?, ?, ?)",
        )
        .bind(foreign_address)
        .bind(account_id as i64)
        .bind(public_key.map(|k| k.to_vec()))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn lookup_by_address(
        &self,
        foreign_address: &str,
    ) -> ExchangeResult<Option<AccountBinding>> {
        let row = sqlx::query(
            "SELECT foreign_address, account_id, public_key FROM account WHERE foreign_address = ?",
        )
        .bind(foreign_address)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| AccountBinding::from_row(&r)))
    }

    pub async fn lookup_by_account(
        &self,
        account_id: u64,
    ) -> ExchangeResult<Option<AccountBinding>> {
        let row = sqlx::query(
            "SELECT foreign_address, account_id, public_key FROM account WHERE account_id = ?",
        )
        .bind(account_id as i64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| AccountBinding::from_row(&r)))
    }

    /// All bindings in stable creation order
    pub async fn list_all(&self) -> ExchangeResult<Vec<AccountBinding>> {
        let rows = sqlx::query(
            "SELECT foreign_address, account_id, public_key FROM account ORDER BY db_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(AccountBinding::from_row).collect())
    }
}
