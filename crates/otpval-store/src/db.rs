//! Replay-safe OATH record store over SQLite.
//!
//! One row per enrolled identity. The validation path only ever reads rows
//! and conditionally advances the acceptance counter; creation and deletion
//! are administrative operations.

use crate::error::{Result, StoreError};
use otpval_core::device::SecretRef;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};
use sqlx::Row;
use std::path::Path;

/// One enrolled identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OathRecord {
    pub identity: String,
    pub secret: SecretRef,
    pub counter: u64,
}

/// Store handle. Cheap to clone (pool is Arc internally).
#[derive(Clone)]
pub struct OathStore {
    pool: SqlitePool,
}

impl OathStore {
    /// Open (or create) the database at `db_path` and run migrations.
    ///
    /// WAL mode is configured at connection time, not in a migration, since
    /// SQLite refuses `journal_mode` changes inside a transaction.
    pub async fn open(db_path: &Path) -> Result<Self> {
        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePool::connect_with(opts).await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;
        Ok(Self { pool })
    }

    /// Fetch the record for `identity`, if enrolled.
    pub async fn get(&self, identity: &str) -> Result<Option<OathRecord>> {
        let row = sqlx::query(
            "SELECT key, nonce, key_handle, aead, oath_c FROM oath WHERE key = ?",
        )
        .bind(identity)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let corrupt = |detail: String| StoreError::Corrupt {
            identity: identity.to_string(),
            detail,
        };
        let nonce_hex: String = row.get("nonce");
        let aead_hex: String = row.get("aead");
        let key_handle: i64 = row.get("key_handle");
        let counter: i64 = row.get("oath_c");
        if counter < 0 {
            return Err(corrupt(format!("negative counter {counter}")));
        }
        Ok(Some(OathRecord {
            identity: row.get("key"),
            secret: SecretRef {
                key_handle: key_handle as u32,
                nonce: hex::decode(&nonce_hex).map_err(|e| corrupt(format!("nonce: {e}")))?,
                aead: hex::decode(&aead_hex).map_err(|e| corrupt(format!("aead: {e}")))?,
            },
            counter: counter as u64,
        }))
    }

    /// Atomically advance the acceptance counter for `identity`.
    ///
    /// Succeeds only when `new_counter` is strictly greater than the stored
    /// value at the moment of the update; the comparison and the write are
    /// one statement, so two racing validations of the same counter resolve
    /// to exactly one success.
    pub async fn try_advance_counter(&self, identity: &str, new_counter: u64) -> Result<bool> {
        let new_counter = i64::try_from(new_counter).map_err(|_| StoreError::Corrupt {
            identity: identity.to_string(),
            detail: format!("counter {new_counter} out of range"),
        })?;
        let result = sqlx::query("UPDATE oath SET oath_c = ?1 WHERE key = ?2 AND ?1 > oath_c")
            .bind(new_counter)
            .bind(identity)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Enroll a record. Administrative path; fails if the identity exists.
    pub async fn add(&self, record: &OathRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO oath (key, nonce, key_handle, aead, oath_c) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&record.identity)
        .bind(hex::encode(&record.secret.nonce))
        .bind(record.secret.key_handle as i64)
        .bind(hex::encode(&record.secret.aead))
        .bind(record.counter as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remove a record. Administrative path.
    pub async fn delete(&self, identity: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM oath WHERE key = ?")
            .bind(identity)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}
