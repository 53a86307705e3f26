//! Fingerprint bookkeeping.
//!
//! This module manages the table that remembers, per reconciled table, the
//! fingerprint of the descriptor it was last brought in line with. All
//! writes happen on the connection of the run's transaction.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tracing::warn;

use crate::error::Result;
use crate::fingerprint::Fingerprint;

/// Default name of the bookkeeping table.
pub const DEFAULT_STORE_TABLE: &str = "oxide_schema_fingerprints";

/// A stored fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintRecord {
    /// Reconciled table.
    pub table_name: String,
    /// Fingerprint of the descriptor the table was reconciled to.
    pub fingerprint: Fingerprint,
    /// When the record was last written.
    pub updated_at: DateTime<Utc>,
}

/// Handle to the bookkeeping table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintStore {
    table: String,
}

impl Default for FingerprintStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FingerprintStore {
    /// Creates a store using [`DEFAULT_STORE_TABLE`].
    #[must_use]
    pub fn new() -> Self {
        Self::named(DEFAULT_STORE_TABLE)
    }

    /// Creates a store using a custom table name.
    #[must_use]
    pub fn named(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
        }
    }

    /// Returns the bookkeeping table name.
    #[must_use]
    pub fn table_name(&self) -> &str {
        &self.table
    }

    fn quoted(&self) -> String {
        format!("\"{}\"", self.table.replace('"', "\"\""))
    }

    /// Checks whether the bookkeeping table exists.
    pub async fn exists(&self, conn: &mut SqliteConnection) -> Result<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?")
                .bind(&self.table)
                .fetch_optional(&mut *conn)
                .await?;
        Ok(row.is_some())
    }

    /// Creates the bookkeeping table if it does not exist.
    pub async fn ensure_table(&self, conn: &mut SqliteConnection) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (\n  \
             table_name TEXT PRIMARY KEY,\n  \
             fingerprint BLOB NOT NULL,\n  \
             updated_at INTEGER NOT NULL\n)",
            self.quoted()
        );
        sqlx::query(&sql).execute(&mut *conn).await?;
        Ok(())
    }

    /// Loads every stored fingerprint, keyed by table name.
    ///
    /// A missing bookkeeping table reads as empty.
    pub async fn load(&self, conn: &mut SqliteConnection) -> Result<HashMap<String, Fingerprint>> {
        Ok(self
            .records(conn)
            .await?
            .into_iter()
            .map(|r| (r.table_name, r.fingerprint))
            .collect())
    }

    /// Gets all records, ordered by table name.
    pub async fn records(&self, conn: &mut SqliteConnection) -> Result<Vec<FingerprintRecord>> {
        if !self.exists(conn).await? {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT table_name, fingerprint, updated_at FROM {} ORDER BY table_name",
            self.quoted()
        );
        let rows: Vec<(String, Vec<u8>, i64)> =
            sqlx::query_as(&sql).fetch_all(&mut *conn).await?;

        let mut records = Vec::with_capacity(rows.len());
        for (table_name, bytes, updated_at) in rows {
            // Malformed records fall back to a full diff.
            let Some(fingerprint) = Fingerprint::from_bytes(&bytes) else {
                warn!(table = %table_name, "Ignoring malformed stored fingerprint");
                continue;
            };
            records.push(FingerprintRecord {
                table_name,
                fingerprint,
                updated_at: DateTime::from_timestamp(updated_at, 0).unwrap_or_default(),
            });
        }
        Ok(records)
    }

    /// Writes the fingerprint for a table, replacing any previous record.
    pub async fn record(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        fingerprint: &Fingerprint,
    ) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (table_name, fingerprint, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT (table_name) DO UPDATE SET \
             fingerprint = excluded.fingerprint, updated_at = excluded.updated_at",
            self.quoted()
        );
        sqlx::query(&sql)
            .bind(table)
            .bind(fingerprint.as_bytes())
            .bind(Utc::now().timestamp())
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Removes the record for a table. Returns true if one existed.
    pub async fn forget(&self, conn: &mut SqliteConnection, table: &str) -> Result<bool> {
        if !self.exists(conn).await? {
            return Ok(false);
        }
        let sql = format!("DELETE FROM {} WHERE table_name = ?", self.quoted());
        let result = sqlx::query(&sql).bind(table).execute(&mut *conn).await?;
        Ok(result.rows_affected() > 0)
    }
}
