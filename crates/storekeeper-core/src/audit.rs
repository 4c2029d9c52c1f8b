//! Append-only audit log of lifecycle events.
//!
//! Every registry mutation, retry, and recovery appends an entry here.
//! Entries are never updated or removed. Appending is best-effort
//! write-through: a failed append is logged by the caller but never rolls
//! back the mutation that triggered it.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;

use crate::store::AuditAction;

/// Default number of entries returned by [`AuditLog::list`].
pub const DEFAULT_LIST_LIMIT: usize = 100;

/// Upper bound on entries returned by a single [`AuditLog::list`] call.
pub const MAX_LIST_LIMIT: usize = 500;

/// One audit log entry.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    /// Monotone id (`SQLite` AUTOINCREMENT).
    pub id: i64,
    /// Store the entry refers to, if any.
    pub store_id: Option<String>,
    /// Action tag.
    pub action: AuditAction,
    /// Free-form details blob.
    pub details: serde_json::Value,
    /// Append time.
    pub created_at: DateTime<Utc>,
}

/// Errors from audit log operations.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// Underlying `SQLite` failure.
    #[error("audit query failed: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Handle to the append-only audit log.
///
/// Shares the registry's `SQLite` connection; cheap to clone.
#[derive(Debug, Clone)]
pub struct AuditLog {
    conn: Arc<Mutex<Connection>>,
}

impl AuditLog {
    /// Creates a handle over an existing connection. The schema must have
    /// been initialized by [`AuditLog::init_schema`].
    #[must_use]
    pub const fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Creates the `audit_log` table and its indices.
    pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                store_id TEXT,
                action TEXT NOT NULL,
                details TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_audit_log_store_id ON audit_log(store_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_audit_log_created_at ON audit_log(created_at)",
            [],
        )?;
        Ok(())
    }

    /// Appends an entry.
    ///
    /// Callers treat failures as non-fatal: log a warning and carry on.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Sqlite`] if the insert fails.
    pub fn append(
        &self,
        store_id: Option<&str>,
        action: AuditAction,
        details: serde_json::Value,
    ) -> Result<(), AuditError> {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute(
            "INSERT INTO audit_log (store_id, action, details, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![store_id, action.as_str(), details.to_string(), now],
        )?;
        Ok(())
    }

    /// Lists entries, newest first.
    ///
    /// `limit` is clamped to `[1, 500]`; `None` means 100.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Sqlite`] if the query fails.
    pub fn list(&self, limit: Option<usize>) -> Result<Vec<AuditEntry>, AuditError> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = conn.prepare(
            "SELECT id, store_id, action, details, created_at
             FROM audit_log ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], row_to_entry)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Lists all entries for one store, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Sqlite`] if the query fails.
    pub fn list_for(&self, store_id: &str) -> Result<Vec<AuditEntry>, AuditError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = conn.prepare(
            "SELECT id, store_id, action, details, created_at
             FROM audit_log WHERE store_id = ?1 ORDER BY id DESC",
        )?;
        let rows = stmt.query_map(params![store_id], row_to_entry)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEntry> {
    let action_raw: String = row.get(2)?;
    let details_raw: String = row.get(3)?;
    let created_raw: String = row.get(4)?;
    Ok(AuditEntry {
        id: row.get(0)?,
        store_id: row.get(1)?,
        action: action_raw.parse().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?,
        details: serde_json::from_str(&details_raw)
            .unwrap_or(serde_json::Value::String(details_raw)),
        created_at: parse_timestamp(&created_raw, 4)?,
    })
}

pub(crate) fn parse_timestamp(raw: &str, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                column,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}
