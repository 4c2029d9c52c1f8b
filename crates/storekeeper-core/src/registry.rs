//! Durable store registry backed by `SQLite`.
//!
//! Single-writer embedded database in WAL journaling mode for crash safety.
//! Every mutation refreshes `updated_at` and emits an audit entry; audit
//! append failures are logged and never roll back the mutation.
//!
//! # Schema
//!
//! The `stores` table has columns: `id` (PK), `name`, `engine`, `status`,
//! `store_url`, `admin_url`, `error_message`, `namespace`, `helm_release`,
//! `created_at`, `updated_at`, with an index on `status`.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;
use tracing::warn;

use crate::audit::{parse_timestamp, AuditLog};
use crate::store::{generate_store_id, EngineKind, Store, StoreStatus};

/// Errors from registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Could not create the database's parent directory.
    #[error("failed to prepare database directory: {0}")]
    Io(#[from] std::io::Error),

    /// Underlying `SQLite` failure.
    #[error("registry query failed: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// No store with the given id.
    #[error("store not found: {0}")]
    NotFound(String),

    /// The store is `deleted`; deleted is terminal.
    #[error("store {0} is deleted and cannot be modified")]
    Terminal(String),
}

/// Aggregate timing of completed provisioning runs, over stores currently
/// in status `ready`.
#[derive(Debug, Clone, Serialize)]
pub struct ProvisioningStats {
    /// Number of `ready` stores.
    pub total_provisioned: u64,
    /// Mean of `updated_at - created_at`, seconds.
    pub avg_seconds: Option<f64>,
    /// Minimum, seconds.
    pub min_seconds: Option<f64>,
    /// Maximum, seconds.
    pub max_seconds: Option<f64>,
}

/// Durable mapping from store identity to lifecycle state.
///
/// Cheap to clone; all clones share one connection. Reads and writes are
/// serialized through the connection mutex - the control plane is the single
/// writer by design.
#[derive(Debug, Clone)]
pub struct Registry {
    conn: Arc<Mutex<Connection>>,
    audit: AuditLog,
}

impl Registry {
    /// Opens (creating if needed) the registry database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Io`] if the parent directory cannot be
    /// created, or [`RegistryError::Sqlite`] if the database cannot be
    /// opened or migrated.
    pub fn open(path: &Path) -> Result<Self, RegistryError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::from_connection(conn)
    }

    /// Opens an in-memory registry. Test use.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Sqlite`] if schema creation fails.
    pub fn open_in_memory() -> Result<Self, RegistryError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, RegistryError> {
        Self::init_schema(&conn)?;
        AuditLog::init_schema(&conn)?;
        let conn = Arc::new(Mutex::new(conn));
        Ok(Self {
            audit: AuditLog::new(Arc::clone(&conn)),
            conn,
        })
    }

    /// Creates the `stores` table and its index.
    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS stores (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                engine TEXT NOT NULL,
                status TEXT NOT NULL,
                store_url TEXT,
                admin_url TEXT,
                error_message TEXT,
                namespace TEXT NOT NULL,
                helm_release TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_stores_status ON stores(status)",
            [],
        )?;
        Ok(())
    }

    /// Audit log handle sharing this registry's connection.
    #[must_use]
    pub fn audit(&self) -> AuditLog {
        self.audit.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn append_audit(
        &self,
        store_id: Option<&str>,
        action: crate::store::AuditAction,
        details: serde_json::Value,
    ) {
        if let Err(e) = self.audit.append(store_id, action, details) {
            warn!(error = %e, "audit append failed");
        }
    }

    /// Inserts a new store at status `queued` and emits audit `create`.
    ///
    /// The id, namespace, and release name are generated here and equal by
    /// construction.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Sqlite`] if the insert fails.
    pub fn create(&self, name: &str, engine: EngineKind) -> Result<Store, RegistryError> {
        let id = generate_store_id();
        let now = Utc::now();
        let now_raw = now.to_rfc3339_opts(SecondsFormat::Millis, true);
        {
            let conn = self.lock();
            conn.execute(
                "INSERT INTO stores (id, name, engine, status, namespace, helm_release, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    id,
                    name,
                    engine.as_str(),
                    StoreStatus::Queued.as_str(),
                    id,
                    id,
                    now_raw,
                    now_raw
                ],
            )?;
        }
        self.append_audit(
            Some(&id),
            crate::store::AuditAction::Create,
            json!({ "name": name, "engine": engine.as_str() }),
        );
        Ok(Store {
            id: id.clone(),
            name: name.to_string(),
            engine,
            status: StoreStatus::Queued,
            store_url: None,
            admin_url: None,
            error_message: None,
            namespace: id.clone(),
            helm_release: id,
            created_at: now,
            updated_at: now,
        })
    }

    /// Fetches a store by id.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Sqlite`] if the query fails.
    pub fn get(&self, id: &str) -> Result<Option<Store>, RegistryError> {
        let conn = self.lock();
        let store = conn
            .query_row(
                &format!("SELECT {STORE_COLUMNS} FROM stores WHERE id = ?1"),
                params![id],
                row_to_store,
            )
            .optional()?;
        Ok(store)
    }

    /// Lists all stores, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Sqlite`] if the query fails.
    pub fn list(&self) -> Result<Vec<Store>, RegistryError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {STORE_COLUMNS} FROM stores ORDER BY created_at DESC, rowid DESC"
        ))?;
        let rows = stmt.query_map([], row_to_store)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Number of stores counted toward the creation quota: everything not
    /// in {`deleted`, `failed`}.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Sqlite`] if the query fails.
    pub fn active_count(&self) -> Result<u32, RegistryError> {
        let conn = self.lock();
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM stores WHERE status NOT IN ('deleted', 'failed')",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Transitions a store's status and emits audit `status_change`.
    ///
    /// `error_message` replaces the stored message; `None` clears it.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for an unknown id and
    /// [`RegistryError::Terminal`] for a `deleted` store.
    pub fn update_status(
        &self,
        id: &str,
        status: StoreStatus,
        error_message: Option<&str>,
    ) -> Result<(), RegistryError> {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        {
            let conn = self.lock();
            check_mutable(&conn, id)?;
            conn.execute(
                "UPDATE stores SET status = ?1, error_message = ?2, updated_at = ?3 WHERE id = ?4",
                params![status.as_str(), error_message, now, id],
            )?;
        }
        self.append_audit(
            Some(id),
            crate::store::AuditAction::StatusChange,
            json!({ "status": status.as_str(), "error_message": error_message }),
        );
        Ok(())
    }

    /// Marks a store `ready`: sets URLs, clears the error, emits audit
    /// `status_change`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for an unknown id and
    /// [`RegistryError::Terminal`] for a `deleted` store.
    pub fn mark_ready(
        &self,
        id: &str,
        store_url: &str,
        admin_url: &str,
    ) -> Result<(), RegistryError> {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        {
            let conn = self.lock();
            check_mutable(&conn, id)?;
            conn.execute(
                "UPDATE stores SET status = 'ready', store_url = ?1, admin_url = ?2,
                 error_message = NULL, updated_at = ?3 WHERE id = ?4",
                params![store_url, admin_url, now, id],
            )?;
        }
        self.append_audit(
            Some(id),
            crate::store::AuditAction::StatusChange,
            json!({ "status": "ready", "store_url": store_url, "admin_url": admin_url }),
        );
        Ok(())
    }

    /// Marks a store `deleted` (terminal) and emits audit `delete`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for an unknown id and
    /// [`RegistryError::Terminal`] if it is already deleted.
    pub fn mark_deleted(&self, id: &str) -> Result<(), RegistryError> {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        {
            let conn = self.lock();
            check_mutable(&conn, id)?;
            conn.execute(
                "UPDATE stores SET status = 'deleted', updated_at = ?1 WHERE id = ?2",
                params![now, id],
            )?;
        }
        self.append_audit(
            Some(id),
            crate::store::AuditAction::Delete,
            json!({ "namespace": id }),
        );
        Ok(())
    }

    /// The `n` most recently failed stores, newest failure first.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Sqlite`] if the query fails.
    pub fn recent_failures(&self, n: usize) -> Result<Vec<Store>, RegistryError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {STORE_COLUMNS} FROM stores WHERE status = 'failed'
             ORDER BY updated_at DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![n as i64], row_to_store)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Count of stores per status.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Sqlite`] if the query fails.
    pub fn status_histogram(&self) -> Result<BTreeMap<String, u64>, RegistryError> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM stores GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Timing stats of `updated_at - created_at` over `ready` stores.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Sqlite`] if the query fails.
    pub fn provisioning_stats(&self) -> Result<ProvisioningStats, RegistryError> {
        let durations: Vec<f64> = {
            let conn = self.lock();
            let mut stmt = conn.prepare(
                "SELECT created_at, updated_at FROM stores WHERE status = 'ready'",
            )?;
            let rows = stmt.query_map([], |row| {
                let created = parse_timestamp(&row.get::<_, String>(0)?, 0)?;
                let updated = parse_timestamp(&row.get::<_, String>(1)?, 1)?;
                Ok(duration_seconds(created, updated))
            })?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        if durations.is_empty() {
            return Ok(ProvisioningStats {
                total_provisioned: 0,
                avg_seconds: None,
                min_seconds: None,
                max_seconds: None,
            });
        }

        #[allow(clippy::cast_precision_loss)]
        let count = durations.len() as f64;
        let avg = durations.iter().sum::<f64>() / count;
        Ok(ProvisioningStats {
            total_provisioned: durations.len() as u64,
            avg_seconds: Some(avg),
            min_seconds: durations.iter().copied().reduce(f64::min),
            max_seconds: durations.iter().copied().reduce(f64::max),
        })
    }
}

/// Rejects mutation of unknown or deleted stores.
fn check_mutable(conn: &Connection, id: &str) -> Result<(), RegistryError> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM stores WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    match status.as_deref() {
        None => Err(RegistryError::NotFound(id.to_string())),
        Some("deleted") => Err(RegistryError::Terminal(id.to_string())),
        Some(_) => Ok(()),
    }
}

const STORE_COLUMNS: &str = "id, name, engine, status, store_url, admin_url, error_message, \
                             namespace, helm_release, created_at, updated_at";

#[allow(clippy::cast_precision_loss)]
fn duration_seconds(
    created: chrono::DateTime<chrono::Utc>,
    updated: chrono::DateTime<chrono::Utc>,
) -> f64 {
    (updated - created).num_milliseconds() as f64 / 1000.0
}

fn row_to_store(row: &rusqlite::Row<'_>) -> rusqlite::Result<Store> {
    let engine_raw: String = row.get(2)?;
    let status_raw: String = row.get(3)?;
    Ok(Store {
        id: row.get(0)?,
        name: row.get(1)?,
        engine: engine_raw.parse().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?,
        status: status_raw.parse().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?,
        store_url: row.get(4)?,
        admin_url: row.get(5)?,
        error_message: row.get(6)?,
        namespace: row.get(7)?,
        helm_release: row.get(8)?,
        created_at: parse_timestamp(&row.get::<_, String>(9)?, 9)?,
        updated_at: parse_timestamp(&row.get::<_, String>(10)?, 10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::AuditAction;

    fn test_registry() -> Registry {
        Registry::open_in_memory().unwrap()
    }

    #[test]
    fn create_starts_queued_with_matching_names() {
        let registry = test_registry();
        let store = registry.create("Shop A", EngineKind::Woocommerce).unwrap();
        assert_eq!(store.status, StoreStatus::Queued);
        assert_eq!(store.namespace, store.id);
        assert_eq!(store.helm_release, store.id);
        assert!(store.store_url.is_none());

        let fetched = registry.get(&store.id).unwrap().unwrap();
        assert_eq!(fetched.name, "Shop A");
        assert_eq!(fetched.engine, EngineKind::Woocommerce);
    }

    #[test]
    fn create_emits_audit() {
        let registry = test_registry();
        let store = registry.create("Shop A", EngineKind::Woocommerce).unwrap();
        let entries = registry.audit().list_for(&store.id).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, AuditAction::Create);
        assert_eq!(entries[0].details["name"], "Shop A");
    }

    #[test]
    fn list_is_newest_first() {
        let registry = test_registry();
        let a = registry.create("A", EngineKind::Woocommerce).unwrap();
        let b = registry.create("B", EngineKind::Woocommerce).unwrap();
        let stores = registry.list().unwrap();
        assert_eq!(stores.len(), 2);
        assert_eq!(stores[0].id, b.id);
        assert_eq!(stores[1].id, a.id);
    }

    #[test]
    fn active_count_excludes_failed_and_deleted() {
        let registry = test_registry();
        let a = registry.create("A", EngineKind::Woocommerce).unwrap();
        let b = registry.create("B", EngineKind::Woocommerce).unwrap();
        let c = registry.create("C", EngineKind::Woocommerce).unwrap();
        assert_eq!(registry.active_count().unwrap(), 3);

        registry
            .update_status(&a.id, StoreStatus::Failed, Some("boom"))
            .unwrap();
        assert_eq!(registry.active_count().unwrap(), 2);

        registry
            .update_status(&b.id, StoreStatus::Deleting, None)
            .unwrap();
        registry.mark_deleted(&b.id).unwrap();
        assert_eq!(registry.active_count().unwrap(), 1);

        // Provisioning still counts.
        registry
            .update_status(&c.id, StoreStatus::Provisioning, None)
            .unwrap();
        assert_eq!(registry.active_count().unwrap(), 1);
    }

    #[test]
    fn update_status_unknown_store() {
        let registry = test_registry();
        let err = registry
            .update_status("store-ffffffff", StoreStatus::Failed, Some("x"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
    }

    #[test]
    fn mark_ready_sets_urls_and_clears_error() {
        let registry = test_registry();
        let store = registry.create("A", EngineKind::Woocommerce).unwrap();
        registry
            .update_status(&store.id, StoreStatus::Failed, Some("first attempt failed"))
            .unwrap();
        registry
            .mark_ready(&store.id, "http://s.example", "http://s.example/wp-admin")
            .unwrap();

        let fetched = registry.get(&store.id).unwrap().unwrap();
        assert_eq!(fetched.status, StoreStatus::Ready);
        assert_eq!(fetched.store_url.as_deref(), Some("http://s.example"));
        assert_eq!(
            fetched.admin_url.as_deref(),
            Some("http://s.example/wp-admin")
        );
        assert!(fetched.error_message.is_none());
    }

    #[test]
    fn deleted_is_terminal() {
        let registry = test_registry();
        let store = registry.create("A", EngineKind::Woocommerce).unwrap();
        registry.mark_deleted(&store.id).unwrap();

        assert!(matches!(
            registry.update_status(&store.id, StoreStatus::Provisioning, None),
            Err(RegistryError::Terminal(_))
        ));
        assert!(matches!(
            registry.mark_ready(&store.id, "u", "a"),
            Err(RegistryError::Terminal(_))
        ));
        assert!(matches!(
            registry.mark_deleted(&store.id),
            Err(RegistryError::Terminal(_))
        ));
    }

    #[test]
    fn failed_store_keeps_error_message() {
        let registry = test_registry();
        let store = registry.create("A", EngineKind::Woocommerce).unwrap();
        registry
            .update_status(&store.id, StoreStatus::Failed, Some("Provisioning timed out"))
            .unwrap();
        let fetched = registry.get(&store.id).unwrap().unwrap();
        assert_eq!(fetched.status, StoreStatus::Failed);
        assert_eq!(
            fetched.error_message.as_deref(),
            Some("Provisioning timed out")
        );
    }

    #[test]
    fn recent_failures_ordering_and_limit() {
        let registry = test_registry();
        for i in 0..7 {
            let store = registry.create(&format!("S{i}"), EngineKind::Woocommerce).unwrap();
            registry
                .update_status(&store.id, StoreStatus::Failed, Some("boom"))
                .unwrap();
        }
        let failures = registry.recent_failures(5).unwrap();
        assert_eq!(failures.len(), 5);
        assert!(failures
            .iter()
            .all(|s| s.status == StoreStatus::Failed && s.error_message.is_some()));
    }

    #[test]
    fn status_histogram_counts() {
        let registry = test_registry();
        let a = registry.create("A", EngineKind::Woocommerce).unwrap();
        registry.create("B", EngineKind::Woocommerce).unwrap();
        registry
            .update_status(&a.id, StoreStatus::Failed, Some("x"))
            .unwrap();

        let histogram = registry.status_histogram().unwrap();
        assert_eq!(histogram.get("queued"), Some(&1));
        assert_eq!(histogram.get("failed"), Some(&1));
    }

    #[test]
    fn provisioning_stats_empty_and_populated() {
        let registry = test_registry();
        let stats = registry.provisioning_stats().unwrap();
        assert_eq!(stats.total_provisioned, 0);
        assert!(stats.avg_seconds.is_none());

        let store = registry.create("A", EngineKind::Woocommerce).unwrap();
        registry.mark_ready(&store.id, "u", "a").unwrap();
        let stats = registry.provisioning_stats().unwrap();
        assert_eq!(stats.total_provisioned, 1);
        assert!(stats.avg_seconds.unwrap() >= 0.0);
        assert_eq!(stats.min_seconds, stats.max_seconds);
    }

    #[test]
    fn status_changes_emit_audit_in_order() {
        let registry = test_registry();
        let store = registry.create("A", EngineKind::Woocommerce).unwrap();
        registry
            .update_status(&store.id, StoreStatus::Provisioning, None)
            .unwrap();
        registry.mark_ready(&store.id, "u", "a").unwrap();

        let entries = registry.audit().list_for(&store.id).unwrap();
        // Newest first: ready, provisioning, create.
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].details["status"], "ready");
        assert_eq!(entries[1].details["status"], "provisioning");
        assert_eq!(entries[2].action, AuditAction::Create);
    }
}
