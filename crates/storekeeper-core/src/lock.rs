//! Per-store operation lock.
//!
//! Process-wide mapping from store id to the lifecycle operation currently
//! executing against it. At most one operation per store at any time; the
//! second writer on the same id observes the held kind instead of entering.
//!
//! The lock is advisory and in-process only. After a crash it starts empty;
//! correctness is re-established by the startup reconciler together with the
//! chart deployer's own release-exists idempotency.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use serde::Serialize;

/// Kind of lifecycle operation holding a store's lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Provision workflow (install + readiness poll).
    Provisioning,
    /// Delete workflow (uninstall + cascade delete).
    Deleting,
}

impl OperationKind {
    /// Wire form of the operation kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Deleting => "deleting",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// In-process per-store mutex over lifecycle operations.
#[derive(Debug, Default)]
pub struct OperationLock {
    held: Mutex<HashMap<String, OperationKind>>,
}

impl OperationLock {
    /// Creates an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts to claim the lock for `store_id`.
    ///
    /// # Errors
    ///
    /// Returns the currently held kind if another operation is active.
    pub fn claim(&self, store_id: &str, kind: OperationKind) -> Result<(), OperationKind> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(active) = held.get(store_id) {
            return Err(*active);
        }
        held.insert(store_id.to_string(), kind);
        Ok(())
    }

    /// Releases the lock for `store_id`. Releasing an unheld lock is a no-op.
    pub fn release(&self, store_id: &str) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        held.remove(store_id);
    }

    /// The operation currently holding `store_id`, if any.
    #[must_use]
    pub fn get(&self, store_id: &str) -> Option<OperationKind> {
        let held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        held.get(store_id).copied()
    }

    /// Number of stores with an active operation.
    #[must_use]
    pub fn len(&self) -> usize {
        let held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        held.len()
    }

    /// Whether no operation is active.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
