//! Store model: the central entity of the control plane.
//!
//! A store is identified by `store-XXXXXXXX` (eight hex digits taken from
//! the first group of a v4 UUID). The id doubles as the Kubernetes
//! namespace name and the Helm release name, which keeps resource addresses
//! stable across retries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a store.
///
/// Transitions:
///
/// ```text
/// (create) -> queued -> provisioning -> ready
///                          |              |
///                          v              |
///                        failed --retry---+
///                          |
/// queued/provisioning/ready/failed -> deleting -> deleted (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreStatus {
    /// Created, waiting for the provision workflow to pick it up.
    Queued,
    /// Chart install issued, readiness poll in progress.
    Provisioning,
    /// All pods ready; URLs are set.
    Ready,
    /// Provisioning or deletion failed; `error_message` says why.
    Failed,
    /// Delete workflow in progress.
    Deleting,
    /// Terminal. No further mutation is accepted.
    Deleted,
}

impl StoreStatus {
    /// Wire form of the status (snake_case, matches the persisted form).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Provisioning => "provisioning",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
        }
    }

    /// Whether the status counts toward the creation quota.
    ///
    /// Active means not in {deleted, failed}.
    #[must_use]
    pub const fn is_active(self) -> bool {
        !matches!(self, Self::Deleted | Self::Failed)
    }
}

impl std::fmt::Display for StoreStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StoreStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "provisioning" => Ok(Self::Provisioning),
            "ready" => Ok(Self::Ready),
            "failed" => Ok(Self::Failed),
            "deleting" => Ok(Self::Deleting),
            "deleted" => Ok(Self::Deleted),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// Error returned when parsing an unknown status string.
#[derive(Debug, thiserror::Error)]
#[error("unknown store status: {0}")]
pub struct ParseStatusError(String);

/// E-commerce engine tag.
///
/// An engine names the strategy used to parameterize the chart for a
/// specific e-commerce stack; see [`crate::engine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// WordPress + WooCommerce on MySQL.
    Woocommerce,
    /// Medusa. Registered but not yet available.
    Medusa,
}

impl EngineKind {
    /// Wire form of the engine tag.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Woocommerce => "woocommerce",
            Self::Medusa => "medusa",
        }
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EngineKind {
    type Err = ParseEngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "woocommerce" => Ok(Self::Woocommerce),
            "medusa" => Ok(Self::Medusa),
            other => Err(ParseEngineError(other.to_string())),
        }
    }
}

/// Error returned when parsing an unknown engine tag.
#[derive(Debug, thiserror::Error)]
#[error("unknown engine: {0}")]
pub struct ParseEngineError(String);

/// A provisioned (or in-flight) tenant store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    /// Unique id, `store-<8 hex chars>`. Also the namespace and release name.
    pub id: String,
    /// Operator-provided display name (2-100 chars after trim).
    pub name: String,
    /// Engine tag.
    pub engine: EngineKind,
    /// Lifecycle state.
    pub status: StoreStatus,
    /// Public storefront URL. Set when the store reaches `ready`.
    pub store_url: Option<String>,
    /// Admin panel URL. Set when the store reaches `ready`.
    pub admin_url: Option<String>,
    /// Human-readable failure reason. Non-empty whenever status is `failed`.
    pub error_message: Option<String>,
    /// Kubernetes namespace owning the store's resources. Equals `id`.
    pub namespace: String,
    /// Helm release name. Equals `id`.
    pub helm_release: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

/// Generates a fresh store id: `store-` plus the first hyphen group of a
/// v4 UUID (eight hex digits).
#[must_use]
pub fn generate_store_id() -> String {
    let uuid = uuid::Uuid::new_v4().to_string();
    let first = uuid.split('-').next().unwrap_or_default();
    format!("store-{first}")
}

/// Audit log action tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Store record created.
    Create,
    /// Store deleted (cascade complete).
    Delete,
    /// Lifecycle status changed.
    StatusChange,
    /// Operator-initiated retry of a failed store.
    Retry,
    /// Startup reconciliation converged a mid-flight store.
    Recovery,
}

impl AuditAction {
    /// Wire form of the action tag.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Delete => "delete",
            Self::StatusChange => "status_change",
            Self::Retry => "retry",
            Self::Recovery => "recovery",
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AuditAction {
    type Err = ParseActionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "delete" => Ok(Self::Delete),
            "status_change" => Ok(Self::StatusChange),
            "retry" => Ok(Self::Retry),
            "recovery" => Ok(Self::Recovery),
            other => Err(ParseActionError(other.to_string())),
        }
    }
}

/// Error returned when parsing an unknown audit action.
#[derive(Debug, thiserror::Error)]
#[error("unknown audit action: {0}")]
pub struct ParseActionError(String);
