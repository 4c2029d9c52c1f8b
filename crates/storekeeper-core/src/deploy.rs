//! Interfaces to the two external worlds the provisioner coordinates:
//! the chart deployer and the live cluster.
//!
//! Production implementations wrap the `helm` and `kubectl` binaries
//! ([`crate::helm`], [`crate::kubectl`]); tests substitute scripted doubles.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Restart count beyond which a pod is considered crash-looping and the
/// readiness poll aborts.
pub const MAX_POD_RESTARTS: u32 = 5;

/// Chart install request. `release`, `namespace`, and the store id are all
/// the same string by construction.
#[derive(Debug, Clone)]
pub struct InstallRequest {
    /// Release name.
    pub release: String,
    /// Path to the chart on disk.
    pub chart_path: PathBuf,
    /// Target namespace.
    pub namespace: String,
    /// Create the namespace if it does not exist.
    pub create_namespace: bool,
    /// Chart values, passed as `--set key=value`.
    pub values: BTreeMap<String, String>,
}

/// Outcome of an install call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    /// The release already existed; nothing was installed.
    AlreadyExists,
    /// A fresh install was issued. Carries the tool's stdout.
    Installed {
        /// Raw tool output, kept for operator debugging.
        output: String,
    },
}

/// Outcome of an uninstall call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UninstallOutcome {
    /// The release was already gone.
    AlreadyRemoved,
    /// The release was uninstalled.
    Uninstalled,
}

/// Errors from the chart deployer.
///
/// Display forms all carry the `Helm command failed:` prefix; the workflow
/// stores them verbatim as the failure reason.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    /// The tool exited non-zero.
    #[error("Helm command failed: {0}")]
    Failed(String),

    /// The tool did not finish within the command timeout.
    #[error("Helm command failed: timed out after {0:?}")]
    TimedOut(Duration),

    /// The tool could not be spawned or its output not collected.
    #[error("Helm command failed: {message}")]
    Io {
        /// What was being attempted.
        message: String,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
}

/// Chart-driven deployment mechanism (Helm-shaped).
#[async_trait]
pub trait ChartDeployer: Send + Sync {
    /// Installs a release. Idempotent: an existing release reports
    /// [`InstallOutcome::AlreadyExists`] instead of failing.
    async fn install(&self, request: InstallRequest) -> Result<InstallOutcome, DeployError>;

    /// Uninstalls a release, waiting for resource removal. Idempotent.
    async fn uninstall(
        &self,
        release: &str,
        namespace: &str,
    ) -> Result<UninstallOutcome, DeployError>;

    /// Whether a release exists in the namespace.
    async fn release_exists(&self, release: &str, namespace: &str) -> Result<bool, DeployError>;
}

/// Point-in-time status of one pod.
#[derive(Debug, Clone, Serialize)]
pub struct PodStatus {
    /// Pod name.
    pub name: String,
    /// Pod phase (`Pending`, `Running`, `Succeeded`, `Failed`, `Unknown`).
    pub phase: String,
    /// Whether the pod has condition `Ready=True`.
    pub ready: bool,
    /// Highest container restart count in the pod.
    pub restarts: u32,
}

impl PodStatus {
    /// Whether the pod finished as one-shot init work and is excluded from
    /// the readiness check.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.phase == "Succeeded"
    }

    /// Whether the pod trips the fail-fast rule: phase `Failed` or
    /// crash-looping restarts.
    #[must_use]
    pub fn failing(&self) -> bool {
        self.phase == "Failed" || self.restarts > MAX_POD_RESTARTS
    }
}

/// One namespace event.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterEvent {
    /// Event type (`Normal`, `Warning`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Machine-readable reason (`BackOff`, `Failed`, ...).
    pub reason: String,
    /// Human-readable message.
    pub message: String,
    /// Involved object, `Kind/name`.
    pub object: String,
    /// Last occurrence, when reported.
    pub timestamp: Option<DateTime<Utc>>,
}

/// Errors from the cluster inspector.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// The tool exited non-zero.
    #[error("kubectl command failed: {0}")]
    Failed(String),

    /// The tool did not finish within the command timeout.
    #[error("kubectl command failed: timed out after {0:?}")]
    TimedOut(Duration),

    /// The tool could not be spawned or its output not collected.
    #[error("kubectl command failed: {message}")]
    Io {
        /// What was being attempted.
        message: String,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// The tool's JSON output could not be parsed.
    #[error("kubectl output parse failed: {0}")]
    Parse(String),
}

/// Read-only (plus namespace deletion) view of the live cluster.
#[async_trait]
pub trait ClusterInspector: Send + Sync {
    /// Whether the namespace exists.
    async fn namespace_exists(&self, namespace: &str) -> Result<bool, ClusterError>;

    /// Deletes the namespace and everything in it, waiting for completion.
    /// No-op when the namespace is absent.
    async fn delete_namespace(&self, namespace: &str) -> Result<(), ClusterError>;

    /// Snapshot of all pods in the namespace.
    async fn pod_statuses(&self, namespace: &str) -> Result<Vec<PodStatus>, ClusterError>;

    /// Whether the namespace is ready: at least one non-`Succeeded` pod
    /// exists and every non-`Succeeded` pod has condition `Ready=True`.
    async fn all_pods_ready(&self, namespace: &str) -> Result<bool, ClusterError>;

    /// Whether the job has a `Complete=True` condition.
    async fn job_completed(&self, namespace: &str, job: &str) -> Result<bool, ClusterError>;

    /// Whether the job has a `Failed=True` condition.
    async fn job_failed(&self, namespace: &str, job: &str) -> Result<bool, ClusterError>;

    /// Recent namespace events, newest last.
    async fn events(&self, namespace: &str, limit: usize)
        -> Result<Vec<ClusterEvent>, ClusterError>;
}

/// Readiness rule shared by the poll loop and `all_pods_ready`: ignore
/// `Succeeded` pods, require at least one remaining pod, require all of
/// them `Ready=True`.
#[must_use]
pub fn pods_ready(pods: &[PodStatus]) -> bool {
    let mut seen = false;
    for pod in pods {
        if pod.succeeded() {
            continue;
        }
        if !pod.ready {
            return false;
        }
        seen = true;
    }
    seen
}
