//! The store lifecycle workflow engine.
//!
//! Orchestrates the create-provision-ready and delete lifecycles against
//! the chart deployer and the live cluster, with per-store mutual
//! exclusion, a whole-workflow provisioning deadline, fail-fast readiness
//! detection, and belt-and-suspenders deletion.
//!
//! Workflows are spawned fire-and-forget from request handlers; outcomes
//! are recorded on the store record, never returned to a caller.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::deploy::{
    pods_ready, ChartDeployer, ClusterError, ClusterInspector, DeployError, InstallOutcome,
    InstallRequest, PodStatus, UninstallOutcome,
};
use crate::engine::EngineRegistry;
use crate::lock::{OperationKind, OperationLock};
use crate::registry::{Registry, RegistryError};
use crate::store::{EngineKind, StoreStatus};

/// Poll attempts before the readiness loop gives up on its own.
pub const DEFAULT_MAX_POLL_ATTEMPTS: u32 = 60;

/// Sleep between readiness poll attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Number of recent namespace events included in a fail-fast message.
const FAILURE_EVENT_COUNT: usize = 5;

/// Errors that end a lifecycle workflow.
///
/// The Display form is stored verbatim as the store's `error_message`.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// The engine refused to provision (unavailable, missing chart).
    #[error("{0}")]
    EngineUnavailable(String),

    /// No strategy registered for the store's engine tag.
    #[error("no engine registered for {0}")]
    UnknownEngine(EngineKind),

    /// Registry read or write failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Chart deployer failed.
    #[error(transparent)]
    Deploy(#[from] DeployError),

    /// Cluster inspector failed.
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// Fail-fast: a pod is in phase `Failed` or crash-looping.
    #[error("Pods failed: {pods}. Events: {events}")]
    PodsFailed {
        /// Names of the failing pods.
        pods: String,
        /// Summary of recent namespace events, `reason: message` pairs.
        events: String,
    },

    /// The readiness loop exhausted its attempts without all pods ready.
    #[error("Timed out waiting for pods to become ready after {attempts} attempts ({elapsed}s)")]
    PollExhausted {
        /// Attempts made.
        attempts: u32,
        /// Wall-clock seconds spent polling.
        elapsed: u64,
    },
}

/// The workflow engine. Cheap to share behind an [`Arc`].
pub struct Provisioner {
    registry: Registry,
    lock: Arc<OperationLock>,
    deployer: Arc<dyn ChartDeployer>,
    inspector: Arc<dyn ClusterInspector>,
    engines: Arc<EngineRegistry>,
    provision_timeout: Duration,
    poll_interval: Duration,
    max_poll_attempts: u32,
}

impl Provisioner {
    /// Creates a provisioner with the default poll cadence.
    #[must_use]
    pub fn new(
        registry: Registry,
        lock: Arc<OperationLock>,
        deployer: Arc<dyn ChartDeployer>,
        inspector: Arc<dyn ClusterInspector>,
        engines: Arc<EngineRegistry>,
        provision_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            lock,
            deployer,
            inspector,
            engines,
            provision_timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_poll_attempts: DEFAULT_MAX_POLL_ATTEMPTS,
        }
    }

    /// Overrides the readiness poll cadence. Test hook: production keeps
    /// the defaults.
    #[must_use]
    pub const fn with_poll_cadence(mut self, interval: Duration, max_attempts: u32) -> Self {
        self.poll_interval = interval;
        self.max_poll_attempts = max_attempts;
        self
    }

    /// The operation currently running against `store_id`, if any.
    #[must_use]
    pub fn operation(&self, store_id: &str) -> Option<OperationKind> {
        self.lock.get(store_id)
    }

    /// Runs the provision workflow to completion.
    ///
    /// Idempotent on the lock: if an operation is already active for the
    /// store the call returns quietly. Any failure (engine validation,
    /// install, fail-fast, deadline) lands on the record as status
    /// `failed` with a human-readable reason. The lock is always released.
    pub async fn provision(&self, store_id: &str) {
        if let Err(active) = self.lock.claim(store_id, OperationKind::Provisioning) {
            debug!(store_id, operation = %active, "operation already active, skipping provision");
            return;
        }

        info!(store_id, "provision started");
        let outcome =
            tokio::time::timeout(self.provision_timeout, self.run_provision(store_id)).await;
        match outcome {
            Ok(Ok(())) => info!(store_id, "provision complete"),
            Ok(Err(e)) => {
                warn!(store_id, error = %e, "provision failed");
                self.fail_store(store_id, &e.to_string());
            }
            Err(_) => {
                warn!(store_id, deadline = ?self.provision_timeout, "provision deadline elapsed");
                self.fail_store(store_id, "Provisioning timed out");
            }
        }
        self.lock.release(store_id);
    }

    /// Runs the delete workflow to completion.
    ///
    /// Deleting a provisioning store is accepted: this waits for the
    /// provisioning workflow to release the lock (it always does, bounded
    /// by its deadline) and then takes over. A concurrent delete makes
    /// this a no-op. Uninstall failures are tolerated; namespace deletion
    /// is the backstop. The lock is always released.
    pub async fn delete(&self, store_id: &str) {
        let give_up = tokio::time::Instant::now() + self.provision_timeout + self.poll_interval;
        loop {
            match self.lock.claim(store_id, OperationKind::Deleting) {
                Ok(()) => break,
                Err(OperationKind::Deleting) => {
                    warn!(store_id, "delete already in progress, skipping");
                    return;
                }
                Err(OperationKind::Provisioning) => {
                    if tokio::time::Instant::now() >= give_up {
                        warn!(store_id, "gave up waiting for provisioning to release the lock");
                        return;
                    }
                    debug!(store_id, "waiting for provisioning to release the lock");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }

        info!(store_id, "delete started");
        if let Err(e) = self.run_delete(store_id).await {
            warn!(store_id, error = %e, "delete failed");
            self.fail_store(store_id, &format!("Delete failed: {e}"));
        } else {
            info!(store_id, "delete complete");
        }
        self.lock.release(store_id);
    }

    async fn run_provision(&self, store_id: &str) -> Result<(), ProvisionError> {
        let store = self
            .registry
            .get(store_id)?
            .ok_or_else(|| RegistryError::NotFound(store_id.to_string()))?;

        let engine = self
            .engines
            .get(store.engine)
            .ok_or(ProvisionError::UnknownEngine(store.engine))?;

        let validation = engine.validate();
        if !validation.valid {
            return Err(ProvisionError::EngineUnavailable(
                validation
                    .error
                    .unwrap_or_else(|| format!("engine {} is unavailable", engine.name())),
            ));
        }

        self.registry
            .update_status(store_id, StoreStatus::Provisioning, None)?;

        let request = InstallRequest {
            release: store.helm_release.clone(),
            chart_path: engine.chart_path().to_path_buf(),
            namespace: store.namespace.clone(),
            create_namespace: true,
            values: engine.values(store_id),
        };
        match self.deployer.install(request).await? {
            InstallOutcome::AlreadyExists => {
                info!(store_id, "release already exists, proceeding to readiness");
            }
            InstallOutcome::Installed { .. } => info!(store_id, "chart installed"),
        }

        self.wait_for_ready(store_id, &store.namespace).await?;

        let urls = engine.urls(store_id);
        self.registry
            .mark_ready(store_id, &urls.store_url, &urls.admin_url)?;
        Ok(())
    }

    /// Polls the namespace until all pods are ready, a pod trips the
    /// fail-fast rule, or the attempt budget runs out.
    async fn wait_for_ready(&self, store_id: &str, namespace: &str) -> Result<(), ProvisionError> {
        let started = tokio::time::Instant::now();
        for attempt in 1..=self.max_poll_attempts {
            let pods = self.inspector.pod_statuses(namespace).await?;

            let failing: Vec<&PodStatus> = pods.iter().filter(|p| p.failing()).collect();
            if !failing.is_empty() {
                let names = failing
                    .iter()
                    .map(|p| p.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                let events = self.failure_events(namespace).await;
                return Err(ProvisionError::PodsFailed {
                    pods: names,
                    events,
                });
            }

            if pods_ready(&pods) {
                debug!(store_id, attempt, "all pods ready");
                return Ok(());
            }

            debug!(store_id, attempt, pods = pods.len(), "pods not ready yet");
            if attempt < self.max_poll_attempts {
                tokio::time::sleep(self.poll_interval).await;
            }
        }
        Err(ProvisionError::PollExhausted {
            attempts: self.max_poll_attempts,
            elapsed: started.elapsed().as_secs(),
        })
    }

    /// Captures a `reason: message` summary of the most recent namespace
    /// events for a fail-fast message. Best-effort: inspector failures
    /// degrade to a placeholder.
    async fn failure_events(&self, namespace: &str) -> String {
        match self.inspector.events(namespace, 10).await {
            Ok(events) => {
                let skip = events.len().saturating_sub(FAILURE_EVENT_COUNT);
                let summary: Vec<String> = events
                    .iter()
                    .skip(skip)
                    .map(|e| format!("{}: {}", e.reason, e.message))
                    .collect();
                if summary.is_empty() {
                    "no recent events".to_string()
                } else {
                    summary.join("; ")
                }
            }
            Err(e) => {
                warn!(namespace, error = %e, "could not fetch events for failure summary");
                "no recent events".to_string()
            }
        }
    }

    async fn run_delete(&self, store_id: &str) -> Result<(), ProvisionError> {
        self.registry
            .update_status(store_id, StoreStatus::Deleting, None)?;

        // Release = namespace = store id by construction.
        match self.deployer.uninstall(store_id, store_id).await {
            Ok(UninstallOutcome::Uninstalled) => info!(store_id, "release uninstalled"),
            Ok(UninstallOutcome::AlreadyRemoved) => {
                debug!(store_id, "release already removed");
            }
            Err(e) => {
                warn!(store_id, error = %e, "uninstall failed, namespace deletion is the backstop");
            }
        }

        self.inspector.delete_namespace(store_id).await?;
        self.registry.mark_deleted(store_id)?;
        Ok(())
    }

    fn fail_store(&self, store_id: &str, reason: &str) {
        if let Err(e) = self
            .registry
            .update_status(store_id, StoreStatus::Failed, Some(reason))
        {
            error!(store_id, error = %e, "could not record workflow failure");
        }
    }
}
