//! Startup reconciliation.
//!
//! Runs once at process start, after the API is bound. Any store left in
//! `queued` or `provisioning` means a previous process died mid-flight:
//! the in-process operation lock evaporated with it, so the record and the
//! cluster may disagree. The reconciler converges the record only - it
//! never resumes provisioning on its own; an operator retries deliberately.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use crate::audit::AuditLog;
use crate::deploy::ClusterInspector;
use crate::engine::EngineRegistry;
use crate::registry::Registry;
use crate::store::{AuditAction, Store, StoreStatus};

/// Message stored on stores the reconciler could not confirm as ready.
pub const INTERRUPTED_MESSAGE: &str =
    "API restarted during provisioning. Click retry to re-attempt.";

/// Converges persisted lifecycle state with cluster reality at startup.
pub struct Reconciler {
    registry: Registry,
    audit: AuditLog,
    inspector: Arc<dyn ClusterInspector>,
    engines: Arc<EngineRegistry>,
}

impl Reconciler {
    /// Creates a reconciler over the given registry and inspector.
    #[must_use]
    pub fn new(
        registry: Registry,
        inspector: Arc<dyn ClusterInspector>,
        engines: Arc<EngineRegistry>,
    ) -> Self {
        Self {
            audit: registry.audit(),
            registry,
            inspector,
            engines,
        }
    }

    /// Runs reconciliation over every mid-flight store.
    ///
    /// Failures on one store are recorded and do not stop the pass.
    pub async fn run(&self) {
        let stores = match self.registry.list() {
            Ok(stores) => stores,
            Err(e) => {
                warn!(error = %e, "reconciliation skipped: could not list stores");
                return;
            }
        };

        let mid_flight: Vec<Store> = stores
            .into_iter()
            .filter(|s| {
                matches!(
                    s.status,
                    StoreStatus::Queued | StoreStatus::Provisioning
                )
            })
            .collect();

        if mid_flight.is_empty() {
            info!("reconciliation: no mid-flight stores");
            return;
        }

        info!(count = mid_flight.len(), "reconciling mid-flight stores");
        for store in mid_flight {
            self.reconcile_store(&store).await;
        }
    }

    async fn reconcile_store(&self, store: &Store) {
        match self.inspector.all_pods_ready(&store.namespace).await {
            Ok(true) => {
                let Some(engine) = self.engines.get(store.engine) else {
                    self.record_failure(
                        &store.id,
                        &format!("Recovery failed: no engine registered for {}", store.engine),
                    );
                    return;
                };
                let urls = engine.urls(&store.id);
                if let Err(e) =
                    self.registry
                        .mark_ready(&store.id, &urls.store_url, &urls.admin_url)
                {
                    warn!(store_id = %store.id, error = %e, "recovery mark_ready failed");
                    return;
                }
                info!(store_id = %store.id, "recovered store as ready");
                self.append_recovery(&store.id, "marked_ready");
            }
            Ok(false) => {
                if let Err(e) = self.registry.update_status(
                    &store.id,
                    StoreStatus::Failed,
                    Some(INTERRUPTED_MESSAGE),
                ) {
                    warn!(store_id = %store.id, error = %e, "recovery update failed");
                    return;
                }
                info!(store_id = %store.id, "recovered store as failed");
                self.append_recovery(&store.id, "marked_failed");
            }
            Err(e) => {
                self.record_failure(&store.id, &format!("Recovery failed: {e}"));
            }
        }
    }

    fn record_failure(&self, store_id: &str, reason: &str) {
        warn!(store_id, reason, "recovery could not converge store");
        if let Err(e) = self
            .registry
            .update_status(store_id, StoreStatus::Failed, Some(reason))
        {
            warn!(store_id, error = %e, "recovery failure update failed");
        }
    }

    fn append_recovery(&self, store_id: &str, result: &str) {
        if let Err(e) = self.audit.append(
            Some(store_id),
            AuditAction::Recovery,
            json!({ "result": result }),
        ) {
            warn!(store_id, error = %e, "audit append failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::config::Config;
    use crate::deploy::{ClusterError, ClusterEvent, PodStatus};
    use crate::store::EngineKind;

    /// Inspector that answers `all_pods_ready` per namespace.
    #[derive(Default)]
    struct FixedInspector {
        ready: bool,
        error: Option<String>,
    }

    #[async_trait]
    impl ClusterInspector for FixedInspector {
        async fn namespace_exists(&self, _ns: &str) -> Result<bool, ClusterError> {
            Ok(true)
        }

        async fn delete_namespace(&self, _ns: &str) -> Result<(), ClusterError> {
            Ok(())
        }

        async fn pod_statuses(&self, _ns: &str) -> Result<Vec<PodStatus>, ClusterError> {
            Ok(Vec::new())
        }

        async fn all_pods_ready(&self, _ns: &str) -> Result<bool, ClusterError> {
            match &self.error {
                Some(message) => Err(ClusterError::Failed(message.clone())),
                None => Ok(self.ready),
            }
        }

        async fn job_completed(&self, _ns: &str, _job: &str) -> Result<bool, ClusterError> {
            Ok(false)
        }

        async fn job_failed(&self, _ns: &str, _job: &str) -> Result<bool, ClusterError> {
            Ok(false)
        }

        async fn events(&self, _ns: &str, _limit: usize) -> Result<Vec<ClusterEvent>, ClusterError> {
            Ok(Vec::new())
        }
    }

    fn engines() -> Arc<EngineRegistry> {
        Arc::new(EngineRegistry::new(&Config::default()))
    }

    fn reconciler(registry: &Registry, inspector: FixedInspector) -> Reconciler {
        Reconciler::new(registry.clone(), Arc::new(inspector), engines())
    }

    #[tokio::test]
    async fn ready_cluster_marks_store_ready() {
        let registry = Registry::open_in_memory().unwrap();
        let store = registry.create("Shop", EngineKind::Woocommerce).unwrap();
        registry
            .update_status(&store.id, StoreStatus::Provisioning, None)
            .unwrap();

        reconciler(
            &registry,
            FixedInspector {
                ready: true,
                error: None,
            },
        )
        .run()
        .await;

        let fetched = registry.get(&store.id).unwrap().unwrap();
        assert_eq!(fetched.status, StoreStatus::Ready);
        assert_eq!(
            fetched.store_url,
            Some(format!("http://{}.127.0.0.1.nip.io", store.id))
        );

        let entries = registry.audit().list_for(&store.id).unwrap();
        let recovery = entries
            .iter()
            .find(|e| e.action == AuditAction::Recovery)
            .unwrap();
        assert_eq!(recovery.details["result"], "marked_ready");
    }

    #[tokio::test]
    async fn unready_cluster_marks_store_failed() {
        let registry = Registry::open_in_memory().unwrap();
        let store = registry.create("Shop", EngineKind::Woocommerce).unwrap();
        registry
            .update_status(&store.id, StoreStatus::Provisioning, None)
            .unwrap();

        reconciler(
            &registry,
            FixedInspector {
                ready: false,
                error: None,
            },
        )
        .run()
        .await;

        let fetched = registry.get(&store.id).unwrap().unwrap();
        assert_eq!(fetched.status, StoreStatus::Failed);
        assert_eq!(fetched.error_message.as_deref(), Some(INTERRUPTED_MESSAGE));

        let entries = registry.audit().list_for(&store.id).unwrap();
        let recovery = entries
            .iter()
            .find(|e| e.action == AuditAction::Recovery)
            .unwrap();
        assert_eq!(recovery.details["result"], "marked_failed");
    }

    #[tokio::test]
    async fn queued_stores_are_also_reconciled() {
        let registry = Registry::open_in_memory().unwrap();
        let store = registry.create("Shop", EngineKind::Woocommerce).unwrap();

        reconciler(
            &registry,
            FixedInspector {
                ready: false,
                error: None,
            },
        )
        .run()
        .await;

        let fetched = registry.get(&store.id).unwrap().unwrap();
        assert_eq!(fetched.status, StoreStatus::Failed);
    }

    #[tokio::test]
    async fn inspector_error_records_recovery_failure() {
        let registry = Registry::open_in_memory().unwrap();
        let store = registry.create("Shop", EngineKind::Woocommerce).unwrap();
        registry
            .update_status(&store.id, StoreStatus::Provisioning, None)
            .unwrap();

        reconciler(
            &registry,
            FixedInspector {
                ready: false,
                error: Some("connection refused".to_string()),
            },
        )
        .run()
        .await;

        let fetched = registry.get(&store.id).unwrap().unwrap();
        assert_eq!(fetched.status, StoreStatus::Failed);
        let message = fetched.error_message.unwrap();
        assert!(message.starts_with("Recovery failed:"), "{message}");
        assert!(message.contains("connection refused"), "{message}");
    }

    #[tokio::test]
    async fn settled_stores_are_untouched() {
        let registry = Registry::open_in_memory().unwrap();
        let ready = registry.create("R", EngineKind::Woocommerce).unwrap();
        registry.mark_ready(&ready.id, "u", "a").unwrap();
        let failed = registry.create("F", EngineKind::Woocommerce).unwrap();
        registry
            .update_status(&failed.id, StoreStatus::Failed, Some("boom"))
            .unwrap();

        reconciler(
            &registry,
            FixedInspector {
                ready: true,
                error: None,
            },
        )
        .run()
        .await;

        assert_eq!(
            registry.get(&ready.id).unwrap().unwrap().status,
            StoreStatus::Ready
        );
        assert_eq!(
            registry.get(&failed.id).unwrap().unwrap().status,
            StoreStatus::Failed
        );
        // Ready store's URLs were not recomputed by recovery.
        assert_eq!(
            registry.get(&ready.id).unwrap().unwrap().store_url.as_deref(),
            Some("u")
        );
    }
}
