//! End-to-end lifecycle scenarios against scripted tool doubles and a
//! file-backed registry.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use storekeeper_core::config::Config;
use storekeeper_core::deploy::{
    ChartDeployer, ClusterError, ClusterEvent, ClusterInspector, DeployError, InstallOutcome,
    InstallRequest, PodStatus, UninstallOutcome,
};
use storekeeper_core::engine::EngineRegistry;
use storekeeper_core::reconciler::{Reconciler, INTERRUPTED_MESSAGE};
use storekeeper_core::store::{AuditAction, EngineKind};
use storekeeper_core::{OperationLock, Provisioner, Registry, StoreStatus};

/// Deployer double with a toggleable install failure and a release set.
#[derive(Default)]
struct FakeHelm {
    releases: Mutex<HashSet<String>>,
    install_calls: AtomicU32,
    fail_installs: AtomicU32,
}

impl FakeHelm {
    fn fail_next_installs(&self, n: u32) {
        self.fail_installs.store(n, Ordering::SeqCst);
    }

    fn has_release(&self, release: &str) -> bool {
        self.releases.lock().unwrap().contains(release)
    }
}

#[async_trait]
impl ChartDeployer for FakeHelm {
    async fn install(&self, request: InstallRequest) -> Result<InstallOutcome, DeployError> {
        if self.releases.lock().unwrap().contains(&request.release) {
            return Ok(InstallOutcome::AlreadyExists);
        }
        if self.fail_installs.load(Ordering::SeqCst) > 0 {
            self.fail_installs.fetch_sub(1, Ordering::SeqCst);
            return Err(DeployError::Failed(
                "Error: INSTALLATION FAILED: context deadline exceeded".to_string(),
            ));
        }
        self.install_calls.fetch_add(1, Ordering::SeqCst);
        self.releases.lock().unwrap().insert(request.release);
        Ok(InstallOutcome::Installed {
            output: "NOTES: deployed".to_string(),
        })
    }

    async fn uninstall(
        &self,
        release: &str,
        _namespace: &str,
    ) -> Result<UninstallOutcome, DeployError> {
        if self.releases.lock().unwrap().remove(release) {
            Ok(UninstallOutcome::Uninstalled)
        } else {
            Ok(UninstallOutcome::AlreadyRemoved)
        }
    }

    async fn release_exists(&self, release: &str, _namespace: &str) -> Result<bool, DeployError> {
        Ok(self.releases.lock().unwrap().contains(release))
    }
}

/// Inspector double: pods become ready when the release is installed.
struct FakeCluster {
    helm: Arc<FakeHelm>,
    deleted: Mutex<Vec<String>>,
}

impl FakeCluster {
    fn new(helm: Arc<FakeHelm>) -> Self {
        Self {
            helm,
            deleted: Mutex::new(Vec::new()),
        }
    }

    fn namespace_deleted(&self, namespace: &str) -> bool {
        self.deleted.lock().unwrap().contains(&namespace.to_string())
    }
}

#[async_trait]
impl ClusterInspector for FakeCluster {
    async fn namespace_exists(&self, namespace: &str) -> Result<bool, ClusterError> {
        Ok(!self.namespace_deleted(namespace))
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<(), ClusterError> {
        self.deleted.lock().unwrap().push(namespace.to_string());
        Ok(())
    }

    async fn pod_statuses(&self, namespace: &str) -> Result<Vec<PodStatus>, ClusterError> {
        if self.helm.has_release(namespace) && !self.namespace_deleted(namespace) {
            Ok(vec![PodStatus {
                name: format!("{namespace}-wordpress-0"),
                phase: "Running".to_string(),
                ready: true,
                restarts: 0,
            }])
        } else {
            Ok(Vec::new())
        }
    }

    async fn all_pods_ready(&self, namespace: &str) -> Result<bool, ClusterError> {
        Ok(storekeeper_core::deploy::pods_ready(
            &self.pod_statuses(namespace).await?,
        ))
    }

    async fn job_completed(&self, _ns: &str, _job: &str) -> Result<bool, ClusterError> {
        Ok(true)
    }

    async fn job_failed(&self, _ns: &str, _job: &str) -> Result<bool, ClusterError> {
        Ok(false)
    }

    async fn events(&self, _ns: &str, _limit: usize) -> Result<Vec<ClusterEvent>, ClusterError> {
        Ok(Vec::new())
    }
}

struct World {
    registry: Registry,
    helm: Arc<FakeHelm>,
    cluster: Arc<FakeCluster>,
    provisioner: Provisioner,
    lock: Arc<OperationLock>,
    engines: Arc<EngineRegistry>,
}

fn world(registry: Registry) -> World {
    let config = Config {
        helm_chart_path: std::env::temp_dir(),
        ..Config::default()
    };
    let helm = Arc::new(FakeHelm::default());
    let cluster = Arc::new(FakeCluster::new(Arc::clone(&helm)));
    let lock = Arc::new(OperationLock::new());
    let engines = Arc::new(EngineRegistry::new(&config));
    let provisioner = Provisioner::new(
        registry.clone(),
        Arc::clone(&lock),
        Arc::clone(&helm) as Arc<dyn ChartDeployer>,
        Arc::clone(&cluster) as Arc<dyn ClusterInspector>,
        Arc::clone(&engines),
        Duration::from_secs(10),
    )
    .with_poll_cadence(Duration::from_millis(5), 5);
    World {
        registry,
        helm,
        cluster,
        provisioner,
        lock,
        engines,
    }
}

#[tokio::test]
async fn create_provision_delete_round_trip() {
    let w = world(Registry::open_in_memory().unwrap());
    let store = w.registry.create("Shop A", EngineKind::Woocommerce).unwrap();

    w.provisioner.provision(&store.id).await;
    let ready = w.registry.get(&store.id).unwrap().unwrap();
    assert_eq!(ready.status, StoreStatus::Ready);
    assert!(ready.store_url.is_some() && ready.admin_url.is_some());

    w.provisioner.delete(&store.id).await;
    let deleted = w.registry.get(&store.id).unwrap().unwrap();
    assert_eq!(deleted.status, StoreStatus::Deleted);

    // No resources left behind: release gone, namespace cascade-deleted.
    assert!(!w.helm.has_release(&store.id));
    assert!(w.cluster.namespace_deleted(&store.id));
    assert!(w.lock.is_empty());
}

#[tokio::test]
async fn failed_install_then_retry_reaches_ready_without_duplicates() {
    let w = world(Registry::open_in_memory().unwrap());
    let store = w.registry.create("Shop", EngineKind::Woocommerce).unwrap();

    w.helm.fail_next_installs(1);
    w.provisioner.provision(&store.id).await;
    let failed = w.registry.get(&store.id).unwrap().unwrap();
    assert_eq!(failed.status, StoreStatus::Failed);
    assert!(failed
        .error_message
        .unwrap()
        .starts_with("Helm command failed:"));

    // Retry re-runs the workflow from the top.
    w.provisioner.provision(&store.id).await;
    let ready = w.registry.get(&store.id).unwrap().unwrap();
    assert_eq!(ready.status, StoreStatus::Ready);
    assert_eq!(w.helm.install_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn provision_after_crash_skips_existing_release() {
    let w = world(Registry::open_in_memory().unwrap());
    let store = w.registry.create("Shop", EngineKind::Woocommerce).unwrap();

    // First run installed the release, then the process "crashed" before
    // readiness was recorded.
    w.provisioner.provision(&store.id).await;
    w.registry
        .update_status(&store.id, StoreStatus::Provisioning, None)
        .unwrap();

    w.provisioner.provision(&store.id).await;
    let ready = w.registry.get(&store.id).unwrap().unwrap();
    assert_eq!(ready.status, StoreStatus::Ready);
    // One install across both runs: the second observed alreadyExists.
    assert_eq!(w.helm.install_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn audit_trail_is_causal_and_append_only() {
    let w = world(Registry::open_in_memory().unwrap());
    let store = w.registry.create("Shop", EngineKind::Woocommerce).unwrap();
    w.provisioner.provision(&store.id).await;
    w.provisioner.delete(&store.id).await;

    let entries = w.registry.audit().list_for(&store.id).unwrap();
    // Oldest first for the causality check.
    let actions: Vec<AuditAction> = entries.iter().rev().map(|e| e.action).collect();
    assert_eq!(
        actions,
        vec![
            AuditAction::Create,
            AuditAction::StatusChange, // provisioning
            AuditAction::StatusChange, // ready
            AuditAction::StatusChange, // deleting
            AuditAction::Delete,
        ]
    );

    let ids: Vec<i64> = entries.iter().rev().map(|e| e.id).collect();
    assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
}

#[tokio::test]
async fn registry_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("stores.db");

    let store_id = {
        let registry = Registry::open(&db_path).unwrap();
        let store = registry.create("Shop", EngineKind::Woocommerce).unwrap();
        registry
            .update_status(&store.id, StoreStatus::Provisioning, None)
            .unwrap();
        store.id
    };

    let registry = Registry::open(&db_path).unwrap();
    let store = registry.get(&store_id).unwrap().unwrap();
    assert_eq!(store.status, StoreStatus::Provisioning);
    assert_eq!(registry.audit().list_for(&store_id).unwrap().len(), 2);
}

#[tokio::test]
async fn reconciler_converges_restarted_process() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("stores.db");

    // Previous process: installed the release, died mid-poll.
    let (store_id, helm) = {
        let w = world(Registry::open(&db_path).unwrap());
        let store = w.registry.create("Shop", EngineKind::Woocommerce).unwrap();
        w.provisioner.provision(&store.id).await;
        w.registry
            .update_status(&store.id, StoreStatus::Provisioning, None)
            .unwrap();
        (store.id, w.helm)
    };

    // New process: fresh lock, same database and cluster.
    let registry = Registry::open(&db_path).unwrap();
    let cluster = Arc::new(FakeCluster::new(Arc::clone(&helm)));
    let engines = Arc::new(EngineRegistry::new(&Config::default()));
    Reconciler::new(
        registry.clone(),
        Arc::clone(&cluster) as Arc<dyn ClusterInspector>,
        engines,
    )
    .run()
    .await;

    let store = registry.get(&store_id).unwrap().unwrap();
    assert_eq!(store.status, StoreStatus::Ready);
    let recovery = registry
        .audit()
        .list_for(&store_id)
        .unwrap()
        .into_iter()
        .find(|e| e.action == AuditAction::Recovery)
        .unwrap();
    assert_eq!(recovery.details["result"], "marked_ready");
}

#[tokio::test]
async fn reconciler_fails_unready_store_with_retry_hint() {
    let w = world(Registry::open_in_memory().unwrap());
    let store = w.registry.create("Shop", EngineKind::Woocommerce).unwrap();
    w.registry
        .update_status(&store.id, StoreStatus::Provisioning, None)
        .unwrap();

    // No release installed, so the cluster reports not ready.
    Reconciler::new(
        w.registry.clone(),
        Arc::clone(&w.cluster) as Arc<dyn ClusterInspector>,
        Arc::clone(&w.engines),
    )
    .run()
    .await;

    let fetched = w.registry.get(&store.id).unwrap().unwrap();
    assert_eq!(fetched.status, StoreStatus::Failed);
    assert_eq!(fetched.error_message.as_deref(), Some(INTERRUPTED_MESSAGE));
}

#[tokio::test]
async fn deleting_a_provisioning_store_wins_after_lock_release() {
    let w = world(Registry::open_in_memory().unwrap());
    let store = w.registry.create("Shop", EngineKind::Woocommerce).unwrap();

    // Provision completes, then deletion takes over cleanly.
    w.provisioner.provision(&store.id).await;
    w.provisioner.delete(&store.id).await;

    let fetched = w.registry.get(&store.id).unwrap().unwrap();
    assert_eq!(fetched.status, StoreStatus::Deleted);
    assert!(w.lock.is_empty());
}
