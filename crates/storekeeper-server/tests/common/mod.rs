//! Shared harness for API integration tests: scripted tool doubles and a
//! router wired exactly like production, minus the real binaries.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::extract::connect_info::MockConnectInfo;
use axum::Router;
use storekeeper_core::deploy::{
    pods_ready, ChartDeployer, ClusterError, ClusterEvent, ClusterInspector, DeployError,
    InstallOutcome, InstallRequest, PodStatus, UninstallOutcome,
};
use storekeeper_core::{Config, Registry};
use storekeeper_server::{api, AppState, SharedState};

/// Deployer double: installs always succeed and are remembered.
#[derive(Default)]
pub struct FakeHelm {
    pub releases: Mutex<HashSet<String>>,
    pub install_calls: AtomicU32,
}

#[async_trait]
impl ChartDeployer for FakeHelm {
    async fn install(&self, request: InstallRequest) -> Result<InstallOutcome, DeployError> {
        if self.releases.lock().unwrap().contains(&request.release) {
            return Ok(InstallOutcome::AlreadyExists);
        }
        self.install_calls.fetch_add(1, Ordering::SeqCst);
        self.releases.lock().unwrap().insert(request.release);
        Ok(InstallOutcome::Installed {
            output: "deployed".to_string(),
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

/// Inspector double: namespaces with an installed release are ready.
pub struct FakeCluster {
    helm: Arc<FakeHelm>,
    pub deleted: Mutex<Vec<String>>,
}

#[async_trait]
impl ClusterInspector for FakeCluster {
    async fn namespace_exists(&self, namespace: &str) -> Result<bool, ClusterError> {
        Ok(!self.deleted.lock().unwrap().contains(&namespace.to_string()))
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<(), ClusterError> {
        self.deleted.lock().unwrap().push(namespace.to_string());
        Ok(())
    }

    async fn pod_statuses(&self, namespace: &str) -> Result<Vec<PodStatus>, ClusterError> {
        if self.helm.releases.lock().unwrap().contains(namespace) {
            Ok(vec![PodStatus {
                name: format!("{namespace}-web-0"),
                phase: "Running".to_string(),
                ready: true,
                restarts: 0,
            }])
        } else {
            Ok(Vec::new())
        }
    }

    async fn all_pods_ready(&self, namespace: &str) -> Result<bool, ClusterError> {
        Ok(pods_ready(&self.pod_statuses(namespace).await?))
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

/// A full application with scripted tool doubles behind it.
pub struct TestApp {
    pub router: Router,
    pub state: SharedState,
    pub helm: Arc<FakeHelm>,
}

/// Builds a test app; `configure` tweaks the config before wiring.
pub fn app_with(configure: impl FnOnce(&mut Config)) -> TestApp {
    let mut config = Config {
        helm_chart_path: std::env::temp_dir(),
        ..Config::default()
    };
    configure(&mut config);

    let registry = Registry::open_in_memory().unwrap();
    let helm = Arc::new(FakeHelm::default());
    let cluster = Arc::new(FakeCluster {
        helm: Arc::clone(&helm),
        deleted: Mutex::new(Vec::new()),
    });

    let state = AppState::new(
        config,
        registry,
        Arc::clone(&helm) as Arc<dyn ChartDeployer>,
        cluster as Arc<dyn ClusterInspector>,
    );
    let router = api::router(Arc::clone(&state))
        .layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))));

    TestApp {
        router,
        state,
        helm,
    }
}

/// Builds a test app with default configuration.
pub fn app() -> TestApp {
    app_with(|_| {})
}
