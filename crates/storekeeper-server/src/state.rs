//! Shared application state.
//!
//! Everything with process lifetime lives here and is passed explicitly:
//! the registry and audit handles, the operation lock, the engine
//! registry, the provisioner, and the two rate limiters. No ambient
//! globals.

use std::sync::Arc;

use storekeeper_core::audit::AuditLog;
use storekeeper_core::deploy::{ChartDeployer, ClusterInspector};
use storekeeper_core::engine::EngineRegistry;
use storekeeper_core::{Config, OperationLock, Provisioner, Registry};

use crate::api::rate_limit::{RateLimitConfig, RateLimiter};

/// Process-wide state shared by every handler.
pub struct AppState {
    /// Resolved configuration.
    pub config: Config,
    /// Durable store registry.
    pub registry: Registry,
    /// Audit log handle.
    pub audit: AuditLog,
    /// Per-store operation lock.
    pub lock: Arc<OperationLock>,
    /// Engine strategies.
    pub engines: Arc<EngineRegistry>,
    /// Cluster inspector, shared with the reconciler.
    pub inspector: Arc<dyn ClusterInspector>,
    /// Lifecycle workflow engine.
    pub provisioner: Arc<Provisioner>,
    /// Limiter over all API requests.
    pub general_limiter: RateLimiter,
    /// Stricter limiter over store creation.
    pub create_limiter: RateLimiter,
}

/// Handler-facing handle to [`AppState`].
pub type SharedState = Arc<AppState>;

impl AppState {
    /// Wires up the full state graph from configuration and the two
    /// external tool clients.
    #[must_use]
    pub fn new(
        config: Config,
        registry: Registry,
        deployer: Arc<dyn ChartDeployer>,
        inspector: Arc<dyn ClusterInspector>,
    ) -> SharedState {
        let lock = Arc::new(OperationLock::new());
        let engines = Arc::new(EngineRegistry::new(&config));
        let provisioner = Arc::new(Provisioner::new(
            registry.clone(),
            Arc::clone(&lock),
            deployer,
            Arc::clone(&inspector),
            Arc::clone(&engines),
            config.provision_timeout,
        ));
        let general_limiter = RateLimiter::new(RateLimitConfig {
            max_requests: config.rate_limit_max_requests,
            window: config.rate_limit_window,
            ..RateLimitConfig::default()
        });
        let create_limiter = RateLimiter::new(RateLimitConfig {
            max_requests: config.rate_limit_max_creates,
            window: config.rate_limit_window,
            ..RateLimitConfig::default()
        });

        Arc::new(Self {
            audit: registry.audit(),
            registry,
            lock,
            engines,
            inspector,
            provisioner,
            general_limiter,
            create_limiter,
            config,
        })
    }
}
