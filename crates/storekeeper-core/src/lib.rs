//! # storekeeper-core
//!
//! Core library for storekeeper - a control plane that provisions, tracks,
//! and tears down isolated e-commerce stores on a Kubernetes cluster.
//!
//! A store is a stack of a web front-end, a backing database, and an ingress
//! route, confined to a per-store namespace. This crate owns the store
//! lifecycle state machine and everything it coordinates:
//!
//! - **Registry**: durable store records backed by `SQLite`
//! - **Audit log**: append-only record of every lifecycle event
//! - **Engine strategies**: per-engine chart values and URLs
//! - **Operation lock**: per-store mutual exclusion
//! - **Provisioner**: the provision/delete workflow engine
//! - **Reconciler**: startup convergence of persisted state with the cluster
//!
//! The chart deployer (Helm) and cluster inspector (kubectl) are consumed
//! through the narrow traits in [`deploy`]; production wrappers live in
//! [`helm`] and [`kubectl`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use storekeeper_core::config::Config;
//! use storekeeper_core::registry::Registry;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::from_env();
//! let registry = Registry::open(&config.db_path)?;
//! let store = registry.create("Shop A", storekeeper_core::store::EngineKind::Woocommerce)?;
//! println!("created {} in status {}", store.id, store.status);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod audit;
pub mod config;
pub mod deploy;
pub mod engine;
pub mod helm;
pub mod kubectl;
pub mod lock;
pub mod provisioner;
pub mod reconciler;
pub mod registry;
pub mod store;

pub use config::Config;
pub use lock::{OperationKind, OperationLock};
pub use provisioner::Provisioner;
pub use reconciler::Reconciler;
pub use registry::Registry;
pub use store::{Store, StoreStatus};
