//! # storekeeper-server
//!
//! REST control plane daemon for storekeeper. The binary in `main.rs`
//! wires configuration, the registry, the tool clients, and this crate's
//! router together; the library exists so integration tests can build the
//! same router against scripted tool doubles.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod api;
pub mod state;

pub use state::{AppState, SharedState};
