//! Reconcile loop for patroni-lb.
//!
//! The loop keeps one HAProxy instance fronting a Patroni cluster:
//!
//! 1. Wait until the scope has a leader
//! 2. Mirror the scope subtree with one-shot watches on every node
//! 3. Build a validated snapshot and render the configuration
//! 4. If the text changed, write it and start or reload the process
//! 5. Sleep until any watch fires, then go to 2
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use plb_reconciler::{LoopConfig, ReconcileLoop};
//! use plb_store::MemoryStore;
//! use plb_supervisor::RecordingSupervisor;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = Arc::new(MemoryStore::new());
//!     let config = LoopConfig::new("/service/demo", "haproxy.cfg");
//!     let mut reconcile_loop =
//!         ReconcileLoop::new(store, Box::new(RecordingSupervisor::new()), config);
//!
//!     let stopper = reconcile_loop.stopper();
//!     // stopper.stop() from a signal handler
//!     // reconcile_loop.run().await;
//! }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod artifact;
pub mod error;
pub mod r#loop;

// Re-export main types
pub use artifact::write_artifact;
pub use error::{Error, Result};
pub use r#loop::{CycleOutcome, LoopConfig, LoopPhase, LoopStopper, ReconcileLoop};
