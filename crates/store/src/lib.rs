//! Coordination-store access for patroni-lb.
//!
//! - [`CoordinationStore`] - the get/list/exists + single-fire watch contract
//! - [`MemoryStore`] - in-process store with the same watch semantics
//! - [`ZkStore`] - ZooKeeper implementation (feature `zookeeper`)
//! - [`TreeWatcher`] - mirrors a subtree and reports the first change anywhere in it

pub mod error;
pub mod memory;
pub mod store;
pub mod watcher;
#[cfg(feature = "zookeeper")]
pub mod zookeeper;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use store::{CoordinationStore, Watch, WatchEvent};
pub use watcher::{TreeChange, TreeWatcher, WatchKind, WatchedTree};
#[cfg(feature = "zookeeper")]
pub use zookeeper::ZkStore;
