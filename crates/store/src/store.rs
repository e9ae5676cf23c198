//! The coordination-store contract.

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::Result;

/// What a fired watch observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEvent {
    NodeCreated,
    NodeDeleted,
    DataChanged,
    ChildrenChanged,
    /// The session (or the store itself) went away before the watch fired.
    SessionLost,
}

/// A single-fire watch. Resolves once, on the first matching change.
///
/// Dropping a `Watch` unregisters interest on the caller's side; stores may
/// keep the registration until it would have fired.
pub type Watch = BoxFuture<'static, WatchEvent>;

/// Hierarchical store with path-based reads and one-shot watches.
///
/// Implementations are shared read-only by every watch task of a cycle, so
/// all methods take `&self`.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Read a node's value and watch it for data changes or deletion.
    async fn get_and_watch(&self, path: &str) -> Result<(Vec<u8>, Watch)>;

    /// List a node's children and watch the child set.
    async fn children_and_watch(&self, path: &str) -> Result<(Vec<String>, Watch)>;

    /// Check whether a node exists and watch for its creation, change or deletion.
    async fn exists_and_watch(&self, path: &str) -> Result<(bool, Watch)>;
}
