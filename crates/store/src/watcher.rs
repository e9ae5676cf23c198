//! Recursive subtree watching.
//!
//! [`TreeWatcher::watch`] reads a whole subtree, registering a value watch
//! and a children watch on every node, and returns a [`WatchedTree`]: the
//! mirror plus a one-shot notification that resolves on the first change
//! anywhere below the root.
//!
//! Watches are never re-armed. Callers build a fresh `WatchedTree` each
//! cycle and [`retire`](WatchedTree::retire) the previous one once the new
//! one is armed, so there is no window without active watches.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use plb_core::TreeNode;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinSet;
use tracing::{debug, trace};

use crate::error::{Result, StoreError};
use crate::store::{CoordinationStore, Watch, WatchEvent};

/// Which of a node's two watches fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    Value,
    Children,
}

/// The first change observed in a watched tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeChange {
    pub path: String,
    pub kind: WatchKind,
    pub event: WatchEvent,
}

type ChangeSlot = Arc<Mutex<Option<oneshot::Sender<TreeChange>>>>;

/// Counts waiter tasks that are still alive, across all trees of a watcher.
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Builds watched mirrors of store subtrees.
#[derive(Clone)]
pub struct TreeWatcher {
    store: Arc<dyn CoordinationStore>,
    active: Arc<AtomicUsize>,
}

impl TreeWatcher {
    /// Create a watcher over a shared store connection.
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self {
            store,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Waiter tasks currently alive for every tree this watcher built.
    pub fn active_waiters(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Mirror the subtree at `root` and arm a watch pair on every node.
    ///
    /// Nodes are visited breadth-first from an explicit queue. Waiters are
    /// only spawned after the whole subtree has been read, so a change can
    /// never be reported against a half-built mirror. Any failed read aborts
    /// the build; the watches registered so far are dropped with it. A node
    /// below the root that is deleted between its parent's listing and its
    /// own read is left out: the parent's children watch already covers it.
    pub async fn watch(&self, root: &str) -> Result<WatchedTree> {
        let mut nodes: Vec<Option<TreeNode>> = Vec::new();
        let mut parents: Vec<Option<usize>> = Vec::new();
        let mut armed: Vec<(String, Watch, Watch)> = Vec::new();
        let mut queue: VecDeque<(String, Option<usize>)> = VecDeque::new();
        queue.push_back((root.to_string(), None));

        while let Some((path, parent)) = queue.pop_front() {
            let read = self.read_node(&path).await;
            let (value, value_watch, names, children_watch) = match read {
                Ok(read) => read,
                Err(StoreError::NoNode { .. }) if parent.is_some() => {
                    debug!(path = %path, "Node vanished during the build, skipping");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let index = nodes.len();
            let mut node = TreeNode::new(path.clone());
            node.value = value;
            for name in names {
                queue.push_back((node.child_path(&name), Some(index)));
            }

            nodes.push(Some(node));
            parents.push(parent);
            armed.push((path, value_watch, children_watch));
        }

        let tree = assemble(nodes, &parents).ok_or_else(|| StoreError::no_node(root))?;
        debug!(root, nodes = armed.len(), "Tree mirror built");

        let (change_tx, change_rx) = oneshot::channel();
        let slot: ChangeSlot = Arc::new(Mutex::new(Some(change_tx)));
        let (stop_tx, _) = watch::channel(false);
        let mut waiters = JoinSet::new();

        for (path, value_watch, children_watch) in armed {
            let guard = ActiveGuard::new(&self.active);
            waiters.spawn(wait_for_change(
                path,
                value_watch,
                children_watch,
                stop_tx.subscribe(),
                Arc::clone(&slot),
                guard,
            ));
        }

        Ok(WatchedTree {
            tree,
            changes: Some(change_rx),
            stop_tx,
            waiters,
        })
    }

    async fn read_node(&self, path: &str) -> Result<(Vec<u8>, Watch, Vec<String>, Watch)> {
        let (value, value_watch) = self.store.get_and_watch(path).await?;
        let (names, children_watch) = self.store.children_and_watch(path).await?;
        Ok((value, value_watch, names, children_watch))
    }
}

/// Attach every node to its parent, deepest index first.
///
/// Breadth-first order guarantees a child's index is greater than its
/// parent's, so each node is complete before it is moved.
fn assemble(mut nodes: Vec<Option<TreeNode>>, parents: &[Option<usize>]) -> Option<TreeNode> {
    for (index, parent) in parents.iter().enumerate().rev() {
        let Some(parent) = parent else { continue };
        let Some(node) = nodes.get_mut(index).and_then(Option::take) else {
            continue;
        };
        if let Some(Some(parent_node)) = nodes.get_mut(*parent) {
            parent_node.insert_child(node);
        }
    }
    nodes.into_iter().next().flatten()
}

async fn wait_for_change(
    path: String,
    value_watch: Watch,
    children_watch: Watch,
    mut stop: watch::Receiver<bool>,
    slot: ChangeSlot,
    _guard: ActiveGuard,
) {
    let change = tokio::select! {
        event = value_watch => TreeChange { path, kind: WatchKind::Value, event },
        event = children_watch => TreeChange { path, kind: WatchKind::Children, event },
        () = stopped(&mut stop) => return,
    };

    trace!(path = %change.path, kind = ?change.kind, event = ?change.event, "Watch fired");
    let sender = slot
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    if let Some(tx) = sender {
        let _ = tx.send(change);
    }
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    loop {
        let is_stopped = *stop.borrow_and_update();
        if is_stopped || stop.changed().await.is_err() {
            return;
        }
    }
}

/// A mirrored subtree whose watches are armed.
pub struct WatchedTree {
    tree: TreeNode,
    changes: Option<oneshot::Receiver<TreeChange>>,
    stop_tx: watch::Sender<bool>,
    waiters: JoinSet<()>,
}

impl WatchedTree {
    /// The mirror as it was when the watches were registered.
    pub fn tree(&self) -> &TreeNode {
        &self.tree
    }

    /// Waiter tasks spawned for this tree that have not been joined yet.
    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    /// Wait for the first change anywhere in the tree.
    ///
    /// Resolves once. Returns `None` if the change was already consumed or
    /// every waiter exited without reporting one. Safe to cancel.
    pub async fn changed(&mut self) -> Option<TreeChange> {
        let rx = self.changes.as_mut()?;
        let change = rx.await.ok();
        self.changes = None;
        change
    }

    /// Stop every waiter of this tree and wait until all have exited.
    pub async fn retire(mut self) {
        let _ = self.stop_tx.send(true);
        while self.waiters.join_next().await.is_some() {}
        debug!(root = %self.tree.path, "Tree watches retired");
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::time::Duration;

    use super::*;
    use crate::memory::MemoryStore;

    const ROOT: &str = "/service/demo";

    fn seeded() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.put("/service/demo/leader", "node1");
        store.put("/service/demo/members/node1", "v1");
        store.put("/service/demo/members/node2", "v2");
        store
    }

    async fn next_change(tree: &mut WatchedTree) -> TreeChange {
        tokio::time::timeout(Duration::from_secs(2), tree.changed())
            .await
            .unwrap()
            .unwrap()
    }

    async fn wait_for_idle(watcher: &TreeWatcher, expected: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while watcher.active_waiters() != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_mirror_matches_store() {
        let store = seeded();
        let watcher = TreeWatcher::new(store.clone());
        let watched = watcher.watch(ROOT).await.unwrap();

        let tree = watched.tree();
        assert_eq!(tree.path, ROOT);
        assert_eq!(tree.name, "demo");
        assert_eq!(tree.node_count(), 5);
        assert_eq!(tree.child("leader").unwrap().value, b"node1");
        let members = tree.child("members").unwrap();
        assert_eq!(members.path, "/service/demo/members");
        assert_eq!(members.child("node2").unwrap().value, b"v2");
        assert_eq!(
            members.child("node1").unwrap().path,
            "/service/demo/members/node1"
        );

        assert_eq!(watched.waiter_count(), 5);
        assert_eq!(watcher.active_waiters(), 5);
        assert_eq!(store.live_watches(), 10);
    }

    #[tokio::test]
    async fn test_value_change_fires() {
        let store = seeded();
        let watcher = TreeWatcher::new(store.clone());
        let mut watched = watcher.watch(ROOT).await.unwrap();

        store.put("/service/demo/members/node2", "v2b");
        let change = next_change(&mut watched).await;
        assert_eq!(change.path, "/service/demo/members/node2");
        assert_eq!(change.kind, WatchKind::Value);
        assert_eq!(change.event, WatchEvent::DataChanged);
    }

    #[tokio::test]
    async fn test_new_member_fires_through_parent() {
        let store = seeded();
        let watcher = TreeWatcher::new(store.clone());
        let mut watched = watcher.watch(ROOT).await.unwrap();

        store.put("/service/demo/members/node3", "v3");
        let change = next_change(&mut watched).await;
        assert_eq!(change.path, "/service/demo/members");
        assert_eq!(change.kind, WatchKind::Children);
    }

    #[tokio::test]
    async fn test_removed_member_fires() {
        let store = seeded();
        let watcher = TreeWatcher::new(store.clone());
        let mut watched = watcher.watch(ROOT).await.unwrap();

        store.remove("/service/demo/members/node1");
        let change = next_change(&mut watched).await;
        assert!(
            change.path == "/service/demo/members/node1" || change.path == "/service/demo/members"
        );
    }

    #[tokio::test]
    async fn test_notification_is_one_shot() {
        let store = seeded();
        let watcher = TreeWatcher::new(store.clone());
        let mut watched = watcher.watch(ROOT).await.unwrap();

        store.put("/service/demo/leader", "node2");
        store.put("/service/demo/members/node1", "v1b");
        let first = next_change(&mut watched).await;
        assert!(first.path.starts_with(ROOT));
        assert!(watched.changed().await.is_none());
    }

    #[tokio::test]
    async fn test_change_before_waiters_start_is_not_lost() {
        let store = seeded();
        let watcher = TreeWatcher::new(store.clone());
        let mut watched = watcher.watch(ROOT).await.unwrap();

        // Fire synchronously, before the spawned waiters get polled.
        store.put("/service/demo/members/node1", "v1b");
        let change = next_change(&mut watched).await;
        assert_eq!(change.path, "/service/demo/members/node1");
    }

    #[tokio::test]
    async fn test_retire_stops_every_waiter() {
        let store = seeded();
        let watcher = TreeWatcher::new(store.clone());
        let watched = watcher.watch(ROOT).await.unwrap();
        assert_eq!(watcher.active_waiters(), 5);

        watched.retire().await;
        assert_eq!(watcher.active_waiters(), 0);
        assert_eq!(store.live_watches(), 0);
    }

    #[tokio::test]
    async fn test_dropping_tree_aborts_waiters() {
        let store = seeded();
        let watcher = TreeWatcher::new(store.clone());
        let watched = watcher.watch(ROOT).await.unwrap();

        drop(watched);
        wait_for_idle(&watcher, 0).await;
    }

    #[tokio::test]
    async fn test_waiters_stay_bounded_across_cycles() {
        let store = seeded();
        let watcher = TreeWatcher::new(store.clone());
        let mut current = watcher.watch(ROOT).await.unwrap();

        for round in 0..25 {
            store.put(
                "/service/demo/members/node1",
                format!("v1-{round}").into_bytes(),
            );
            let _ = next_change(&mut current).await;

            let next = watcher.watch(ROOT).await.unwrap();
            assert!(watcher.active_waiters() <= 10);
            std::mem::replace(&mut current, next).retire().await;

            assert_eq!(watcher.active_waiters(), 5);
            assert!(store.live_watches() <= 10);
        }
    }

    #[tokio::test]
    async fn test_missing_root_fails_without_waiters() {
        let store = seeded();
        let watcher = TreeWatcher::new(store);
        let err = watcher.watch("/service/other").await.err().unwrap();
        assert_eq!(err, StoreError::no_node("/service/other"));
        assert_eq!(watcher.active_waiters(), 0);
    }

    /// Deletes `doomed` right after `parent` has been listed, the way a
    /// member can leave during a failover while the tree is being read.
    struct RacingStore {
        inner: Arc<MemoryStore>,
        parent: &'static str,
        doomed: &'static str,
    }

    #[async_trait::async_trait]
    impl CoordinationStore for RacingStore {
        async fn get_and_watch(&self, path: &str) -> Result<(Vec<u8>, Watch)> {
            self.inner.get_and_watch(path).await
        }

        async fn children_and_watch(&self, path: &str) -> Result<(Vec<String>, Watch)> {
            let listed = self.inner.children_and_watch(path).await?;
            if path == self.parent {
                self.inner.remove(self.doomed);
            }
            Ok(listed)
        }

        async fn exists_and_watch(&self, path: &str) -> Result<(bool, Watch)> {
            self.inner.exists_and_watch(path).await
        }
    }

    #[tokio::test]
    async fn test_member_removed_mid_build_is_skipped() {
        let store = Arc::new(RacingStore {
            inner: seeded(),
            parent: "/service/demo/members",
            doomed: "/service/demo/members/node1",
        });
        let watcher = TreeWatcher::new(store);
        let mut watched = watcher.watch(ROOT).await.unwrap();

        let members = watched.tree().child("members").unwrap();
        assert!(members.child("node1").is_none());
        assert_eq!(members.child("node2").unwrap().value, b"v2");
        assert_eq!(watched.tree().node_count(), 4);
        assert_eq!(watched.waiter_count(), 4);

        let change = next_change(&mut watched).await;
        assert_eq!(change.path, "/service/demo/members");
        assert_eq!(change.kind, WatchKind::Children);
    }

    #[tokio::test]
    async fn test_offline_store_fails_build() {
        let store = seeded();
        store.set_online(false);
        let watcher = TreeWatcher::new(store.clone());
        assert!(matches!(
            watcher.watch(ROOT).await,
            Err(StoreError::ConnectionLost { .. })
        ));
    }

    #[test]
    fn test_assemble_nests_by_parent_index() {
        let nodes = vec![
            Some(TreeNode::new("/r")),
            Some(TreeNode::new("/r/a")),
            Some(TreeNode::new("/r/b")),
            Some(TreeNode::new("/r/a/x")),
        ];
        let parents = [None, Some(0), Some(0), Some(1)];
        let root = assemble(nodes, &parents).unwrap();
        assert_eq!(root.node_count(), 4);
        assert!(root.child("a").unwrap().child("x").is_some());
    }
}
