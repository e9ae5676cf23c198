//! In-process coordination store.
//!
//! Mirrors ZooKeeper's watch semantics closely enough to drive the tree
//! watcher and the reconcile loop without a server:
//!
//! - data watches fire `DataChanged` on a write and `NodeDeleted` on removal
//! - child watches fire `ChildrenChanged` when a direct child appears or goes away
//! - exists watches fire on creation, write or removal
//! - every watch fires at most once
//!
//! Taking the store offline fails all calls with `ConnectionLost` and fires
//! every pending watch with `SessionLost`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::FutureExt;
use plb_core::tree::join_path;
use tokio::sync::oneshot;

use crate::error::{Result, StoreError};
use crate::store::{CoordinationStore, Watch, WatchEvent};

type Waiters = HashMap<String, Vec<oneshot::Sender<WatchEvent>>>;

struct Inner {
    nodes: BTreeMap<String, Vec<u8>>,
    online: bool,
    data_watches: Waiters,
    child_watches: Waiters,
    exist_watches: Waiters,
}

impl Inner {
    fn exists(&self, path: &str) -> bool {
        path == "/" || self.nodes.contains_key(path)
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = key.strip_prefix(prefix.as_str())?;
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn descendants(&self, path: &str) -> Vec<String> {
        let prefix = format!("{path}/");
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn fire(watches: &mut Waiters, path: &str, event: WatchEvent) {
        if let Some(senders) = watches.remove(path) {
            for tx in senders {
                let _ = tx.send(event);
            }
        }
    }

    fn fire_all(&mut self, event: WatchEvent) {
        for watches in [
            &mut self.data_watches,
            &mut self.child_watches,
            &mut self.exist_watches,
        ] {
            for (_, senders) in watches.drain() {
                for tx in senders {
                    let _ = tx.send(event);
                }
            }
        }
    }

    fn register(watches: &mut Waiters, path: &str) -> Watch {
        let (tx, rx) = oneshot::channel();
        watches.entry(path.to_string()).or_default().push(tx);
        async move { rx.await.unwrap_or(WatchEvent::SessionLost) }.boxed()
    }

    fn ensure_online(&self) -> Result<()> {
        if self.online {
            Ok(())
        } else {
            Err(StoreError::connection_lost("memory store is offline"))
        }
    }
}

/// Coordination store held entirely in memory.
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty, online store containing only `/`.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                nodes: BTreeMap::new(),
                online: true,
                data_watches: HashMap::new(),
                child_watches: HashMap::new(),
                exist_watches: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create or overwrite a node, creating missing ancestors with empty values.
    pub fn put(&self, path: &str, value: impl Into<Vec<u8>>) {
        let value = value.into();
        let mut inner = self.lock();

        let mut parent = "/".to_string();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        for (i, segment) in segments.iter().enumerate() {
            let current = join_path(&parent, segment);
            let is_target = i.saturating_add(1) == segments.len();

            if inner.exists(&current) {
                if is_target {
                    inner.nodes.insert(current.clone(), value.clone());
                    Inner::fire(&mut inner.data_watches, &current, WatchEvent::DataChanged);
                    Inner::fire(&mut inner.exist_watches, &current, WatchEvent::DataChanged);
                }
            } else {
                let data = if is_target { value.clone() } else { Vec::new() };
                inner.nodes.insert(current.clone(), data);
                Inner::fire(&mut inner.exist_watches, &current, WatchEvent::NodeCreated);
                Inner::fire(&mut inner.child_watches, &parent, WatchEvent::ChildrenChanged);
            }
            parent = current;
        }
    }

    /// Remove a node and everything below it. Returns false if it did not exist.
    pub fn remove(&self, path: &str) -> bool {
        let mut inner = self.lock();
        if path == "/" || !inner.nodes.contains_key(path) {
            return false;
        }

        let mut doomed = inner.descendants(path);
        doomed.push(path.to_string());
        // deepest first
        doomed.sort_by_key(|p| std::cmp::Reverse(p.matches('/').count()));
        for node in &doomed {
            inner.nodes.remove(node);
            Inner::fire(&mut inner.data_watches, node, WatchEvent::NodeDeleted);
            Inner::fire(&mut inner.child_watches, node, WatchEvent::NodeDeleted);
            Inner::fire(&mut inner.exist_watches, node, WatchEvent::NodeDeleted);
        }

        let parent = path
            .rsplit_once('/')
            .map(|(p, _)| if p.is_empty() { "/" } else { p })
            .unwrap_or("/")
            .to_string();
        Inner::fire(&mut inner.child_watches, &parent, WatchEvent::ChildrenChanged);
        true
    }

    /// Take the store offline (all pending watches fire `SessionLost`) or back online.
    pub fn set_online(&self, online: bool) {
        let mut inner = self.lock();
        inner.online = online;
        if !online {
            inner.fire_all(WatchEvent::SessionLost);
        }
    }

    /// Watches still registered and still awaited by someone.
    pub fn live_watches(&self) -> usize {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let mut live = 0usize;
        for watches in [
            &mut inner.data_watches,
            &mut inner.child_watches,
            &mut inner.exist_watches,
        ] {
            watches.retain(|_, senders| {
                senders.retain(|tx| !tx.is_closed());
                !senders.is_empty()
            });
            live = live.saturating_add(watches.values().map(Vec::len).sum::<usize>());
        }
        live
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get_and_watch(&self, path: &str) -> Result<(Vec<u8>, Watch)> {
        let mut inner = self.lock();
        inner.ensure_online()?;
        if !inner.exists(path) {
            return Err(StoreError::no_node(path));
        }
        let value = inner.nodes.get(path).cloned().unwrap_or_default();
        let watch = Inner::register(&mut inner.data_watches, path);
        Ok((value, watch))
    }

    async fn children_and_watch(&self, path: &str) -> Result<(Vec<String>, Watch)> {
        let mut inner = self.lock();
        inner.ensure_online()?;
        if !inner.exists(path) {
            return Err(StoreError::no_node(path));
        }
        let children = inner.children(path);
        let watch = Inner::register(&mut inner.child_watches, path);
        Ok((children, watch))
    }

    async fn exists_and_watch(&self, path: &str) -> Result<(bool, Watch)> {
        let mut inner = self.lock();
        inner.ensure_online()?;
        let exists = inner.exists(path);
        let watch = Inner::register(&mut inner.exist_watches, path);
        Ok((exists, watch))
    }
}
