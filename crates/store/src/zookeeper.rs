//! ZooKeeper implementation of [`CoordinationStore`].

use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{info, warn};
use zookeeper_client as zk;

use crate::error::{Result, StoreError};
use crate::store::{CoordinationStore, Watch, WatchEvent};

/// A shared ZooKeeper session.
#[derive(Clone)]
pub struct ZkStore {
    client: zk::Client,
}

impl ZkStore {
    /// Connect to `host:port`.
    pub async fn connect(endpoint: &str) -> Result<Self> {
        let client = zk::Client::connect(endpoint)
            .await
            .map_err(|e| StoreError::connection_lost(format!("{endpoint}: {e}")))?;
        Ok(Self { client })
    }

    /// Connect, retrying with doubling backoff up to `attempts` times.
    pub async fn connect_with_retry(
        endpoint: &str,
        attempts: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
    ) -> Result<Self> {
        let mut backoff = initial_backoff;
        let mut attempt = 1u32;
        loop {
            match Self::connect(endpoint).await {
                Ok(store) => {
                    info!(endpoint, attempt, "Connected to ZooKeeper");
                    return Ok(store);
                }
                Err(e) if attempt < attempts => {
                    warn!(
                        endpoint,
                        attempt,
                        retry_in_ms = backoff.as_millis(),
                        error = %e,
                        "Cannot connect to ZooKeeper, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2).min(max_backoff);
                    attempt = attempt.saturating_add(1);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn map_error(operation: &'static str, path: &str, err: &zk::Error) -> StoreError {
    match err {
        zk::Error::NoNode => StoreError::no_node(path),
        zk::Error::ConnectionLoss | zk::Error::SessionExpired => {
            StoreError::connection_lost(err.to_string())
        }
        other => StoreError::operation_failed(operation, path, other.to_string()),
    }
}

fn into_watch(watcher: zk::OneshotWatcher) -> Watch {
    async move {
        let event = watcher.changed().await;
        match event.event_type {
            zk::EventType::NodeCreated => WatchEvent::NodeCreated,
            zk::EventType::NodeDeleted => WatchEvent::NodeDeleted,
            zk::EventType::NodeDataChanged => WatchEvent::DataChanged,
            zk::EventType::NodeChildrenChanged => WatchEvent::ChildrenChanged,
            _ => WatchEvent::SessionLost,
        }
    }
    .boxed()
}

#[async_trait]
impl CoordinationStore for ZkStore {
    async fn get_and_watch(&self, path: &str) -> Result<(Vec<u8>, Watch)> {
        let (data, _stat, watcher) = self
            .client
            .get_and_watch_data(path)
            .await
            .map_err(|e| map_error("get", path, &e))?;
        Ok((data, into_watch(watcher)))
    }

    async fn children_and_watch(&self, path: &str) -> Result<(Vec<String>, Watch)> {
        let (children, _stat, watcher) = self
            .client
            .get_and_watch_children(path)
            .await
            .map_err(|e| map_error("children", path, &e))?;
        Ok((children, into_watch(watcher)))
    }

    async fn exists_and_watch(&self, path: &str) -> Result<(bool, Watch)> {
        let (stat, watcher) = self
            .client
            .check_and_watch_stat(path)
            .await
            .map_err(|e| map_error("exists", path, &e))?;
        Ok((stat.is_some(), into_watch(watcher)))
    }
}
