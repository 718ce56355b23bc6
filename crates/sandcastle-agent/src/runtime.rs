//! Container runtime contract
//!
//! The control plane never creates or destroys containers itself. It only
//! needs read-only inspection (list, inspect, published host ports) and a live
//! lifecycle event feed, so that is all the [`ContainerRuntime`] trait asks of
//! an implementation.

use crate::error::{Result, SandboxError};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{broadcast, mpsc, RwLock};

/// Container lifecycle actions the event monitor subscribes to
pub const LIFECYCLE_ACTIONS: &[&str] = &[
    "start", "stop", "die", "kill", "oom", "pause", "unpause", "restart", "destroy",
];

/// Runtime-reported view of one container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    /// Runtime container id
    pub id: String,
    /// Raw runtime state (`running`, `exited`, `paused`, ...)
    pub state: String,
    /// Container labels
    pub labels: HashMap<String, String>,
    /// Host ports published by this container
    pub published_ports: Vec<u16>,
}

/// One raw lifecycle event from the runtime feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEvent {
    /// Runtime container id
    pub container_id: String,
    /// Action name (`start`, `die`, `oom`, ...)
    pub action: String,
    /// Labels attached to the container at event time
    pub labels: HashMap<String, String>,
}

/// Read-only container runtime interface
#[async_trait::async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// List every container (running or not) carrying the given label key
    async fn list_containers(&self, label: &str) -> Result<Vec<ContainerInfo>>;

    /// Inspect a single container by id
    async fn inspect_container(&self, container_id: &str) -> Result<ContainerInfo>;

    /// Host ports currently published by any container, tracked or not
    async fn published_ports(&self) -> Result<HashSet<u16>>;

    /// Stream lifecycle events for containers carrying `label` into `tx`
    ///
    /// Runs until the feed ends (`Ok`) or fails (`Err`); callers own the
    /// reconnect policy. Returns early with `Ok` once `tx` is closed.
    async fn watch_events(&self, label: &str, tx: mpsc::Sender<RuntimeEvent>) -> Result<()>;
}

/// In-memory runtime for tests and local development
pub struct MockRuntime {
    containers: RwLock<HashMap<String, ContainerInfo>>,
    extra_ports: RwLock<HashSet<u16>>,
    // `None` tells current watchers the feed dropped
    events: broadcast::Sender<Option<RuntimeEvent>>,
    watch_calls: AtomicUsize,
}

impl std::fmt::Debug for MockRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockRuntime").finish_non_exhaustive()
    }
}

impl MockRuntime {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            containers: RwLock::new(HashMap::new()),
            extra_ports: RwLock::new(HashSet::new()),
            events,
            watch_calls: AtomicUsize::new(0),
        }
    }

    /// Add or replace a container record
    pub async fn insert_container(&self, info: ContainerInfo) {
        self.containers.write().await.insert(info.id.clone(), info);
    }

    /// Drop a container record
    pub async fn remove_container(&self, container_id: &str) {
        self.containers.write().await.remove(container_id);
    }

    /// Mark a host port as published by a container this process does not track
    pub async fn publish_port(&self, port: u16) {
        self.extra_ports.write().await.insert(port);
    }

    /// Deliver an event to every active watcher
    pub fn emit(&self, event: RuntimeEvent) {
        let _ = self.events.send(Some(event));
    }

    /// Make every active watcher fail as if the daemon connection dropped
    pub fn drop_feed(&self) {
        let _ = self.events.send(None);
    }

    /// Number of currently active watchers
    pub fn watcher_count(&self) -> usize {
        self.events.receiver_count()
    }

    /// Number of times `watch_events` has been entered
    pub fn watch_calls(&self) -> usize {
        self.watch_calls.load(Ordering::SeqCst)
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for MockRuntime {
    async fn list_containers(&self, label: &str) -> Result<Vec<ContainerInfo>> {
        let containers = self.containers.read().await;
        Ok(containers
            .values()
            .filter(|c| c.labels.contains_key(label))
            .cloned()
            .collect())
    }

    async fn inspect_container(&self, container_id: &str) -> Result<ContainerInfo> {
        let containers = self.containers.read().await;
        containers
            .get(container_id)
            .cloned()
            .ok_or_else(|| SandboxError::runtime("inspect", format!("no such container: {}", container_id)))
    }

    async fn published_ports(&self) -> Result<HashSet<u16>> {
        let mut ports = self.extra_ports.read().await.clone();
        for container in self.containers.read().await.values() {
            ports.extend(container.published_ports.iter().copied());
        }
        Ok(ports)
    }

    async fn watch_events(&self, label: &str, tx: mpsc::Sender<RuntimeEvent>) -> Result<()> {
        let mut rx = self.events.subscribe();
        self.watch_calls.fetch_add(1, Ordering::SeqCst);

        loop {
            match rx.recv().await {
                Ok(Some(event)) => {
                    if !event.labels.contains_key(label) {
                        continue;
                    }
                    if tx.send(event).await.is_err() {
                        return Ok(());
                    }
                }
                Ok(None) => {
                    return Err(SandboxError::runtime("events", "event stream disconnected"));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "mock event feed lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container(id: &str, labels: &[(&str, &str)], ports: &[u16]) -> ContainerInfo {
        ContainerInfo {
            id: id.to_string(),
            state: "running".to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            published_ports: ports.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_mock_list_filters_by_label() {
        let runtime = MockRuntime::new();
        runtime
            .insert_container(container("a", &[("sandbox", "true")], &[]))
            .await;
        runtime.insert_container(container("b", &[], &[])).await;

        let listed = runtime.list_containers("sandbox").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "a");
    }

    #[tokio::test]
    async fn test_mock_published_ports() {
        let runtime = MockRuntime::new();
        runtime.insert_container(container("a", &[], &[8080, 8081])).await;
        runtime.publish_port(9000).await;

        let ports = runtime.published_ports().await.unwrap();
        assert_eq!(ports, HashSet::from([8080, 8081, 9000]));
    }

    #[tokio::test]
    async fn test_mock_inspect_missing() {
        let runtime = MockRuntime::new();
        assert!(runtime.inspect_container("nope").await.is_err());
    }

    #[tokio::test]
    async fn test_mock_watch_forwards_and_disconnects() {
        let runtime = std::sync::Arc::new(MockRuntime::new());
        let (tx, mut rx) = mpsc::channel(8);

        let watcher = {
            let runtime = runtime.clone();
            tokio::spawn(async move { runtime.watch_events("sandbox", tx).await })
        };

        while runtime.watcher_count() == 0 {
            tokio::task::yield_now().await;
        }

        runtime.emit(RuntimeEvent {
            container_id: "ignored".into(),
            action: "start".into(),
            labels: HashMap::new(),
        });
        runtime.emit(RuntimeEvent {
            container_id: "a".into(),
            action: "start".into(),
            labels: HashMap::from([("sandbox".to_string(), "true".to_string())]),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.container_id, "a");

        runtime.drop_feed();
        assert!(watcher.await.unwrap().is_err());
        assert_eq!(runtime.watch_calls(), 1);
    }
}
