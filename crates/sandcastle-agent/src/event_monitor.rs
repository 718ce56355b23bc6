//! Container lifecycle event monitor
//!
//! Subscribes to the runtime's event feed, keeps only containers carrying the
//! sandbox label, and republishes each lifecycle action as a normalized
//! [`StatusChange`] on a channel. The reader task owns the feed; whoever holds
//! the receiver owns the consumer side, so no state is shared between them.
//!
//! Events that happened while this process was down are invisible to the
//! feed. Call [`ContainerEventMonitor::sync_current_state`] at startup to
//! reconcile.

use crate::config::MonitorConfig;
use crate::error::{Result, SandboxError};
use crate::runtime::{ContainerInfo, ContainerRuntime, RuntimeEvent};
use sandcastle_observability::SandcastleMetrics;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;

/// Normalized sandbox status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Running,
    Stopped,
    Error,
    Terminated,
}

impl SandboxStatus {
    /// Map a runtime lifecycle action
    pub fn from_action(action: &str) -> Option<Self> {
        match action {
            "start" | "unpause" | "restart" => Some(Self::Running),
            "stop" | "die" | "kill" | "pause" => Some(Self::Stopped),
            "oom" => Some(Self::Error),
            "destroy" => Some(Self::Terminated),
            _ => None,
        }
    }

    /// Map a runtime container state as reported by list/inspect
    pub fn from_state(state: &str) -> Option<Self> {
        match state {
            "running" | "restarting" => Some(Self::Running),
            "paused" | "exited" | "created" => Some(Self::Stopped),
            "dead" => Some(Self::Error),
            "removing" => Some(Self::Terminated),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One sandbox status transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusChange {
    pub project_id: Option<String>,
    pub sandbox_id: Option<String>,
    pub container_id: String,
    pub status: SandboxStatus,
    /// Raw runtime action, or `sync` for reconciliation results
    pub action: String,
}

struct MonitorTasks {
    shutdown: Arc<Notify>,
    reader: JoinHandle<()>,
    consumer: Option<JoinHandle<()>>,
}

/// Watches sandbox containers and publishes status changes
pub struct ContainerEventMonitor {
    runtime: Arc<dyn ContainerRuntime>,
    config: MonitorConfig,
    metrics: Option<Arc<SandcastleMetrics>>,
    running: Arc<AtomicBool>,
    tasks: Mutex<Option<MonitorTasks>>,
}

impl std::fmt::Debug for ContainerEventMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerEventMonitor")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl ContainerEventMonitor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: MonitorConfig) -> Self {
        Self {
            runtime,
            config,
            metrics: None,
            running: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(None),
        }
    }

    /// Count published transitions in the metrics registry
    pub fn with_metrics(mut self, metrics: Arc<SandcastleMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start reading the event feed and return the receiving end
    pub async fn start(&self) -> Result<mpsc::Receiver<StatusChange>> {
        let mut tasks = self.tasks.lock().await;
        if tasks.is_some() {
            if self.is_running() {
                return Err(SandboxError::MonitorAlreadyRunning);
            }
            tracing::debug!("Previous event reader already exited, starting a new one");
            *tasks = None;
        }

        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let shutdown = Arc::new(Notify::new());
        let running = self.running.clone();
        running.store(true, Ordering::SeqCst);

        let reader = {
            let runtime = self.runtime.clone();
            let config = self.config.clone();
            let metrics = self.metrics.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                run_reader(runtime, config, metrics, tx, shutdown).await;
                running.store(false, Ordering::SeqCst);
            })
        };

        *tasks = Some(MonitorTasks {
            shutdown,
            reader,
            consumer: None,
        });

        tracing::info!(label = %self.config.sandbox_label, "Container event monitor started");
        Ok(rx)
    }

    /// Start the monitor and feed every change to `handler` on a consumer task
    pub async fn start_with_handler<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(StatusChange) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut rx = self.start().await?;
        let consumer = tokio::spawn(async move {
            while let Some(change) = rx.recv().await {
                handler(change).await;
            }
        });

        if let Some(tasks) = self.tasks.lock().await.as_mut() {
            tasks.consumer = Some(consumer);
        }
        Ok(())
    }

    /// Stop the reader and consumer tasks and wait for both to finish
    ///
    /// No handler invocation happens after this returns.
    pub async fn stop(&self) {
        let Some(tasks) = self.tasks.lock().await.take() else {
            return;
        };

        tasks.shutdown.notify_one();
        if let Err(e) = tasks.reader.await {
            tracing::warn!(error = %e, "Event reader task ended abnormally");
        }
        // The reader dropped the sender, so the consumer drains and exits
        if let Some(consumer) = tasks.consumer {
            if let Err(e) = consumer.await {
                tracing::warn!(error = %e, "Status consumer task ended abnormally");
            }
        }

        self.running.store(false, Ordering::SeqCst);
        tracing::info!("Container event monitor stopped");
    }

    /// Current status of every sandbox container, keyed by container id
    pub async fn sync_current_state(&self) -> Result<HashMap<String, SandboxStatus>> {
        Ok(self
            .snapshot()
            .await?
            .into_iter()
            .map(|change| (change.container_id, change.status))
            .collect())
    }

    /// One `sync` status change per sandbox container known to the runtime
    pub async fn snapshot(&self) -> Result<Vec<StatusChange>> {
        let containers = self
            .runtime
            .list_containers(&self.config.sandbox_label)
            .await?;

        let changes: Vec<StatusChange> = containers
            .into_iter()
            .filter_map(|container| self.change_from_container(container))
            .collect();

        tracing::info!(containers = changes.len(), "Reconciled sandbox container state");
        Ok(changes)
    }

    fn change_from_container(&self, container: ContainerInfo) -> Option<StatusChange> {
        let Some(status) = SandboxStatus::from_state(&container.state) else {
            tracing::debug!(
                container_id = %container.id,
                state = %container.state,
                "Unrecognized container state, skipping"
            );
            return None;
        };

        Some(StatusChange {
            project_id: container.labels.get(&self.config.project_id_label).cloned(),
            sandbox_id: container.labels.get(&self.config.sandbox_id_label).cloned(),
            container_id: container.id,
            status,
            action: "sync".to_string(),
        })
    }
}

fn translate(config: &MonitorConfig, event: RuntimeEvent) -> Option<StatusChange> {
    if !event.labels.contains_key(&config.sandbox_label) {
        return None;
    }

    let status = SandboxStatus::from_action(&event.action)?;
    Some(StatusChange {
        project_id: event.labels.get(&config.project_id_label).cloned(),
        sandbox_id: event.labels.get(&config.sandbox_id_label).cloned(),
        container_id: event.container_id,
        status,
        action: event.action,
    })
}

async fn run_reader(
    runtime: Arc<dyn ContainerRuntime>,
    config: MonitorConfig,
    metrics: Option<Arc<SandcastleMetrics>>,
    tx: mpsc::Sender<StatusChange>,
    shutdown: Arc<Notify>,
) {
    let publisher = Publisher {
        config: &config,
        metrics: metrics.as_deref(),
        tx: &tx,
        shutdown: &shutdown,
    };
    let mut backoff = config.retry_backoff;

    loop {
        let (raw_tx, mut raw_rx) = mpsc::channel::<RuntimeEvent>(config.channel_capacity);
        let watch = runtime.watch_events(&config.sandbox_label, raw_tx);
        tokio::pin!(watch);

        let outcome = loop {
            tokio::select! {
                biased;
                _ = shutdown.notified() => return,
                Some(event) = raw_rx.recv() => {
                    backoff = config.retry_backoff;
                    if !publisher.publish(event).await {
                        return;
                    }
                }
                result = &mut watch => break result,
            }
        };

        // The feed may have queued events just before it ended
        while let Ok(event) = raw_rx.try_recv() {
            if !publisher.publish(event).await {
                return;
            }
        }

        match outcome {
            Ok(()) => tracing::warn!(retry_in = ?backoff, "Container event feed ended, resubscribing"),
            Err(e) => tracing::warn!(error = %e, retry_in = ?backoff, "Container event feed failed, resubscribing"),
        }

        tokio::select! {
            _ = shutdown.notified() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = next_backoff(backoff, config.max_retry_backoff);
    }
}

struct Publisher<'a> {
    config: &'a MonitorConfig,
    metrics: Option<&'a SandcastleMetrics>,
    tx: &'a mpsc::Sender<StatusChange>,
    shutdown: &'a Notify,
}

impl Publisher<'_> {
    /// Forward one raw event; returns `false` once the reader should exit
    async fn publish(&self, event: RuntimeEvent) -> bool {
        let Some(change) = translate(self.config, event) else {
            return true;
        };

        tracing::debug!(
            container_id = %change.container_id,
            sandbox_id = ?change.sandbox_id,
            action = %change.action,
            status = %change.status,
            "Sandbox status change"
        );
        if let Some(metrics) = self.metrics {
            metrics.record_status_change(change.status.as_str());
        }

        tokio::select! {
            _ = self.shutdown.notified() => false,
            sent = self.tx.send(change) => {
                if sent.is_err() {
                    tracing::debug!("Status receiver dropped, stopping event reader");
                }
                sent.is_ok()
            }
        }
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}
