//! Control plane composition root
//!
//! Builds every resource manager from configuration, injects the shared
//! runtime and metrics handles, and reacts to sandbox lifecycle changes.

use anyhow::{Context, Result};
use sandcastle_agent::{
    ContainerEventMonitor, ContainerRuntime, PortAllocator, ProcessTracker, RateLimiter,
    SandboxStatus, SandcastleConfig, StatusChange, ToolRegistry,
};
use sandcastle_observability::SandcastleMetrics;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

const MIN_CLEANUP_INTERVAL: Duration = Duration::from_secs(1);

/// Every long-lived component of a running control plane
pub(crate) struct ControlPlane {
    config: SandcastleConfig,
    metrics: Arc<SandcastleMetrics>,
    ports: Arc<PortAllocator>,
    processes: Arc<ProcessTracker>,
    rate_limiter: RateLimiter,
    tools: Arc<ToolRegistry>,
    monitor: ContainerEventMonitor,
}

impl ControlPlane {
    pub(crate) fn new(
        config: SandcastleConfig,
        runtime: Arc<dyn ContainerRuntime>,
        metrics: Arc<SandcastleMetrics>,
    ) -> Self {
        let reporting = config.observability.metrics.enabled.then(|| metrics.clone());

        let mut ports = PortAllocator::new(config.ports.clone()).with_runtime(runtime.clone());
        let mut monitor = ContainerEventMonitor::new(runtime, config.monitor.clone());
        let rate_limiter = match &reporting {
            Some(metrics) => {
                ports = ports.with_metrics(metrics.clone());
                monitor = monitor.with_metrics(metrics.clone());
                RateLimiter::with_metrics(config.rate_limits.clone(), metrics.clone())
            }
            None => RateLimiter::new(config.rate_limits.clone()),
        };

        let ports = Arc::new(ports);
        let processes = Arc::new(ProcessTracker::new(config.processes.clone()));
        let tools = Arc::new(ToolRegistry::new());

        Self {
            config,
            metrics,
            ports,
            processes,
            rate_limiter,
            tools,
            monitor,
        }
    }

    /// Run until `shutdown` resolves or the event feed closes
    pub(crate) async fn serve<S>(self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        let existing = self
            .monitor
            .snapshot()
            .await
            .context("Failed to reconcile sandbox containers")?;
        for change in &existing {
            debug!(
                container_id = %change.container_id,
                sandbox_id = ?change.sandbox_id,
                status = %change.status,
                "Existing sandbox container"
            );
        }
        info!(containers = existing.len(), "Reconciled sandbox state");

        let mut changes = self
            .monitor
            .start()
            .await
            .context("Failed to start container event monitor")?;

        let mut cleanup = interval(cleanup_interval(self.config.ports.reservation_ttl));
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut dump = self.metrics_interval();

        info!("Sandcastle control plane running");
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown signal received, starting graceful shutdown");
                    break;
                }
                change = changes.recv() => match change {
                    Some(change) => self.on_status_change(change).await,
                    None => {
                        warn!("Container event monitor closed its channel");
                        break;
                    }
                },
                _ = cleanup.tick() => {
                    let expired = self.ports.cleanup_expired().await;
                    if expired > 0 {
                        info!(expired, "Reclaimed expired port reservations");
                    }
                }
                _ = tick(&mut dump) => self.dump_metrics(),
            }
        }

        self.monitor.stop().await;
        self.processes.stop_all().await;
        info!("Sandcastle control plane stopped");
        Ok(())
    }

    /// Free everything held for a sandbox whose container is gone
    async fn on_status_change(&self, change: StatusChange) {
        info!(
            container_id = %change.container_id,
            sandbox_id = ?change.sandbox_id,
            project_id = ?change.project_id,
            status = %change.status,
            action = %change.action,
            "Sandbox status changed"
        );

        if change.status != SandboxStatus::Terminated {
            return;
        }
        let Some(sandbox_id) = change.sandbox_id.as_deref() else {
            return;
        };

        let ports = self.ports.release_by_sandbox(sandbox_id).await;
        let fingerprints = self.tools.invalidate_sandbox(sandbox_id);
        info!(
            sandbox_id,
            released_ports = ports.len(),
            fingerprints,
            "Released resources of terminated sandbox"
        );
    }

    fn metrics_interval(&self) -> Option<Interval> {
        let config = &self.config.observability.metrics;
        if !config.enabled || config.dump_interval_secs == 0 {
            return None;
        }
        let mut dump = interval(Duration::from_secs(config.dump_interval_secs));
        dump.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Some(dump)
    }

    fn dump_metrics(&self) {
        for (provider, load) in self.rate_limiter.all_metrics() {
            debug!(
                provider = %provider,
                active = load.active_requests,
                queued = load.queued_requests,
                "Provider load"
            );
        }

        match self.metrics.encode(self.config.observability.metrics.format) {
            Ok(text) => info!(target: "sandcastle::metrics", "{}", text),
            Err(e) => warn!(error = %e, "Failed to encode metrics"),
        }
    }
}

fn cleanup_interval(ttl: Duration) -> Duration {
    (ttl / 4).max(MIN_CLEANUP_INTERVAL)
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Resolves on Ctrl+C or SIGTERM
pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandcastle_agent::{compute_hash, MockRuntime, PortRange, RuntimeEvent};
    use std::collections::HashMap;
    use tokio::sync::oneshot;

    fn test_config(base: u16) -> SandcastleConfig {
        let mut config = SandcastleConfig::default();
        config.ports.control_range = PortRange::new(base, base + 1);
        config.ports.desktop_range = PortRange::new(base + 2, base + 3);
        config.ports.terminal_range = PortRange::new(base + 4, base + 5);
        config.observability.metrics.dump_interval_secs = 0;
        config
    }

    fn destroy_event(sandbox_id: &str) -> RuntimeEvent {
        RuntimeEvent {
            container_id: format!("c-{}", sandbox_id),
            action: "destroy".to_string(),
            labels: HashMap::from([
                ("sandcastle.sandbox".to_string(), "true".to_string()),
                ("sandcastle.sandbox_id".to_string(), sandbox_id.to_string()),
            ]),
        }
    }

    #[test]
    fn test_cleanup_interval_floor() {
        assert_eq!(cleanup_interval(Duration::from_secs(300)), Duration::from_secs(75));
        assert_eq!(cleanup_interval(Duration::from_millis(100)), MIN_CLEANUP_INTERVAL);
    }

    #[tokio::test]
    async fn test_terminated_sandbox_is_released() {
        let runtime = Arc::new(MockRuntime::new());
        let metrics = Arc::new(SandcastleMetrics::new().unwrap());
        let plane = ControlPlane::new(test_config(44100), runtime.clone(), metrics);

        let ports = plane.ports.clone();
        let tools = plane.tools.clone();
        let reservation = ports.allocate_ports("sb-1").await.unwrap();
        tools.store("sb-1", "desktop", compute_hash(&[]));

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(plane.serve(async {
            let _ = stop_rx.await;
        }));

        for _ in 0..200 {
            if runtime.watcher_count() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        runtime.emit(destroy_event("sb-1"));

        for _ in 0..200 {
            if !ports.is_reserved(reservation.control_port).await && tools.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!ports.is_reserved(reservation.control_port).await);
        assert!(tools.is_empty());

        stop_tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_disabled_metrics_are_not_reported() {
        let runtime = Arc::new(MockRuntime::new());
        let metrics = Arc::new(SandcastleMetrics::new().unwrap());
        let mut config = test_config(44300);
        config.observability.metrics.enabled = false;
        let plane = ControlPlane::new(config, runtime, metrics.clone());

        plane.ports.allocate_ports("sb-1").await.unwrap();
        let _permit = plane.rate_limiter.acquire("anthropic").await.into_result().unwrap();

        assert_eq!(metrics.port_reservations.get(), 0);
        assert_eq!(
            metrics.rate_limit_accepted_total.with_label_values(&["anthropic"]).get(),
            0
        );
        assert!(plane.metrics_interval().is_none());
    }

    #[tokio::test]
    async fn test_enabled_metrics_are_reported() {
        let runtime = Arc::new(MockRuntime::new());
        let metrics = Arc::new(SandcastleMetrics::new().unwrap());
        let plane = ControlPlane::new(test_config(44400), runtime, metrics.clone());

        plane.ports.allocate_ports("sb-1").await.unwrap();
        assert_eq!(metrics.port_reservations.get(), 3);
    }

    #[tokio::test]
    async fn test_non_terminal_status_keeps_resources() {
        let runtime = Arc::new(MockRuntime::new());
        let metrics = Arc::new(SandcastleMetrics::new().unwrap());
        let plane = ControlPlane::new(test_config(44200), runtime, metrics);

        let reservation = plane.ports.allocate_ports("sb-1").await.unwrap();
        plane
            .on_status_change(StatusChange {
                project_id: None,
                sandbox_id: Some("sb-1".to_string()),
                container_id: "c-1".to_string(),
                status: SandboxStatus::Stopped,
                action: "die".to_string(),
            })
            .await;

        assert!(plane.ports.is_reserved(reservation.control_port).await);
    }
}
