//! Docker-backed container runtime using bollard
//!
//! Read-only: lists and inspects sandbox containers, collects published host
//! ports, and streams lifecycle events.

use crate::error::{Result, SandboxError};
use crate::runtime::{ContainerInfo, ContainerRuntime, RuntimeEvent, LIFECYCLE_ACTIONS};
use bollard::models::{ContainerInspectResponse, ContainerSummary, EventMessage};
use bollard::query_parameters::{EventsOptions, ListContainersOptions};
use bollard::Docker;
use futures_util::StreamExt;
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tracing::instrument;

/// Docker runtime connected to the local daemon
pub struct DockerRuntime {
    docker: Docker,
}

impl std::fmt::Debug for DockerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerRuntime").finish_non_exhaustive()
    }
}

impl DockerRuntime {
    /// Connect to the local Docker daemon using platform defaults
    ///
    /// # Errors
    ///
    /// Returns an error if the daemon is unreachable or does not answer a ping.
    pub async fn new() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::runtime("connect", e))?;

        docker
            .ping()
            .await
            .map_err(|e| SandboxError::runtime("ping", e))?;

        tracing::info!("Connected to Docker daemon");
        Ok(Self { docker })
    }

    /// Wrap an existing client
    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }
}

fn label_filter(label: &str) -> HashMap<String, Vec<String>> {
    HashMap::from([("label".to_string(), vec![label.to_string()])])
}

fn info_from_summary(summary: ContainerSummary) -> Option<ContainerInfo> {
    let id = summary.id?;
    let mut published_ports: Vec<u16> = summary
        .ports
        .unwrap_or_default()
        .into_iter()
        .filter_map(|p| p.public_port)
        .collect();
    published_ports.sort_unstable();
    published_ports.dedup();

    Some(ContainerInfo {
        id,
        state: summary.state.map(|s| s.to_string()).unwrap_or_default(),
        labels: summary.labels.unwrap_or_default(),
        published_ports,
    })
}

fn info_from_inspect(container_id: &str, inspect: ContainerInspectResponse) -> ContainerInfo {
    let state = inspect
        .state
        .and_then(|s| s.status)
        .map(|s| s.to_string())
        .unwrap_or_default();
    let labels = inspect
        .config
        .and_then(|c| c.labels)
        .unwrap_or_default();

    let mut published_ports: Vec<u16> = inspect
        .network_settings
        .and_then(|n| n.ports)
        .unwrap_or_default()
        .into_values()
        .flatten()
        .flatten()
        .filter_map(|binding| binding.host_port)
        .filter_map(|port| port.parse().ok())
        .collect();
    published_ports.sort_unstable();
    published_ports.dedup();

    ContainerInfo {
        id: inspect.id.unwrap_or_else(|| container_id.to_string()),
        state,
        labels,
        published_ports,
    }
}

fn event_from_message(message: EventMessage) -> Option<RuntimeEvent> {
    let action = message.action?;
    let actor = message.actor?;
    Some(RuntimeEvent {
        container_id: actor.id?,
        action,
        labels: actor.attributes.unwrap_or_default(),
    })
}

#[async_trait::async_trait]
impl ContainerRuntime for DockerRuntime {
    #[instrument(skip(self), fields(otel.name = "container.list"))]
    async fn list_containers(&self, label: &str) -> Result<Vec<ContainerInfo>> {
        let options = ListContainersOptions {
            all: true,
            filters: Some(label_filter(label)),
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| SandboxError::runtime("list", e))?;

        let infos: Vec<ContainerInfo> = containers.into_iter().filter_map(info_from_summary).collect();
        tracing::debug!(count = infos.len(), "listed sandbox containers");
        Ok(infos)
    }

    #[instrument(skip(self), fields(otel.name = "container.inspect"))]
    async fn inspect_container(&self, container_id: &str) -> Result<ContainerInfo> {
        let inspect = self
            .docker
            .inspect_container(container_id, None::<bollard::query_parameters::InspectContainerOptions>)
            .await
            .map_err(|e| SandboxError::runtime("inspect", e))?;

        Ok(info_from_inspect(container_id, inspect))
    }

    #[instrument(skip(self), fields(otel.name = "container.published_ports"))]
    async fn published_ports(&self) -> Result<HashSet<u16>> {
        let options = ListContainersOptions {
            all: true,
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| SandboxError::runtime("list", e))?;

        Ok(containers
            .into_iter()
            .flat_map(|c| c.ports.unwrap_or_default())
            .filter_map(|p| p.public_port)
            .collect())
    }

    #[instrument(skip(self, tx), fields(otel.name = "container.events"))]
    async fn watch_events(&self, label: &str, tx: mpsc::Sender<RuntimeEvent>) -> Result<()> {
        let mut filters = label_filter(label);
        filters.insert("type".to_string(), vec!["container".to_string()]);
        filters.insert(
            "event".to_string(),
            LIFECYCLE_ACTIONS.iter().map(|a| a.to_string()).collect(),
        );

        let mut stream = self.docker.events(Some(EventsOptions {
            filters: Some(filters),
            ..Default::default()
        }));
        tracing::info!("subscribed to Docker events");

        while let Some(message) = stream.next().await {
            let message = message.map_err(|e| SandboxError::runtime("events", e))?;
            let Some(event) = event_from_message(message) else {
                continue;
            };
            if tx.send(event).await.is_err() {
                return Ok(());
            }
        }

        Ok(())
    }
}
