//! Host port allocation for sandbox service endpoints
//!
//! Every sandbox needs three host ports (control channel, desktop, terminal).
//! The allocator hands them out as one reservation under a single lock, so
//! concurrent callers can never be given the same port and a failed call never
//! leaves a partial reservation behind.
//!
//! Reservations expire after a TTL unless confirmed. Expired reservations are
//! purged lazily at the start of every allocation and eagerly by
//! [`PortAllocator::cleanup_expired`].

use crate::config::{PortAllocatorConfig, PortRange};
use crate::error::{Result, SandboxError};
use crate::runtime::ContainerRuntime;
use sandcastle_observability::SandcastleMetrics;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

/// Logical service class a port is reserved for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    /// RPC control channel
    Control,
    /// Interactive desktop (VNC)
    Desktop,
    /// Interactive terminal
    Terminal,
}

impl ServiceType {
    /// Allocation order within one reservation
    pub const ALL: [ServiceType; 3] = [Self::Control, Self::Desktop, Self::Terminal];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Control => "control",
            Self::Desktop => "desktop",
            Self::Terminal => "terminal",
        }
    }

    fn index(self) -> usize {
        match self {
            Self::Control => 0,
            Self::Desktop => 1,
            Self::Terminal => 2,
        }
    }
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A claim on one host port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortReservation {
    pub port: u16,
    pub sandbox_id: String,
    pub service_type: ServiceType,
    pub reserved_at: Instant,
    /// `None` once confirmed; confirmed reservations never expire
    pub expires_at: Option<Instant>,
}

impl PortReservation {
    pub fn is_confirmed(&self) -> bool {
        self.expires_at.is_none()
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

/// Ports handed out for one sandbox
///
/// A port value of `0` means the container runtime picks the port itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAllocationResult {
    pub control_port: u16,
    pub desktop_port: u16,
    pub terminal_port: u16,
    /// Groups the three ports so they are released together
    pub reservation_id: Uuid,
}

impl PortAllocationResult {
    /// Sentinel port meaning "let the runtime choose"
    pub const AUTO_ASSIGN: u16 = 0;

    pub fn ports(&self) -> [u16; 3] {
        [self.control_port, self.desktop_port, self.terminal_port]
    }

    pub fn port(&self, service: ServiceType) -> u16 {
        self.ports()[service.index()]
    }

    pub fn is_auto_assigned(&self) -> bool {
        self.ports().iter().all(|p| *p == Self::AUTO_ASSIGN)
    }
}

#[derive(Debug, Default)]
struct AllocatorState {
    /// Reservation groups keyed by reservation id
    reservations: HashMap<Uuid, Vec<PortReservation>>,
    /// Every reserved port and the group that owns it
    active: HashMap<u16, Uuid>,
    /// Round-robin offset per service class
    cursors: [usize; 3],
}

impl AllocatorState {
    /// Drop expired groups; returns how many were removed
    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<Uuid> = self
            .reservations
            .iter()
            .filter(|(_, group)| group.iter().any(|r| r.is_expired(now)))
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            if let Some(ports) = self.remove_group(id) {
                tracing::debug!(reservation_id = %id, ?ports, "Reservation expired");
            }
        }
        expired.len()
    }

    fn remove_group(&mut self, id: &Uuid) -> Option<Vec<u16>> {
        let group = self.reservations.remove(id)?;
        let ports: Vec<u16> = group.iter().map(|r| r.port).collect();
        for port in &ports {
            self.active.remove(port);
        }
        Some(ports)
    }
}

/// Allocates and tracks host ports for sandboxes
pub struct PortAllocator {
    config: PortAllocatorConfig,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    metrics: Option<Arc<SandcastleMetrics>>,
    state: Mutex<AllocatorState>,
}

impl std::fmt::Debug for PortAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortAllocator")
            .field("config", &self.config)
            .field("has_runtime", &self.runtime.is_some())
            .finish_non_exhaustive()
    }
}

impl PortAllocator {
    /// Create an allocator that only checks its own reservations and local binds
    pub fn new(config: PortAllocatorConfig) -> Self {
        Self {
            config,
            runtime: None,
            metrics: None,
            state: Mutex::new(AllocatorState::default()),
        }
    }

    /// Also reject ports already published by containers on this host
    pub fn with_runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Mirror the reserved port count into the metrics registry
    pub fn with_metrics(mut self, metrics: Arc<SandcastleMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &PortAllocatorConfig {
        &self.config
    }

    fn range(&self, service: ServiceType) -> PortRange {
        match service {
            ServiceType::Control => self.config.control_range,
            ServiceType::Desktop => self.config.desktop_range,
            ServiceType::Terminal => self.config.terminal_range,
        }
    }

    /// Reserve a control, desktop and terminal port for a sandbox
    ///
    /// All three ports are chosen under one lock. If any class has no free
    /// port the call fails with [`SandboxError::PortsExhausted`] and nothing
    /// is reserved.
    pub async fn allocate_ports(&self, sandbox_id: &str) -> Result<PortAllocationResult> {
        if self.config.auto_assign {
            let reservation_id = Uuid::new_v4();
            tracing::debug!(
                sandbox_id,
                reservation_id = %reservation_id,
                "Port auto-assign enabled, deferring to container runtime"
            );
            return Ok(PortAllocationResult {
                control_port: PortAllocationResult::AUTO_ASSIGN,
                desktop_port: PortAllocationResult::AUTO_ASSIGN,
                terminal_port: PortAllocationResult::AUTO_ASSIGN,
                reservation_id,
            });
        }

        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.purge_expired(now);

        let published = self.published_ports().await;
        let mut cursors = state.cursors;
        let mut picked: Vec<u16> = Vec::with_capacity(ServiceType::ALL.len());

        for service in ServiceType::ALL {
            let port = self
                .find_free_port(&state, service, &published, &picked, &mut cursors)
                .await?;
            picked.push(port);
        }

        // Nothing is committed until every class has a port
        state.cursors = cursors;
        let reservation_id = Uuid::new_v4();
        let expires_at = Some(now + self.config.reservation_ttl);
        let group: Vec<PortReservation> = ServiceType::ALL
            .iter()
            .zip(&picked)
            .map(|(service, port)| PortReservation {
                port: *port,
                sandbox_id: sandbox_id.to_string(),
                service_type: *service,
                reserved_at: now,
                expires_at,
            })
            .collect();

        for port in &picked {
            state.active.insert(*port, reservation_id);
        }
        state.reservations.insert(reservation_id, group);
        self.sync_metrics(&state);

        let result = PortAllocationResult {
            control_port: picked[0],
            desktop_port: picked[1],
            terminal_port: picked[2],
            reservation_id,
        };

        tracing::info!(
            sandbox_id,
            reservation_id = %reservation_id,
            control = result.control_port,
            desktop = result.desktop_port,
            terminal = result.terminal_port,
            "Allocated sandbox ports"
        );

        Ok(result)
    }

    async fn find_free_port(
        &self,
        state: &AllocatorState,
        service: ServiceType,
        published: &HashSet<u16>,
        picked: &[u16],
        cursors: &mut [usize; 3],
    ) -> Result<u16> {
        let range = self.range(service);
        let len = range.len();
        let start = cursors[service.index()] % len.max(1);

        for step in 0..len {
            let offset = (start + step) % len;
            let port = range.nth(offset);

            if state.active.contains_key(&port) || picked.contains(&port) {
                continue;
            }
            if published.contains(&port) {
                tracing::debug!(port, service = %service, "Port published by a container, skipping");
                continue;
            }
            if !self.can_bind(port).await {
                tracing::debug!(port, service = %service, "Port not bindable, skipping");
                continue;
            }

            cursors[service.index()] = (offset + 1) % len;
            return Ok(port);
        }

        tracing::warn!(
            service = %service,
            range_start = range.start,
            range_end = range.end,
            "Port range exhausted"
        );
        Err(SandboxError::PortsExhausted {
            service,
            range_start: range.start,
            range_end: range.end,
            tried: len,
        })
    }

    async fn can_bind(&self, port: u16) -> bool {
        TcpListener::bind(SocketAddr::new(self.config.bind_host, port))
            .await
            .is_ok()
    }

    async fn published_ports(&self) -> HashSet<u16> {
        let Some(runtime) = &self.runtime else {
            return HashSet::new();
        };

        match runtime.published_ports().await {
            Ok(ports) => ports,
            Err(e) => {
                tracing::warn!(error = %e, "Could not list published container ports, relying on bind probe");
                HashSet::new()
            }
        }
    }

    /// Make a reservation permanent
    ///
    /// Returns `false` if the reservation is unknown or already expired.
    pub async fn confirm(&self, reservation_id: Uuid) -> bool {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        let expired = match state.reservations.get(&reservation_id) {
            None => return false,
            Some(group) => group.iter().any(|r| r.is_expired(now)),
        };
        if expired {
            state.remove_group(&reservation_id);
            self.sync_metrics(&state);
            return false;
        }

        if let Some(group) = state.reservations.get_mut(&reservation_id) {
            for reservation in group.iter_mut() {
                reservation.expires_at = None;
            }
        }
        tracing::debug!(reservation_id = %reservation_id, "Reservation confirmed");
        true
    }

    /// Release a reservation group, returning the freed ports
    ///
    /// Unknown ids release nothing and return an empty list.
    pub async fn release(&self, reservation_id: Uuid) -> Vec<u16> {
        let mut state = self.state.lock().await;
        let ports = state.remove_group(&reservation_id).unwrap_or_default();
        if !ports.is_empty() {
            self.sync_metrics(&state);
            tracing::info!(reservation_id = %reservation_id, ?ports, "Released ports");
        }
        ports
    }

    /// Release every reservation held by a sandbox
    pub async fn release_by_sandbox(&self, sandbox_id: &str) -> Vec<u16> {
        let mut state = self.state.lock().await;
        let ids: Vec<Uuid> = state
            .reservations
            .iter()
            .filter(|(_, group)| group.iter().any(|r| r.sandbox_id == sandbox_id))
            .map(|(id, _)| *id)
            .collect();

        let mut ports = Vec::new();
        for id in &ids {
            if let Some(freed) = state.remove_group(id) {
                ports.extend(freed);
            }
        }

        if !ports.is_empty() {
            self.sync_metrics(&state);
            tracing::info!(sandbox_id, ?ports, "Released sandbox ports");
        }
        ports
    }

    /// Purge expired reservations now; returns how many groups were removed
    pub async fn cleanup_expired(&self) -> usize {
        let mut state = self.state.lock().await;
        let removed = state.purge_expired(Instant::now());
        if removed > 0 {
            self.sync_metrics(&state);
            tracing::info!(removed, "Cleaned up expired port reservations");
        }
        removed
    }

    /// Snapshot of one reservation group
    pub async fn reservation(&self, reservation_id: Uuid) -> Option<Vec<PortReservation>> {
        self.state.lock().await.reservations.get(&reservation_id).cloned()
    }

    /// Number of live reservation groups
    pub async fn active_reservations(&self) -> usize {
        self.state.lock().await.reservations.len()
    }

    /// Number of reserved ports
    pub async fn active_port_count(&self) -> usize {
        self.state.lock().await.active.len()
    }

    /// Whether a port is currently held, including expired but not yet purged
    pub async fn is_reserved(&self, port: u16) -> bool {
        self.state.lock().await.active.contains_key(&port)
    }

    fn sync_metrics(&self, state: &AllocatorState) {
        if let Some(metrics) = &self.metrics {
            metrics.set_port_reservations(state.active.len());
        }
    }
}
