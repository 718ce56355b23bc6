//! Sandcastle Agent - Sandbox resource management
//!
//! Keeps sandboxes reachable without leaking or double-booking resources:
//! host ports, tool-server processes, container lifecycle events, pooled
//! control-channel connections, upstream model call slots and tool list
//! fingerprints.
//!
//! Every component is an ordinary value built by the caller and shared by
//! `Arc`; nothing here is a process-wide singleton.

pub mod capabilities;
pub mod config;
pub mod connection_pool;
pub mod error;
pub mod event_monitor;
pub mod port_allocator;
pub mod process_tracker;
pub mod rate_limiter;
pub mod runtime;
pub mod runtimes;
pub mod tool_registry;
pub mod transport;

pub use capabilities::{
    CapabilitySet, Clicker, DesktopCapabilities, MouseButton, ScrollDirection, Scroller, Typer,
};
pub use config::*;
pub use connection_pool::{ConnectionPool, PoolStats, PooledConnection};
pub use error::*;
pub use event_monitor::{ContainerEventMonitor, SandboxStatus, StatusChange};
pub use port_allocator::{PortAllocationResult, PortAllocator, PortReservation, ServiceType};
pub use process_tracker::{
    ManagedProcess, ProcessStatus, ProcessTracker, ProcessTransport, StdioHandles, PORT_ENV,
};
pub use rate_limiter::{Admission, ProviderMetrics, RateLimiter, RatePermit};
pub use runtime::*;
pub use runtimes::connect_default_runtime;
pub use tool_registry::{compute_hash, RegistryStats, ToolDefinition, ToolRegistry, ToolsetFingerprint};
pub use transport::{Connection, Connector, TcpConnector, TcpTransport};

#[cfg(feature = "docker")]
pub use runtimes::DockerRuntime;
