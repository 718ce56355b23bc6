//! Agent-side errors

use crate::port_allocator::ServiceType;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the sandbox resource managers
#[derive(Debug, Error)]
pub enum SandboxError {
    /// No free, bindable port left in a service class range
    #[error("No free {service} port in range {range_start}-{range_end} ({tried} candidates tried)")]
    PortsExhausted {
        service: ServiceType,
        range_start: u16,
        range_end: u16,
        tried: usize,
    },

    /// Provider is at capacity and the strategy is `reject`
    #[error("Rate limit reached for provider '{provider}' ({max_concurrent} concurrent calls)")]
    RateLimited {
        provider: String,
        max_concurrent: usize,
    },

    /// Waited too long for a provider slot under the `queue` strategy
    #[error("Timed out after {timeout:?} waiting for a '{provider}' call slot")]
    QueueTimeout { provider: String, timeout: Duration },

    /// Container runtime call failed
    #[error("Container runtime {operation} failed: {reason}")]
    Runtime { operation: String, reason: String },

    /// Child process could not be spawned
    #[error("Failed to spawn process '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    /// No process tracked under this name
    #[error("Process '{name}' is not tracked")]
    ProcessNotFound { name: String },

    /// Caller-driven restart refused because the budget is spent
    #[error("Process '{name}' already restarted {restarts} times (max {max})")]
    RestartLimitExceeded { name: String, restarts: u32, max: u32 },

    /// Could not establish a transport connection
    #[error("Failed to connect to {endpoint} within {timeout:?}")]
    ConnectFailed { endpoint: String, timeout: Duration },

    /// The pool was shut down
    #[error("Connection pool is closed")]
    PoolClosed,

    /// `start` called on a monitor that is already running
    #[error("Event monitor is already running")]
    MonitorAlreadyRunning,

    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl SandboxError {
    /// Build a runtime failure for the named operation
    pub fn runtime(operation: impl Into<String>, reason: impl ToString) -> Self {
        Self::Runtime {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the error reports a saturated resource rather than a fault
    pub fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            Self::PortsExhausted { .. } | Self::RateLimited { .. } | Self::QueueTimeout { .. }
        )
    }
}

pub type Result<T, E = SandboxError> = std::result::Result<T, E>;
