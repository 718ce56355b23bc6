//! Control plane configuration
//!
//! Every section has serde defaults so a config file only needs to name what
//! it overrides. Durations are written as human strings (`"5m"`, `"250ms"`).

use crate::error::{Result, SandboxError};
use sandcastle_observability::ObservabilityConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

pub(crate) mod duration {
    use humantime::format_duration;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(|e| D::Error::custom(format!("invalid duration: {}", e)))
    }
}

/// Inclusive host port range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// Number of ports in the range
    pub fn len(&self) -> usize {
        if self.end < self.start {
            0
        } else {
            (self.end - self.start) as usize + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    /// Port at `offset` from the start; callers keep `offset < len()`
    pub(crate) fn nth(&self, offset: usize) -> u16 {
        self.start + offset as u16
    }
}

/// Port allocator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortAllocatorConfig {
    /// Range for the control-channel (RPC) endpoint
    #[serde(default = "default_control_range")]
    pub control_range: PortRange,

    /// Range for the interactive desktop (VNC/noVNC) endpoint
    #[serde(default = "default_desktop_range")]
    pub desktop_range: PortRange,

    /// Range for the interactive terminal endpoint
    #[serde(default = "default_terminal_range")]
    pub terminal_range: PortRange,

    /// How long an unconfirmed reservation lives
    #[serde(default = "default_reservation_ttl", with = "duration")]
    pub reservation_ttl: Duration,

    /// Address used for the local bind probe
    #[serde(default = "default_bind_host")]
    pub bind_host: IpAddr,

    /// Hand every slot to the container runtime (port 0) instead of allocating
    #[serde(default)]
    pub auto_assign: bool,
}

fn default_control_range() -> PortRange {
    PortRange::new(30000, 30999)
}

fn default_desktop_range() -> PortRange {
    PortRange::new(31000, 31999)
}

fn default_terminal_range() -> PortRange {
    PortRange::new(32000, 32999)
}

fn default_reservation_ttl() -> Duration {
    Duration::from_secs(300)
}

fn default_bind_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

impl Default for PortAllocatorConfig {
    fn default() -> Self {
        Self {
            control_range: default_control_range(),
            desktop_range: default_desktop_range(),
            terminal_range: default_terminal_range(),
            reservation_ttl: default_reservation_ttl(),
            bind_host: default_bind_host(),
            auto_assign: false,
        }
    }
}

/// Process tracker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessTrackerConfig {
    /// Grace period between SIGTERM and SIGKILL
    #[serde(default = "default_stop_timeout", with = "duration")]
    pub stop_timeout: Duration,

    /// Restart budget recorded on newly started processes
    #[serde(default = "default_max_restarts")]
    pub default_max_restarts: u32,

    /// Bytes of stderr kept for crash diagnostics
    #[serde(default = "default_stderr_tail_bytes")]
    pub stderr_tail_bytes: usize,
}

fn default_stop_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_max_restarts() -> u32 {
    3
}

fn default_stderr_tail_bytes() -> usize {
    1000
}

impl Default for ProcessTrackerConfig {
    fn default() -> Self {
        Self {
            stop_timeout: default_stop_timeout(),
            default_max_restarts: default_max_restarts(),
            stderr_tail_bytes: default_stderr_tail_bytes(),
        }
    }
}

/// Container event monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Label present on every sandbox container
    #[serde(default = "default_sandbox_label")]
    pub sandbox_label: String,

    /// Label carrying the sandbox id
    #[serde(default = "default_sandbox_id_label")]
    pub sandbox_id_label: String,

    /// Label carrying the owning project id
    #[serde(default = "default_project_id_label")]
    pub project_id_label: String,

    /// First delay before re-subscribing after the event feed drops
    #[serde(default = "default_retry_backoff", with = "duration")]
    pub retry_backoff: Duration,

    /// Upper bound for the doubling reconnect delay
    #[serde(default = "default_max_retry_backoff", with = "duration")]
    pub max_retry_backoff: Duration,

    /// Buffered status changes before the reader waits on the consumer
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_sandbox_label() -> String {
    "sandcastle.sandbox".to_string()
}

fn default_sandbox_id_label() -> String {
    "sandcastle.sandbox_id".to_string()
}

fn default_project_id_label() -> String {
    "sandcastle.project_id".to_string()
}

fn default_retry_backoff() -> Duration {
    Duration::from_secs(5)
}

fn default_max_retry_backoff() -> Duration {
    Duration::from_secs(60)
}

fn default_channel_capacity() -> usize {
    256
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sandbox_label: default_sandbox_label(),
            sandbox_id_label: default_sandbox_id_label(),
            project_id_label: default_project_id_label(),
            retry_backoff: default_retry_backoff(),
            max_retry_backoff: default_max_retry_backoff(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// Connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum live connections handed out or idle at once
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Deadline for establishing a new connection
    #[serde(default = "default_connect_timeout", with = "duration")]
    pub connect_timeout: Duration,
}

fn default_pool_size() -> usize {
    4
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

/// What happens when a provider is at capacity
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionStrategy {
    /// Fail immediately
    Reject,
    /// Wait for a slot until the provider timeout elapses
    #[default]
    Queue,
}

/// Concurrency budget of one upstream provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderBudget {
    pub max_concurrent: usize,
    #[serde(default = "default_provider_timeout", with = "duration")]
    pub timeout: Duration,
}

fn default_provider_timeout() -> Duration {
    Duration::from_secs(60)
}

impl ProviderBudget {
    pub const fn new(max_concurrent: usize, timeout: Duration) -> Self {
        Self {
            max_concurrent,
            timeout,
        }
    }
}

impl Default for ProviderBudget {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            timeout: default_provider_timeout(),
        }
    }
}

/// Rate limiter configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// Process-wide admission strategy
    #[serde(default)]
    pub strategy: AdmissionStrategy,

    /// Budget seeded for providers not listed in `providers`
    #[serde(default)]
    pub default_budget: ProviderBudget,

    /// Per-provider budgets
    #[serde(default)]
    pub providers: HashMap<String, ProviderBudget>,
}

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandcastleConfig {
    #[serde(default)]
    pub ports: PortAllocatorConfig,
    #[serde(default)]
    pub processes: ProcessTrackerConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub rate_limits: RateLimiterConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl SandcastleConfig {
    /// Read and validate a YAML config file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            SandboxError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate YAML text
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(contents)
            .map_err(|e| SandboxError::Config(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations no component could run with
    pub fn validate(&self) -> Result<()> {
        for (class, range) in [
            ("control", self.ports.control_range),
            ("desktop", self.ports.desktop_range),
            ("terminal", self.ports.terminal_range),
        ] {
            if range.is_empty() || range.start == 0 {
                return Err(SandboxError::Config(format!(
                    "{} port range {}-{} is empty or starts at 0",
                    class, range.start, range.end
                )));
            }
        }

        if self.pool.pool_size == 0 {
            return Err(SandboxError::Config("pool_size must be at least 1".into()));
        }

        if self.rate_limits.default_budget.max_concurrent == 0 {
            return Err(SandboxError::Config(
                "default_budget.max_concurrent must be at least 1".into(),
            ));
        }

        if let Some((name, _)) = self
            .rate_limits
            .providers
            .iter()
            .find(|(_, b)| b.max_concurrent == 0)
        {
            return Err(SandboxError::Config(format!(
                "provider '{}' has max_concurrent 0",
                name
            )));
        }

        if self.monitor.channel_capacity == 0 {
            return Err(SandboxError::Config(
                "monitor.channel_capacity must be at least 1".into(),
            ));
        }

        Ok(())
    }
}
