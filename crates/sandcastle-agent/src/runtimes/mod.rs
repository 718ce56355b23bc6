//! Container runtime implementations
//!
//! - **docker**: talks to the local Docker daemon through bollard. Enabled by
//!   the default `docker` feature.
//!
//! Tests and local experiments use [`MockRuntime`](crate::runtime::MockRuntime).

#[cfg(feature = "docker")]
mod docker;

#[cfg(feature = "docker")]
pub use docker::DockerRuntime;

use crate::error::Result;
use crate::runtime::ContainerRuntime;
use std::sync::Arc;

/// Connect to the best runtime compiled into this build
pub async fn connect_default_runtime() -> Result<Arc<dyn ContainerRuntime>> {
    #[cfg(feature = "docker")]
    {
        Ok(Arc::new(DockerRuntime::new().await?))
    }

    #[cfg(not(feature = "docker"))]
    {
        Err(crate::error::SandboxError::runtime(
            "connect",
            "no container runtime compiled in (enable the `docker` feature)",
        ))
    }
}
