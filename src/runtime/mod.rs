use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::RuntimeError;

pub mod docker;
pub use docker::DockerRuntime;

/// Container lifecycle operations the node agent needs.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Fetch `image` so a later `run` does not hit the registry.
    async fn pull(&self, image: &str) -> Result<(), RuntimeError>;

    /// Stop a running container.
    async fn stop(&self, container_id: &str) -> Result<(), RuntimeError>;

    /// Start a detached container from `image` with `env` and return its id.
    async fn run(
        &self,
        image: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<String, RuntimeError>;
}
