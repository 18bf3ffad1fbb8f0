use super::ContainerRuntime;
use crate::error::RuntimeError;
use crate::types::env;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use futures_util::stream::StreamExt;
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap};

/// Seconds docker waits after SIGTERM before killing a stopped container.
const STOP_GRACE_SECS: i64 = 10;

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon using default settings.
    /// This handles unix socket on Linux.
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn pull(&self, image: &str) -> Result<(), RuntimeError> {
        info!("Pulling {}", image);
        let opts = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(opts), None, None);
        while let Some(progress) = stream.next().await {
            match progress {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!("pull {}: {}", image, status);
                    }
                    if let Some(err) = info.error {
                        return Err(RuntimeError::Pull {
                            image: image.to_string(),
                            reason: err,
                        });
                    }
                }
                Err(e) => {
                    return Err(RuntimeError::Pull {
                        image: image.to_string(),
                        reason: e.to_string(),
                    })
                }
            }
        }
        info!("Pulled {}", image);
        Ok(())
    }

    async fn stop(&self, container_id: &str) -> Result<(), RuntimeError> {
        self.docker
            .stop_container(container_id, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await
            .map_err(|e| {
                warn!("docker stop {} failed: {}", container_id, e);
                RuntimeError::from(e)
            })?;
        info!("Stopped container {}", container_id);
        Ok(())
    }

    async fn run(
        &self,
        image: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<String, RuntimeError> {
        let config = container_config(image, env)?;
        let created = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await
            .map_err(|e| RuntimeError::Run {
                image: image.to_string(),
                reason: e.to_string(),
            })?;
        for warning in &created.warnings {
            warn!("docker create {}: {}", image, warning);
        }
        self.docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| RuntimeError::Run {
                image: image.to_string(),
                reason: e.to_string(),
            })?;
        info!("Started {} as {}", image, created.id);
        Ok(created.id)
    }
}

/// Builds the create request: every env entry is passed through and the
/// `Port`/`ContainerPort` pair becomes the published port binding.
/// An empty environment runs the image as-is.
fn container_config(
    image: &str,
    vars: &BTreeMap<String, String>,
) -> Result<Config<String>, RuntimeError> {
    let mut config = Config {
        image: Some(image.to_string()),
        ..Default::default()
    };
    if vars.is_empty() {
        return Ok(config);
    }

    let host_port = vars.get(env::PORT).filter(|p| !p.is_empty());
    let container_port = vars.get(env::CONTAINER_PORT).filter(|p| !p.is_empty());
    let (host_port, container_port) = match (host_port, container_port) {
        (Some(h), Some(c)) => (h, c),
        _ => {
            return Err(RuntimeError::MissingPorts(format!(
                "{} and {}",
                env::PORT,
                env::CONTAINER_PORT
            )))
        }
    };

    let exposed = format!("{container_port}/tcp");
    let mut bindings = HashMap::new();
    bindings.insert(
        exposed.clone(),
        Some(vec![PortBinding {
            host_ip: None,
            host_port: Some(host_port.clone()),
        }]),
    );
    let mut exposed_ports = HashMap::new();
    exposed_ports.insert(exposed, HashMap::new());

    config.env = Some(vars.iter().map(|(k, v)| format!("{k}={v}")).collect());
    config.exposed_ports = Some(exposed_ports);
    config.host_config = Some(HostConfig {
        port_bindings: Some(bindings),
        ..Default::default()
    });
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn ports_become_bindings() {
        let config = container_config(
            "registry:5000/panel:abc",
            &vars(&[("Port", "8999"), ("ContainerPort", "80"), ("ServiceName", "panel")]),
        )
        .unwrap();
        let env = config.env.unwrap();
        assert!(env.contains(&"ServiceName=panel".to_string()));
        let bindings = config.host_config.unwrap().port_bindings.unwrap();
        let binding = bindings["80/tcp"].as_ref().unwrap();
        assert_eq!(binding[0].host_port.as_deref(), Some("8999"));
    }

    #[test]
    fn env_without_ports_is_rejected() {
        let err = container_config("img:1", &vars(&[("ServiceName", "panel")])).unwrap_err();
        assert!(matches!(err, RuntimeError::MissingPorts(_)));
    }

    #[test]
    fn empty_env_runs_plain_image() {
        let config = container_config("img:1", &BTreeMap::new()).unwrap();
        assert!(config.env.is_none());
        assert!(config.host_config.is_none());
    }
}
