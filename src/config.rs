use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Which component this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Scheduler,
    Agent,
    Gateway,
    /// Sidecar that registers a service instance and keeps it alive.
    Register,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    pub store: StoreSettings,
    /// How often the agent retries failed replicas.
    pub retry_interval_secs: u64,
    pub scheduler: SchedulerSettings,
    pub gateway: GatewaySettings,
    pub registration: RegistrationSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreSettings {
    /// etcd endpoint; without one an in-process store is used.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub dial_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerSettings {
    pub bind: SocketAddr,
    pub api_prefix: String,
    pub catalog_file: PathBuf,
    pub rollout_timeout_secs: u64,
    pub fleet_audit_secs: u64,
    pub registration_audit_secs: u64,
    pub recipients: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewaySettings {
    pub bind: SocketAddr,
    pub route_prefix: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegistrationSettings {
    pub ttl_secs: u64,
    pub heartbeat_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            role: Role::Agent,
            node_name: None,
            store: StoreSettings {
                endpoint: None,
                dial_timeout_secs: 5,
            },
            retry_interval_secs: 60,
            scheduler: SchedulerSettings {
                bind: SocketAddr::from(([0, 0, 0, 0], 20000)),
                api_prefix: "flotilla".into(),
                catalog_file: PathBuf::from("catalog.toml"),
                rollout_timeout_secs: 120,
                fleet_audit_secs: 120,
                registration_audit_secs: 180,
                recipients: Vec::new(),
                webhook_url: None,
            },
            gateway: GatewaySettings {
                bind: SocketAddr::from(([0, 0, 0, 0], 3030)),
                route_prefix: "/api/v3".into(),
            },
            registration: RegistrationSettings {
                ttl_secs: 10,
                heartbeat_secs: 10,
            },
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("flotilla.toml"))
            .merge(Json::file("flotilla.json"))
            .merge(Env::prefixed("FLOTILLA_").split("__"));
        let mut config = Self::from_figment(figment)?;

        // Deployed containers receive the store address as `Etcd`.
        if config.store.endpoint.is_none() {
            if let Ok(endpoint) = std::env::var(crate::types::env::STORE) {
                if !endpoint.is_empty() {
                    config.store.endpoint = Some(endpoint);
                }
            }
        }
        Ok(config)
    }

    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Config = figment.extract()?;
        if config.retry_interval_secs == 0 {
            return Err(ConfigError::Invalid("retry_interval_secs must be > 0".into()));
        }
        if !config.gateway.route_prefix.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "gateway.route_prefix must start with '/': {}",
                config.gateway.route_prefix
            )));
        }
        Ok(config)
    }

    /// Node identity: configured name, else `HOSTNAME`, else `/etc/hostname`.
    pub fn node_name(&self) -> Result<String, ConfigError> {
        if let Some(name) = self.node_name.as_ref().filter(|n| !n.is_empty()) {
            return Ok(name.clone());
        }
        if let Ok(name) = std::env::var("HOSTNAME") {
            if !name.trim().is_empty() {
                return Ok(name.trim().to_string());
            }
        }
        std::fs::read_to_string("/etc/hostname")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::NodeName)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }
}

/// Declared shape of one service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServiceConfig {
    /// Filled from the catalog key.
    #[serde(default)]
    pub name: String,
    pub replica: usize,
    /// Image without tag, e.g. `registry:5000/panel`.
    pub image_prefix: String,
    pub port: String,
    pub container_port: String,
    #[serde(default)]
    pub need_public_network: bool,
    /// Store address handed to the containers; defaults to the
    /// scheduler's own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_endpoint: Option<String>,
}

/// Declared shape of one fleet node.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct NodeConfig {
    pub hostname: String,
    pub private_ip: String,
    #[serde(default)]
    pub public_ip: String,
    #[serde(default)]
    pub has_public: bool,
}

/// Services and nodes known to the scheduler.  Immutable after startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Catalog {
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

impl Catalog {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::Invalid(format!(
                "catalog file {} not found",
                path.display()
            )));
        }
        Self::from_figment(Figment::new().merge(Toml::file(path)))
    }

    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let mut catalog: Catalog = figment.extract()?;
        for (name, service) in catalog.services.iter_mut() {
            service.name = name.clone();
        }
        Ok(catalog)
    }

    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.get(name)
    }
}
