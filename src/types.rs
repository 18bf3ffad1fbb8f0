//! Data structures exchanged through the coordination store.
//!
//! Everything here is serialised as JSON with [`serde`](https://serde.rs/)
//! and written under the key conventions in [`crate::keys`].  The
//! scheduler produces [`DeploymentUnit`]s, node agents turn them into
//! [`ReplicaRecord`]s, and service processes announce themselves with a
//! [`ServiceRegistration`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ImageRefError;

/// Environment keys injected into every container the scheduler designs.
pub mod env {
    pub const IP: &str = "IP";
    pub const PORT: &str = "Port";
    pub const CONTAINER_PORT: &str = "ContainerPort";
    pub const HOST: &str = "Host";
    pub const STORE: &str = "Etcd";
    pub const SERVICE_NAME: &str = "ServiceName";
}

/// Length of the short container id the runtime prints and removal
/// instructions carry.
pub const SHORT_ID_LEN: usize = 12;

/// Generates a fresh identifier without separators, so it can be the
/// last `-`-delimited segment of a key.
pub fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Truncates a container id to the runtime's short form.
pub fn short_id(id: &str) -> &str {
    id.get(..SHORT_ID_LEN).unwrap_or(id)
}

/// A request to redeploy `service_name` at `commit_hash`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutRequest {
    #[serde(alias = "serviceName")]
    pub service_name: String,
    #[serde(alias = "commitHash")]
    pub commit_hash: String,
    #[serde(alias = "createTime", default = "Utc::now")]
    pub create_time: DateTime<Utc>,
}

impl RolloutRequest {
    pub fn new(service_name: impl Into<String>, commit_hash: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            commit_hash: commit_hash.into(),
            create_time: Utc::now(),
        }
    }
}

/// One replica's target image and placement.  Published by the
/// scheduler, consumed by the agent running on `node`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentUnit {
    pub id: String,
    pub full_name: String,
    pub service_name: String,
    pub env: BTreeMap<String, String>,
    pub node: String,
    pub create_time: DateTime<Utc>,
}

/// `name` and `version` resolved from a full image reference such as
/// `registry:5000/panel:abc123`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub name: String,
    pub version: String,
}

impl ImageRef {
    pub fn parse(full_name: &str) -> Result<Self, ImageRefError> {
        let last = full_name.rsplit('/').next().unwrap_or(full_name);
        match last.split_once(':') {
            Some((name, version))
                if !name.is_empty() && !version.is_empty() && !version.contains(':') =>
            {
                Ok(Self {
                    name: name.to_string(),
                    version: version.to_string(),
                })
            }
            _ => Err(ImageRefError(full_name.to_string())),
        }
    }
}

/// A replica as the node agent tracks it.  The same shape is used for
/// running and failed replicas; which map holds it decides its state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaRecord {
    /// Key of the durable [`ImageDetail`] for this replica, empty until
    /// the first successful start.
    #[serde(default)]
    pub detail_key: String,
    pub full_name: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub node: String,
    /// Container handle.  For a failed record this is the container that
    /// was running before the failed attempt, if any.
    #[serde(default)]
    pub container_id: String,
    /// Deployment unit that produced this record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_id: Option<String>,
}

/// Running (or failed) replicas on one node keyed by logical service name.
pub type ReplicaSet = BTreeMap<String, ReplicaRecord>;

/// Durable per-replica detail written under `image-<name>-<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDetail {
    pub name: String,
    pub full_name: String,
    pub version: String,
    pub env: BTreeMap<String, String>,
    pub node: String,
    pub container_id: String,
    pub create_time: DateTime<Utc>,
}

/// One live instance of a service, for discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRegistration {
    pub id: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub port: String,
    #[serde(default)]
    pub container_port: String,
    pub host: String,
    pub address: String,
    pub service_name: String,
}

/// Instruction to forget a replica whose container went away.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovalInstruction {
    pub service_name: String,
    pub container_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_ref_with_registry_port() {
        let r = ImageRef::parse("registry.local:5000/panel:abc123").unwrap();
        assert_eq!(r.name, "panel");
        assert_eq!(r.version, "abc123");
    }

    #[test]
    fn image_ref_without_tag_is_rejected() {
        assert!(ImageRef::parse("registry.local:5000/panel").is_err());
        assert!(ImageRef::parse("panel:").is_err());
        assert!(ImageRef::parse("").is_err());
    }

    #[test]
    fn short_id_truncates_long_ids_only() {
        assert_eq!(short_id("0123456789abcdef"), "0123456789ab");
        assert_eq!(short_id("abc"), "abc");
    }

    #[test]
    fn rollout_request_accepts_camel_case_and_defaults_time() {
        let req: RolloutRequest =
            serde_json::from_str(r#"{"serviceName":"panel","commitHash":"abc"}"#).unwrap();
        assert_eq!(req.service_name, "panel");
        assert_eq!(req.commit_hash, "abc");
    }

    #[test]
    fn removal_instruction_wire_names() {
        let rm: RemovalInstruction =
            serde_json::from_str(r#"{"serviceName":"panel","containerId":"0123456789ab"}"#)
                .unwrap();
        assert_eq!(rm.service_name, "panel");
        assert_eq!(rm.container_id, "0123456789ab");
    }

    #[test]
    fn new_ids_have_no_separator() {
        let id = new_id();
        assert!(!id.contains('-'));
        assert_ne!(id, new_id());
    }
}
