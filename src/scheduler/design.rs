//! Expands a service's declared shape into per-replica deployment units.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use log::{info, warn};

use crate::config::{NodeConfig, ServiceConfig};
use crate::error::DesignError;
use crate::types::{env, new_id, DeploymentUnit};

/// Nodes a service may be placed on.  Services that need the public
/// network only go to nodes that have it.
pub fn eligible_nodes(nodes: &[NodeConfig], need_public: bool) -> Vec<&NodeConfig> {
    nodes
        .iter()
        .filter(|n| !need_public || n.has_public)
        .collect()
}

/// Designs one unit per replica slot, in rollout order.  Each replica
/// gets its own eligible node, taken in catalog order: a node runs at
/// most one replica of a service, so a pool smaller than the replica
/// count is refused.
pub fn design_units(
    service: &ServiceConfig,
    nodes: &[NodeConfig],
    commit_hash: &str,
    create_time: DateTime<Utc>,
    default_store: &str,
) -> Result<Vec<DeploymentUnit>, DesignError> {
    let eligible = eligible_nodes(nodes, service.need_public_network);
    if eligible.is_empty() {
        let err = DesignError::NoEligibleNodes {
            need_public: service.need_public_network,
        };
        warn!("Cannot place {}: {}", service.name, err);
        return Err(err);
    }
    if service.replica > eligible.len() {
        let err = DesignError::InsufficientNodes {
            wanted: service.replica,
            eligible: eligible.len(),
        };
        warn!("Cannot place {}: {}", service.name, err);
        return Err(err);
    }

    let full_name = format!("{}:{}", service.image_prefix, commit_hash);
    let store = service
        .store_endpoint
        .clone()
        .unwrap_or_else(|| default_store.to_string());

    let units: Vec<DeploymentUnit> = eligible
        .iter()
        .take(service.replica)
        .map(|node| {
            let vars = BTreeMap::from([
                (env::IP.to_string(), node.private_ip.clone()),
                (env::PORT.to_string(), service.port.clone()),
                (env::CONTAINER_PORT.to_string(), service.container_port.clone()),
                (env::HOST.to_string(), node.hostname.clone()),
                (env::STORE.to_string(), store.clone()),
                (env::SERVICE_NAME.to_string(), service.name.clone()),
            ]);
            DeploymentUnit {
                id: new_id(),
                full_name: full_name.clone(),
                service_name: service.name.clone(),
                env: vars,
                node: node.hostname.clone(),
                create_time,
            }
        })
        .collect();

    info!(
        "Designed {} units for {} at {}",
        units.len(),
        service.name,
        commit_hash
    );
    Ok(units)
}
