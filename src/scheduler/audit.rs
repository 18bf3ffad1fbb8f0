//! Periodic consistency checks.  Findings are reported, never repaired.

use std::collections::{BTreeMap, BTreeSet};

use log::{error, info, warn};

use super::rollout::RolloutContext;
use crate::config::Catalog;
use crate::error::StoreError;
use crate::keys;
use crate::notify::{deliver, Journal};
use crate::registration::registrations;
use crate::store::{get_json, CoordinationStore};
use crate::types::{ReplicaSet, ServiceRegistration};

pub const FLEET_SUBJECT: &str = "Check-Fleet-Replicas";
pub const REGISTRATION_SUBJECT: &str = "Check-Service-Register";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaMismatch {
    pub service: String,
    pub expected: usize,
    pub actual: usize,
}

/// A running replica with no registration from its node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unregistered {
    pub service: String,
    pub node: String,
}

/// Node names of every agent currently announcing liveness.
pub async fn live_agents(store: &dyn CoordinationStore) -> Result<Vec<String>, StoreError> {
    Ok(store
        .get_prefix(keys::LIVENESS_PREFIX)
        .await?
        .into_iter()
        .map(|kv| String::from_utf8_lossy(&kv.value).into_owned())
        .collect())
}

/// Running sets reported by `nodes`.  A node whose set cannot be read is
/// left out.
pub async fn running_sets(
    store: &dyn CoordinationStore,
    nodes: &[String],
) -> BTreeMap<String, ReplicaSet> {
    let mut sets = BTreeMap::new();
    for node in nodes {
        match get_json::<ReplicaSet>(store, &keys::running_set(node)).await {
            Ok(Some(set)) => {
                sets.insert(node.clone(), set);
            }
            Ok(None) => {
                sets.insert(node.clone(), ReplicaSet::new());
            }
            Err(e) => warn!("Cannot read running set of {}: {}", node, e),
        }
    }
    sets
}

/// Catalog services whose replica count differs from what the fleet runs.
pub fn replica_mismatches(
    catalog: &Catalog,
    sets: &BTreeMap<String, ReplicaSet>,
) -> Vec<ReplicaMismatch> {
    let mut running: BTreeMap<&str, usize> = BTreeMap::new();
    for set in sets.values() {
        for service in set.keys() {
            *running.entry(service.as_str()).or_default() += 1;
        }
    }
    catalog
        .services
        .values()
        .filter_map(|svc| {
            let actual = running.get(svc.name.as_str()).copied().unwrap_or(0);
            (actual != svc.replica).then(|| ReplicaMismatch {
                service: svc.name.clone(),
                expected: svc.replica,
                actual,
            })
        })
        .collect()
}

/// Running replicas whose node has no registration for that service.
pub fn unregistered(
    sets: &BTreeMap<String, ReplicaSet>,
    registered: &BTreeMap<String, Vec<ServiceRegistration>>,
) -> Vec<Unregistered> {
    let mut missing = Vec::new();
    for (node, set) in sets {
        for service in set.keys() {
            let hosts: BTreeSet<&str> = registered
                .get(service)
                .map(|regs| regs.iter().map(|r| r.host.as_str()).collect())
                .unwrap_or_default();
            if !hosts.contains(node.as_str()) {
                missing.push(Unregistered {
                    service: service.clone(),
                    node: node.clone(),
                });
            }
        }
    }
    missing
}

/// Compares running replica counts with the catalog and notifies on any
/// difference.  Returns `None` when the store could not be read.
pub async fn fleet(ctx: &RolloutContext) -> Option<Vec<ReplicaMismatch>> {
    let agents = match live_agents(ctx.store.as_ref()).await {
        Ok(agents) => agents,
        Err(e) => {
            error!("Fleet audit skipped: {}", e);
            return None;
        }
    };
    if agents.is_empty() {
        warn!("Fleet audit found no live node agents");
    }
    let sets = running_sets(ctx.store.as_ref(), &agents).await;
    let mismatches = replica_mismatches(&ctx.catalog, &sets);

    if mismatches.is_empty() {
        info!("Fleet audit: all {} services at expected replicas", ctx.catalog.services.len());
        return Some(mismatches);
    }
    let mut journal = Journal::new();
    for m in &mismatches {
        let msg = format!(
            "Check-Fleet-Replicas: service {} expects {} replicas, {} running",
            m.service, m.expected, m.actual
        );
        warn!("{}", msg);
        journal.record(msg);
    }
    deliver(ctx.notifier.as_ref(), &ctx.recipients, FLEET_SUBJECT, &mut journal).await;
    Some(mismatches)
}

/// Checks every running replica has a registration from its node.
pub async fn registrations_check(ctx: &RolloutContext) -> Option<Vec<Unregistered>> {
    let agents = match live_agents(ctx.store.as_ref()).await {
        Ok(agents) => agents,
        Err(e) => {
            error!("Registration audit skipped: {}", e);
            return None;
        }
    };
    let registered = match registrations(ctx.store.as_ref()).await {
        Ok(r) => r,
        Err(e) => {
            error!("Registration audit skipped: {}", e);
            return None;
        }
    };
    let sets = running_sets(ctx.store.as_ref(), &agents).await;
    let missing = unregistered(&sets, &registered);

    if missing.is_empty() {
        info!("Registration audit: every running replica is registered");
        return Some(missing);
    }
    let mut journal = Journal::new();
    for m in &missing {
        let msg = format!(
            "Check-Service-Register: service {} runs on {} but is not registered",
            m.service, m.node
        );
        warn!("{}", msg);
        journal.record(msg);
    }
    deliver(
        ctx.notifier.as_ref(),
        &ctx.recipients,
        REGISTRATION_SUBJECT,
        &mut journal,
    )
    .await;
    Some(missing)
}
