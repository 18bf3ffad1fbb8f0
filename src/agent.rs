//! Node agent.
//!
//! Runs on every node.  Deployment units addressed to this node are
//! applied through the [`ContainerRuntime`]; the outcome is kept in two
//! disjoint maps, `running` and `failed`, keyed by service name.  The
//! running map is mirrored to `keeper-<node>-image` after every change,
//! and every apply attempt is acknowledged on `rolling-update-<service>`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{error, info, warn};
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::error::ApplyError;
use crate::keys;
use crate::runtime::ContainerRuntime;
use crate::store::{get_json, put_json, CoordinationStore, EventKind, Watch, WatchEvent};
use crate::types::{
    new_id, short_id, DeploymentUnit, ImageDetail, ImageRef, RemovalInstruction, ReplicaRecord,
    ReplicaSet,
};

/// Pause before re-opening a watch the store closed.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

pub struct NodeAgent {
    node: String,
    store: Arc<dyn CoordinationStore>,
    runtime: Arc<dyn ContainerRuntime>,
    running: ReplicaSet,
    failed: ReplicaSet,
    retry_every: Duration,
}

impl NodeAgent {
    pub fn new(
        node: impl Into<String>,
        store: Arc<dyn CoordinationStore>,
        runtime: Arc<dyn ContainerRuntime>,
        retry_every: Duration,
    ) -> Self {
        Self {
            node: node.into(),
            store,
            runtime,
            running: ReplicaSet::new(),
            failed: ReplicaSet::new(),
            retry_every,
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn running(&self) -> &ReplicaSet {
        &self.running
    }

    pub fn failed(&self) -> &ReplicaSet {
        &self.failed
    }

    /// Restarts everything this node last published as running.
    pub async fn recover(&mut self) {
        let key = keys::running_set(&self.node);
        let previous = match get_json::<ReplicaSet>(self.store.as_ref(), &key).await {
            Ok(Some(set)) => set,
            Ok(None) => return,
            Err(e) => {
                error!("Cannot load running set {}: {}", key, e);
                return;
            }
        };
        if previous.is_empty() {
            return;
        }
        info!("Recovering {} replicas on {}", previous.len(), self.node);
        self.running = previous.clone();
        for (service, record) in previous {
            let ok = self.apply(&service, record).await.is_ok();
            self.acknowledge(&service, ok).await;
        }
        info!(
            "Recovery finished: {} running, {} failed",
            self.running.len(),
            self.failed.len()
        );
        self.publish().await;
    }

    /// Applies a unit if it targets this node.  Returns the acknowledgment
    /// sent, or `None` for units meant for other nodes.
    pub async fn apply_unit(&mut self, unit: &DeploymentUnit) -> Option<bool> {
        if unit.node != self.node {
            return None;
        }
        let service = unit.service_name.clone();
        let duplicate = self
            .running
            .get(&service)
            .is_some_and(|r| r.unit_id.as_deref() == Some(unit.id.as_str()));
        if duplicate {
            info!("Unit {} for {} already applied", unit.id, service);
            self.acknowledge(&service, true).await;
            return Some(true);
        }

        info!("Applying unit {} ({}) for {}", unit.id, unit.full_name, service);
        let target = ReplicaRecord {
            detail_key: String::new(),
            full_name: unit.full_name.clone(),
            env: unit.env.clone(),
            node: unit.node.clone(),
            container_id: String::new(),
            unit_id: Some(unit.id.clone()),
        };
        let ok = match self.apply(&service, target).await {
            Ok(()) => true,
            Err(e) => {
                error!("Unit {} for {} failed: {}", unit.id, service, e);
                false
            }
        };
        self.acknowledge(&service, ok).await;
        Some(ok)
    }

    /// Pull, stop the previous container, run.  On failure the service
    /// ends up in `failed` carrying the previous container handle; a
    /// malformed image reference changes nothing.
    async fn apply(&mut self, service: &str, target: ReplicaRecord) -> Result<(), ApplyError> {
        let image = ImageRef::parse(&target.full_name)?;
        let prior = self
            .running
            .get(service)
            .or_else(|| self.failed.get(service))
            .cloned()
            .unwrap_or_default();
        let failed_record = ReplicaRecord {
            detail_key: prior.detail_key.clone(),
            container_id: prior.container_id.clone(),
            ..target.clone()
        };

        if let Err(e) = self.runtime.pull(&target.full_name).await {
            self.demote(service, failed_record).await;
            return Err(e.into());
        }
        if !prior.container_id.is_empty() {
            if let Err(e) = self.runtime.stop(&prior.container_id).await {
                warn!("Stopping {} for {} failed: {}", prior.container_id, service, e);
            }
        }
        let container_id = match self.runtime.run(&target.full_name, &target.env).await {
            Ok(id) => id,
            Err(e) => {
                self.demote(service, failed_record).await;
                return Err(e.into());
            }
        };

        let detail_key = if prior.detail_key.is_empty() {
            keys::detail(&image.name, &new_id())
        } else {
            prior.detail_key
        };
        let detail = ImageDetail {
            name: image.name,
            full_name: target.full_name.clone(),
            version: image.version,
            env: target.env.clone(),
            node: target.node.clone(),
            container_id: container_id.clone(),
            create_time: Utc::now(),
        };
        if let Err(e) = put_json(self.store.as_ref(), &detail_key, &detail).await {
            error!("Failed to write detail {}: {}", detail_key, e);
        }

        self.failed.remove(service);
        self.running.insert(
            service.to_string(),
            ReplicaRecord {
                detail_key,
                container_id,
                ..target
            },
        );
        info!("{} running on {}", service, self.node);
        self.publish().await;
        Ok(())
    }

    async fn demote(&mut self, service: &str, record: ReplicaRecord) {
        let was_running = self.running.remove(service).is_some();
        self.failed.insert(service.to_string(), record);
        warn!("{} marked failed on {}", service, self.node);
        if was_running {
            self.publish().await;
        }
    }

    /// Handles an `RM-<node>-<id>` instruction.  Only a matching container
    /// demotes the replica and consumes the instruction.
    pub async fn remove(&mut self, key: &str, instruction: &RemovalInstruction) -> bool {
        let matches = self.running.get(&instruction.service_name).is_some_and(|r| {
            short_id(&r.container_id) == short_id(&instruction.container_id)
        });
        if !matches {
            info!(
                "Ignoring removal of {} ({}): not the running container",
                instruction.service_name, instruction.container_id
            );
            return false;
        }
        if let Some(record) = self.running.get(&instruction.service_name).cloned() {
            self.demote(&instruction.service_name, record).await;
        }
        if let Err(e) = self.store.delete(key).await {
            error!("Failed to delete removal instruction {}: {}", key, e);
        }
        true
    }

    /// Re-applies every failed replica once.
    pub async fn retry_failed(&mut self) {
        if self.failed.is_empty() {
            return;
        }
        info!("Retrying {} failed replicas on {}", self.failed.len(), self.node);
        for (service, record) in self.failed.clone() {
            let ok = match self.apply(&service, record).await {
                Ok(()) => true,
                Err(e) => {
                    warn!("Retry of {} failed: {}", service, e);
                    false
                }
            };
            self.acknowledge(&service, ok).await;
        }
        self.publish().await;
    }

    async fn acknowledge(&self, service: &str, ok: bool) {
        let value = if ok { "true" } else { "false" };
        match self.store.put(&keys::ack(service), value.as_bytes()).await {
            Ok(()) => info!("Feedback {} for {}", value, service),
            Err(e) => error!("Failed to send feedback for {}: {}", service, e),
        }
    }

    async fn publish(&self) {
        let key = keys::running_set(&self.node);
        if let Err(e) = put_json(self.store.as_ref(), &key, &self.running).await {
            error!("Failed to publish {}: {}", key, e);
        }
    }

    pub async fn announce(&self) {
        if let Err(e) = self
            .store
            .put(&keys::liveness(&self.node), self.node.as_bytes())
            .await
        {
            error!("Failed to announce {}: {}", self.node, e);
        }
    }

    pub async fn withdraw(&self) {
        if let Err(e) = self.store.delete(&keys::liveness(&self.node)).await {
            error!("Failed to withdraw {}: {}", self.node, e);
        }
    }

    async fn subscribe(&self, prefix: &str) -> Watch {
        loop {
            match self.store.watch_prefix(prefix).await {
                Ok(watch) => return watch,
                Err(e) => {
                    error!("Watch on {} failed: {}", prefix, e);
                    tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                }
            }
        }
    }

    async fn on_unit_event(&mut self, event: WatchEvent) {
        if event.kind != EventKind::Put {
            return;
        }
        match serde_json::from_slice::<DeploymentUnit>(&event.value) {
            Ok(unit) => {
                self.apply_unit(&unit).await;
            }
            Err(e) => warn!("Skipping malformed unit {}: {}", event.key, e),
        }
    }

    async fn on_removal_event(&mut self, event: WatchEvent) {
        if event.kind != EventKind::Put {
            return;
        }
        match serde_json::from_slice::<RemovalInstruction>(&event.value) {
            Ok(instruction) => {
                self.remove(&event.key, &instruction).await;
            }
            Err(e) => warn!("Skipping malformed removal {}: {}", event.key, e),
        }
    }

    /// Recovers, announces liveness, then serves units, removals and the
    /// retry timer until `shutdown` resolves.
    pub async fn run<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        self.recover().await;

        let removal_prefix = keys::removal_prefix(&self.node);
        let mut units = self.subscribe(keys::UNIT_PREFIX).await;
        let mut removals = self.subscribe(&removal_prefix).await;
        self.announce().await;

        let mut retry = interval_at(Instant::now() + self.retry_every, self.retry_every);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        info!("Node agent {} ready", self.node);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    self.withdraw().await;
                    info!("Node agent {} stopped", self.node);
                    break;
                }
                event = units.recv() => match event {
                    Some(event) => self.on_unit_event(event).await,
                    None => {
                        warn!("Unit watch closed, resubscribing");
                        units = self.subscribe(keys::UNIT_PREFIX).await;
                    }
                },
                event = removals.recv() => match event {
                    Some(event) => self.on_removal_event(event).await,
                    None => {
                        warn!("Removal watch closed, resubscribing");
                        removals = self.subscribe(&removal_prefix).await;
                    }
                },
                _ = retry.tick() => self.retry_failed().await,
            }
        }
    }
}
