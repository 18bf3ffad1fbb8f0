//! Service registry gateway.
//!
//! [`RoutingTable`] mirrors the `service-` registration namespace: a
//! snapshot at startup, then watch events.  The sync loop is its only
//! writer; proxy handlers only read.

pub mod proxy;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use rand::Rng;
use tokio::sync::RwLock;

use crate::error::{GatewayError, StoreError};
use crate::keys;
use crate::registration::registrations;
use crate::store::{CoordinationStore, EventKind, WatchEvent};
use crate::types::ServiceRegistration;

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct Table {
    services: HashMap<String, Vec<ServiceRegistration>>,
    /// Instance id to service name.
    index: HashMap<String, String>,
}

impl Table {
    fn insert(&mut self, registration: ServiceRegistration) -> bool {
        if self.index.contains_key(&registration.id) {
            return false;
        }
        self.index
            .insert(registration.id.clone(), registration.service_name.clone());
        self.services
            .entry(registration.service_name.clone())
            .or_default()
            .push(registration);
        true
    }

    fn remove(&mut self, id: &str) -> bool {
        let Some(service) = self.index.remove(id) else {
            return false;
        };
        if let Some(instances) = self.services.get_mut(&service) {
            instances.retain(|r| r.id != id);
            if instances.is_empty() {
                self.services.remove(&service);
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    inner: Arc<RwLock<Table>>,
}

impl RoutingTable {
    /// Replaces the table with the current registration namespace.
    pub async fn reload(&self, store: &dyn CoordinationStore) -> Result<(), StoreError> {
        self.replace(registrations(store).await?).await;
        Ok(())
    }

    /// Swaps the whole table for `snapshot`.
    pub async fn replace(&self, snapshot: BTreeMap<String, Vec<ServiceRegistration>>) {
        let mut fresh = Table::default();
        for registration in snapshot.into_values().flatten() {
            fresh.insert(registration);
        }
        let count = fresh.index.len();
        *self.inner.write().await = fresh;
        info!("Routing table loaded with {} instances", count);
    }

    pub async fn insert(&self, registration: ServiceRegistration) -> bool {
        self.inner.write().await.insert(registration)
    }

    pub async fn remove(&self, id: &str) -> bool {
        self.inner.write().await.remove(id)
    }

    /// Applies one event from the registration watch.
    pub async fn apply(&self, event: &WatchEvent) {
        match event.kind {
            EventKind::Put => match serde_json::from_slice::<ServiceRegistration>(&event.value) {
                Ok(registration) => {
                    let (service, address) =
                        (registration.service_name.clone(), registration.address.clone());
                    if self.insert(registration).await {
                        info!("Added {} instance at {}", service, address);
                    }
                }
                Err(e) => warn!("Skipping malformed registration {}: {}", event.key, e),
            },
            EventKind::Delete => match keys::parse_registration(&event.key) {
                Some((service, id)) => {
                    if self.remove(id).await {
                        info!("Removed {} instance {}", service, id);
                    }
                }
                None => warn!("Ignoring delete of unrecognised key {}", event.key),
            },
        }
    }

    /// Picks an instance of `service` uniformly at random.
    pub async fn select(&self, service: &str) -> Result<ServiceRegistration, GatewayError> {
        let table = self.inner.read().await;
        let instances = table
            .services
            .get(service)
            .filter(|i| !i.is_empty())
            .ok_or_else(|| GatewayError::NoService(service.to_string()))?;
        let chosen = match instances.len() {
            1 => &instances[0],
            n => &instances[rand::thread_rng().gen_range(0..n)],
        };
        Ok(chosen.clone())
    }

    pub async fn len(&self, service: &str) -> usize {
        self.inner
            .read()
            .await
            .services
            .get(service)
            .map_or(0, Vec::len)
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.index.is_empty()
    }
}

/// Keeps `table` in step with the store forever.  Every (re)subscription
/// opens the watch first and then reloads the snapshot, so nothing that
/// happens in between is lost.
pub async fn sync(table: RoutingTable, store: Arc<dyn CoordinationStore>) {
    loop {
        let mut watch = match store.watch_prefix(keys::REGISTRATION_PREFIX).await {
            Ok(watch) => watch,
            Err(e) => {
                error!("Registration watch failed: {}", e);
                tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                continue;
            }
        };
        if let Err(e) = table.reload(store.as_ref()).await {
            error!("Registration snapshot failed: {}", e);
        }
        while let Some(event) = watch.recv().await {
            table.apply(&event).await;
        }
        warn!("Registration watch closed, resubscribing");
        tokio::time::sleep(RESUBSCRIBE_DELAY).await;
    }
}
