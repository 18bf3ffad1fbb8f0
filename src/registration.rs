//! Service-instance side of discovery.
//!
//! A service process (or the `register` sidecar next to it) announces
//! itself under `service-<name>-<id>` with a lease, keeps the lease fresh
//! and, on the way out, asks its node agent to forget the container.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};

use crate::error::{ConfigError, StoreError};
use crate::keys;
use crate::store::{put_json, CoordinationStore, LeaseId};
use crate::types::{env, new_id, short_id, RemovalInstruction, ServiceRegistration};

/// Builds this instance's registration from the environment the
/// scheduler injected into its container.  `lookup` is usually
/// `std::env::var(..).ok()`.
pub fn registration_from_env<F>(lookup: F) -> Result<ServiceRegistration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let required = |key: &str| {
        lookup(key)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ConfigError::Invalid(format!("missing environment variable {key}")))
    };
    let ip = required(env::IP)?;
    let port = required(env::PORT)?;
    Ok(ServiceRegistration {
        id: new_id(),
        address: format!("{ip}:{port}"),
        ip,
        port,
        container_port: lookup(env::CONTAINER_PORT).unwrap_or_default(),
        host: required(env::HOST)?,
        service_name: required(env::SERVICE_NAME)?,
    })
}

/// Keeps one registration alive in the store.
pub struct Registrar {
    store: Arc<dyn CoordinationStore>,
    registration: ServiceRegistration,
    /// Container handle reported in the removal instruction.
    container_id: String,
    ttl: Duration,
    heartbeat: Duration,
}

impl Registrar {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        registration: ServiceRegistration,
        container_id: impl Into<String>,
        ttl: Duration,
        heartbeat: Duration,
    ) -> Self {
        Self {
            store,
            registration,
            container_id: container_id.into(),
            ttl,
            heartbeat,
        }
    }

    pub fn key(&self) -> String {
        keys::registration(&self.registration.service_name, &self.registration.id)
    }

    pub fn registration(&self) -> &ServiceRegistration {
        &self.registration
    }

    /// Writes the registration under a freshly granted lease.
    pub async fn register(&self) -> Result<LeaseId, StoreError> {
        let lease = self.store.grant_lease(self.ttl).await?;
        let value = serde_json::to_vec(&self.registration)
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        self.store.put_with_lease(&self.key(), &value, lease).await?;
        Ok(lease)
    }

    /// Refresh period.  Never longer than half the lease, so the key is
    /// re-put before the previous lease can lapse.
    pub fn refresh_every(&self) -> Duration {
        self.heartbeat.min(self.ttl / 2).max(Duration::from_millis(100))
    }

    /// Re-registers forever.  Failures are logged and retried on the
    /// next beat; a lapsed lease only hides the instance until then.
    pub async fn keep_alive(&self) {
        let period = self.refresh_every();
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            ticker.tick().await;
            if let Err(e) = self.register().await {
                error!("Heartbeat for {} failed: {}", self.key(), e);
            }
        }
    }

    /// Graceful shutdown: tell the node agent to drop the replica, then
    /// withdraw the registration.
    pub async fn deregister(&self) -> Result<(), StoreError> {
        let instruction = RemovalInstruction {
            service_name: self.registration.service_name.clone(),
            container_id: short_id(&self.container_id).to_string(),
        };
        let removal_key = keys::removal(&self.registration.host, &self.registration.id);
        put_json(self.store.as_ref(), &removal_key, &instruction).await?;
        self.store.delete(&self.key()).await?;
        info!("Deregistered {} and published {}", self.key(), removal_key);
        Ok(())
    }
}

/// Every current registration grouped by service name.  Entries that do
/// not decode are skipped.
pub async fn registrations(
    store: &dyn CoordinationStore,
) -> Result<BTreeMap<String, Vec<ServiceRegistration>>, StoreError> {
    let mut grouped: BTreeMap<String, Vec<ServiceRegistration>> = BTreeMap::new();
    for kv in store.get_prefix(keys::REGISTRATION_PREFIX).await? {
        match serde_json::from_slice::<ServiceRegistration>(&kv.value) {
            Ok(reg) => grouped.entry(reg.service_name.clone()).or_default().push(reg),
            Err(e) => warn!("Skipping malformed registration {}: {}", kv.key, e),
        }
    }
    Ok(grouped)
}

/// Live instances of `service`.  None at all is an error so callers can
/// fail fast instead of dialling nothing.
pub async fn instances(
    store: &dyn CoordinationStore,
    service: &str,
) -> Result<Vec<ServiceRegistration>, StoreError> {
    let found: Vec<ServiceRegistration> = store
        .get_prefix(&keys::registration_prefix(service))
        .await?
        .into_iter()
        .filter_map(|kv| serde_json::from_slice::<ServiceRegistration>(&kv.value).ok())
        .filter(|reg| reg.service_name == service)
        .collect();
    if found.is_empty() {
        return Err(StoreError::Unavailable(format!("no service instance for {service}")));
    }
    Ok(found)
}
