//! Coordination store abstraction.
//!
//! All cross-component signalling goes through a watchable key-value
//! store with leases.  [`EtcdStore`] talks to a real etcd cluster,
//! [`MemoryStore`] keeps everything in process.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::StoreError;

pub mod etcd;
pub mod memory;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

pub type LeaseId = i64;

/// Receiving half of a watch.  `None` from `recv` means the watch ended
/// and the consumer should re-establish it.
pub type Watch = mpsc::Receiver<WatchEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub key: String,
    /// Empty for deletes.
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
}

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Put `key` attached to `lease`; the key disappears when the lease
    /// expires unless it has been re-put under another lease.
    async fn put_with_lease(
        &self,
        key: &str,
        value: &[u8],
        lease: LeaseId,
    ) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Watch a single key.
    async fn watch(&self, key: &str) -> Result<Watch, StoreError>;

    /// Watch every key starting with `prefix`.
    async fn watch_prefix(&self, prefix: &str) -> Result<Watch, StoreError>;

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, StoreError>;
}

/// Serialises `value` as JSON and stores it under `key`.
pub async fn put_json<T: Serialize + ?Sized>(
    store: &dyn CoordinationStore,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec(value).map_err(|e| StoreError::Decode(e.to_string()))?;
    store.put(key, &bytes).await
}

/// Reads `key` and decodes it as JSON.  A missing key is `Ok(None)`.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn CoordinationStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(key).await? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Decode(format!("{key}: {e}"))),
        None => Ok(None),
    }
}

/// Which keys a watch delivers.
#[derive(Debug, Clone)]
pub(crate) enum KeyFilter {
    Exact(String),
    Prefix(String),
}

impl KeyFilter {
    pub(crate) fn matches(&self, key: &str) -> bool {
        match self {
            Self::Exact(k) => k == key,
            Self::Prefix(p) => key.starts_with(p.as_str()),
        }
    }
}
