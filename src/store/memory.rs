//! In-process coordination store.
//!
//! Mirrors the etcd semantics the rest of the crate relies on: ordered
//! keys, prefix reads, watches that see every mutation after they are
//! opened, and TTL leases whose expiry deletes the keys still attached.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::{broadcast, mpsc, Mutex};

use super::{
    CoordinationStore, EventKind, KeyFilter, KeyValue, LeaseId, Watch, WatchEvent,
};
use crate::error::StoreError;

const EVENT_BUFFER: usize = 1024;
const WATCH_BUFFER: usize = 256;

struct Entry {
    value: Vec<u8>,
    lease: Option<LeaseId>,
}

#[derive(Default)]
struct Inner {
    kv: BTreeMap<String, Entry>,
    leases: HashSet<LeaseId>,
    next_lease: LeaseId,
}

#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            events,
        }
    }

    fn publish(&self, kind: EventKind, key: &str, value: &[u8]) {
        // No receivers just means nobody is watching.
        let _ = self.events.send(WatchEvent {
            kind,
            key: key.to_string(),
            value: value.to_vec(),
        });
    }

    async fn insert(&self, key: &str, value: &[u8], lease: Option<LeaseId>) {
        let mut inner = self.inner.lock().await;
        inner.kv.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                lease,
            },
        );
        self.publish(EventKind::Put, key, value);
    }

    async fn expire(&self, lease: LeaseId) {
        let mut inner = self.inner.lock().await;
        if !inner.leases.remove(&lease) {
            return;
        }
        let doomed: Vec<String> = inner
            .kv
            .iter()
            .filter(|(_, e)| e.lease == Some(lease))
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            inner.kv.remove(&key);
            debug!("lease {} expired, deleting {}", lease, key);
            self.publish(EventKind::Delete, &key, &[]);
        }
    }

    fn open_watch(&self, filter: KeyFilter) -> Watch {
        let mut events = self.events.subscribe();
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if filter.matches(&event.key) && tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("watch on {:?} lagged, {} events dropped", filter, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        rx
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.insert(key, value, None).await;
        Ok(())
    }

    async fn put_with_lease(
        &self,
        key: &str,
        value: &[u8],
        lease: LeaseId,
    ) -> Result<(), StoreError> {
        if !self.inner.lock().await.leases.contains(&lease) {
            return Err(StoreError::UnknownLease(lease));
        }
        self.insert(key, value, Some(lease)).await;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.kv.get(key).map(|e| e.value.clone()))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| KeyValue {
                key: k.clone(),
                value: e.value.clone(),
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.kv.remove(key).is_some() {
            self.publish(EventKind::Delete, key, &[]);
        }
        Ok(())
    }

    async fn watch(&self, key: &str) -> Result<Watch, StoreError> {
        Ok(self.open_watch(KeyFilter::Exact(key.to_string())))
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<Watch, StoreError> {
        Ok(self.open_watch(KeyFilter::Prefix(prefix.to_string())))
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, StoreError> {
        let lease = {
            let mut inner = self.inner.lock().await;
            inner.next_lease += 1;
            let lease = inner.next_lease;
            inner.leases.insert(lease);
            lease
        };
        let store = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            store.expire(lease).await;
        });
        Ok(lease)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn prefix_reads_are_bounded() {
        let store = MemoryStore::new();
        store.put("service-a-1", b"1").await.unwrap();
        store.put("service-b-1", b"2").await.unwrap();
        store.put("services", b"x").await.unwrap();
        store.put("t", b"y").await.unwrap();

        let kvs = store.get_prefix("service-").await.unwrap();
        let keys: Vec<_> = kvs.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, ["service-a-1", "service-b-1"]);
    }

    #[tokio::test]
    async fn watch_sees_puts_and_deletes_for_its_key_only() {
        let store = MemoryStore::new();
        let mut watch = store.watch("rolling-update-a").await.unwrap();

        store.put("rolling-update-b", b"true").await.unwrap();
        store.put("rolling-update-a", b"true").await.unwrap();
        store.delete("rolling-update-a").await.unwrap();

        let put = watch.recv().await.unwrap();
        assert_eq!(put.kind, EventKind::Put);
        assert_eq!(put.value, b"true");
        let del = watch.recv().await.unwrap();
        assert_eq!(del.kind, EventKind::Delete);
        assert_eq!(del.key, "rolling-update-a");
    }

    #[tokio::test]
    async fn deleting_missing_key_emits_nothing() {
        let store = MemoryStore::new();
        let mut watch = store.watch_prefix("k").await.unwrap();
        store.delete("k1").await.unwrap();
        store.put("k2", b"v").await.unwrap();
        assert_eq!(watch.recv().await.unwrap().key, "k2");
    }

    #[tokio::test(start_paused = true)]
    async fn lease_expiry_deletes_attached_keys() {
        let store = MemoryStore::new();
        let mut watch = store.watch_prefix("service-").await.unwrap();
        let lease = store.grant_lease(Duration::from_secs(10)).await.unwrap();
        store
            .put_with_lease("service-a-1", b"{}", lease)
            .await
            .unwrap();
        assert_eq!(watch.recv().await.unwrap().kind, EventKind::Put);

        tokio::time::sleep(Duration::from_secs(11)).await;
        let event = watch.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::Delete);
        assert!(store.get("service-a-1").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn reput_under_new_lease_survives_old_expiry() {
        let store = MemoryStore::new();
        let first = store.grant_lease(Duration::from_secs(10)).await.unwrap();
        store.put_with_lease("k", b"1", first).await.unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        let second = store.grant_lease(Duration::from_secs(10)).await.unwrap();
        store.put_with_lease("k", b"2", second).await.unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(store.get("k").await.unwrap(), Some(b"2".to_vec()));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn unknown_lease_is_rejected() {
        let store = MemoryStore::new();
        let err = store.put_with_lease("k", b"v", 42).await.unwrap_err();
        assert!(matches!(err, StoreError::UnknownLease(42)));
    }
}
