//! etcd binding over the v3 JSON gateway.
//!
//! Keys and values travel base64 encoded; 64-bit integers may come back
//! as JSON strings.  Watches are a long-lived streaming POST whose body
//! is a sequence of newline-delimited JSON messages.

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::{CoordinationStore, EventKind, KeyValue, LeaseId, Watch, WatchEvent};
use crate::error::StoreError;

const WATCH_BUFFER: usize = 256;
const PROBE_KEY: &str = "flotilla-probe";

#[derive(Debug, Clone)]
pub struct EtcdStore {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct RawKv {
    key: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct RangeResponse {
    #[serde(default)]
    kvs: Vec<RawKv>,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    kv: RawKv,
}

#[derive(Debug, Default, Deserialize)]
struct WatchResult {
    #[serde(default)]
    events: Vec<RawEvent>,
    #[serde(default)]
    canceled: bool,
}

#[derive(Debug, Deserialize)]
struct WatchMessage {
    #[serde(default)]
    result: WatchResult,
}

impl EtcdStore {
    /// Connects to `endpoint` (`host:port` or a full URL) and probes it
    /// with a read.  Failing here is fatal for every role.
    pub async fn connect(endpoint: &str, dial_timeout: Duration) -> Result<Self, StoreError> {
        let base_url = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", endpoint.trim_end_matches('/'))
        };
        let client = Client::builder().connect_timeout(dial_timeout).build()?;
        let store = Self { client, base_url };

        tokio::time::timeout(dial_timeout, store.get(PROBE_KEY))
            .await
            .map_err(|_| StoreError::Unavailable(format!("{} did not answer", store.base_url)))??;
        info!("Connected to coordination store at {}", store.base_url);
        Ok(store)
    }

    async fn call(&self, path: &str, body: Value) -> Result<Value, StoreError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.post(&url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(StoreError::Unavailable(format!("{path} returned {status}: {text}")));
        }
        Ok(response.json().await?)
    }

    async fn range(&self, key: &[u8], range_end: Option<Vec<u8>>) -> Result<Vec<KeyValue>, StoreError> {
        let mut body = json!({ "key": STANDARD.encode(key) });
        if let Some(end) = range_end {
            body["range_end"] = Value::String(STANDARD.encode(end));
        }
        let raw = self.call("/v3/kv/range", body).await?;
        let parsed: RangeResponse =
            serde_json::from_value(raw).map_err(|e| StoreError::Decode(e.to_string()))?;
        parsed.kvs.into_iter().map(decode_kv).collect()
    }

    async fn open_watch(&self, key: &[u8], range_end: Option<Vec<u8>>) -> Result<Watch, StoreError> {
        let mut create = json!({ "key": STANDARD.encode(key) });
        if let Some(end) = range_end {
            create["range_end"] = Value::String(STANDARD.encode(end));
        }
        let url = format!("{}/v3/watch", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "create_request": create }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(StoreError::Unavailable(format!(
                "watch returned {}",
                response.status()
            )));
        }

        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let mut stream = response.bytes_stream();
        tokio::spawn(async move {
            let mut buf: Vec<u8> = Vec::new();
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        error!("Watch stream failed: {}", e);
                        break;
                    }
                };
                buf.extend_from_slice(&chunk);
                while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    match parse_watch_line(&line) {
                        Ok(Some(events)) => {
                            for event in events {
                                if tx.send(event).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Ok(None) => {
                            warn!("Watch canceled by server");
                            return;
                        }
                        Err(e) => warn!("Skipping malformed watch message: {}", e),
                    }
                }
            }
            debug!("Watch stream ended");
        });
        Ok(rx)
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let body = json!({
            "key": STANDARD.encode(key),
            "value": STANDARD.encode(value),
        });
        self.call("/v3/kv/put", body).await.map(|_| ())
    }

    async fn put_with_lease(
        &self,
        key: &str,
        value: &[u8],
        lease: LeaseId,
    ) -> Result<(), StoreError> {
        let body = json!({
            "key": STANDARD.encode(key),
            "value": STANDARD.encode(value),
            "lease": lease.to_string(),
        });
        self.call("/v3/kv/put", body).await.map(|_| ())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .range(key.as_bytes(), None)
            .await?
            .into_iter()
            .next()
            .map(|kv| kv.value))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError> {
        self.range(prefix.as_bytes(), Some(prefix_end(prefix.as_bytes())))
            .await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let body = json!({ "key": STANDARD.encode(key) });
        self.call("/v3/kv/deleterange", body).await.map(|_| ())
    }

    async fn watch(&self, key: &str) -> Result<Watch, StoreError> {
        self.open_watch(key.as_bytes(), None).await
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<Watch, StoreError> {
        self.open_watch(prefix.as_bytes(), Some(prefix_end(prefix.as_bytes())))
            .await
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, StoreError> {
        let raw = self
            .call("/v3/lease/grant", json!({ "TTL": ttl.as_secs(), "ID": 0 }))
            .await?;
        raw.get("ID")
            .and_then(int64)
            .ok_or_else(|| StoreError::Decode(format!("lease grant without ID: {raw}")))
    }
}

/// Smallest key greater than every key starting with `prefix`.
fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    // Every byte was 0xff: range to the end of the keyspace.
    vec![0]
}

fn int64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn decode_kv(raw: RawKv) -> Result<KeyValue, StoreError> {
    let key = STANDARD
        .decode(raw.key.as_bytes())
        .map_err(|e| StoreError::Decode(e.to_string()))?;
    let value = STANDARD
        .decode(raw.value.as_bytes())
        .map_err(|e| StoreError::Decode(e.to_string()))?;
    Ok(KeyValue {
        key: String::from_utf8_lossy(&key).into_owned(),
        value,
    })
}

/// `Ok(None)` when the server canceled the watch.
fn parse_watch_line(line: &[u8]) -> Result<Option<Vec<WatchEvent>>, StoreError> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return Ok(Some(Vec::new()));
    }
    let msg: WatchMessage =
        serde_json::from_str(text).map_err(|e| StoreError::Decode(e.to_string()))?;
    if msg.result.canceled {
        return Ok(None);
    }
    let mut events = Vec::with_capacity(msg.result.events.len());
    for raw in msg.result.events {
        let kind = match raw.kind.as_deref() {
            Some("DELETE") => EventKind::Delete,
            _ => EventKind::Put,
        };
        let kv = decode_kv(raw.kv)?;
        events.push(WatchEvent {
            kind,
            key: kv.key,
            value: kv.value,
        });
    }
    Ok(Some(events))
}
