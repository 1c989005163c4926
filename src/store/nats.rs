//! NATS JetStream KV coordination store.
//!
//! ## Architecture
//!
//! - One KV bucket (default `rolling-tx`, `?bucket=` overrides)
//! - Node path `/a/b/c` maps to key `a.b.c`; segment bytes outside
//!   `[A-Za-z0-9-]` are escaped as `_XX`
//! - Node version is the key's KV revision
//! - One-shot watches are per-key watch streams, dropped after the
//!   first change past the armed revision
//! - Connection events come from the client event callback

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_nats::jetstream::{self, kv, Context};
use async_trait::async_trait;
use backon::Retryable;
use futures::{StreamExt, TryStreamExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    parent_path, validate_path, ConnectionEvent, CoordinationStore, NodeData, NodeWatcher,
    Result, StoreError, WatchedEvent, WatchedEventKind, PATH_SEPARATOR,
};
use crate::config::MediatorUrl;
use crate::utils::retry::connection_backoff;

/// Default KV bucket name.
pub const DEFAULT_BUCKET: &str = "rolling-tx";

const KEY_SEPARATOR: char = '.';
const EVENT_CAPACITY: usize = 64;

fn backend(context: &str, e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(format!("{}: {}", context, e))
}

fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for b in segment.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' {
            out.push(b as char);
        } else {
            out.push_str(&format!("_{:02X}", b));
        }
    }
    out
}

fn decode_segment(token: &str) -> String {
    let bytes = token.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'_' && i + 2 < bytes.len() {
            let escaped = std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok());
            if let Some(b) = escaped {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Map a node path to a KV key.
fn path_to_key(path: &str) -> String {
    path.split(PATH_SEPARATOR)
        .filter(|s| !s.is_empty())
        .map(encode_segment)
        .collect::<Vec<_>>()
        .join(".")
}

fn key_to_path(key: &str) -> String {
    key.split(KEY_SEPARATOR)
        .map(|token| format!("{}{}", PATH_SEPARATOR, decode_segment(token)))
        .collect()
}

fn is_live(entry: &kv::Entry) -> bool {
    matches!(entry.operation, kv::Operation::Put)
}

/// Coordination store on a NATS JetStream KV bucket.
pub struct NatsKvStore {
    client: async_nats::Client,
    kv: kv::Store,
    closed: AtomicBool,
    events: broadcast::Sender<ConnectionEvent>,
    watches: Mutex<HashMap<String, Vec<JoinHandle<()>>>>,
}

impl NatsKvStore {
    /// Connect to the servers a locator names, retrying with backoff.
    ///
    /// Gives up once the backoff is exhausted; the caller treats that as
    /// fatal.
    pub async fn connect(url: &MediatorUrl) -> Result<Arc<Self>> {
        let servers = url
            .addresses()
            .iter()
            .map(|a| format!("nats://{}", a))
            .collect::<Vec<_>>()
            .join(",");
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let client = (|| {
            let servers = servers.clone();
            let tx = events.clone();
            let mut options = async_nats::ConnectOptions::new().event_callback(move |event| {
                let tx = tx.clone();
                async move {
                    let mapped = match event {
                        async_nats::Event::Connected => Some(ConnectionEvent::Connected),
                        async_nats::Event::Disconnected => Some(ConnectionEvent::Disconnected),
                        _ => None,
                    };
                    if let Some(mapped) = mapped {
                        let _ = tx.send(mapped);
                    }
                }
            });
            if let (Some(user), Some(password)) = (&url.username, &url.password) {
                options = options.user_and_password(user.clone(), password.clone());
            }
            async move {
                options
                    .connect(servers.as_str())
                    .await
                    .map_err(|e| e.to_string())
            }
        })
        .retry(connection_backoff())
        .notify(|err: &String, dur: Duration| {
            warn!(error = %err, delay = ?dur, "NATS connection failed, retrying");
        })
        .await
        .map_err(|e| backend("connect", e))?;

        let bucket = url.parameter("bucket").unwrap_or(DEFAULT_BUCKET);
        Self::new(client, bucket, events).await
    }

    /// Create a store on an already connected client.
    pub async fn with_client(client: async_nats::Client, bucket: &str) -> Result<Arc<Self>> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self::new(client, bucket, events).await
    }

    async fn new(
        client: async_nats::Client,
        bucket: &str,
        events: broadcast::Sender<ConnectionEvent>,
    ) -> Result<Arc<Self>> {
        let jetstream = jetstream::new(client.clone());
        let kv = Self::ensure_bucket(&jetstream, bucket).await?;
        info!(bucket = %bucket, "NATS coordination store initialized");

        Ok(Arc::new(Self {
            client,
            kv,
            closed: AtomicBool::new(false),
            events,
            watches: Mutex::new(HashMap::new()),
        }))
    }

    /// Ensure the KV bucket exists.
    async fn ensure_bucket(jetstream: &Context, bucket: &str) -> Result<kv::Store> {
        match jetstream.get_key_value(bucket).await {
            Ok(store) => Ok(store),
            Err(_) => jetstream
                .create_key_value(kv::Config {
                    bucket: bucket.to_string(),
                    history: 1,
                    ..Default::default()
                })
                .await
                .map_err(|e| backend("create bucket", e)),
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    async fn live_entry(&self, path: &str) -> Result<Option<kv::Entry>> {
        let entry = self
            .kv
            .entry(path_to_key(path))
            .await
            .map_err(|e| backend("entry", e))?;
        Ok(entry.filter(is_live))
    }

    async fn keys_under(&self, path: &str) -> Result<Vec<String>> {
        let prefix = format!("{}{}", path_to_key(path), KEY_SEPARATOR);
        let keys: Vec<String> = self
            .kv
            .keys()
            .await
            .map_err(|e| backend("keys", e))?
            .try_collect()
            .await
            .map_err(|e| backend("keys", e))?;
        Ok(keys.into_iter().filter(|k| k.starts_with(&prefix)).collect())
    }

    fn track_watch(&self, path: &str, handle: JoinHandle<()>) {
        if let Ok(mut watches) = self.watches.lock() {
            let handles = watches.entry(path.to_string()).or_default();
            handles.retain(|h| !h.is_finished());
            handles.push(handle);
        }
    }
}

#[async_trait]
impl CoordinationStore for NatsKvStore {
    async fn create(&self, path: &str, data: &[u8]) -> Result<()> {
        validate_path(path)?;
        self.check_open()?;

        if let Some(parent) = parent_path(path) {
            if self.live_entry(parent).await?.is_none() {
                return Err(StoreError::NoNode(parent.to_string()));
            }
        }
        match self.kv.create(path_to_key(path), data.to_vec().into()).await {
            Ok(_) => {
                debug!(path = %path, "Node created");
                Ok(())
            }
            Err(e) => {
                if self.live_entry(path).await?.is_some() {
                    Err(StoreError::NodeExists(path.to_string()))
                } else {
                    Err(backend("create", e))
                }
            }
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.check_open()?;
        Ok(self.live_entry(path).await?.is_some())
    }

    async fn get_data(&self, path: &str) -> Result<NodeData> {
        self.check_open()?;
        self.live_entry(path)
            .await?
            .map(|entry| NodeData {
                data: entry.value.to_vec(),
                version: entry.revision,
            })
            .ok_or_else(|| StoreError::NoNode(path.to_string()))
    }

    async fn watch(&self, path: &str, watcher: Arc<dyn NodeWatcher>) -> Result<NodeData> {
        self.check_open()?;
        let current = self.get_data(path).await?;
        let armed_at = current.version;

        let mut updates = self
            .kv
            .watch_with_history(path_to_key(path))
            .await
            .map_err(|e| backend("watch", e))?;

        let watched = path.to_string();
        let handle = tokio::spawn(async move {
            while let Some(update) = updates.next().await {
                let entry = match update {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!(path = %watched, error = %e, "Watch stream error");
                        continue;
                    }
                };
                if entry.revision <= armed_at {
                    continue;
                }
                let event = if is_live(&entry) {
                    WatchedEvent {
                        kind: WatchedEventKind::DataChanged,
                        path: watched.clone(),
                        data: Some(entry.value.to_vec()),
                    }
                } else {
                    WatchedEvent {
                        kind: WatchedEventKind::Deleted,
                        path: watched.clone(),
                        data: None,
                    }
                };
                watcher.process(event).await;
                break;
            }
        });
        self.track_watch(path, handle);
        Ok(current)
    }

    async fn set_data(
        &self,
        path: &str,
        data: &[u8],
        expected_version: Option<u64>,
    ) -> Result<u64> {
        self.check_open()?;
        let current = self
            .live_entry(path)
            .await?
            .ok_or_else(|| StoreError::NoNode(path.to_string()))?;
        let expected = expected_version.unwrap_or(current.revision);
        if expected != current.revision {
            return Err(StoreError::BadVersion {
                path: path.to_string(),
                expected,
                actual: current.revision,
            });
        }

        match self
            .kv
            .update(path_to_key(path), data.to_vec().into(), expected)
            .await
        {
            Ok(revision) => Ok(revision),
            Err(e) => match self.live_entry(path).await? {
                Some(entry) if entry.revision != expected => Err(StoreError::BadVersion {
                    path: path.to_string(),
                    expected,
                    actual: entry.revision,
                }),
                Some(_) => Err(backend("update", e)),
                None => Err(StoreError::NoNode(path.to_string())),
            },
        }
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        self.check_open()?;
        if self.live_entry(path).await?.is_none() {
            return Err(StoreError::NoNode(path.to_string()));
        }
        let prefix_len = path_to_key(path).len() + 1;
        Ok(self
            .keys_under(path)
            .await?
            .into_iter()
            .filter_map(|key| {
                let rest = &key[prefix_len..];
                (!rest.contains(KEY_SEPARATOR)).then(|| decode_segment(rest))
            })
            .collect())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.check_open()?;
        if self.live_entry(path).await?.is_none() {
            return Err(StoreError::NoNode(path.to_string()));
        }
        if !self.keys_under(path).await?.is_empty() {
            return Err(StoreError::NotEmpty(path.to_string()));
        }
        self.kv
            .delete(path_to_key(path))
            .await
            .map_err(|e| backend("delete", e))
    }

    async fn delete_recursive(&self, path: &str) -> Result<()> {
        self.check_open()?;
        if self.live_entry(path).await?.is_none() {
            return Err(StoreError::NoNode(path.to_string()));
        }
        let mut keys = self.keys_under(path).await?;
        // Deepest first.
        keys.sort_by_key(|k| std::cmp::Reverse(k.matches(KEY_SEPARATOR).count()));
        keys.push(path_to_key(path));

        for key in keys {
            self.kv
                .delete(&key)
                .await
                .map_err(|e| backend("delete", e))?;
            debug!(path = %key_to_path(&key), "Node deleted");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && self.client.connection_state() == async_nats::connection::State::Connected
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Ok(mut watches) = self.watches.lock() {
            for handle in watches.drain().flat_map(|(_, handles)| handles) {
                handle.abort();
            }
        }
        if let Err(e) = self.client.flush().await {
            debug!(error = %e, "Flush on close failed");
        }
        info!("NATS coordination store closed");
    }
}
