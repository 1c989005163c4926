//! In-process coordination store.
//!
//! A ZooKeeper-shaped tree held in memory. Several mediators can share one
//! `Arc<MemoryStore>` to stand in for peers talking to the same ensemble,
//! which is how standalone mode and the scenario tests run.
//!
//! Watch notifications are queued and delivered in order on a single
//! background task, mirroring the ZooKeeper client event thread.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, info};

use super::{
    parent_path, validate_path, ConnectionEvent, CoordinationStore, NodeData, NodeWatcher,
    Result, StoreError, WatchedEvent, WatchedEventKind, PATH_SEPARATOR,
};

/// Capacity of the connection event channel.
const EVENT_CAPACITY: usize = 64;

struct Node {
    data: Vec<u8>,
    version: u64,
}

#[derive(Default)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    watches: HashMap<String, Vec<Arc<dyn NodeWatcher>>>,
}

impl Tree {
    fn take_watches(&mut self, path: &str) -> Vec<Arc<dyn NodeWatcher>> {
        self.watches.remove(path).unwrap_or_default()
    }

    fn has_children(&self, path: &str) -> bool {
        let prefix = format!("{}{}", path, PATH_SEPARATOR);
        self.nodes
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(k, _)| k.starts_with(&prefix))
    }
}

type Delivery = (Arc<dyn NodeWatcher>, WatchedEvent);

/// In-memory hierarchical store with one-shot watches.
pub struct MemoryStore {
    tree: RwLock<Tree>,
    connected: AtomicBool,
    closed: AtomicBool,
    fail_writes: AtomicBool,
    events: broadcast::Sender<ConnectionEvent>,
    delivery: mpsc::UnboundedSender<Delivery>,
}

impl MemoryStore {
    /// Create a new, connected store.
    ///
    /// Must be called from within a tokio runtime: the watch delivery task
    /// is spawned here.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (delivery, mut rx) = mpsc::unbounded_channel::<Delivery>();

        tokio::spawn(async move {
            while let Some((watcher, event)) = rx.recv().await {
                watcher.process(event).await;
            }
        });

        info!("Memory coordination store initialized");

        Self {
            tree: RwLock::new(Tree::default()),
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            events,
            delivery,
        }
    }

    /// Make every subsequent write fail with a backend error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Drop the connection. Operations fail with `ConnectionLoss` until
    /// `reconnect` is called; watches survive.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.events.send(ConnectionEvent::Disconnected);
    }

    /// Restore the connection.
    pub fn reconnect(&self) {
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.events.send(ConnectionEvent::Connected);
    }

    /// Expire the session: all registered watches are discarded, then the
    /// store reconnects with a fresh session.
    pub async fn expire_session(&self) {
        self.tree.write().await.watches.clear();
        let _ = self.events.send(ConnectionEvent::SessionExpired);
        self.reconnect();
    }

    /// Number of nodes in the tree.
    pub async fn node_count(&self) -> usize {
        self.tree.read().await.nodes.len()
    }

    /// Number of watches armed on `path`.
    pub async fn watch_count(&self, path: &str) -> usize {
        self.tree
            .read()
            .await
            .watches
            .get(path)
            .map_or(0, |w| w.len())
    }

    fn check_session(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(StoreError::ConnectionLoss);
        }
        Ok(())
    }

    fn check_write(&self) -> Result<()> {
        self.check_session()?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("injected write failure".to_string()));
        }
        Ok(())
    }

    fn fire(&self, watchers: Vec<Arc<dyn NodeWatcher>>, event: WatchedEvent) {
        for watcher in watchers {
            // Receiver only goes away with the runtime.
            let _ = self.delivery.send((watcher, event.clone()));
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn create(&self, path: &str, data: &[u8]) -> Result<()> {
        validate_path(path)?;
        self.check_write()?;

        let mut tree = self.tree.write().await;
        if tree.nodes.contains_key(path) {
            return Err(StoreError::NodeExists(path.to_string()));
        }
        if let Some(parent) = parent_path(path) {
            if !tree.nodes.contains_key(parent) {
                return Err(StoreError::NoNode(parent.to_string()));
            }
        }
        tree.nodes.insert(
            path.to_string(),
            Node {
                data: data.to_vec(),
                version: 0,
            },
        );
        debug!(path = %path, "Node created");
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.check_session()?;
        Ok(self.tree.read().await.nodes.contains_key(path))
    }

    async fn get_data(&self, path: &str) -> Result<NodeData> {
        self.check_session()?;
        let tree = self.tree.read().await;
        tree.nodes
            .get(path)
            .map(|n| NodeData {
                data: n.data.clone(),
                version: n.version,
            })
            .ok_or_else(|| StoreError::NoNode(path.to_string()))
    }

    async fn watch(&self, path: &str, watcher: Arc<dyn NodeWatcher>) -> Result<NodeData> {
        self.check_session()?;
        let mut tree = self.tree.write().await;
        let current = match tree.nodes.get(path) {
            Some(n) => NodeData {
                data: n.data.clone(),
                version: n.version,
            },
            None => return Err(StoreError::NoNode(path.to_string())),
        };
        tree.watches.entry(path.to_string()).or_default().push(watcher);
        Ok(current)
    }

    async fn set_data(
        &self,
        path: &str,
        data: &[u8],
        expected_version: Option<u64>,
    ) -> Result<u64> {
        self.check_write()?;

        let mut tree = self.tree.write().await;
        let node = tree
            .nodes
            .get_mut(path)
            .ok_or_else(|| StoreError::NoNode(path.to_string()))?;
        if let Some(expected) = expected_version {
            if node.version != expected {
                return Err(StoreError::BadVersion {
                    path: path.to_string(),
                    expected,
                    actual: node.version,
                });
            }
        }
        node.data = data.to_vec();
        node.version += 1;
        let version = node.version;

        let watchers = tree.take_watches(path);
        drop(tree);

        self.fire(
            watchers,
            WatchedEvent {
                kind: WatchedEventKind::DataChanged,
                path: path.to_string(),
                data: Some(data.to_vec()),
            },
        );
        Ok(version)
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        self.check_session()?;
        let tree = self.tree.read().await;
        if !tree.nodes.contains_key(path) {
            return Err(StoreError::NoNode(path.to_string()));
        }
        let prefix = format!("{}{}", path, PATH_SEPARATOR);
        Ok(tree
            .nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, _)| {
                let rest = &k[prefix.len()..];
                (!rest.contains(PATH_SEPARATOR)).then(|| rest.to_string())
            })
            .collect())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.check_write()?;

        let mut tree = self.tree.write().await;
        if !tree.nodes.contains_key(path) {
            return Err(StoreError::NoNode(path.to_string()));
        }
        if tree.has_children(path) {
            return Err(StoreError::NotEmpty(path.to_string()));
        }
        tree.nodes.remove(path);
        let watchers = tree.take_watches(path);
        drop(tree);

        self.fire(
            watchers,
            WatchedEvent {
                kind: WatchedEventKind::Deleted,
                path: path.to_string(),
                data: None,
            },
        );
        Ok(())
    }

    async fn delete_recursive(&self, path: &str) -> Result<()> {
        self.check_write()?;

        let mut tree = self.tree.write().await;
        if !tree.nodes.contains_key(path) {
            return Err(StoreError::NoNode(path.to_string()));
        }
        let prefix = format!("{}{}", path, PATH_SEPARATOR);
        let doomed: Vec<String> = tree
            .nodes
            .keys()
            .filter(|k| k.as_str() == path || k.starts_with(&prefix))
            .cloned()
            .collect();

        let mut fired = Vec::new();
        for key in doomed {
            tree.nodes.remove(&key);
            let watchers = tree.take_watches(&key);
            if !watchers.is_empty() {
                fired.push((key, watchers));
            }
        }
        drop(tree);

        for (key, watchers) in fired {
            self.fire(
                watchers,
                WatchedEvent {
                    kind: WatchedEventKind::Deleted,
                    path: key,
                    data: None,
                },
            );
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.connected.load(Ordering::SeqCst)
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.tree.write().await.watches.clear();
        info!("Memory coordination store closed");
    }
}
