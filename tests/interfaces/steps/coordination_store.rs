//! CoordinationStore interface step definitions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cucumber::{given, then, when, World};
use tokio::sync::mpsc;
use txchain::store::{CoordinationStore, NodeWatcher, StoreError, WatchedEvent, WatchedEventKind};

use crate::backend::{StoreBackend, StoreContext};

struct ChannelWatcher(mpsc::UnboundedSender<WatchedEvent>);

#[async_trait]
impl NodeWatcher for ChannelWatcher {
    async fn process(&self, event: WatchedEvent) {
        let _ = self.0.send(event);
    }
}

/// Test context for CoordinationStore scenarios.
#[derive(Debug, World)]
#[world(init = Self::new)]
pub struct CoordinationStoreWorld {
    backend: StoreBackend,
    context: Option<StoreContext>,
    last_error: Option<StoreError>,
    last_version: Option<u64>,
    events: Option<mpsc::UnboundedReceiver<WatchedEvent>>,
    watcher: Option<mpsc::UnboundedSender<WatchedEvent>>,
}

impl CoordinationStoreWorld {
    fn new() -> Self {
        Self {
            backend: StoreBackend::from_env(),
            context: None,
            last_error: None,
            last_version: None,
            events: None,
            watcher: None,
        }
    }

    fn store(&self) -> &dyn CoordinationStore {
        self.context
            .as_ref()
            .expect("Store context not initialized")
            .store
            .as_ref()
    }

    fn watcher(&mut self) -> Arc<dyn NodeWatcher> {
        if self.watcher.is_none() {
            let (tx, rx) = mpsc::unbounded_channel();
            self.watcher = Some(tx);
            self.events = Some(rx);
        }
        Arc::new(ChannelWatcher(
            self.watcher.clone().expect("watcher channel"),
        ))
    }

    fn record<T>(&mut self, result: Result<T, StoreError>) -> Option<T> {
        match result {
            Ok(value) => {
                self.last_error = None;
                Some(value)
            }
            Err(e) => {
                self.last_error = Some(e);
                None
            }
        }
    }
}

fn error_kind(err: &StoreError) -> &'static str {
    match err {
        StoreError::NodeExists(_) => "NodeExists",
        StoreError::NoNode(_) => "NoNode",
        StoreError::NotEmpty(_) => "NotEmpty",
        StoreError::BadVersion { .. } => "BadVersion",
        StoreError::ConnectionLoss => "ConnectionLoss",
        StoreError::Closed => "Closed",
        StoreError::InvalidPath(_) => "InvalidPath",
        StoreError::Backend(_) => "Backend",
    }
}

// --- Background ---

#[given("a CoordinationStore backend")]
async fn given_store_backend(world: &mut CoordinationStoreWorld) {
    println!("Using backend: {}", world.backend.name());
    world.context = Some(StoreContext::new(world.backend).await);
}

// --- Given steps ---

#[given(expr = "a node {string} with data {string}")]
async fn given_node(world: &mut CoordinationStoreWorld, path: String, data: String) {
    world
        .store()
        .create(&path, data.as_bytes())
        .await
        .expect("Failed to create node");
}

#[given(expr = "a watch on node {string}")]
async fn given_watch(world: &mut CoordinationStoreWorld, path: String) {
    let watcher = world.watcher();
    world
        .store()
        .watch(&path, watcher)
        .await
        .expect("Failed to arm watch");
}

// --- When steps ---

#[when(expr = "I create node {string} with data {string}")]
async fn when_create(world: &mut CoordinationStoreWorld, path: String, data: String) {
    let result = world.store().create(&path, data.as_bytes()).await;
    world.record(result);
}

#[when(expr = "I watch node {string}")]
async fn when_watch(world: &mut CoordinationStoreWorld, path: String) {
    let watcher = world.watcher();
    let result = world.store().watch(&path, watcher).await;
    world.record(result);
}

#[when(expr = "I set node {string} to {string}")]
async fn when_set(world: &mut CoordinationStoreWorld, path: String, data: String) {
    let result = world.store().set_data(&path, data.as_bytes(), None).await;
    world.last_version = world.record(result);
}

#[when(expr = "I set node {string} to {string} at its current version")]
async fn when_set_at_current_version(
    world: &mut CoordinationStoreWorld,
    path: String,
    data: String,
) {
    let version = world
        .store()
        .get_data(&path)
        .await
        .expect("Failed to read node")
        .version;
    let result = world
        .store()
        .set_data(&path, data.as_bytes(), Some(version))
        .await;
    world.last_version = world.record(result);
}

#[when(expr = "I set node {string} to {string} at a stale version")]
async fn when_set_at_stale_version(
    world: &mut CoordinationStoreWorld,
    path: String,
    data: String,
) {
    let version = world
        .store()
        .get_data(&path)
        .await
        .expect("Failed to read node")
        .version;
    world
        .store()
        .set_data(&path, b"interleaved", None)
        .await
        .expect("Failed to write node");
    let result = world
        .store()
        .set_data(&path, data.as_bytes(), Some(version))
        .await;
    world.last_version = world.record(result);
}

#[when(expr = "I delete node {string}")]
async fn when_delete(world: &mut CoordinationStoreWorld, path: String) {
    let result = world.store().delete(&path).await;
    world.record(result);
}

#[when(expr = "I delete node {string} recursively")]
async fn when_delete_recursive(world: &mut CoordinationStoreWorld, path: String) {
    let result = world.store().delete_recursive(&path).await;
    world.record(result);
}

// --- Then steps ---

#[then("the operation should succeed")]
fn then_success(world: &mut CoordinationStoreWorld) {
    assert!(
        world.last_error.is_none(),
        "Expected success but got {:?}",
        world.last_error
    );
}

#[then(expr = "the operation should fail with {word}")]
fn then_failure(world: &mut CoordinationStoreWorld, kind: String) {
    let err = world.last_error.as_ref().expect("Expected an error");
    assert_eq!(error_kind(err), kind, "Unexpected error {:?}", err);
}

#[then(expr = "node {string} should have data {string}")]
async fn then_node_data(world: &mut CoordinationStoreWorld, path: String, data: String) {
    let node = world
        .store()
        .get_data(&path)
        .await
        .expect("Failed to read node");
    assert_eq!(String::from_utf8_lossy(&node.data), data);
}

#[then(expr = "node {string} should exist")]
async fn then_node_exists(world: &mut CoordinationStoreWorld, path: String) {
    assert!(world.store().exists(&path).await.expect("exists failed"));
}

#[then(expr = "node {string} should not exist")]
async fn then_node_missing(world: &mut CoordinationStoreWorld, path: String) {
    assert!(!world.store().exists(&path).await.expect("exists failed"));
}

#[then(expr = "node {string} should have children {string}")]
async fn then_children(world: &mut CoordinationStoreWorld, path: String, expected: String) {
    let mut children = world
        .store()
        .children(&path)
        .await
        .expect("Failed to list children");
    children.sort();
    let expected: Vec<String> = expected
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    assert_eq!(children, expected);
}

#[then(expr = "node {string} should be at the returned version")]
async fn then_returned_version(world: &mut CoordinationStoreWorld, path: String) {
    let node = world
        .store()
        .get_data(&path)
        .await
        .expect("Failed to read node");
    assert_eq!(Some(node.version), world.last_version);
}

#[then(expr = "the watcher should see node {string} change to {string}")]
async fn then_watch_changed(world: &mut CoordinationStoreWorld, path: String, data: String) {
    let event = next_event(world).await;
    assert_eq!(event.kind, WatchedEventKind::DataChanged);
    assert_eq!(event.path, path);
    assert_eq!(event.data.as_deref(), Some(data.as_bytes()));
}

#[then(expr = "the watcher should see node {string} deleted")]
async fn then_watch_deleted(world: &mut CoordinationStoreWorld, path: String) {
    let event = next_event(world).await;
    assert_eq!(event.kind, WatchedEventKind::Deleted);
    assert_eq!(event.path, path);
}

#[then("the watcher should see nothing more")]
async fn then_watch_quiet(world: &mut CoordinationStoreWorld) {
    let events = world.events.as_mut().expect("No watch armed");
    let next = tokio::time::timeout(Duration::from_millis(200), events.recv()).await;
    assert!(next.is_err(), "Unexpected watch event {:?}", next);
}

async fn next_event(world: &mut CoordinationStoreWorld) -> WatchedEvent {
    let events = world.events.as_mut().expect("No watch armed");
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("Watch event not delivered")
        .expect("Watch channel closed")
}
