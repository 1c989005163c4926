//! Hierarchical coordination store.
//!
//! The mediator records chain membership and decisions in a tree of
//! versioned nodes with one-shot watches, the model ZooKeeper exposes.
//! This module defines that contract and its implementations:
//! - `MemoryStore`: in-process tree (standalone mode, tests)
//! - `NatsKvStore`: NATS JetStream KV bucket (feature `nats`)

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

pub mod memory;
#[cfg(feature = "nats")]
pub mod nats;

pub use memory::MemoryStore;
#[cfg(feature = "nats")]
pub use nats::NatsKvStore;

/// Path separator for node paths.
pub const PATH_SEPARATOR: char = '/';

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Node already exists: {0}")]
    NodeExists(String),

    #[error("Node does not exist: {0}")]
    NoNode(String),

    #[error("Node has children: {0}")]
    NotEmpty(String),

    #[error("Version mismatch on {path}: expected {expected}, found {actual}")]
    BadVersion {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("Connection to coordination service lost")]
    ConnectionLoss,

    #[error("Store closed")]
    Closed,

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

/// Node payload together with its modification version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeData {
    pub data: Vec<u8>,
    pub version: u64,
}

/// What happened to a watched node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchedEventKind {
    DataChanged,
    Deleted,
}

/// One-shot watch notification.
///
/// Carries the node data as of the change, so a receiver does not have to
/// read the node back (it may already have been removed by then).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedEvent {
    pub kind: WatchedEventKind,
    pub path: String,
    pub data: Option<Vec<u8>>,
}

/// Session state transitions reported by a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    /// Session lost; every watch registered before this event is gone.
    SessionExpired,
}

/// Receiver of one-shot watch notifications.
#[async_trait]
pub trait NodeWatcher: Send + Sync {
    async fn process(&self, event: WatchedEvent);
}

/// Interface for a hierarchical coordination store.
///
/// Semantics follow ZooKeeper persistent nodes:
/// - `create` requires the parent to exist and fails with `NodeExists`
///   if the node is already there
/// - every `set_data` bumps the node version
/// - a watch fires at most once, on the next data change or deletion
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Create a node. Fails with `NoNode` if the parent is missing.
    async fn create(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Check whether a node exists.
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Read a node's data and version.
    async fn get_data(&self, path: &str) -> Result<NodeData>;

    /// Arm a one-shot watch on an existing node and return its current data.
    async fn watch(&self, path: &str, watcher: Arc<dyn NodeWatcher>) -> Result<NodeData>;

    /// Overwrite a node's data.
    ///
    /// With `expected_version` set, the write only succeeds if the node is
    /// still at that version (`BadVersion` otherwise).
    async fn set_data(&self, path: &str, data: &[u8], expected_version: Option<u64>)
        -> Result<u64>;

    /// List the names of a node's direct children.
    async fn children(&self, path: &str) -> Result<Vec<String>>;

    /// Delete a leaf node.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Delete a node and everything below it.
    async fn delete_recursive(&self, path: &str) -> Result<()>;

    /// Whether the store currently has a live session.
    fn is_connected(&self) -> bool;

    /// Subscribe to session state transitions.
    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent>;

    /// Release the session. Further calls fail with `Closed`.
    async fn close(&self);
}

/// Return the parent path of `path`, or `None` for a top-level node.
pub fn parent_path(path: &str) -> Option<&str> {
    match path.rfind(PATH_SEPARATOR) {
        Some(0) | None => None,
        Some(i) => Some(&path[..i]),
    }
}

/// Return the last segment of `path`.
pub fn node_name(path: &str) -> &str {
    path.rsplit(PATH_SEPARATOR).next().unwrap_or(path)
}

/// Join a parent path and a child name.
pub fn join_path(parent: &str, child: &str) -> String {
    format!("{}{}{}", parent, PATH_SEPARATOR, child)
}

/// Reject paths the tree cannot address.
pub(crate) fn validate_path(path: &str) -> Result<()> {
    if !path.starts_with(PATH_SEPARATOR)
        || path.len() < 2
        || path.ends_with(PATH_SEPARATOR)
        || path.contains("//")
    {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_path() {
        assert_eq!(parent_path("/a/b/c"), Some("/a/b"));
        assert_eq!(parent_path("/a"), None);
    }

    #[test]
    fn test_node_name() {
        assert_eq!(node_name("/rolling-tx/state/tx-1"), "tx-1");
        assert_eq!(node_name("/a"), "a");
    }

    #[test]
    fn test_validate_path() {
        assert!(validate_path("/a/b").is_ok());
        assert!(validate_path("a/b").is_err());
        assert!(validate_path("/").is_err());
        assert!(validate_path("/a/").is_err());
        assert!(validate_path("/a//b").is_err());
    }
}
