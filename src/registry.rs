//! Process-wide transaction registry.
//!
//! Maps a transaction id to the resident view of the context that owns it
//! in this process. Entries are added when a context learns its id and
//! removed exactly once, when a final decision is settled.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use crate::context::ResidentContext;

/// Concurrent map of resident contexts.
#[derive(Debug, Default)]
pub struct TransactionRegistry {
    entries: RwLock<HashMap<String, Arc<ResidentContext>>>,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `resident` under `transaction_id`.
    ///
    /// Returns `false` if another context already holds the id; the first
    /// registration is kept.
    pub fn register(&self, transaction_id: &str, resident: Arc<ResidentContext>) -> bool {
        let Ok(mut entries) = self.entries.write() else {
            return false;
        };
        match entries.get(transaction_id) {
            Some(existing) if Arc::ptr_eq(existing, &resident) => true,
            Some(_) => {
                warn!(
                    transaction_id = %transaction_id,
                    "Transaction already has a resident context in this process"
                );
                false
            }
            None => {
                entries.insert(transaction_id.to_string(), resident);
                debug!(transaction_id = %transaction_id, "Context registered");
                true
            }
        }
    }

    pub fn get(&self, transaction_id: &str) -> Option<Arc<ResidentContext>> {
        self.entries
            .read()
            .ok()
            .and_then(|entries| entries.get(transaction_id).cloned())
    }

    /// Remove the entry for `transaction_id` if it is `resident`.
    ///
    /// Returns `true` for exactly one caller per registration.
    pub fn remove(&self, transaction_id: &str, resident: &Arc<ResidentContext>) -> bool {
        let Ok(mut entries) = self.entries.write() else {
            return false;
        };
        match entries.get(transaction_id) {
            Some(existing) if Arc::ptr_eq(existing, resident) => {
                entries.remove(transaction_id);
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, transaction_id: &str) -> bool {
        self.entries
            .read()
            .map(|entries| entries.contains_key(transaction_id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
