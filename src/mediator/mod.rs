//! Coordination protocol.
//!
//! `MediatorClient` is the contract a transaction context talks to: join a
//! chain, record the final decision, and learn about decisions made by other
//! participants through a process-wide watcher. Any coordination service
//! that can provide these primitives is substitutable.
//!
//! Implementations:
//! - `StoreMediator`: node layout on top of a `CoordinationStore`

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::store::StoreError;

pub mod store;

pub use store::StoreMediator;

/// Root node for chain membership records.
pub const CHAIN_ROOT: &str = "/rolling-tx/chain";
/// Root node for decision records.
pub const STATE_ROOT: &str = "/rolling-tx/state";
/// Separator between fields of a record payload.
pub const FIELD_SEPARATOR: char = '|';
/// State payload of a transaction still in progress.
pub const STATE_IN_PROGRESS: &str = "0";
/// State payload of a committed transaction.
pub const STATE_COMMITTED: &str = "1";
/// Rollback detail written by the lease reaper.
pub const LEASE_EXPIRED: &str = "lease-expired";

/// Result type for mediator operations.
pub type Result<T> = std::result::Result<T, MediatorError>;

/// Errors raised by the coordination protocol.
///
/// Every variant is fatal for the in-flight call: once a chain record
/// write is uncertain, chain consistency cannot be assumed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MediatorError {
    #[error("Transaction join failed, invalid id [{0}] in chain")]
    UnknownChain(String),

    #[error("Coordination store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid coordination record at {path}: {reason}")]
    InvalidRecord { path: String, reason: String },
}

/// Why a transaction was rolled back: the participant method that failed
/// and, when the failure was an error, its type name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackDetail {
    pub method: String,
    pub failure_type: Option<String>,
}

impl RollbackDetail {
    pub fn new(method: impl Into<String>, failure_type: Option<String>) -> Self {
        Self {
            method: method.into(),
            failure_type,
        }
    }

    /// Detail recorded when an abandoned transaction outlives its lease.
    pub fn lease_expired() -> Self {
        Self::new(LEASE_EXPIRED, None)
    }

    /// Encode as a state payload: `<method>[|<failureType>]`.
    pub fn encode(&self) -> String {
        match &self.failure_type {
            Some(failure) => format!("{}{}{}", self.method, FIELD_SEPARATOR, failure),
            None => self.method.clone(),
        }
    }

    fn parse(data: &str) -> Self {
        match data.split_once(FIELD_SEPARATOR) {
            Some((method, failure)) => Self::new(method, Some(failure.to_string())),
            None => Self::new(data, None),
        }
    }

    pub fn is_lease_expiry(&self) -> bool {
        self.method == LEASE_EXPIRED && self.failure_type.is_none()
    }
}

/// Decision recorded in a transaction's state node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Decision {
    InProgress,
    Committed,
    RolledBack(RollbackDetail),
}

impl Decision {
    /// Decode a state payload. Anything other than `"0"` or `"1"` is a
    /// rollback detail.
    pub fn parse(data: &str) -> Self {
        match data {
            STATE_IN_PROGRESS => Decision::InProgress,
            STATE_COMMITTED => Decision::Committed,
            other => Decision::RolledBack(RollbackDetail::parse(other)),
        }
    }

    /// Encode as a state payload.
    pub fn encode(&self) -> String {
        match self {
            Decision::InProgress => STATE_IN_PROGRESS.to_string(),
            Decision::Committed => STATE_COMMITTED.to_string(),
            Decision::RolledBack(detail) => detail.encode(),
        }
    }

    /// Whether this is a final decision.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Decision::InProgress)
    }

    pub fn is_rollback(&self) -> bool {
        matches!(self, Decision::RolledBack(_))
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::InProgress => write!(f, "in-progress"),
            Decision::Committed => write!(f, "committed"),
            Decision::RolledBack(detail) => write!(f, "rollback({})", detail.encode()),
        }
    }
}

/// One join record in a transaction chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainEntry {
    pub group: String,
    pub peer: String,
    pub index: u32,
    pub data: String,
}

/// Everything the coordination service knows about one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionResult {
    pub transaction_id: String,
    pub origin_group: String,
    pub origin_peer: String,
    pub started_at: Option<DateTime<Utc>>,
    pub decision: Decision,
    pub chain: Vec<ChainEntry>,
}

impl fmt::Display for TransactionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let chain = serde_json::to_string(&self.chain).map_err(|_| fmt::Error)?;
        write!(
            f,
            "ROLLING-TX = {{id:\"{}\", origin:\"{}{}{}\", startedAt:\"{}\", decision:\"{}\", chain:{}}}",
            self.transaction_id,
            self.origin_group,
            FIELD_SEPARATOR,
            self.origin_peer,
            self.started_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "unknown".to_string()),
            self.decision,
            chain
        )
    }
}

/// Outcome of a lease sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpiryReport {
    /// Transactions still in progress past their lease, now rolled back.
    pub rolled_back: Vec<String>,
    /// Finished transactions whose records were left behind, now removed.
    pub cleared: Vec<String>,
}

/// Process-wide receiver of decision changes.
#[async_trait]
pub trait MediatorWatcher: Send + Sync {
    /// Called whenever a watched transaction's decision record changes.
    async fn change(&self, transaction_id: &str, decision: &Decision);
}

/// Coordination protocol consumed by transaction contexts.
#[async_trait]
pub trait MediatorClient: Send + Sync {
    /// Create root structures. Idempotent; re-run after every reconnect.
    async fn init(&self) -> Result<()>;

    /// Record that `peer` (within `group`) occupies `index` in the chain of
    /// `transaction_id`.
    ///
    /// Index 0 creates the chain root and its in-progress decision record;
    /// concurrent creators both succeed. A non-zero index for an unknown
    /// chain fails with `UnknownChain`.
    async fn join_chain(
        &self,
        transaction_id: &str,
        group: &str,
        peer: &str,
        index: u32,
        data: Option<&str>,
    ) -> Result<()>;

    /// Record a rollback decision.
    ///
    /// Returns the decision in force afterwards: the rollback, or whatever
    /// final decision another participant recorded first.
    async fn rollback(
        &self,
        transaction_id: &str,
        group: &str,
        peer: &str,
        detail: &RollbackDetail,
    ) -> Result<Decision>;

    /// Record a commit decision.
    ///
    /// Returns the decision in force afterwards. A rollback recorded by
    /// another participant is never overwritten.
    async fn commit(&self, transaction_id: &str, group: &str, peer: &str) -> Result<Decision>;

    /// Best-effort existence probe. Never errors.
    async fn transaction_exists(&self, transaction_id: &str) -> bool;

    /// Read back the chain and decision of a transaction.
    async fn transaction_result(&self, transaction_id: &str) -> Result<Option<TransactionResult>>;

    /// Register the process-wide decision watcher, replacing any previous one.
    fn add_watcher(&self, watcher: Arc<dyn MediatorWatcher>);

    /// Remove all coordination records of a finished transaction.
    async fn clear(&self, transaction_id: &str) -> Result<()>;

    /// Roll back transactions still in progress after `ttl`, and remove
    /// records of finished ones older than `ttl`.
    async fn expire_abandoned(&self, ttl: Duration) -> Result<ExpiryReport>;

    fn is_connected(&self) -> bool;

    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_parse() {
        assert_eq!(Decision::parse("0"), Decision::InProgress);
        assert_eq!(Decision::parse("1"), Decision::Committed);
        assert_eq!(
            Decision::parse("orders::place(u64)|std::io::Error"),
            Decision::RolledBack(RollbackDetail::new(
                "orders::place(u64)",
                Some("std::io::Error".to_string())
            ))
        );
        assert_eq!(
            Decision::parse("orders::place(u64)"),
            Decision::RolledBack(RollbackDetail::new("orders::place(u64)", None))
        );
    }

    #[test]
    fn test_decision_encode() {
        assert_eq!(Decision::Committed.encode(), "1");
        assert_eq!(Decision::InProgress.encode(), "0");
        let detail = RollbackDetail::new("a::b()", Some("E".to_string()));
        assert_eq!(Decision::RolledBack(detail).encode(), "a::b()|E");
    }

    #[test]
    fn test_lease_expired_detail() {
        let detail = RollbackDetail::lease_expired();
        assert!(detail.is_lease_expiry());
        assert_eq!(Decision::parse(&detail.encode()), Decision::RolledBack(detail));
    }

    #[test]
    fn test_transaction_result_display() {
        let result = TransactionResult {
            transaction_id: "tx-1".to_string(),
            origin_group: "orders".to_string(),
            origin_peer: "10.0.0.1:8080".to_string(),
            started_at: None,
            decision: Decision::Committed,
            chain: vec![ChainEntry {
                group: "orders".to_string(),
                peer: "10.0.0.1:8080".to_string(),
                index: 0,
                data: "orders::place()".to_string(),
            }],
        };
        let line = result.to_string();
        assert!(line.starts_with("ROLLING-TX = {id:\"tx-1\""));
        assert!(line.contains("decision:\"committed\""));
        assert!(line.contains("\"index\":0"));
    }
}
