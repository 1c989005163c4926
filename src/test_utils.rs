//! Test utilities and mock implementations.
//!
//! Recording doubles for the coordination protocol and for compensating
//! handlers, so context and dispatch logic can be tested without a
//! coordination store.

use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::context::MethodId;
use crate::dispatch::{HandlerError, RollbackHandler, RollbackRequest};
use crate::mediator::{
    Decision, ExpiryReport, MediatorClient, MediatorError, MediatorWatcher, Result,
    RollbackDetail, TransactionResult,
};
use crate::store::StoreError;

/// One call made against a `RecordingMediator`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediatorCall {
    Join {
        transaction_id: String,
        index: u32,
        data: Option<String>,
    },
    Commit {
        transaction_id: String,
    },
    Rollback {
        transaction_id: String,
        detail: RollbackDetail,
    },
    Clear {
        transaction_id: String,
    },
}

/// Mediator that records every call and keeps decisions in memory.
///
/// Decisions follow the same compare-and-set rule as the real protocol.
/// Nothing is delivered to the watcher on its own; tests call `notify`.
#[derive(Default)]
pub struct RecordingMediator {
    calls: RwLock<Vec<MediatorCall>>,
    decisions: RwLock<HashMap<String, Decision>>,
    watcher: StdRwLock<Option<Arc<dyn MediatorWatcher>>>,
    fail_on_join: RwLock<bool>,
    fail_on_decide: RwLock<bool>,
}

impl RecordingMediator {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_join(&self, fail: bool) {
        *self.fail_on_join.write().await = fail;
    }

    pub async fn set_fail_on_decide(&self, fail: bool) {
        *self.fail_on_decide.write().await = fail;
    }

    /// Record a decision as if another participant had made it.
    pub async fn set_decision(&self, transaction_id: &str, decision: Decision) {
        self.decisions
            .write()
            .await
            .insert(transaction_id.to_string(), decision);
    }

    pub async fn decision(&self, transaction_id: &str) -> Option<Decision> {
        self.decisions.read().await.get(transaction_id).cloned()
    }

    /// Deliver a decision change to the registered watcher.
    pub async fn notify(&self, transaction_id: &str, decision: &Decision) {
        let watcher = self.watcher.read().ok().and_then(|w| w.clone());
        if let Some(watcher) = watcher {
            watcher.change(transaction_id, decision).await;
        }
    }

    pub async fn calls(&self) -> Vec<MediatorCall> {
        self.calls.read().await.clone()
    }

    pub async fn commits(&self) -> usize {
        self.calls
            .read()
            .await
            .iter()
            .filter(|c| matches!(c, MediatorCall::Commit { .. }))
            .count()
    }

    pub async fn rollbacks(&self) -> Vec<RollbackDetail> {
        self.calls
            .read()
            .await
            .iter()
            .filter_map(|c| match c {
                MediatorCall::Rollback { detail, .. } => Some(detail.clone()),
                _ => None,
            })
            .collect()
    }

    pub async fn joins(&self) -> Vec<(u32, Option<String>)> {
        self.calls
            .read()
            .await
            .iter()
            .filter_map(|c| match c {
                MediatorCall::Join { index, data, .. } => Some((*index, data.clone())),
                _ => None,
            })
            .collect()
    }

    async fn decide(&self, transaction_id: &str, target: Decision) -> Result<Decision> {
        if *self.fail_on_decide.read().await {
            return Err(StoreError::ConnectionLoss.into());
        }
        let mut decisions = self.decisions.write().await;
        let current = decisions
            .entry(transaction_id.to_string())
            .or_insert(Decision::InProgress);
        if current.is_terminal() {
            return Ok(current.clone());
        }
        *current = target.clone();
        Ok(target)
    }
}

#[async_trait]
impl MediatorClient for RecordingMediator {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn join_chain(
        &self,
        transaction_id: &str,
        _group: &str,
        _peer: &str,
        index: u32,
        data: Option<&str>,
    ) -> Result<()> {
        if *self.fail_on_join.read().await {
            return Err(StoreError::ConnectionLoss.into());
        }
        let mut decisions = self.decisions.write().await;
        if index > 0 && !decisions.contains_key(transaction_id) {
            return Err(MediatorError::UnknownChain(transaction_id.to_string()));
        }
        decisions
            .entry(transaction_id.to_string())
            .or_insert(Decision::InProgress);
        drop(decisions);

        self.calls.write().await.push(MediatorCall::Join {
            transaction_id: transaction_id.to_string(),
            index,
            data: data.map(str::to_string),
        });
        Ok(())
    }

    async fn rollback(
        &self,
        transaction_id: &str,
        _group: &str,
        _peer: &str,
        detail: &RollbackDetail,
    ) -> Result<Decision> {
        self.calls.write().await.push(MediatorCall::Rollback {
            transaction_id: transaction_id.to_string(),
            detail: detail.clone(),
        });
        self.decide(transaction_id, Decision::RolledBack(detail.clone()))
            .await
    }

    async fn commit(&self, transaction_id: &str, _group: &str, _peer: &str) -> Result<Decision> {
        self.calls.write().await.push(MediatorCall::Commit {
            transaction_id: transaction_id.to_string(),
        });
        self.decide(transaction_id, Decision::Committed).await
    }

    async fn transaction_exists(&self, transaction_id: &str) -> bool {
        self.decisions.read().await.contains_key(transaction_id)
    }

    async fn transaction_result(&self, transaction_id: &str) -> Result<Option<TransactionResult>> {
        Ok(self
            .decision(transaction_id)
            .await
            .map(|decision| TransactionResult {
                transaction_id: transaction_id.to_string(),
                origin_group: String::new(),
                origin_peer: String::new(),
                started_at: None,
                decision,
                chain: Vec::new(),
            }))
    }

    fn add_watcher(&self, watcher: Arc<dyn MediatorWatcher>) {
        if let Ok(mut slot) = self.watcher.write() {
            *slot = Some(watcher);
        }
    }

    async fn clear(&self, transaction_id: &str) -> Result<()> {
        self.decisions.write().await.remove(transaction_id);
        self.calls.write().await.push(MediatorCall::Clear {
            transaction_id: transaction_id.to_string(),
        });
        Ok(())
    }

    async fn expire_abandoned(&self, _ttl: Duration) -> Result<ExpiryReport> {
        Ok(ExpiryReport::default())
    }

    fn is_connected(&self) -> bool {
        true
    }

    async fn close(&self) {}
}

/// Compensating handler that records every invocation.
#[derive(Default)]
pub struct RecordingHandler {
    invocations: RwLock<Vec<(MethodId, RollbackRequest)>>,
    fail: RwLock<bool>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail(&self, fail: bool) {
        *self.fail.write().await = fail;
    }

    pub async fn invocations(&self) -> Vec<(MethodId, RollbackRequest)> {
        self.invocations.read().await.clone()
    }
}

#[async_trait]
impl RollbackHandler for RecordingHandler {
    async fn rollback(
        &self,
        method: &MethodId,
        request: RollbackRequest,
    ) -> std::result::Result<Option<Value>, HandlerError> {
        self.invocations
            .write()
            .await
            .push((method.clone(), request));
        if *self.fail.read().await {
            return Err(HandlerError::Failed("injected handler failure".to_string()));
        }
        Ok(Some(Value::Bool(true)))
    }
}
