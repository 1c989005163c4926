//! Per-call transaction context.
//!
//! A `TransactionContext` tracks the execution chain of one root call:
//! the local business call and every outbound call it makes. Collaborators
//! drive it through a fixed protocol:
//!
//! - `prepare_transaction` before the local call, `complete_transaction`
//!   after it, exactly once on every exit path
//! - `before_remoter` before an outbound call, `after_remoter` after it
//! - `set_transaction_id` on receipt of a propagated id
//!
//! Each step records the chain position with the mediator. The context is
//! consumed by `complete_transaction`.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::coordinator::Coordinator;
use crate::mediator::{Decision, MediatorError, RollbackDetail};

pub mod holder;
pub mod resident;

pub use holder::{ExecutionHolder, ExecutionState, Failure, MethodId};
pub use resident::{ExecutionSnapshot, ResidentContext, Settlement};

/// Result type for context operations.
pub type Result<T> = std::result::Result<T, ContextError>;

/// Errors raised by the context protocol.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ContextError {
    #[error("A local call is already in progress: {0}")]
    ExecutionInProgress(String),

    #[error("No local call in progress")]
    NoCurrentExecution,

    #[error("No outbound call in progress")]
    NoRemoteExecution,

    #[error("Transaction id already set to {0}")]
    TransactionIdAlreadySet(String),

    #[error(transparent)]
    Mediator(#[from] MediatorError),
}

/// Final view of a context, returned by `complete_transaction`.
#[derive(Debug, Clone)]
pub struct Completion {
    pub transaction_id: Option<String>,
    pub is_new: bool,
    /// State of the local call.
    pub state: ExecutionState,
    pub chain: Vec<ExecutionHolder>,
}

/// Chain tracker for one root call.
pub struct TransactionContext {
    coordinator: Arc<Coordinator>,
    transaction_id: Option<String>,
    is_new: bool,
    execution_index: u32,
    execution_chain: BTreeMap<u32, ExecutionHolder>,
    current_execution: Option<u32>,
    rollback: bool,
    remote_failed: bool,
    entry_url: Option<String>,
    resident: Arc<ResidentContext>,
}

impl TransactionContext {
    pub(crate) fn new(coordinator: Arc<Coordinator>) -> Self {
        Self {
            coordinator,
            transaction_id: None,
            is_new: true,
            execution_index: 0,
            execution_chain: BTreeMap::new(),
            current_execution: None,
            rollback: false,
            remote_failed: false,
            entry_url: None,
            resident: Arc::new(ResidentContext::new(true)),
        }
    }

    pub fn transaction_id(&self) -> Option<&str> {
        self.transaction_id.as_deref()
    }

    /// Whether this context originated its transaction.
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn is_marked_rollback(&self) -> bool {
        self.rollback
    }

    pub fn entry_url(&self) -> Option<&str> {
        self.entry_url.as_deref()
    }

    /// Record the inbound URL that started this call.
    pub fn set_entry_url(&mut self, url: impl Into<String>) {
        self.entry_url = Some(url.into());
    }

    /// The open local call, if any.
    pub fn current_execution(&self) -> Option<&ExecutionHolder> {
        self.current_execution
            .and_then(|index| self.execution_chain.get(&index))
    }

    /// Holders in chain order.
    pub fn execution_chain(&self) -> impl Iterator<Item = (u32, &ExecutionHolder)> {
        self.execution_chain.iter().map(|(i, h)| (*i, h))
    }

    /// Force the local call to complete as a rollback.
    pub fn mark_rollback(&mut self) {
        self.rollback = true;
    }

    /// Attach a value to the open local call for later compensation.
    pub fn set_parameter(&mut self, key: impl Into<String>, value: Value) -> Result<()> {
        let index = self.current_execution.ok_or(ContextError::NoCurrentExecution)?;
        let holder = self
            .execution_chain
            .get_mut(&index)
            .ok_or(ContextError::NoCurrentExecution)?;
        holder.extra_parameters.insert(key.into(), value);
        Ok(())
    }

    async fn join(&self, transaction_id: &str, index: u32, data: Option<String>) -> Result<()> {
        self.coordinator
            .mediator()
            .join_chain(
                transaction_id,
                self.coordinator.group(),
                self.coordinator.peer(),
                index,
                data.as_deref(),
            )
            .await?;
        Ok(())
    }

    fn register(&self, transaction_id: &str) {
        self.resident.set_new(self.is_new);
        self.coordinator
            .registry()
            .register(transaction_id, Arc::clone(&self.resident));
    }

    fn unregister(&self, transaction_id: &str) {
        self.coordinator
            .registry()
            .remove(transaction_id, &self.resident);
    }

    /// Adopt a propagated transaction id.
    ///
    /// Joins the chain at the open local call's position, or at index 0
    /// without payload when no local call is open.
    pub async fn set_transaction_id(&mut self, transaction_id: impl Into<String>) -> Result<()> {
        if let Some(existing) = &self.transaction_id {
            return Err(ContextError::TransactionIdAlreadySet(existing.clone()));
        }
        let transaction_id = transaction_id.into();
        self.is_new = false;
        self.register(&transaction_id);

        let (index, data) = match self.current_execution() {
            Some(holder) => (self.execution_index - 1, Some(holder.method.to_string())),
            None => {
                self.resident.await_call();
                (0, None)
            }
        };
        if let Err(e) = self.join(&transaction_id, index, data.clone()).await {
            self.unregister(&transaction_id);
            return Err(e);
        }

        info!(
            transaction_id = %transaction_id,
            group = %self.coordinator.group(),
            peer = %self.coordinator.peer(),
            index,
            method = data.as_deref().unwrap_or_default(),
            "Joined propagated transaction"
        );
        self.transaction_id = Some(transaction_id);
        Ok(())
    }

    /// Open the local call.
    pub async fn prepare_transaction(
        &mut self,
        target: impl Into<String>,
        method: MethodId,
        args: Vec<Value>,
    ) -> Result<()> {
        if let Some(open) = self.current_execution() {
            return Err(ContextError::ExecutionInProgress(open.method.to_string()));
        }
        let index = self.execution_index;
        let holder = ExecutionHolder::new(true, target.into(), method, args);

        if let Some(transaction_id) = &self.transaction_id {
            self.join(transaction_id, index, Some(holder.method.to_string()))
                .await?;
            info!(
                transaction_id = %transaction_id,
                group = %self.coordinator.group(),
                peer = %self.coordinator.peer(),
                index,
                method = %holder.method,
                "Local call joined transaction"
            );
        }

        self.resident.begin_call(&holder);
        self.execution_chain.insert(index, holder);
        self.execution_index += 1;
        self.current_execution = Some(index);
        Ok(())
    }

    /// Close the local call and record its outcome.
    ///
    /// The call rolls back if `failure` is present, the context was marked
    /// for rollback, or one of its outbound calls failed. A rollback is
    /// recorded when later calls joined the chain after this one; a commit
    /// is recorded only by the originating context.
    pub async fn complete_transaction(
        mut self,
        result: Option<Value>,
        failure: Option<Failure>,
    ) -> Result<Completion> {
        let index = self
            .current_execution
            .take()
            .ok_or(ContextError::NoCurrentExecution)?;

        let failed = failure.is_some() || self.rollback || self.remote_failed;
        let state = if failed {
            ExecutionState::LocalRollback
        } else {
            ExecutionState::Committed
        };
        let failure_type = failure
            .as_ref()
            .or_else(|| self.failed_remote())
            .map(|f| f.type_name.clone());

        let holder = self
            .execution_chain
            .get_mut(&index)
            .ok_or(ContextError::NoCurrentExecution)?;
        holder.finish(result, failure, state);
        self.resident.publish(holder, self.rollback);

        let recorded = self.record_outcome(index, failed, failure_type).await;

        if let Some(parked) = self.resident.end_call() {
            if let Some(transaction_id) = &self.transaction_id {
                self.coordinator
                    .dispatcher()
                    .settle(transaction_id, &self.resident, &parked)
                    .await;
            }
        }
        let state = recorded?;

        if let Some(holder) = self.execution_chain.get_mut(&index) {
            holder.state = state;
            info!(
                transaction_id = self.transaction_id.as_deref().unwrap_or_default(),
                group = %self.coordinator.group(),
                peer = %self.coordinator.peer(),
                elapsed_ms = holder.elapsed_ms().unwrap_or_default(),
                state = state.code(),
                "Local call completed"
            );
        }

        Ok(Completion {
            transaction_id: self.transaction_id.take(),
            is_new: self.is_new,
            state,
            chain: std::mem::take(&mut self.execution_chain).into_values().collect(),
        })
    }

    /// Write the local call's outcome and return its final state.
    async fn record_outcome(
        &self,
        index: u32,
        failed: bool,
        failure_type: Option<String>,
    ) -> Result<ExecutionState> {
        let Some(holder) = self.execution_chain.get(&index) else {
            return Err(ContextError::NoCurrentExecution);
        };
        let Some(transaction_id) = &self.transaction_id else {
            return Ok(holder.state);
        };
        let mediator = self.coordinator.mediator();
        let (group, peer) = (self.coordinator.group(), self.coordinator.peer());

        if failed {
            let is_tail = self.execution_chain.keys().next_back() == Some(&index);
            if !is_tail {
                let detail = RollbackDetail::new(holder.method.to_string(), failure_type);
                mediator
                    .rollback(transaction_id, group, peer, &detail)
                    .await?;
                info!(
                    transaction_id = %transaction_id,
                    method = %holder.method,
                    local_rollback = self.rollback,
                    failure = holder.failure.as_ref().map(ToString::to_string).unwrap_or_default(),
                    "Local call rolled back transaction"
                );
            }
            return Ok(ExecutionState::LocalRollback);
        }

        if self.is_new {
            let decision = mediator.commit(transaction_id, group, peer).await?;
            if let Decision::RolledBack(detail) = decision {
                warn!(
                    transaction_id = %transaction_id,
                    detail = %detail.encode(),
                    "Commit refused, transaction already rolled back"
                );
                return Ok(ExecutionState::GlobalRollback);
            }
        }
        Ok(ExecutionState::Committed)
    }

    fn failed_remote(&self) -> Option<&Failure> {
        self.execution_chain
            .values()
            .filter(|h| !h.is_local && h.state == ExecutionState::LocalRollback)
            .find_map(|h| h.failure.as_ref())
    }

    /// Register an outbound call. On return the context has a transaction id.
    ///
    /// Without an id yet, one is generated and the chain is originated:
    /// at the open local call's position, or at index 0 by the outbound
    /// call itself when no local call is open.
    pub async fn before_remoter(
        &mut self,
        target: impl Into<String>,
        method: MethodId,
        args: Vec<Value>,
    ) -> Result<String> {
        let mut join_remote = true;
        let transaction_id = match self.transaction_id.clone() {
            Some(id) => id,
            None => {
                let generator = self.coordinator.id_generator();
                let (id, index, data) = match self.current_execution() {
                    Some(local) => (
                        generator.generate(&local.method, &local.args),
                        self.execution_index - 1,
                        local.method.to_string(),
                    ),
                    None => {
                        join_remote = false;
                        (
                            generator.generate(&method, &args),
                            self.execution_index,
                            method.to_string(),
                        )
                    }
                };
                self.register(&id);
                if let Err(e) = self.join(&id, index, Some(data.clone())).await {
                    self.unregister(&id);
                    return Err(e);
                }
                info!(
                    transaction_id = %id,
                    group = %self.coordinator.group(),
                    peer = %self.coordinator.peer(),
                    index,
                    method = %data,
                    "Transaction started"
                );
                self.transaction_id = Some(id.clone());
                id
            }
        };

        let index = self.execution_index;
        let holder = ExecutionHolder::new(false, target.into(), method, args);
        if join_remote {
            self.join(&transaction_id, index, Some(holder.method.to_string()))
                .await?;
        }
        info!(
            transaction_id = %transaction_id,
            index,
            target = %holder.target,
            method = %holder.method,
            "Outbound call joined transaction"
        );
        self.execution_chain.insert(index, holder);
        self.execution_index += 1;
        Ok(transaction_id)
    }

    /// Close the most recent outbound call and classify its outcome.
    ///
    /// A failed outbound call inside a local call makes that local call
    /// roll back on completion. Without a local call, the outcome is
    /// recorded right away when this context originated the transaction.
    pub async fn after_remoter(
        &mut self,
        result: Option<Value>,
        failure: Option<Failure>,
    ) -> Result<ExecutionState> {
        let index = self
            .execution_index
            .checked_sub(1)
            .ok_or(ContextError::NoRemoteExecution)?;
        let failed = self
            .coordinator
            .failure_checker()
            .failed(result.as_ref(), failure.as_ref());
        let state = if failed {
            ExecutionState::LocalRollback
        } else {
            ExecutionState::Committed
        };

        let holder = match self.execution_chain.get_mut(&index) {
            Some(holder) if !holder.is_local && holder.ended_at.is_none() => holder,
            _ => return Err(ContextError::NoRemoteExecution),
        };
        holder.finish(result, failure, state);
        let method = holder.method.to_string();
        let failure_type = holder.failure.as_ref().map(|f| f.type_name.clone());
        info!(
            transaction_id = self.transaction_id.as_deref().unwrap_or_default(),
            method = %method,
            elapsed_ms = holder.elapsed_ms().unwrap_or_default(),
            state = state.code(),
            "Outbound call completed"
        );

        let Some(transaction_id) = self.transaction_id.clone() else {
            return Ok(state);
        };
        if self.current_execution.is_some() {
            if failed {
                self.remote_failed = true;
            }
            return Ok(state);
        }

        let mediator = self.coordinator.mediator();
        let (group, peer) = (self.coordinator.group(), self.coordinator.peer());
        if failed {
            let detail = RollbackDetail::new(method, failure_type);
            mediator
                .rollback(&transaction_id, group, peer, &detail)
                .await?;
        } else if self.is_new {
            let decision = mediator.commit(&transaction_id, group, peer).await?;
            if decision.is_rollback() {
                if let Some(holder) = self.execution_chain.get_mut(&index) {
                    holder.state = ExecutionState::GlobalRollback;
                }
                return Ok(ExecutionState::GlobalRollback);
            }
        }
        Ok(state)
    }
}
