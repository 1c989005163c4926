//! Shared view of a context, read by asynchronous decision delivery.
//!
//! The owning `TransactionContext` is the only writer: it publishes a
//! snapshot of its current local call before every decision write. Watch
//! delivery reads the snapshot, or parks the decision when the owner still
//! has a local call open.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use serde_json::Value;

use super::holder::{ExecutionHolder, ExecutionState, MethodId};
use crate::mediator::Decision;

/// What compensation needs to know about the local call.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionSnapshot {
    pub method: MethodId,
    pub args: Vec<Value>,
    pub extra_parameters: HashMap<String, Value>,
    pub state: ExecutionState,
}

impl From<&ExecutionHolder> for ExecutionSnapshot {
    fn from(holder: &ExecutionHolder) -> Self {
        Self {
            method: holder.method.clone(),
            args: holder.args.clone(),
            extra_parameters: holder.extra_parameters.clone(),
            state: holder.state,
        }
    }
}

/// Input for settling a decision against a resident context.
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub is_new: bool,
    pub local_rollback: bool,
    pub execution: Option<ExecutionSnapshot>,
}

#[derive(Debug, Default)]
struct ResidentState {
    is_new: bool,
    local_rollback: bool,
    execution: Option<ExecutionSnapshot>,
    in_flight: bool,
    awaiting_call: bool,
    pending: Option<Decision>,
}

/// Resident view of one context, registered under its transaction id.
#[derive(Debug, Default)]
pub struct ResidentContext {
    state: Mutex<ResidentState>,
}

impl ResidentContext {
    pub fn new(is_new: bool) -> Self {
        Self {
            state: Mutex::new(ResidentState {
                is_new,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ResidentState> {
        // Writers never panic while holding the lock.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn set_new(&self, is_new: bool) {
        self.lock().is_new = is_new;
    }

    /// The context adopted a transaction before opening its local call.
    /// Decisions are held until that call completes.
    pub(crate) fn await_call(&self) {
        self.lock().awaiting_call = true;
    }

    /// A local call opened.
    pub(crate) fn begin_call(&self, holder: &ExecutionHolder) {
        let mut state = self.lock();
        state.execution = Some(holder.into());
        state.in_flight = true;
        state.awaiting_call = false;
    }

    /// Publish the current local call ahead of a decision write.
    pub(crate) fn publish(&self, holder: &ExecutionHolder, local_rollback: bool) {
        let mut state = self.lock();
        state.execution = Some(holder.into());
        state.local_rollback = local_rollback;
    }

    /// Close the local call and hand back any decision parked meanwhile.
    pub(crate) fn end_call(&self) -> Option<Decision> {
        let mut state = self.lock();
        state.in_flight = false;
        state.pending.take()
    }

    /// Park `decision` if a local call is open or about to open. Returns
    /// `true` if parked.
    ///
    /// Decisions are final once recorded, so the first one parked is kept.
    pub(crate) fn park_if_in_flight(&self, decision: &Decision) -> bool {
        let mut state = self.lock();
        if !state.in_flight && !state.awaiting_call {
            return false;
        }
        if state.pending.is_none() {
            state.pending = Some(decision.clone());
        }
        true
    }

    /// Apply `decision` to the snapshot and return what settlement needs.
    ///
    /// A rollback turns a call that had not failed on its own into a
    /// global rollback.
    pub(crate) fn settle(&self, decision: &Decision) -> Settlement {
        let mut state = self.lock();
        if decision.is_rollback() {
            if let Some(execution) = state.execution.as_mut() {
                if execution.state != ExecutionState::LocalRollback {
                    execution.state = ExecutionState::GlobalRollback;
                }
            }
        }
        Settlement {
            is_new: state.is_new,
            local_rollback: state.local_rollback,
            execution: state.execution.clone(),
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.lock().in_flight
    }

    pub fn execution(&self) -> Option<ExecutionSnapshot> {
        self.lock().execution.clone()
    }
}
