//! Decision dispatch.
//!
//! `RollbackDispatcher` is the process-wide `MediatorWatcher`. For every
//! final decision it finds the resident context, runs compensation on a
//! rollback, and removes the registry entry. The originating process also
//! deletes the transaction's coordination records.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::context::{ResidentContext, Settlement};
use crate::mediator::{Decision, MediatorClient, MediatorWatcher};
use crate::registry::TransactionRegistry;

pub mod handler;

pub use handler::{HandlerError, HandlerTable, MethodTable, RollbackHandler, RollbackRequest};

/// Settles decisions against resident contexts.
pub struct RollbackDispatcher {
    client: Weak<dyn MediatorClient>,
    registry: Arc<TransactionRegistry>,
    handlers: HandlerTable,
}

impl RollbackDispatcher {
    pub fn new(
        client: Weak<dyn MediatorClient>,
        registry: Arc<TransactionRegistry>,
        handlers: HandlerTable,
    ) -> Self {
        Self {
            client,
            registry,
            handlers,
        }
    }

    /// Settle `decision` against `resident`.
    ///
    /// Only the caller that removes the registry entry settles; every
    /// other call is a no-op.
    pub async fn settle(
        &self,
        transaction_id: &str,
        resident: &Arc<ResidentContext>,
        decision: &Decision,
    ) {
        if !decision.is_terminal() {
            return;
        }
        if !self.registry.remove(transaction_id, resident) {
            debug!(transaction_id = %transaction_id, "Decision already settled");
            return;
        }

        let settlement = resident.settle(decision);
        match decision {
            Decision::Committed => {
                info!(transaction_id = %transaction_id, "Global transaction committed");
            }
            Decision::RolledBack(detail) => {
                info!(
                    transaction_id = %transaction_id,
                    detail = %detail.encode(),
                    "Global transaction rolled back"
                );
                self.compensate(transaction_id, &settlement).await;
            }
            Decision::InProgress => {}
        }

        if settlement.is_new {
            self.clear(transaction_id).await;
        }
        info!(
            transaction_id = %transaction_id,
            originator = settlement.is_new,
            "Transaction context cleared"
        );
    }

    async fn compensate(&self, transaction_id: &str, settlement: &Settlement) {
        let Some(execution) = &settlement.execution else {
            debug!(transaction_id = %transaction_id, "No local call to compensate");
            return;
        };
        let method = &execution.method;

        let Some(handler) = self.handlers.resolve(&method.declaring_type) else {
            error!(
                transaction_id = %transaction_id,
                method = %method,
                "No rollback handler defined"
            );
            return;
        };

        let request = RollbackRequest {
            transaction_id: transaction_id.to_string(),
            local_rollback: settlement.local_rollback,
            state: execution.state,
            extra_parameters: execution.extra_parameters.clone(),
            args: execution.args.clone(),
        };
        match handler.rollback(method, request).await {
            Ok(result) => {
                info!(
                    transaction_id = %transaction_id,
                    method = %method,
                    result = ?result,
                    "Rollback handler finished"
                );
            }
            Err(e) => {
                error!(
                    transaction_id = %transaction_id,
                    method = %method,
                    error = %e,
                    "Rollback handler failed"
                );
            }
        }
    }

    async fn clear(&self, transaction_id: &str) {
        let Some(client) = self.client.upgrade() else {
            warn!(transaction_id = %transaction_id, "Mediator gone, records not cleared");
            return;
        };
        if let Err(e) = client.clear(transaction_id).await {
            error!(
                transaction_id = %transaction_id,
                error = %e,
                "Failed to clear coordination records"
            );
        }
    }
}

#[async_trait]
impl MediatorWatcher for RollbackDispatcher {
    async fn change(&self, transaction_id: &str, decision: &Decision) {
        if !decision.is_terminal() {
            debug!(transaction_id = %transaction_id, "Ignoring in-progress state change");
            return;
        }
        let Some(resident) = self.registry.get(transaction_id) else {
            debug!(
                transaction_id = %transaction_id,
                decision = %decision,
                "No resident context for decision"
            );
            return;
        };
        if resident.park_if_in_flight(decision) {
            debug!(
                transaction_id = %transaction_id,
                decision = %decision,
                "Local call still open, decision parked"
            );
            return;
        }
        self.settle(transaction_id, &resident, decision).await;
    }
}
