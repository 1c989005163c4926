//! Compensating handlers.
//!
//! Business code registers one handler per participant type at startup.
//! When a rollback is settled against a resident context, the handler
//! registered for the failing call's declaring type is asked to undo it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::context::{ExecutionState, MethodId};

/// Errors raised by compensating handlers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    #[error("No rollback method defined for {0}")]
    NoSuchMethod(String),

    #[error("Rollback failed: {0}")]
    Failed(String),
}

/// Everything a compensating method receives.
#[derive(Debug, Clone, PartialEq)]
pub struct RollbackRequest {
    pub transaction_id: String,
    /// Whether the owning context had been marked for rollback locally.
    pub local_rollback: bool,
    /// State of the call being compensated.
    pub state: ExecutionState,
    pub extra_parameters: HashMap<String, Value>,
    /// Arguments of the original call.
    pub args: Vec<Value>,
}

/// Compensating logic for one business type.
#[async_trait]
pub trait RollbackHandler: Send + Sync {
    /// Undo the effects of `method`.
    async fn rollback(
        &self,
        method: &MethodId,
        request: RollbackRequest,
    ) -> Result<Option<Value>, HandlerError>;
}

/// Startup registration table: declaring type -> handler.
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: HashMap<String, Arc<dyn RollbackHandler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `declaring_type`, replacing any previous one.
    pub fn register(
        mut self,
        declaring_type: impl Into<String>,
        handler: Arc<dyn RollbackHandler>,
    ) -> Self {
        self.handlers.insert(declaring_type.into(), handler);
        self
    }

    pub fn resolve(&self, declaring_type: &str) -> Option<Arc<dyn RollbackHandler>> {
        self.handlers.get(declaring_type).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.handlers.keys().collect();
        types.sort();
        f.debug_struct("HandlerTable").field("types", &types).finish()
    }
}

type CompensateFn =
    dyn Fn(RollbackRequest) -> BoxFuture<'static, Result<Option<Value>, HandlerError>> + Send + Sync;

/// Handler built from closures, one per business method.
///
/// Methods are matched by name and parameter shape, mirroring the
/// business type's own method set.
#[derive(Default)]
pub struct MethodTable {
    methods: HashMap<(String, Vec<String>), Box<CompensateFn>>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<I, P, F>(mut self, name: impl Into<String>, params: I, f: F) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
        F: Fn(RollbackRequest) -> BoxFuture<'static, Result<Option<Value>, HandlerError>>
            + Send
            + Sync
            + 'static,
    {
        let key = (name.into(), params.into_iter().map(Into::into).collect());
        self.methods.insert(key, Box::new(f));
        self
    }
}

#[async_trait]
impl RollbackHandler for MethodTable {
    async fn rollback(
        &self,
        method: &MethodId,
        request: RollbackRequest,
    ) -> Result<Option<Value>, HandlerError> {
        let key = (method.name.clone(), method.params.clone());
        let compensate = self
            .methods
            .get(&key)
            .ok_or_else(|| HandlerError::NoSuchMethod(method.to_string()))?;
        compensate(request).await
    }
}
