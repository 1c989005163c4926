//! Pluggable policies: transaction id generation and outbound failure
//! classification.

use serde_json::Value;
use uuid::Uuid;

use crate::context::{Failure, MethodId};

/// Produces ids for transactions originated in this process.
pub trait IdGenerator: Send + Sync {
    /// Generate an id for a transaction whose first call is `method`.
    fn generate(&self, method: &MethodId, args: &[Value]) -> String;
}

/// Random UUID v4 ids.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn generate(&self, _method: &MethodId, _args: &[Value]) -> String {
        Uuid::new_v4().to_string()
    }
}

/// Decides whether an outbound call failed.
pub trait FailureChecker: Send + Sync {
    fn failed(&self, result: Option<&Value>, failure: Option<&Failure>) -> bool;
}

/// A failure, or a missing or empty result, counts as failed.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultFailureChecker;

impl FailureChecker for DefaultFailureChecker {
    fn failed(&self, result: Option<&Value>, failure: Option<&Failure>) -> bool {
        if failure.is_some() {
            return true;
        }
        match result {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.is_empty(),
            Some(_) => false,
        }
    }
}
