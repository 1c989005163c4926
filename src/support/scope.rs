//! Scope runners.
//!
//! `run_local` and `run_remote` wrap a business call between its open and
//! completion steps. Completion runs exactly once whether the call returns
//! `Ok`, returns `Err`, or panics; a panic is recorded as a failure and
//! then resumed. Business results are handed back unchanged.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::context::{self, Completion, ExecutionState, Failure, MethodId, TransactionContext};

/// Failure type recorded for a call that panicked.
pub const PANIC_FAILURE: &str = "panic";

/// Outcome of a local call run through `run_local`.
#[derive(Debug)]
pub struct LocalOutcome<T, E> {
    /// The business result, unchanged.
    pub output: Result<T, E>,
    /// Result of completing the context.
    pub completion: context::Result<Completion>,
}

/// Outcome of an outbound call run through `run_remote`.
#[derive(Debug)]
pub struct RemoteOutcome<T, E> {
    pub output: Result<T, E>,
    pub state: context::Result<ExecutionState>,
}

fn panic_failure(payload: &(dyn Any + Send)) -> Failure {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_default();
    Failure::new(PANIC_FAILURE, message)
}

fn recorded<T: Serialize, E: std::error::Error>(
    output: &Result<T, E>,
) -> (Option<Value>, Option<Failure>) {
    match output {
        Ok(value) => match serde_json::to_value(value) {
            Ok(value) => (Some(value), None),
            Err(e) => {
                let type_name = std::any::type_name::<T>();
                warn!(
                    result_type = type_name,
                    error = %e,
                    "Call result not serializable, recording its type"
                );
                (Some(Value::String(type_name.to_string())), None)
            }
        },
        Err(e) => (None, Some(Failure::of(e))),
    }
}

/// Run the local call of a root context.
///
/// The call gets the context to make outbound calls through. Fails only
/// if the call could not be opened, in which case it does not run.
pub async fn run_local<T, E, F>(
    mut context: TransactionContext,
    target: impl Into<String>,
    method: MethodId,
    args: Vec<Value>,
    call: F,
) -> context::Result<LocalOutcome<T, E>>
where
    T: Serialize,
    E: std::error::Error,
    F: for<'c> FnOnce(&'c mut TransactionContext) -> BoxFuture<'c, Result<T, E>>,
{
    context.prepare_transaction(target, method, args).await?;

    let output = AssertUnwindSafe(call(&mut context)).catch_unwind().await;
    match output {
        Ok(output) => {
            let (result, failure) = recorded(&output);
            let completion = context.complete_transaction(result, failure).await;
            Ok(LocalOutcome { output, completion })
        }
        Err(payload) => {
            let failure = panic_failure(payload.as_ref());
            // The panic is resumed regardless of the completion outcome.
            let _ = context.complete_transaction(None, Some(failure)).await;
            std::panic::resume_unwind(payload)
        }
    }
}

/// Run an outbound call. The call receives the transaction id to propagate.
///
/// Fails only if the call could not be registered, in which case it does
/// not run.
pub async fn run_remote<T, E, F, Fut>(
    context: &mut TransactionContext,
    target: impl Into<String>,
    method: MethodId,
    args: Vec<Value>,
    call: F,
) -> context::Result<RemoteOutcome<T, E>>
where
    T: Serialize,
    E: std::error::Error,
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let transaction_id = context.before_remoter(target, method, args).await?;

    let output = AssertUnwindSafe(call(transaction_id)).catch_unwind().await;
    match output {
        Ok(output) => {
            let (result, failure) = recorded(&output);
            let state = context.after_remoter(result, failure).await;
            Ok(RemoteOutcome { output, state })
        }
        Err(payload) => {
            let failure = panic_failure(payload.as_ref());
            let _ = context.after_remoter(None, Some(failure)).await;
            std::panic::resume_unwind(payload)
        }
    }
}

#[cfg(test)]
mod tests;
