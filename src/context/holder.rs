//! Per-call execution records.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde_json::Value;

/// Outcome state of one call in a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionState {
    InProgress,
    /// The call itself failed, or the context was marked for rollback.
    LocalRollback,
    /// The call succeeded (or never finished) but another participant
    /// rolled the transaction back.
    GlobalRollback,
    Committed,
}

impl ExecutionState {
    /// Numeric state code: 0, -1, -2 or 1.
    pub fn code(self) -> i8 {
        match self {
            ExecutionState::InProgress => 0,
            ExecutionState::LocalRollback => -1,
            ExecutionState::GlobalRollback => -2,
            ExecutionState::Committed => 1,
        }
    }

    pub fn is_rollback(self) -> bool {
        self.code() < 0
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Identity of an invoked operation.
///
/// Rendered as `declaring_type::name(p1,p2)`. Compensating handlers are
/// resolved by `declaring_type` and matched by `name` and `params`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodId {
    pub declaring_type: String,
    pub name: String,
    pub params: Vec<String>,
}

impl MethodId {
    pub fn new<I, P>(declaring_type: impl Into<String>, name: impl Into<String>, params: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        Self {
            declaring_type: declaring_type.into(),
            name: name.into(),
            params: params.into_iter().map(Into::into).collect(),
        }
    }

    /// Identity of an outbound HTTP call, keyed by verb.
    pub fn http(verb: impl AsRef<str>) -> Self {
        Self::new("http", verb.as_ref().to_ascii_uppercase(), Vec::<String>::new())
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}::{}({})",
            self.declaring_type,
            self.name,
            self.params.join(",")
        )
    }
}

/// An observed business failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub type_name: String,
    pub message: String,
}

impl Failure {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
        }
    }

    /// Capture an error's type name and message.
    ///
    /// Takes the concrete error type; a trait object has no useful name.
    pub fn of<E: std::error::Error>(err: &E) -> Self {
        Self::new(std::any::type_name::<E>(), err.to_string())
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

/// Record of one call in a transaction chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionHolder {
    /// Same-process call (`true`) or outbound call.
    pub is_local: bool,
    /// Invoked service, or the URI of an outbound HTTP call.
    pub target: String,
    pub method: MethodId,
    pub args: Vec<Value>,
    pub result: Option<Value>,
    pub failure: Option<Failure>,
    pub state: ExecutionState,
    /// Values attached by business code for later compensation.
    pub extra_parameters: HashMap<String, Value>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl ExecutionHolder {
    pub(crate) fn new(is_local: bool, target: String, method: MethodId, args: Vec<Value>) -> Self {
        Self {
            is_local,
            target,
            method,
            args,
            result: None,
            failure: None,
            state: ExecutionState::InProgress,
            extra_parameters: HashMap::new(),
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub(crate) fn finish(
        &mut self,
        result: Option<Value>,
        failure: Option<Failure>,
        state: ExecutionState,
    ) {
        self.result = result;
        self.failure = failure;
        self.state = state;
        self.ended_at = Some(Utc::now());
    }

    /// Wall-clock time between start and end, once finished.
    pub fn elapsed_ms(&self) -> Option<i64> {
        self.ended_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }
}
