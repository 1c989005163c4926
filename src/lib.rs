//! txchain - rolling distributed transactions
//!
//! Every participant of a distributed call chain records its position in a
//! shared coordination store. The participant that completes the chain
//! records the outcome; every other participant observes that decision and
//! runs its own compensating handler when the chain rolled back.
//!
//! ## Architecture
//! ```text
//! [root call] --prepare/complete--> TransactionContext --join/decide--> MediatorClient
//!      |                                   |                                 |
//!   outbound calls (_rtxId / _rtxid)   TransactionRegistry          CoordinationStore
//!                                          ^                                 |
//!                                          +---- RollbackDispatcher <--watch-+
//! ```

pub mod config;
pub mod context;
pub mod coordinator;
pub mod dispatch;
pub mod mediator;
pub mod policy;
pub mod reaper;
pub mod registry;
pub mod store;
pub mod support;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::TxConfig;
pub use context::{
    Completion, ContextError, ExecutionHolder, ExecutionState, Failure, MethodId,
    TransactionContext,
};
pub use coordinator::{Coordinator, CoordinatorBuilder, CoordinatorError};
pub use dispatch::{HandlerTable, MethodTable, RollbackHandler, RollbackRequest};
pub use mediator::{Decision, MediatorClient, RollbackDetail, TransactionResult};
