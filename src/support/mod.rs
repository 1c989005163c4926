//! Glue for driving a `TransactionContext` from request handlers.
//!
//! - `http`: `_rtxId` query parameter propagation
//! - `grpc`: `_rtxid` metadata propagation
//! - `scope`: runners that pair every open call with its completion

pub mod grpc;
pub mod http;
pub mod scope;

pub use scope::{run_local, run_remote, LocalOutcome, RemoteOutcome};
