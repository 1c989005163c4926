//! Cucumber step definitions for interface tests.

pub mod coordination_store;
pub mod mediator;
