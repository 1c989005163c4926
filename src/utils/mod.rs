//! Pure utility functions.
//!
//! Process bootstrap and retry policies shared by the library and binaries.

pub mod bootstrap;
pub mod retry;
