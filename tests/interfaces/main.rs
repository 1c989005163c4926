//! Interface tests for coordination backends using Cucumber.
//!
//! These tests verify that every store implementation honours the same
//! node contract, and that the mediator layered on top of it implements
//! the chain protocol. Select a store backend via environment variable:
//!
//! ```bash
//! # In-memory (default)
//! cargo test --test interfaces --features test-utils
//!
//! # NATS JetStream KV (NATS_URL, default nats://localhost:4222)
//! STORE_BACKEND=nats cargo test --test interfaces --features test-utils,nats
//! ```

mod backend;
mod steps;

use cucumber::World;
use steps::coordination_store::CoordinationStoreWorld;
use steps::mediator::MediatorWorld;

#[tokio::main]
async fn main() {
    println!("\n=== Running CoordinationStore Interface Tests ===\n");
    CoordinationStoreWorld::cucumber()
        .fail_on_skipped()
        .run("tests/interfaces/features/coordination_store.feature")
        .await;

    println!("\n=== Running Mediator Interface Tests ===\n");
    MediatorWorld::cucumber()
        .fail_on_skipped()
        .run("tests/interfaces/features/mediator.feature")
        .await;
}
