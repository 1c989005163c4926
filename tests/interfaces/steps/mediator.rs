//! Mediator interface step definitions.
//!
//! Scenarios run `StoreMediator` on the in-memory store, which can
//! simulate session loss.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cucumber::{given, then, when, World};
use tokio::sync::mpsc;
use txchain::mediator::{
    Decision, MediatorClient, MediatorError, MediatorWatcher, RollbackDetail, StoreMediator,
};
use txchain::store::MemoryStore;

struct ChannelListener(mpsc::UnboundedSender<(String, Decision)>);

#[async_trait]
impl MediatorWatcher for ChannelListener {
    async fn change(&self, transaction_id: &str, decision: &Decision) {
        let _ = self.0.send((transaction_id.to_string(), decision.clone()));
    }
}

/// Test context for Mediator scenarios.
#[derive(World)]
#[world(init = Self::new)]
pub struct MediatorWorld {
    store: Arc<MemoryStore>,
    mediator: Option<Arc<StoreMediator>>,
    changes: Option<mpsc::UnboundedReceiver<(String, Decision)>>,
    last_decision: Option<Decision>,
    last_error: Option<MediatorError>,
}

impl std::fmt::Debug for MediatorWorld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediatorWorld")
            .field("mediator", &self.mediator.as_ref().map(|_| "<StoreMediator>"))
            .field("last_decision", &self.last_decision)
            .field("last_error", &self.last_error)
            .finish()
    }
}

impl MediatorWorld {
    fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            mediator: None,
            changes: None,
            last_decision: None,
            last_error: None,
        }
    }

    fn mediator(&self) -> &StoreMediator {
        self.mediator.as_ref().expect("Mediator not initialized")
    }

    async fn next_change(&mut self) -> (String, Decision) {
        let changes = self.changes.as_mut().expect("No listener registered");
        tokio::time::timeout(Duration::from_secs(1), changes.recv())
            .await
            .expect("Decision change not delivered")
            .expect("Listener channel closed")
    }
}

fn peer_parts(participant: &str) -> (&str, &str) {
    participant
        .split_once('@')
        .expect("participant must be <group>@<peer>")
}

fn detail(method: &str) -> RollbackDetail {
    match method.split_once('|') {
        Some((method, failure)) => RollbackDetail::new(method, Some(failure.to_string())),
        None => RollbackDetail::new(method, None),
    }
}

// --- Background ---

#[given("an initialized mediator with a listener")]
async fn given_mediator(world: &mut MediatorWorld) {
    let mediator = StoreMediator::new(world.store.clone());
    let (tx, rx) = mpsc::unbounded_channel();
    mediator.add_watcher(Arc::new(ChannelListener(tx)));
    mediator.init().await.expect("Failed to init mediator");
    world.mediator = Some(mediator);
    world.changes = Some(rx);
}

// --- Given steps ---

#[given(expr = "transaction {string} started by {string} in {string}")]
async fn given_started(
    world: &mut MediatorWorld,
    transaction_id: String,
    participant: String,
    method: String,
) {
    let (group, peer) = peer_parts(&participant);
    world
        .mediator()
        .join_chain(&transaction_id, group, peer, 0, Some(&method))
        .await
        .expect("Failed to start transaction");
}

#[given(expr = "transaction {string} was committed")]
async fn given_committed(world: &mut MediatorWorld, transaction_id: String) {
    world
        .mediator()
        .commit(&transaction_id, "orders", "a:1")
        .await
        .expect("Failed to commit");
    world.next_change().await;
}

// --- When steps ---

#[when(expr = "{string} joins transaction {string} at index {int} in {string}")]
async fn when_join(
    world: &mut MediatorWorld,
    participant: String,
    transaction_id: String,
    index: u32,
    method: String,
) {
    let (group, peer) = peer_parts(&participant);
    match world
        .mediator()
        .join_chain(&transaction_id, group, peer, index, Some(&method))
        .await
    {
        Ok(()) => world.last_error = None,
        Err(e) => world.last_error = Some(e),
    }
}

#[when(expr = "{string} commits transaction {string}")]
async fn when_commit(world: &mut MediatorWorld, participant: String, transaction_id: String) {
    let (group, peer) = peer_parts(&participant);
    world.last_decision = Some(
        world
            .mediator()
            .commit(&transaction_id, group, peer)
            .await
            .expect("Failed to commit"),
    );
}

#[when(expr = "{string} rolls back transaction {string} for {string}")]
async fn when_rollback(
    world: &mut MediatorWorld,
    participant: String,
    transaction_id: String,
    method: String,
) {
    let (group, peer) = peer_parts(&participant);
    world.last_decision = Some(
        world
            .mediator()
            .rollback(&transaction_id, group, peer, &detail(&method))
            .await
            .expect("Failed to roll back"),
    );
}

#[when(expr = "transaction {string} is cleared")]
async fn when_cleared(world: &mut MediatorWorld, transaction_id: String) {
    world
        .mediator()
        .clear(&transaction_id)
        .await
        .expect("Failed to clear");
}

#[when(expr = "the coordination session expires while watching {string}")]
async fn when_session_expires(world: &mut MediatorWorld, transaction_id: String) {
    world.store.expire_session().await;
    // Re-arming runs on the session follower task.
    let path = format!("/rolling-tx/state/{}", transaction_id);
    for _ in 0..50 {
        if world.store.watch_count(&path).await == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(world.store.watch_count(&path).await, 1, "watch not re-armed");
}

#[when("abandoned transactions are expired")]
async fn when_expire(world: &mut MediatorWorld) {
    world
        .mediator()
        .expire_abandoned(Duration::ZERO)
        .await
        .expect("Failed to expire");
}

// --- Then steps ---

#[then(expr = "transaction {string} should exist")]
async fn then_exists(world: &mut MediatorWorld, transaction_id: String) {
    assert!(world.mediator().transaction_exists(&transaction_id).await);
}

#[then(expr = "transaction {string} should not exist")]
async fn then_not_exists(world: &mut MediatorWorld, transaction_id: String) {
    assert!(!world.mediator().transaction_exists(&transaction_id).await);
}

#[then(expr = "transaction {string} should have {int} chain entries")]
async fn then_chain_len(world: &mut MediatorWorld, transaction_id: String, count: usize) {
    let result = world
        .mediator()
        .transaction_result(&transaction_id)
        .await
        .expect("Failed to read transaction")
        .expect("Transaction not found");
    assert_eq!(result.chain.len(), count, "chain: {:?}", result.chain);
}

#[then(expr = "transaction {string} should be started by {string}")]
async fn then_origin(world: &mut MediatorWorld, transaction_id: String, participant: String) {
    let (group, peer) = peer_parts(&participant);
    let result = world
        .mediator()
        .transaction_result(&transaction_id)
        .await
        .expect("Failed to read transaction")
        .expect("Transaction not found");
    assert_eq!(result.origin_group, group);
    assert_eq!(result.origin_peer, peer);
    assert!(result.started_at.is_some());
}

#[then("the join should fail for an unknown chain")]
fn then_unknown_chain(world: &mut MediatorWorld) {
    assert!(
        matches!(world.last_error, Some(MediatorError::UnknownChain(_))),
        "Expected UnknownChain, got {:?}",
        world.last_error
    );
}

#[then(expr = "the decision in force should be {string}")]
fn then_decision(world: &mut MediatorWorld, expected: String) {
    let decision = world.last_decision.as_ref().expect("No decision returned");
    assert_eq!(decision.to_string(), expected);
}

#[then(expr = "the listener should observe {string} for {string}")]
async fn then_observed(world: &mut MediatorWorld, expected: String, transaction_id: String) {
    let (id, decision) = world.next_change().await;
    assert_eq!(id, transaction_id);
    assert_eq!(decision.to_string(), expected);
}

#[then("the listener should observe nothing more")]
async fn then_quiet(world: &mut MediatorWorld) {
    let changes = world.changes.as_mut().expect("No listener registered");
    let next = tokio::time::timeout(Duration::from_millis(200), changes.recv()).await;
    assert!(next.is_err(), "Unexpected change {:?}", next);
}
