use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::*;
use crate::config::TxConfig;
use crate::context::ContextError;
use crate::coordinator::Coordinator;
use crate::mediator::{MediatorError, RollbackDetail};
use crate::policy::IdGenerator;
use crate::test_utils::RecordingMediator;

const TX: &str = "tx-scope";

#[derive(Debug, PartialEq, thiserror::Error)]
#[error("out of stock: {0}")]
struct OutOfStock(u64);

struct FixedId;

impl IdGenerator for FixedId {
    fn generate(&self, _method: &MethodId, _args: &[Value]) -> String {
        TX.to_string()
    }
}

async fn coordinator() -> (Arc<Coordinator>, Arc<RecordingMediator>) {
    let mediator = Arc::new(RecordingMediator::new());
    let mut config = TxConfig::standalone("orders", "10.0.0.1:8080");
    config.lease.ttl_secs = 0;
    let coordinator = Coordinator::builder(config)
        .mediator(mediator.clone())
        .id_generator(Arc::new(FixedId))
        .build()
        .await
        .unwrap();
    (coordinator, mediator)
}

fn place() -> MethodId {
    MethodId::new("orders::OrderService", "place", ["u64"])
}

fn reserve() -> MethodId {
    MethodId::new("stock::StockService", "reserve", ["u64"])
}

async fn reserve_ok(transaction_id: String) -> Result<String, OutOfStock> {
    Ok(format!("reserved under {}", transaction_id))
}

async fn reserve_crash(_transaction_id: String) -> Result<String, OutOfStock> {
    panic!("stock service crashed")
}

fn place_then_crash(ctx: &mut TransactionContext) -> BoxFuture<'_, Result<u64, OutOfStock>> {
    Box::pin(async move {
        run_remote(ctx, "stock", reserve(), vec![], reserve_ok)
            .await
            .unwrap();
        panic!("order service crashed")
    })
}

#[tokio::test]
async fn test_run_local_passes_output_and_commits() {
    let (coordinator, mediator) = coordinator().await;

    let outcome = run_local(
        coordinator.context(),
        "orders",
        place(),
        vec![Value::from(7)],
        |ctx| {
            Box::pin(async move {
                let remote = run_remote(ctx, "stock", reserve(), vec![Value::from(7)], reserve_ok)
                    .await
                    .unwrap();
                assert_eq!(remote.state.unwrap(), ExecutionState::Committed);
                remote.output.map(|_| 7u64)
            })
        },
    )
    .await
    .unwrap();

    assert_eq!(outcome.output, Ok(7));
    let completion = outcome.completion.unwrap();
    assert_eq!(completion.state, ExecutionState::Committed);
    assert_eq!(completion.transaction_id.as_deref(), Some(TX));
    assert_eq!(completion.chain.len(), 2);
    assert_eq!(mediator.commits().await, 1);
}

#[tokio::test]
async fn test_run_local_business_error_passes_through() {
    let (coordinator, mediator) = coordinator().await;

    let outcome = run_local(coordinator.context(), "orders", place(), vec![], |ctx| {
        Box::pin(async move {
            run_remote(ctx, "stock", reserve(), vec![], reserve_ok)
                .await
                .unwrap();
            Err::<u64, _>(OutOfStock(3))
        })
    })
    .await
    .unwrap();

    assert_eq!(outcome.output, Err(OutOfStock(3)));
    assert_eq!(
        outcome.completion.unwrap().state,
        ExecutionState::LocalRollback
    );
    assert_eq!(
        mediator.rollbacks().await,
        vec![RollbackDetail::new(
            place().to_string(),
            Some(std::any::type_name::<OutOfStock>().to_string())
        )]
    );
    assert_eq!(mediator.commits().await, 0);
}

#[tokio::test]
async fn test_run_remote_failure_rolls_back_enclosing_call() {
    let (coordinator, mediator) = coordinator().await;

    let outcome = run_local(coordinator.context(), "orders", place(), vec![], |ctx| {
        Box::pin(async move {
            let remote = run_remote(ctx, "stock", reserve(), vec![], |_id| async {
                Err::<String, _>(OutOfStock(1))
            })
            .await
            .unwrap();
            assert_eq!(remote.output, Err(OutOfStock(1)));
            assert_eq!(remote.state.unwrap(), ExecutionState::LocalRollback);
            Ok::<_, OutOfStock>(0u64)
        })
    })
    .await
    .unwrap();

    assert_eq!(outcome.output, Ok(0));
    assert_eq!(
        outcome.completion.unwrap().state,
        ExecutionState::LocalRollback
    );
    assert_eq!(mediator.rollbacks().await.len(), 1);
}

#[tokio::test]
async fn test_run_local_skips_call_when_open_fails() {
    let (coordinator, mediator) = coordinator().await;
    let mut ctx = coordinator.context();
    ctx.set_transaction_id("tx-upstream").await.unwrap();
    mediator.set_fail_on_join(true).await;

    let ran = AtomicBool::new(false);
    let result = run_local(ctx, "orders", place(), vec![], |_ctx| {
        ran.store(true, Ordering::SeqCst);
        Box::pin(async { Ok::<_, OutOfStock>(1u64) })
    })
    .await;

    assert!(matches!(
        result,
        Err(ContextError::Mediator(MediatorError::Store(_)))
    ));
    assert!(!ran.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_run_local_panic_completes_then_resumes() {
    let (coordinator, mediator) = coordinator().await;
    let ctx = coordinator.context();

    let handle = tokio::spawn(async move {
        let _ = run_local(ctx, "orders", place(), vec![], place_then_crash).await;
    });
    let err = handle.await.unwrap_err();

    assert!(err.is_panic());
    assert_eq!(
        mediator.rollbacks().await,
        vec![RollbackDetail::new(
            place().to_string(),
            Some(PANIC_FAILURE.to_string())
        )]
    );
    assert_eq!(mediator.commits().await, 0);
}

#[tokio::test]
async fn test_run_remote_panic_without_local_call() {
    let (coordinator, mediator) = coordinator().await;
    let mut ctx = coordinator.context();

    let handle = tokio::spawn(async move {
        let _ = run_remote(&mut ctx, "stock", reserve(), vec![], reserve_crash).await;
    });
    let err = handle.await.unwrap_err();

    assert!(err.is_panic());
    assert_eq!(
        mediator.rollbacks().await,
        vec![RollbackDetail::new(
            reserve().to_string(),
            Some(PANIC_FAILURE.to_string())
        )]
    );
}

#[test]
fn test_panic_failure_message() {
    let payload: Box<dyn Any + Send> = Box::new("boom");
    assert_eq!(panic_failure(payload.as_ref()), Failure::new(PANIC_FAILURE, "boom"));

    let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
    assert_eq!(panic_failure(payload.as_ref()).message, "bang");

    let payload: Box<dyn Any + Send> = Box::new(42);
    assert_eq!(panic_failure(payload.as_ref()).message, "");
}

async fn reserve_lots(_transaction_id: String) -> Result<HashMap<(u64, u64), u64>, OutOfStock> {
    Ok(HashMap::from([((7, 1), 3)]))
}

#[tokio::test]
async fn test_unserializable_remote_result_still_commits() {
    let (coordinator, mediator) = coordinator().await;

    let outcome = run_local(coordinator.context(), "orders", place(), vec![], |ctx| {
        Box::pin(async move {
            let remote = run_remote(ctx, "stock", reserve(), vec![], reserve_lots)
                .await
                .unwrap();
            assert_eq!(remote.state.unwrap(), ExecutionState::Committed);
            remote.output.map(|lots| lots.len())
        })
    })
    .await
    .unwrap();

    assert_eq!(outcome.output, Ok(1));
    assert_eq!(outcome.completion.unwrap().state, ExecutionState::Committed);
    assert!(mediator.rollbacks().await.is_empty());
    assert_eq!(mediator.commits().await, 1);
}
