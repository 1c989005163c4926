//! Coordinator assembly.
//!
//! One `Coordinator` is built at startup and shared via `Arc`. It owns the
//! mediator connection, the transaction registry, the rollback dispatcher
//! and the pluggable policies, and hands out a fresh `TransactionContext`
//! for every root call.

use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{ConfigError, MediatorUrl, TxConfig};
use crate::context::TransactionContext;
use crate::dispatch::{HandlerTable, RollbackDispatcher};
use crate::mediator::{MediatorClient, MediatorError, StoreMediator};
use crate::policy::{DefaultFailureChecker, FailureChecker, IdGenerator, UuidGenerator};
use crate::reaper::LeaseReaper;
use crate::registry::TransactionRegistry;
use crate::store::{CoordinationStore, MemoryStore, StoreError};

/// Errors raised while assembling a coordinator.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Coordination store error: {0}")]
    Store(#[from] StoreError),

    #[error("Mediator initialization failed: {0}")]
    Mediator(#[from] MediatorError),
}

/// Open the coordination store a locator names.
pub async fn open_store(url: &MediatorUrl) -> Result<Arc<dyn CoordinationStore>, CoordinatorError> {
    let store: Arc<dyn CoordinationStore> = match url.scheme.as_str() {
        "memory" => Arc::new(MemoryStore::new()),
        #[cfg(feature = "nats")]
        "nats" => crate::store::NatsKvStore::connect(url).await?,
        other => return Err(ConfigError::UnsupportedScheme(other.to_string()).into()),
    };
    Ok(store)
}

/// Builder for `Coordinator`.
pub struct CoordinatorBuilder {
    config: TxConfig,
    handlers: HandlerTable,
    id_generator: Arc<dyn IdGenerator>,
    failure_checker: Arc<dyn FailureChecker>,
    store: Option<Arc<dyn CoordinationStore>>,
    mediator: Option<Arc<dyn MediatorClient>>,
}

impl CoordinatorBuilder {
    /// Compensating handlers, keyed by business type.
    pub fn handlers(mut self, handlers: HandlerTable) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn id_generator(mut self, generator: Arc<dyn IdGenerator>) -> Self {
        self.id_generator = generator;
        self
    }

    pub fn failure_checker(mut self, checker: Arc<dyn FailureChecker>) -> Self {
        self.failure_checker = checker;
        self
    }

    /// Use an existing store instead of opening the configured locator.
    pub fn store(mut self, store: Arc<dyn CoordinationStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use an existing mediator instead of building one on a store.
    pub fn mediator(mut self, mediator: Arc<dyn MediatorClient>) -> Self {
        self.mediator = Some(mediator);
        self
    }

    /// Connect, register the decision watcher and initialize root records.
    ///
    /// Any failure here is fatal.
    pub async fn build(self) -> Result<Arc<Coordinator>, CoordinatorError> {
        let url = self.config.validate()?;

        let mediator = match (self.mediator, self.store) {
            (Some(mediator), _) => mediator,
            (None, Some(store)) => StoreMediator::new(store) as Arc<dyn MediatorClient>,
            (None, None) => StoreMediator::new(open_store(&url).await?) as Arc<dyn MediatorClient>,
        };

        let registry = Arc::new(TransactionRegistry::new());
        let dispatcher = Arc::new(RollbackDispatcher::new(
            Arc::downgrade(&mediator),
            Arc::clone(&registry),
            self.handlers,
        ));
        mediator.add_watcher(dispatcher.clone());
        mediator.init().await?;

        let reaper = if self.config.lease.enabled() {
            Some(LeaseReaper::from_config(Arc::clone(&mediator), &self.config.lease).spawn())
        } else {
            None
        };

        info!(
            mediator = %url,
            group = %self.config.group,
            peer = %self.config.peer,
            lease_ttl_secs = self.config.lease.ttl_secs,
            "Transaction coordinator started"
        );

        Ok(Arc::new(Coordinator {
            config: self.config,
            mediator,
            registry,
            dispatcher,
            id_generator: self.id_generator,
            failure_checker: self.failure_checker,
            reaper: Mutex::new(reaper),
        }))
    }
}

/// Process-wide transaction coordinator.
pub struct Coordinator {
    config: TxConfig,
    mediator: Arc<dyn MediatorClient>,
    registry: Arc<TransactionRegistry>,
    dispatcher: Arc<RollbackDispatcher>,
    id_generator: Arc<dyn IdGenerator>,
    failure_checker: Arc<dyn FailureChecker>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    pub fn builder(config: TxConfig) -> CoordinatorBuilder {
        CoordinatorBuilder {
            config,
            handlers: HandlerTable::new(),
            id_generator: Arc::new(UuidGenerator),
            failure_checker: Arc::new(DefaultFailureChecker),
            store: None,
            mediator: None,
        }
    }

    /// Build a coordinator with default policies and no handlers.
    pub async fn connect(config: TxConfig) -> Result<Arc<Self>, CoordinatorError> {
        Self::builder(config).build().await
    }

    /// Start a context for a new root call.
    pub fn context(self: &Arc<Self>) -> TransactionContext {
        TransactionContext::new(Arc::clone(self))
    }

    pub fn group(&self) -> &str {
        &self.config.group
    }

    pub fn peer(&self) -> &str {
        &self.config.peer
    }

    pub fn config(&self) -> &TxConfig {
        &self.config
    }

    pub fn mediator(&self) -> &Arc<dyn MediatorClient> {
        &self.mediator
    }

    pub fn registry(&self) -> &TransactionRegistry {
        &self.registry
    }

    pub(crate) fn dispatcher(&self) -> &RollbackDispatcher {
        &self.dispatcher
    }

    pub(crate) fn id_generator(&self) -> &dyn IdGenerator {
        self.id_generator.as_ref()
    }

    pub(crate) fn failure_checker(&self) -> &dyn FailureChecker {
        self.failure_checker.as_ref()
    }

    /// Stop the lease reaper and release the coordination session.
    pub async fn shutdown(&self) {
        let reaper = self.reaper.lock().ok().and_then(|mut r| r.take());
        if let Some(handle) = reaper {
            handle.abort();
        }
        if !self.registry.is_empty() {
            warn!(
                resident = self.registry.len(),
                "Shutting down with unsettled transactions"
            );
        }
        self.mediator.close().await;
        info!("Transaction coordinator stopped");
    }
}
