//! Backend factory for interface tests.

use std::env;
use std::sync::Arc;

use txchain::store::{CoordinationStore, MemoryStore};

/// Coordination store backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Nats,
}

impl StoreBackend {
    pub fn from_env() -> Self {
        match env::var("STORE_BACKEND")
            .unwrap_or_else(|_| "memory".to_string())
            .to_lowercase()
            .as_str()
        {
            "nats" => StoreBackend::Nats,
            _ => StoreBackend::Memory,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StoreBackend::Memory => "memory",
            StoreBackend::Nats => "nats",
        }
    }
}

/// Holds the store under test.
pub struct StoreContext {
    pub store: Arc<dyn CoordinationStore>,
}

impl std::fmt::Debug for StoreContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreContext")
            .field("store", &"<dyn CoordinationStore>")
            .finish()
    }
}

impl StoreContext {
    /// Create a store for the configured backend.
    pub async fn new(backend: StoreBackend) -> Self {
        match backend {
            StoreBackend::Memory => StoreContext {
                store: Arc::new(MemoryStore::new()),
            },
            StoreBackend::Nats => Self::create_nats().await,
        }
    }

    #[cfg(feature = "nats")]
    async fn create_nats() -> Self {
        use txchain::config::MediatorUrl;
        use txchain::store::NatsKvStore;

        let server = env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string());
        // One bucket per scenario keeps scenarios independent.
        let bucket = format!("iface-{}", uuid::Uuid::new_v4().simple());
        let url = MediatorUrl::parse(&format!("{}?bucket={}", server, bucket))
            .expect("Invalid NATS_URL");
        let store: Arc<dyn CoordinationStore> = NatsKvStore::connect(&url)
            .await
            .expect("Failed to connect to NATS");

        StoreContext { store }
    }

    #[cfg(not(feature = "nats"))]
    async fn create_nats() -> Self {
        panic!("NATS feature not enabled. Build with --features nats");
    }
}
