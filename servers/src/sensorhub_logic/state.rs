use crate::sensorhub_logic::config::Config;
use lib_sensorhub::connections::{EventStore, MemoryStore, PostgresStore};
use lib_sensorhub::core::Broadcaster;
use lib_sensorhub::ingestors::{BusStatus, IngestionPipeline, ManualSubmit};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Shared handles for every request handler and background task.
#[derive(Clone)]
pub struct AppState {
    pub broadcaster: Arc<Broadcaster>,
    pub store: Arc<dyn EventStore>,
    pub manual: Arc<ManualSubmit>,
    pub bus_status: BusStatus,
    // Reported by the status endpoint.
    pub broker: Arc<str>,
    pub topic: Arc<str>,
    pub persist_timeout: Duration,
    pub max_pending_writes: usize,
    pub sse_keep_alive: Duration,
}

impl AppState {
    pub fn new(config: &Config, store: Arc<dyn EventStore>) -> Self {
        let broadcaster = Arc::new(Broadcaster::new(config.subscriber_queue));
        let manual = Arc::new(ManualSubmit::new(
            Arc::clone(&store),
            Arc::clone(&broadcaster),
            config.persist_timeout(),
        ));
        Self {
            broadcaster,
            store,
            manual,
            bus_status: BusStatus::new(),
            broker: Arc::from(config.mqtt_broker.as_str()),
            topic: Arc::from(config.mqtt_topic.as_str()),
            persist_timeout: config.persist_timeout(),
            max_pending_writes: config.max_pending_writes,
            sse_keep_alive: config.sse_keep_alive(),
        }
    }

    /// A pipeline feeding the same store and broadcaster as the HTTP side.
    pub fn pipeline(&self) -> IngestionPipeline {
        IngestionPipeline::new(Arc::clone(&self.store), Arc::clone(&self.broadcaster), self.persist_timeout)
            .with_max_pending_writes(self.max_pending_writes)
    }
}

/// Connects to PostgreSQL when a database URL is configured, otherwise (or
/// when the connection fails) keeps events in memory.
pub async fn open_store(config: &Config) -> Arc<dyn EventStore> {
    let Some(url) = config.database_url.as_deref() else {
        warn!(
            max_events = config.memory_store_max_events,
            "DATABASE_URL not set; events are kept in memory and lost on restart"
        );
        return Arc::new(MemoryStore::with_max_events(config.memory_store_max_events));
    };

    match PostgresStore::connect(url, config.db_pool_size).await {
        Ok(store) => {
            info!(pool_size = config.db_pool_size, "Connected to PostgreSQL");
            Arc::new(store)
        }
        Err(e) => {
            error!(error = %e, "PostgreSQL connection error; falling back to the in-memory store");
            Arc::new(MemoryStore::with_max_events(config.memory_store_max_events))
        }
    }
}
