//! Fixtures shared by the end-to-end scenario tests in `tests/`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lib_sensorhub::connections::{DocumentId, EventQuery, EventStore, MemoryStore, StoreError, StoredEvent};
use lib_sensorhub::core::{Broadcaster, Subscription};
use lib_sensorhub::ingestors::{BusMessage, IngestionPipeline, ManualSubmit};
use lib_sensorhub::model::event::fields_from_object;
use lib_sensorhub::model::Event;
use serde_json::Value;

/// An in-memory store that counts append attempts and can be switched into
/// failing mode.
#[derive(Default)]
pub struct SwitchableStore {
    inner: MemoryStore,
    failing: AtomicBool,
    append_calls: AtomicUsize,
}

impl SwitchableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Every call to `append`, successful or not.
    pub fn append_calls(&self) -> usize {
        self.append_calls.load(Ordering::SeqCst)
    }

    pub fn stored(&self) -> usize {
        self.inner.len()
    }
}

#[async_trait]
impl EventStore for SwitchableStore {
    async fn append(&self, event: &Event) -> Result<DocumentId, StoreError> {
        self.append_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("switched off".to_string()));
        }
        self.inner.append(event).await
    }

    async fn query(&self, query: &EventQuery) -> Result<Vec<StoredEvent>, StoreError> {
        self.inner.query(query).await
    }

    fn backend(&self) -> &'static str {
        "switchable"
    }
}

/// Everything the ingestion side needs, wired to one store and broadcaster.
pub struct Harness {
    pub store: Arc<SwitchableStore>,
    pub broadcaster: Arc<Broadcaster>,
    pub pipeline: IngestionPipeline,
    pub manual: ManualSubmit,
}

impl Harness {
    pub fn new(subscriber_queue: usize) -> Self {
        let store = Arc::new(SwitchableStore::new());
        let broadcaster = Arc::new(Broadcaster::new(subscriber_queue));
        let timeout = Duration::from_secs(1);
        Self {
            pipeline: IngestionPipeline::new(store.clone(), Arc::clone(&broadcaster), timeout),
            manual: ManualSubmit::new(store.clone(), Arc::clone(&broadcaster), timeout),
            store,
            broadcaster,
        }
    }
}

/// A bus message on the default telemetry topic.
pub fn bus_message(payload: &str) -> BusMessage {
    BusMessage::new("sensor/data", payload.to_string())
}

/// Builds a stamped event from a JSON object literal.
///
/// # Panics
/// If `value` is not an object with at least one scalar member.
pub fn event_from(value: Value) -> Arc<Event> {
    let Value::Object(map) = value else {
        panic!("fixture events must be JSON objects");
    };
    Arc::new(Event::stamp(fields_from_object(&map)).expect("fixture event has no fields"))
}

/// Takes every frame currently queued for `subscription`, decoded as JSON.
pub fn drain(subscription: &mut Subscription) -> Vec<Value> {
    std::iter::from_fn(|| subscription.try_recv())
        .map(|frame| serde_json::from_str(&frame).expect("frames are JSON"))
        .collect()
}
