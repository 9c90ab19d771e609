//! # Ingestion Pipeline
//!
//! Turns raw bus messages into published events. Each message walks the same
//! path:
//!
//! 1. **parse**: the payload must be a JSON object with at least one scalar
//!    field; anything else is logged and dropped.
//! 2. **stamp**: the receipt time becomes the event timestamp.
//! 3. **persist**: appended to the event store, bounded by a timeout. A
//!    failure here is logged and the event still goes out.
//! 4. **publish**: handed to the [`Broadcaster`].
//!
//! A bad message never stops the loop; the pipeline simply waits for the
//! next one.
//!
//! ## Degraded store
//!
//! While the store answers, each event is published only after its write
//! returns. Once a write times out the pipeline stops waiting: later events
//! are published immediately and their writes run as background tasks, at
//! most `max_pending_writes` at a time. Events arriving while that many
//! writes are outstanding are not persisted. The first background write that
//! succeeds puts the pipeline back into write-then-publish mode.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::connections::store::{append_within, DocumentId, EventStore, StoreError};
use crate::core::Broadcaster;
use crate::model::event::{fields_from_payload, Event, EventError};

/// One message as delivered by the bus client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Why a bus message was dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IngestError {
    #[error("malformed payload on topic '{topic}': {reason}")]
    MalformedPayload { topic: String, reason: EventError },
}

/// What became of an accepted event.
#[derive(Debug, Clone)]
pub struct IngestReceipt {
    pub event: Arc<Event>,
    /// Store id, or `None` when persistence failed or was left to run in the
    /// background while the store is degraded.
    pub document_id: Option<DocumentId>,
    /// Position in publish order.
    pub sequence: u64,
}

/// Background writes allowed at once while the store is degraded.
pub const DEFAULT_MAX_PENDING_WRITES: usize = 256;

/// # Ingestion Pipeline
pub struct IngestionPipeline {
    store: Arc<dyn EventStore>,
    broadcaster: Arc<Broadcaster>,
    persist_timeout: Duration,
    pending_writes: Arc<Semaphore>,
    degraded: Arc<AtomicBool>,
}

impl IngestionPipeline {
    pub fn new(store: Arc<dyn EventStore>, broadcaster: Arc<Broadcaster>, persist_timeout: Duration) -> Self {
        Self {
            store,
            broadcaster,
            persist_timeout,
            pending_writes: Arc::new(Semaphore::new(DEFAULT_MAX_PENDING_WRITES)),
            degraded: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Caps the background writes kept in flight while the store is
    /// degraded (minimum 1).
    pub fn with_max_pending_writes(mut self, max: usize) -> Self {
        self.pending_writes = Arc::new(Semaphore::new(max.max(1)));
        self
    }

    /// Whether a write timed out and no background write has succeeded since.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// Processes one bus message from parse to publish.
    pub async fn handle_message(&self, message: &BusMessage) -> Result<IngestReceipt, IngestError> {
        let malformed = |reason: EventError| IngestError::MalformedPayload {
            topic: message.topic.clone(),
            reason,
        };

        let fields = fields_from_payload(&message.payload).map_err(malformed)?;
        let event = Arc::new(Event::stamp(fields).map_err(malformed)?);

        let document_id = if self.is_degraded() {
            self.persist_in_background(&event, &message.topic);
            None
        } else {
            self.persist(&event, &message.topic).await
        };

        let report = self.broadcaster.publish(Arc::clone(&event));
        info!(
            topic = %message.topic,
            sequence = report.sequence,
            websocket = report.push.delivered,
            sse = report.stream.delivered,
            persisted = document_id.is_some(),
            "MQTT message broadcasted"
        );

        Ok(IngestReceipt {
            event,
            document_id,
            sequence: report.sequence,
        })
    }

    async fn persist(&self, event: &Event, topic: &str) -> Option<DocumentId> {
        match append_within(self.store.as_ref(), event, self.persist_timeout).await {
            Ok(id) => Some(id),
            Err(e) => {
                error!(
                    topic,
                    backend = self.store.backend(),
                    error = %e,
                    "Persisting bus event failed; broadcasting anyway"
                );
                if matches!(e, StoreError::Timeout(_)) && !self.degraded.swap(true, Ordering::AcqRel) {
                    warn!(backend = self.store.backend(), "Event store is stalling; writes continue in the background");
                }
                None
            }
        }
    }

    fn persist_in_background(&self, event: &Arc<Event>, topic: &str) {
        let Ok(permit) = Arc::clone(&self.pending_writes).try_acquire_owned() else {
            warn!(topic, backend = self.store.backend(), "Too many pending writes; event not persisted");
            return;
        };
        let store = Arc::clone(&self.store);
        let degraded = Arc::clone(&self.degraded);
        let event = Arc::clone(event);
        let topic = topic.to_owned();
        let limit = self.persist_timeout;

        tokio::spawn(async move {
            let _permit = permit;
            match append_within(store.as_ref(), &event, limit).await {
                Ok(_) => {
                    if degraded.swap(false, Ordering::AcqRel) {
                        info!(backend = store.backend(), "Event store is answering again");
                    }
                }
                Err(e) => error!(
                    topic = %topic,
                    backend = store.backend(),
                    error = %e,
                    "Background write of bus event failed"
                ),
            }
        });
    }

    /// Consumes bus messages until the channel closes or `cancel` fires.
    pub async fn run(self, mut messages: mpsc::Receiver<BusMessage>, cancel: CancellationToken) {
        info!(backend = self.store.backend(), "Ingestion pipeline started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Ingestion pipeline received shutdown signal.");
                    break;
                }
                next = messages.recv() => {
                    let Some(message) = next else {
                        info!("Bus channel closed; ingestion pipeline stopping.");
                        break;
                    };
                    if let Err(e) = self.handle_message(&message).await {
                        warn!(payload = %preview(&message.payload), error = %e, "Dropping bus message");
                    }
                }
            }
        }
    }
}

/// Lossy, length-capped rendering of a payload for logs.
fn preview(payload: &[u8]) -> String {
    const MAX: usize = 200;
    let text = String::from_utf8_lossy(payload);
    if text.chars().count() > MAX {
        let cut: String = text.chars().take(MAX).collect();
        format!("{cut}...")
    } else {
        text.into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::memory::MemoryStore;
    use crate::connections::store::{EventQuery, StoreError, StoredEvent};
    use crate::model::FieldValue;
    use async_trait::async_trait;

    struct BrokenStore;

    #[async_trait]
    impl EventStore for BrokenStore {
        async fn append(&self, _event: &Event) -> Result<DocumentId, StoreError> {
            Err(StoreError::Unavailable("database down".to_string()))
        }

        async fn query(&self, _query: &EventQuery) -> Result<Vec<StoredEvent>, StoreError> {
            Err(StoreError::Unavailable("database down".to_string()))
        }

        fn backend(&self) -> &'static str {
            "broken"
        }
    }

    struct StalledStore;

    #[async_trait]
    impl EventStore for StalledStore {
        async fn append(&self, _event: &Event) -> Result<DocumentId, StoreError> {
            std::future::pending().await
        }

        async fn query(&self, _query: &EventQuery) -> Result<Vec<StoredEvent>, StoreError> {
            std::future::pending().await
        }

        fn backend(&self) -> &'static str {
            "stalled"
        }
    }

    /// Hangs while `stalled` is set, then behaves like a memory store.
    #[derive(Default)]
    struct FlakyStore {
        stalled: AtomicBool,
        inner: MemoryStore,
    }

    #[async_trait]
    impl EventStore for FlakyStore {
        async fn append(&self, event: &Event) -> Result<DocumentId, StoreError> {
            if self.stalled.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            self.inner.append(event).await
        }

        async fn query(&self, query: &EventQuery) -> Result<Vec<StoredEvent>, StoreError> {
            self.inner.query(query).await
        }

        fn backend(&self) -> &'static str {
            "flaky"
        }
    }

    fn pipeline(store: Arc<dyn EventStore>) -> (Arc<Broadcaster>, IngestionPipeline) {
        let broadcaster = Arc::new(Broadcaster::new(16));
        let pipeline = IngestionPipeline::new(store, Arc::clone(&broadcaster), Duration::from_millis(50));
        (broadcaster, pipeline)
    }

    #[tokio::test]
    async fn valid_message_is_persisted_cached_and_broadcast() {
        let store = Arc::new(MemoryStore::new());
        let (broadcaster, pipeline) = pipeline(store.clone());
        let mut sub = broadcaster.stream_registry().register();

        let receipt = pipeline
            .handle_message(&BusMessage::new("sensor/data", r#"{"temp":22.5}"#))
            .await
            .unwrap();

        assert!(receipt.document_id.is_some());
        assert_eq!(store.len(), 1);
        assert_eq!(broadcaster.latest().as_deref(), Some(&*receipt.event));
        assert_eq!(sub.try_recv().as_deref(), Some(receipt.event.encode().as_str()));
        assert!(receipt.event.get("temp").is_some());
    }

    #[tokio::test]
    async fn malformed_message_touches_nothing() {
        let store = Arc::new(MemoryStore::new());
        let (broadcaster, pipeline) = pipeline(store.clone());
        let mut sub = broadcaster.push_registry().register();

        let err = pipeline
            .handle_message(&BusMessage::new("sensor/data", "not json"))
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::MalformedPayload { .. }));
        assert!(store.is_empty());
        assert!(broadcaster.latest().is_none());
        assert!(sub.try_recv().is_none());

        // the next valid message goes through normally
        let receipt = pipeline
            .handle_message(&BusMessage::new("sensor/data", r#"{"mq2":300}"#))
            .await
            .unwrap();
        assert_eq!(receipt.sequence, 1);
        assert_eq!(receipt.event.get("mq2"), Some(&FieldValue::from(300_i64)));
    }

    #[tokio::test]
    async fn persistence_failure_still_broadcasts() {
        let (broadcaster, pipeline) = pipeline(Arc::new(BrokenStore));
        let mut ws = broadcaster.push_registry().register();
        let mut sse = broadcaster.stream_registry().register();

        let receipt = pipeline
            .handle_message(&BusMessage::new("sensor/data", r#"{"gerakan":true}"#))
            .await
            .unwrap();

        assert!(receipt.document_id.is_none());
        assert!(broadcaster.latest().is_some());
        assert!(ws.try_recv().is_some());
        assert!(sse.try_recv().is_some());
    }

    #[tokio::test]
    async fn stalled_store_is_bounded_by_timeout() {
        let (broadcaster, pipeline) = pipeline(Arc::new(StalledStore));
        let receipt = pipeline
            .handle_message(&BusMessage::new("sensor/data", r#"{"temp":1}"#))
            .await
            .unwrap();

        assert!(receipt.document_id.is_none());
        assert!(broadcaster.latest().is_some());
    }

    #[tokio::test]
    async fn hung_store_does_not_delay_later_events() {
        let broadcaster = Arc::new(Broadcaster::new(64));
        let timeout = Duration::from_millis(100);
        let pipeline = IngestionPipeline::new(Arc::new(StalledStore), Arc::clone(&broadcaster), timeout);
        let mut sub = broadcaster.push_registry().register();
        let (tx, rx) = mpsc::channel(32);
        for temp in 0..20 {
            tx.send(BusMessage::new("sensor/data", format!(r#"{{"temp":{temp}}}"#)))
                .await
                .unwrap();
        }

        let started = tokio::time::Instant::now();
        let task = tokio::spawn(pipeline.run(rx, CancellationToken::new()));
        for _ in 0..20 {
            tokio::time::timeout(Duration::from_secs(5), sub.recv()).await.unwrap().unwrap();
        }
        let elapsed = started.elapsed();

        // only the first write is waited for
        assert!(elapsed < timeout * 5, "20 events took {elapsed:?}");
        drop(tx);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn pending_writes_are_capped_while_degraded() {
        let store = Arc::new(FlakyStore::default());
        store.stalled.store(true, Ordering::SeqCst);
        let (broadcaster, pipeline) = pipeline(store.clone());
        let pipeline = pipeline.with_max_pending_writes(1);
        let mut sub = broadcaster.stream_registry().register();

        for temp in 0..4 {
            let receipt = pipeline
                .handle_message(&BusMessage::new("sensor/data", format!(r#"{{"temp":{temp}}}"#)))
                .await
                .unwrap();
            assert!(receipt.document_id.is_none());
        }

        assert!(pipeline.is_degraded());
        assert_eq!(pipeline.pending_writes.available_permits(), 0);
        for _ in 0..4 {
            assert!(sub.try_recv().is_some());
        }
    }

    #[tokio::test]
    async fn recovered_store_ends_degraded_mode() {
        let store = Arc::new(FlakyStore::default());
        store.stalled.store(true, Ordering::SeqCst);
        let (_broadcaster, pipeline) = pipeline(store.clone());

        let first = pipeline.handle_message(&BusMessage::new("t", r#"{"a":1}"#)).await.unwrap();
        assert!(first.document_id.is_none());
        assert!(pipeline.is_degraded());

        store.stalled.store(false, Ordering::SeqCst);
        pipeline.handle_message(&BusMessage::new("t", r#"{"a":2}"#)).await.unwrap();
        for _ in 0..500 {
            if !pipeline.is_degraded() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!pipeline.is_degraded());
        assert_eq!(store.inner.len(), 1);

        let third = pipeline.handle_message(&BusMessage::new("t", r#"{"a":3}"#)).await.unwrap();
        assert!(third.document_id.is_some());
        assert_eq!(store.inner.len(), 2);
    }

    #[tokio::test]
    async fn run_consumes_until_channel_closes() {
        let store = Arc::new(MemoryStore::new());
        let (broadcaster, pipeline) = pipeline(store.clone());
        let (tx, rx) = mpsc::channel(8);

        let task = tokio::spawn(pipeline.run(rx, CancellationToken::new()));
        tx.send(BusMessage::new("t", r#"{"a":1}"#)).await.unwrap();
        tx.send(BusMessage::new("t", "[]")).await.unwrap();
        tx.send(BusMessage::new("t", r#"{"a":2}"#)).await.unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(broadcaster.cache().entry().unwrap().sequence, 2);
        assert_eq!(broadcaster.latest().unwrap().get("a"), Some(&FieldValue::from(2_i64)));
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let (_broadcaster, pipeline) = pipeline(Arc::new(MemoryStore::new()));
        let (_tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(pipeline.run(rx, cancel.clone()));
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    #[test]
    fn preview_caps_long_payloads() {
        let long = vec![b'x'; 500];
        assert_eq!(preview(&long).len(), 203);
        assert_eq!(preview(b"short"), "short");
    }
}
