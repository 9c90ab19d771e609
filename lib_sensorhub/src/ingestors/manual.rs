//! # Manual Submission
//!
//! Accepts a reading typed in by an operator rather than published on the
//! bus. Unlike bus ingestion this path is strict: the three sensor fields
//! must all be present, and the event is only cached and broadcast once it
//! has been persisted.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::{error, info};

use crate::connections::store::{append_within, EventStore, StoreError};
use crate::core::Broadcaster;
use crate::ingestors::pipeline::IngestReceipt;
use crate::model::event::{Event, FieldValue, SensorFields};

/// Fields a manual submission must carry. Any other member is ignored.
pub const REQUIRED_MANUAL_FIELDS: [&str; 3] = ["jarak_cm", "gerakan", "mq2"];

#[derive(Debug, Clone, Error)]
pub enum ManualSubmitError {
    #[error("request body must be a JSON object: {0}")]
    InvalidBody(String),

    #[error("missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<String>),

    #[error("failed to persist manual reading: {0}")]
    Persistence(#[from] StoreError),
}

impl ManualSubmitError {
    /// `true` for problems with the submitted data, as opposed to the store.
    pub fn is_validation(&self) -> bool {
        !matches!(self, Self::Persistence(_))
    }
}

/// # Manual Submit
pub struct ManualSubmit {
    store: Arc<dyn EventStore>,
    broadcaster: Arc<Broadcaster>,
    persist_timeout: Duration,
}

impl ManualSubmit {
    pub fn new(store: Arc<dyn EventStore>, broadcaster: Arc<Broadcaster>, persist_timeout: Duration) -> Self {
        Self {
            store,
            broadcaster,
            persist_timeout,
        }
    }

    /// Validates, stamps, persists and publishes one submitted reading.
    ///
    /// On any error nothing is cached or broadcast.
    pub async fn submit(&self, body: &[u8]) -> Result<IngestReceipt, ManualSubmitError> {
        let fields = required_fields(body)?;
        let event = Arc::new(Event::stamp(fields).map_err(|e| ManualSubmitError::InvalidBody(e.to_string()))?);

        let document_id = append_within(self.store.as_ref(), &event, self.persist_timeout)
            .await
            .inspect_err(|e| {
                error!(backend = self.store.backend(), error = %e, "Failed to store manual reading");
            })?;

        let report = self.broadcaster.publish(Arc::clone(&event));
        info!(
            id = %document_id,
            sequence = report.sequence,
            websocket = report.push.delivered,
            sse = report.stream.delivered,
            "Manual reading stored and broadcasted"
        );

        Ok(IngestReceipt {
            event,
            document_id: Some(document_id),
            sequence: report.sequence,
        })
    }
}

/// Picks exactly the required fields out of `body`. A field that is absent,
/// `null` or not a scalar counts as missing.
fn required_fields(body: &[u8]) -> Result<SensorFields, ManualSubmitError> {
    let value: Value = serde_json::from_slice(body).map_err(|e| ManualSubmitError::InvalidBody(e.to_string()))?;
    let Value::Object(map) = value else {
        return Err(ManualSubmitError::InvalidBody("expected an object".to_string()));
    };

    let mut fields = SensorFields::new();
    let mut missing = Vec::new();
    for key in REQUIRED_MANUAL_FIELDS {
        match map.get(key).and_then(FieldValue::from_json) {
            Some(value) => {
                fields.insert(key.to_string(), value);
            }
            None => missing.push(key.to_string()),
        }
    }

    if missing.is_empty() {
        Ok(fields)
    } else {
        Err(ManualSubmitError::MissingFields(missing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::memory::MemoryStore;
    use crate::connections::store::{DocumentId, EventQuery, StoredEvent};
    use async_trait::async_trait;

    struct RejectingStore;

    #[async_trait]
    impl EventStore for RejectingStore {
        async fn append(&self, _event: &Event) -> Result<DocumentId, StoreError> {
            Err(StoreError::Query("disk full".to_string()))
        }

        async fn query(&self, _query: &EventQuery) -> Result<Vec<StoredEvent>, StoreError> {
            Ok(Vec::new())
        }

        fn backend(&self) -> &'static str {
            "rejecting"
        }
    }

    fn submitter(store: Arc<dyn EventStore>) -> (Arc<Broadcaster>, ManualSubmit) {
        let broadcaster = Arc::new(Broadcaster::new(8));
        let manual = ManualSubmit::new(store, Arc::clone(&broadcaster), Duration::from_secs(1));
        (broadcaster, manual)
    }

    #[tokio::test]
    async fn complete_submission_is_stored_then_broadcast() {
        let store = Arc::new(MemoryStore::new());
        let (broadcaster, manual) = submitter(store.clone());
        let mut ws = broadcaster.push_registry().register();

        let receipt = manual
            .submit(br#"{"jarak_cm":42,"gerakan":true,"mq2":310.5,"extra":"ignored","timestamp":"x"}"#)
            .await
            .unwrap();

        assert_eq!(receipt.document_id, Some(DocumentId("1".to_string())));
        assert_eq!(receipt.event.fields().len(), 3);
        assert!(receipt.event.get("extra").is_none());
        assert_eq!(store.len(), 1);
        assert_eq!(broadcaster.latest().as_deref(), Some(&*receipt.event));
        assert_eq!(ws.try_recv().as_deref(), Some(receipt.event.encode().as_str()));
    }

    #[tokio::test]
    async fn missing_or_null_fields_are_rejected() {
        let store = Arc::new(MemoryStore::new());
        let (broadcaster, manual) = submitter(store.clone());

        let err = manual.submit(br#"{"jarak_cm":42,"gerakan":null}"#).await.unwrap_err();
        match &err {
            ManualSubmitError::MissingFields(missing) => assert_eq!(missing, &["gerakan", "mq2"]),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.is_validation());
        assert!(store.is_empty());
        assert!(broadcaster.latest().is_none());
    }

    #[tokio::test]
    async fn non_object_bodies_are_rejected() {
        let (_broadcaster, manual) = submitter(Arc::new(MemoryStore::new()));
        for body in [&b"not json"[..], b"[1,2,3]", b"42"] {
            let err = manual.submit(body).await.unwrap_err();
            assert!(matches!(err, ManualSubmitError::InvalidBody(_)), "{err:?}");
        }
    }

    #[tokio::test]
    async fn persistence_failure_blocks_cache_and_broadcast() {
        let (broadcaster, manual) = submitter(Arc::new(RejectingStore));
        let mut sse = broadcaster.stream_registry().register();

        let err = manual
            .submit(br#"{"jarak_cm":1,"gerakan":false,"mq2":2}"#)
            .await
            .unwrap_err();

        assert!(matches!(err, ManualSubmitError::Persistence(StoreError::Query(_))));
        assert!(!err.is_validation());
        assert!(broadcaster.latest().is_none());
        assert!(sse.try_recv().is_none());
    }

    #[test]
    fn text_values_are_accepted() {
        let fields = required_fields(br#"{"jarak_cm":"12","gerakan":"ya","mq2":0}"#).unwrap();
        assert_eq!(fields["gerakan"], FieldValue::from("ya"));
    }
}
