//! # In-Memory Event Store
//!
//! Keeps the most recent events in process memory. Used when no database is
//! configured or reachable, and as the default store in tests. Once
//! `max_events` are held, each append evicts the oldest one. Contents are
//! lost on exit.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use crate::connections::store::{DocumentId, EventQuery, EventStore, SortOrder, StoreError, StoredEvent};
use crate::model::Event;

/// Retention of [`MemoryStore::new`].
pub const DEFAULT_MAX_EVENTS: usize = 100_000;

#[derive(Debug)]
pub struct MemoryStore {
    events: RwLock<VecDeque<StoredEvent>>,
    next_id: AtomicU64,
    max_events: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_max_events(DEFAULT_MAX_EVENTS)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store holding at most `max_events` (minimum 1), in append order.
    pub fn with_max_events(max_events: usize) -> Self {
        Self {
            events: RwLock::new(VecDeque::new()),
            next_id: AtomicU64::new(0),
            max_events: max_events.max(1),
        }
    }

    pub fn max_events(&self) -> usize {
        self.max_events
    }

    pub fn len(&self) -> usize {
        self.events.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn append(&self, event: &Event) -> Result<DocumentId, StoreError> {
        let id = DocumentId((self.next_id.fetch_add(1, Ordering::Relaxed) + 1).to_string());
        let mut events = self.events.write().unwrap_or_else(PoisonError::into_inner);
        while events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back(StoredEvent {
            id: id.clone(),
            event: event.clone(),
        });
        Ok(id)
    }

    async fn query(&self, query: &EventQuery) -> Result<Vec<StoredEvent>, StoreError> {
        let mut matched: Vec<StoredEvent> = self
            .events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|stored| query.since.map_or(true, |since| stored.event.timestamp() >= since))
            .cloned()
            .collect();

        // stable sort keeps insertion order between equal timestamps
        matched.sort_by_key(|stored| stored.event.timestamp());
        if query.order == SortOrder::Desc {
            matched.reverse();
        }
        if let Some(limit) = query.limit {
            matched.truncate(limit as usize);
        }
        Ok(matched)
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldValue, SensorFields};
    use chrono::{DateTime, TimeZone, Utc};

    fn event_at(temp: i64, minute: u32) -> Event {
        let mut fields = SensorFields::new();
        fields.insert("temp".to_string(), FieldValue::from(temp));
        let at: DateTime<Utc> = Utc.with_ymd_and_hms(2025, 1, 1, 10, minute, 0).unwrap();
        Event::stamp_at(fields, at).unwrap()
    }

    fn temps(events: &[StoredEvent]) -> Vec<FieldValue> {
        events.iter().map(|s| s.event.get("temp").unwrap().clone()).collect()
    }

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        // appended out of timestamp order on purpose
        for (temp, minute) in [(2, 20), (1, 10), (3, 30)] {
            store.append(&event_at(temp, minute)).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn append_assigns_distinct_ids() {
        let store = MemoryStore::new();
        let a = store.append(&event_at(1, 0)).await.unwrap();
        let b = store.append(&event_at(2, 0)).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn full_store_evicts_the_oldest_events() {
        let store = MemoryStore::with_max_events(3);
        for temp in 0..5 {
            store.append(&event_at(temp, temp as u32)).await.unwrap();
        }

        assert_eq!(store.len(), 3);
        let kept = store.query(&EventQuery::default()).await.unwrap();
        assert_eq!(temps(&kept), vec![FieldValue::from(4_i64), FieldValue::from(3_i64), FieldValue::from(2_i64)]);
        // ids keep counting across evictions
        assert_eq!(kept[0].id, DocumentId("5".to_string()));
    }

    #[tokio::test]
    async fn default_query_is_newest_first() {
        let store = seeded().await;
        let all = store.query(&EventQuery::default()).await.unwrap();
        assert_eq!(temps(&all), vec![FieldValue::from(3_i64), FieldValue::from(2_i64), FieldValue::from(1_i64)]);
    }

    #[tokio::test]
    async fn since_order_and_limit_combine() {
        let store = seeded().await;
        let query = EventQuery {
            since: Some(Utc.with_ymd_and_hms(2025, 1, 1, 10, 20, 0).unwrap()),
            order: SortOrder::Asc,
            limit: Some(1),
        };
        let rows = store.query(&query).await.unwrap();
        assert_eq!(temps(&rows), vec![FieldValue::from(2_i64)]);
    }
}
