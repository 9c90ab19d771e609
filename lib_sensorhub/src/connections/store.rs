//! # Event Store Contract
//!
//! The persistence boundary of the gateway: an append-only store of events,
//! queryable by time range and ordered by `timestamp`. Backends live next to
//! this module (`db_postgres`, `memory`).

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::Event;

/// Identifier assigned by the store to a persisted event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(pub String);

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ordering of query results by event timestamp.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    /// Newest first.
    #[default]
    Desc,
}

impl SortOrder {
    /// `"asc"` selects ascending order; anything else, including nothing,
    /// is descending.
    pub fn parse_lenient(raw: Option<&str>) -> Self {
        match raw {
            Some(value) if value.eq_ignore_ascii_case("asc") => SortOrder::Asc,
            _ => SortOrder::Desc,
        }
    }

    pub fn as_sql(self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// # Event Query
///
/// Filters for reading back persisted events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventQuery {
    /// Only events stamped at or after this instant.
    pub since: Option<DateTime<Utc>>,
    pub order: SortOrder,
    pub limit: Option<u32>,
}

impl EventQuery {
    /// Builds a query from raw request parameters. Unparsable `since` or
    /// `limit` values are ignored rather than rejected.
    pub fn from_params(since: Option<&str>, order: Option<&str>, limit: Option<&str>) -> Self {
        Self {
            since: since.and_then(parse_since),
            order: SortOrder::parse_lenient(order),
            limit: limit.and_then(|raw| raw.trim().parse::<u32>().ok()),
        }
    }
}

/// Accepts an RFC 3339 instant or a bare `YYYY-MM-DD` date (UTC midnight).
pub fn parse_since(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(instant) = DateTime::parse_from_rfc3339(raw) {
        return Some(instant.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|midnight| midnight.and_utc())
}

/// A persisted event with its store id; serializes flat as
/// `{ "id": ..., <fields>, "timestamp": ... }`. Events never carry an `id`
/// field of their own, so the key is unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub id: DocumentId,
    #[serde(flatten)]
    pub event: Event,
}

/// Failures of the persistence layer.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Failed to get a connection from the pool: {0}")]
    Pool(String),

    #[error("Query execution failed: {0}")]
    Query(String),

    #[error("Stored record could not be decoded: {0}")]
    Decode(String),

    #[error("Store did not answer within {0:?}")]
    Timeout(Duration),

    #[error("Store is unavailable: {0}")]
    Unavailable(String),
}

/// # Event Store
///
/// Implemented by every persistence backend. Shared as `Arc<dyn EventStore>`.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends one event and returns its new id.
    async fn append(&self, event: &Event) -> Result<DocumentId, StoreError>;

    /// Reads events matching `query`, ordered by timestamp.
    async fn query(&self, query: &EventQuery) -> Result<Vec<StoredEvent>, StoreError>;

    /// Short backend name for logs.
    fn backend(&self) -> &'static str;
}

/// Appends with an upper bound on how long the caller waits.
pub async fn append_within(
    store: &dyn EventStore,
    event: &Event,
    limit: Duration,
) -> Result<DocumentId, StoreError> {
    tokio::time::timeout(limit, store.append(event))
        .await
        .map_err(|_| StoreError::Timeout(limit))?
}
