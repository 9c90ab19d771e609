//! # Connections Module
//!
//! Persistence of telemetry events: the [`EventStore`] contract and its
//! PostgreSQL and in-memory backends.

/// The persistence contract shared by all backends.
pub mod store;

/// Module for PostgreSQL connection pooling and event persistence.
pub mod db_postgres;

/// Process-local event store.
pub mod memory;

pub use db_postgres::PostgresStore;
pub use memory::MemoryStore;
pub use store::{append_within, DocumentId, EventQuery, EventStore, SortOrder, StoreError, StoredEvent};
