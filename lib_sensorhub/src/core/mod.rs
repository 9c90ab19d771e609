//! # Core Fan-out Engine
//!
//! The ingestion → cache → fan-out heart of the gateway:
//!
//! - **`cache`**: the latest-value cache, holding the most recent event.
//! - **`registry`**: a set of live subscribers of one transport kind, with
//!   per-subscriber bounded queues and self-healing membership.
//! - **`broadcaster`**: writes each event to the cache and pushes it to the
//!   WebSocket and event-stream registries.

/// The latest-value cache.
pub mod cache;
/// Subscriber registries and their subscriptions.
pub mod registry;
/// Cache update plus dual fan-out.
pub mod broadcaster;

// --- Public API Re-exports ---
pub use broadcaster::{Broadcaster, PublishReport};
pub use cache::{CacheEntry, LatestValueCache};
pub use registry::{BroadcastReport, ClientId, ClientKind, ClientRegistry, DeliveryError, Frame, Subscription};
