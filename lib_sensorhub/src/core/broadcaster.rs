//! # Broadcaster
//!
//! The single entry point through which a stamped event becomes visible:
//! it is written to the latest-value cache and then pushed to the WebSocket
//! and event-stream registries.
//!
//! Publishes are serialized, so all subscribers observe events in the order
//! the broadcaster received them, whether they came from the bus or from a
//! manual submission.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::core::cache::{CacheEntry, LatestValueCache};
use crate::core::registry::{BroadcastReport, ClientKind, ClientRegistry};
use crate::model::Event;

/// Result of one publish across both registries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReport {
    /// Position of the event in publish order.
    pub sequence: u64,
    pub push: BroadcastReport,
    pub stream: BroadcastReport,
}

/// # Broadcaster
///
/// Owns the process-wide cache and both registries. Handlers that need to
/// register subscribers or read the cache reach them through this type.
pub struct Broadcaster {
    cache: Arc<LatestValueCache>,
    push: ClientRegistry,
    stream: ClientRegistry,
    publish_lock: Mutex<()>,
}

impl Broadcaster {
    /// Builds an empty cache and two registries with the given per-subscriber
    /// queue depth.
    pub fn new(subscriber_queue: usize) -> Self {
        let cache = Arc::new(LatestValueCache::new());
        Self {
            push: ClientRegistry::new(ClientKind::PushSocket, Arc::clone(&cache), subscriber_queue),
            stream: ClientRegistry::new(ClientKind::Stream, Arc::clone(&cache), subscriber_queue),
            cache,
            publish_lock: Mutex::new(()),
        }
    }

    /// # Publish
    ///
    /// Writes `event` to the cache, then fans it out to the push-socket and
    /// stream registries. Never fails: delivery problems stay inside the
    /// registries, which drop the affected subscribers.
    pub fn publish(&self, event: Arc<Event>) -> PublishReport {
        let _serialized = self.publish_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let entry: CacheEntry = self.cache.set(event);
        let push = self.push.broadcast(&entry);
        let stream = self.stream.broadcast(&entry);
        debug!(
            sequence = entry.sequence,
            websocket = push.delivered,
            sse = stream.delivered,
            "Event published"
        );
        PublishReport {
            sequence: entry.sequence,
            push,
            stream,
        }
    }

    pub fn cache(&self) -> &LatestValueCache {
        &self.cache
    }

    /// The current cached event, `None` before the first publish.
    pub fn latest(&self) -> Option<Arc<Event>> {
        self.cache.get()
    }

    pub fn push_registry(&self) -> &ClientRegistry {
        &self.push
    }

    pub fn stream_registry(&self) -> &ClientRegistry {
        &self.stream
    }

    /// Closes both registries, ending every open subscription.
    pub fn shutdown(&self) {
        self.push.close_all();
        self.stream.close_all();
    }
}
