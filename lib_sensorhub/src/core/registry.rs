//! # Client Registry
//!
//! Tracks the live subscribers of one transport kind (WebSocket push clients
//! or long-lived HTTP event-stream clients) and fans events out to them.
//!
//! ## Delivery model
//!
//! Each subscriber gets its own bounded queue, drained by the task that owns
//! the connection. A broadcast serializes the event once and hands the same
//! shared frame to every queue with a non-blocking `try_send`, so one stalled
//! client can never hold up the others or the ingestion path. A subscriber
//! whose queue is closed (it went away) or full (it stopped reading) is
//! dropped from the registry on the spot.
//!
//! ## Consistency
//!
//! Registration, removal and the snapshot-and-send step of a broadcast all
//! run under the same short-held lock. A new subscriber is handed the cached
//! event during registration, and every subscriber remembers the sequence
//! number of the last event it was given, so an event that was already part
//! of the join handshake is never delivered a second time.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::core::cache::{CacheEntry, LatestValueCache};

/// An encoded event, shared by every queue it is pushed to.
pub type Frame = Arc<str>;

/// Identifier of one subscriber within its registry.
pub type ClientId = u64;

/// Transport a registry serves. Used for logging only; both kinds share the
/// same mechanics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientKind {
    /// WebSocket clients.
    PushSocket,
    /// Server-sent-event stream clients.
    Stream,
}

impl ClientKind {
    pub fn label(self) -> &'static str {
        match self {
            ClientKind::PushSocket => "websocket",
            ClientKind::Stream => "sse",
        }
    }
}

impl fmt::Display for ClientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Why a single subscriber could not take a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("subscriber queue is closed")]
    Closed,
    #[error("subscriber queue is full")]
    Lagging,
}

/// Outcome of one broadcast over one registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Subscribers that were handed the frame.
    pub delivered: usize,
    /// Subscribers that already had this event from their join handshake.
    pub skipped: usize,
    /// Subscribers removed because their queue was closed or full.
    pub dropped: usize,
}

struct ClientHandle {
    sender: mpsc::Sender<Frame>,
    last_sequence: u64,
}

impl ClientHandle {
    /// Pushes `frame` unless the subscriber already has `sequence`.
    /// Returns whether a frame was queued.
    fn deliver(&mut self, frame: &Frame, sequence: u64) -> Result<bool, DeliveryError> {
        if sequence <= self.last_sequence {
            return Ok(false);
        }
        self.sender
            .try_send(Arc::clone(frame))
            .map_err(|e| match e {
                TrySendError::Full(_) => DeliveryError::Lagging,
                TrySendError::Closed(_) => DeliveryError::Closed,
            })?;
        self.last_sequence = sequence;
        Ok(true)
    }
}

#[derive(Default)]
struct Clients {
    handles: HashMap<ClientId, ClientHandle>,
    next_id: ClientId,
    closed: bool,
}

fn lock(clients: &Mutex<Clients>) -> std::sync::MutexGuard<'_, Clients> {
    clients.lock().unwrap_or_else(PoisonError::into_inner)
}

fn remove_client(clients: &Mutex<Clients>, kind: ClientKind, id: ClientId) -> bool {
    let mut guard = lock(clients);
    let removed = guard.handles.remove(&id).is_some();
    if removed {
        info!(kind = %kind, client_id = id, total = guard.handles.len(), "Subscriber disconnected");
    }
    removed
}

/// # Client Registry
///
/// Cheap to clone; clones share the same subscriber set.
#[derive(Clone)]
pub struct ClientRegistry {
    kind: ClientKind,
    clients: Arc<Mutex<Clients>>,
    cache: Arc<LatestValueCache>,
    queue_capacity: usize,
}

impl ClientRegistry {
    /// Creates an empty registry whose join handshake reads from `cache`.
    /// `queue_capacity` bounds each subscriber's backlog (minimum 1).
    pub fn new(kind: ClientKind, cache: Arc<LatestValueCache>, queue_capacity: usize) -> Self {
        Self {
            kind,
            clients: Arc::new(Mutex::new(Clients {
                next_id: 1,
                ..Clients::default()
            })),
            cache,
            queue_capacity: queue_capacity.max(1),
        }
    }

    pub fn kind(&self) -> ClientKind {
        self.kind
    }

    /// # Register
    ///
    /// Adds a subscriber and, when the cache holds an event, queues it as the
    /// first frame before returning. After [`close_all`](Self::close_all) the
    /// returned subscription is already finished.
    pub fn register(&self) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        let mut clients = lock(&self.clients);
        let id = clients.next_id;
        clients.next_id += 1;

        if !clients.closed {
            let mut handle = ClientHandle {
                sender,
                last_sequence: 0,
            };
            if let Some(CacheEntry { sequence, event }) = self.cache.entry() {
                let frame: Frame = Arc::from(event.encode());
                // A fresh queue always has room for the handshake frame.
                if let Err(e) = handle.deliver(&frame, sequence) {
                    warn!(kind = %self.kind, client_id = id, error = %e, "Join handshake failed");
                }
            }
            clients.handles.insert(id, handle);
            info!(kind = %self.kind, client_id = id, total = clients.handles.len(), "Subscriber connected");
        }

        Subscription {
            id,
            kind: self.kind,
            receiver,
            clients: Arc::downgrade(&self.clients),
        }
    }

    /// Removes a subscriber. Returns `false` if it was already gone, which is
    /// expected when a disconnect races with a broadcast-triggered removal.
    pub fn unregister(&self, id: ClientId) -> bool {
        remove_client(&self.clients, self.kind, id)
    }

    /// # Broadcast
    ///
    /// Encodes the event once and queues the frame for every subscriber that
    /// has not seen this sequence yet. Subscribers that cannot take it are
    /// removed; the rest are unaffected.
    pub fn broadcast(&self, entry: &CacheEntry) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let mut clients = lock(&self.clients);
        if clients.handles.is_empty() {
            return report;
        }

        let frame: Frame = Arc::from(entry.event.encode());
        let kind = self.kind;
        clients.handles.retain(|id, handle| match handle.deliver(&frame, entry.sequence) {
            Ok(true) => {
                report.delivered += 1;
                true
            }
            Ok(false) => {
                report.skipped += 1;
                true
            }
            Err(e) => {
                warn!(kind = %kind, client_id = *id, error = %e, "Dropping subscriber");
                report.dropped += 1;
                false
            }
        });

        debug!(
            kind = %kind,
            sequence = entry.sequence,
            delivered = report.delivered,
            skipped = report.skipped,
            dropped = report.dropped,
            "Broadcast complete"
        );
        report
    }

    /// Drops every subscriber and refuses new ones. Open subscriptions see
    /// the end of their stream once their queued frames are drained.
    pub fn close_all(&self) {
        let mut clients = lock(&self.clients);
        clients.closed = true;
        let count = clients.handles.len();
        clients.handles.clear();
        info!(kind = %self.kind, count, "Registry closed");
    }

    pub fn len(&self) -> usize {
        lock(&self.clients).handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: ClientId) -> bool {
        lock(&self.clients).handles.contains_key(&id)
    }
}

/// # Subscription
///
/// The receiving side of one subscriber. Dropping it unregisters the
/// subscriber, so a connection task only has to let it go when the client
/// disconnects.
pub struct Subscription {
    id: ClientId,
    kind: ClientKind,
    receiver: mpsc::Receiver<Frame>,
    clients: Weak<Mutex<Clients>>,
}

impl Subscription {
    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn kind(&self) -> ClientKind {
        self.kind
    }

    /// Waits for the next frame. `None` once the registry dropped this
    /// subscriber (closed, lagging or shut down) and the queue is drained.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.receiver.recv().await
    }

    /// Takes a queued frame without waiting.
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(clients) = self.clients.upgrade() {
            remove_client(&clients, self.kind, self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Event, FieldValue, SensorFields};
    use std::time::Duration;

    fn event(temp: i64) -> Arc<Event> {
        let mut fields = SensorFields::new();
        fields.insert("temp".to_string(), FieldValue::from(temp));
        Arc::new(Event::stamp(fields).unwrap())
    }

    fn registry(capacity: usize) -> (Arc<LatestValueCache>, ClientRegistry) {
        let cache = Arc::new(LatestValueCache::new());
        let registry = ClientRegistry::new(ClientKind::Stream, Arc::clone(&cache), capacity);
        (cache, registry)
    }

    fn drain(sub: &mut Subscription) -> Vec<Frame> {
        std::iter::from_fn(|| sub.try_recv()).collect()
    }

    #[test]
    fn no_handshake_when_cache_is_empty() {
        let (_cache, registry) = registry(8);
        let mut sub = registry.register();

        assert!(registry.contains(sub.id()));
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn every_subscriber_gets_exactly_one_frame() {
        let (cache, registry) = registry(8);
        let mut subs: Vec<_> = (0..5).map(|_| registry.register()).collect();

        let entry = cache.set(event(7));
        let report = registry.broadcast(&entry);

        assert_eq!(report.delivered, 5);
        for sub in subs.iter_mut() {
            let frames = drain(sub);
            assert_eq!(frames.len(), 1);
            assert_eq!(&*frames[0], entry.event.encode());
        }
    }

    #[test]
    fn late_joiner_gets_cached_event_once_then_new_events_in_order() {
        let (cache, registry) = registry(8);
        let e1 = cache.set(event(1));
        registry.broadcast(&e1);

        // joins after the cache write but could still race the fan-out of e1
        let mut late = registry.register();
        let report = registry.broadcast(&e1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.delivered, 0);

        let e2 = cache.set(event(2));
        registry.broadcast(&e2);

        let frames = drain(&mut late);
        assert_eq!(frames.len(), 2);
        assert_eq!(&*frames[0], e1.event.encode());
        assert_eq!(&*frames[1], e2.event.encode());
    }

    #[test]
    fn unregister_is_idempotent() {
        let (_cache, registry) = registry(8);
        let sub = registry.register();
        let id = sub.id();

        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
        drop(sub);
        assert!(registry.is_empty());
    }

    #[test]
    fn dropping_subscription_unregisters() {
        let (_cache, registry) = registry(8);
        let keep = registry.register();
        let gone = registry.register();
        assert_eq!(registry.len(), 2);

        drop(gone);
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(keep.id()));
    }

    #[test]
    fn closed_queue_is_dropped_on_next_broadcast() {
        let (cache, registry) = registry(8);
        let mut closed = registry.register();
        let mut open = registry.register();
        // the connection task is gone but its handle has not unregistered yet
        closed.receiver.close();

        let report = registry.broadcast(&cache.set(event(1)));
        assert_eq!(report.delivered, 1);
        assert_eq!(report.dropped, 1);
        assert!(!registry.contains(closed.id()));
        assert_eq!(drain(&mut open).len(), 1);
        assert!(closed.try_recv().is_none());
    }

    #[test]
    fn lagging_subscriber_is_dropped_without_affecting_others() {
        let (cache, registry) = registry(1);
        let mut slow = registry.register();
        let mut fast = registry.register();

        let e1 = cache.set(event(1));
        assert_eq!(registry.broadcast(&e1).delivered, 2);
        assert_eq!(drain(&mut fast).len(), 1);

        let e2 = cache.set(event(2));
        let report = registry.broadcast(&e2);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.dropped, 1);
        assert!(!registry.contains(slow.id()));
        assert!(registry.contains(fast.id()));

        // the slow one still drains what it had, then sees the end
        assert_eq!(drain(&mut slow).len(), 1);
        assert_eq!(drain(&mut fast).len(), 1);
    }

    #[tokio::test]
    async fn close_all_ends_subscriptions_and_refuses_new_ones() {
        let (cache, registry) = registry(8);
        let mut sub = registry.register();
        registry.close_all();

        assert!(registry.is_empty());
        assert!(sub.recv().await.is_none());

        cache.set(event(1));
        let mut after = registry.register();
        assert!(registry.is_empty());
        assert!(after.recv().await.is_none());
    }

    #[tokio::test]
    async fn broadcast_survives_concurrent_churn() {
        let (cache, registry) = registry(256);
        let mut stable = registry.register();

        let churn: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    for _ in 0..50 {
                        let sub = registry.register();
                        tokio::task::yield_now().await;
                        registry.unregister(sub.id());
                    }
                })
            })
            .collect();

        for i in 0..100 {
            let entry = cache.set(event(i));
            registry.broadcast(&entry);
            tokio::task::yield_now().await;
        }
        for task in churn {
            task.await.unwrap();
        }

        let frames = drain(&mut stable);
        assert_eq!(frames.len(), 100);
        assert_eq!(registry.len(), 1);

        let got = tokio::time::timeout(Duration::from_millis(10), stable.recv()).await;
        assert!(got.is_err(), "no extra frames after the last broadcast");
    }
}
