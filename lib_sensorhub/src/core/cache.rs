//! # Latest-Value Cache
//!
//! Holds the single most recent [`Event`]. Writes are last-write-wins and
//! replace the whole entry under one lock, so a reader (a subscriber doing its
//! join handshake, or a `/realtime` query) sees either the previous entry or
//! the new one, never a mix.
//!
//! Every write is tagged with a strictly increasing sequence number. The
//! registries use it to tell whether a subscriber has already been handed an
//! event, which keeps join handshakes and broadcasts from delivering the same
//! event twice.

use std::sync::{Arc, PoisonError, RwLock};

use crate::model::Event;

/// The cached event together with the sequence number of its write.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Position of this event in publish order, starting at 1.
    pub sequence: u64,
    /// The event itself, shared with every in-flight send.
    pub event: Arc<Event>,
}

#[derive(Debug, Default)]
struct Slot {
    entry: Option<CacheEntry>,
    last_sequence: u64,
}

/// # Latest-Value Cache
///
/// Starts empty and lives for the whole process. Only the
/// [`Broadcaster`](crate::core::Broadcaster) writes to it.
#[derive(Debug, Default)]
pub struct LatestValueCache {
    slot: RwLock<Slot>,
}

impl LatestValueCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the cached event unconditionally and returns the new entry.
    pub fn set(&self, event: Arc<Event>) -> CacheEntry {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        slot.last_sequence += 1;
        let entry = CacheEntry {
            sequence: slot.last_sequence,
            event,
        };
        slot.entry = Some(entry.clone());
        entry
    }

    /// The current event, or `None` before the first write.
    pub fn get(&self) -> Option<Arc<Event>> {
        self.entry().map(|entry| entry.event)
    }

    /// The current event with its sequence number.
    pub fn entry(&self) -> Option<CacheEntry> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entry
            .clone()
    }

    pub fn is_empty(&self) -> bool {
        self.entry().is_none()
    }
}
