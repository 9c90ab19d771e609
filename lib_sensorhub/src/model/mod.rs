//! # Data Model
//!
//! The canonical telemetry record that flows from ingestion to fan-out.

/// Sensor events, scalar field values and the timestamp wire format.
pub mod event;

pub use event::{Event, EventError, FieldValue, SensorFields, ID_KEY, RESERVED_KEYS, TIMESTAMP_KEY};
