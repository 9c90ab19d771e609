//! # Ingestors Module
//!
//! The two ways a reading enters the gateway:
//!
//! - **`mqtt_bus`**: the MQTT client that subscribes to the telemetry topic and
//!   hands every publish to the pipeline.
//! - **`pipeline`**: parses, stamps, persists and publishes bus messages.
//!   Lenient: bad payloads are dropped, store failures do not block delivery.
//! - **`manual`**: operator submissions from the HTTP API. Strict: required
//!   fields are enforced and nothing is broadcast unless the store accepted it.

pub mod manual;
pub mod mqtt_bus;
pub mod pipeline;

pub use manual::{ManualSubmit, ManualSubmitError, REQUIRED_MANUAL_FIELDS};
pub use mqtt_bus::{parse_broker_url, spawn_bus, BrokerAddress, BusConfigError, BusSettings, BusStatus};
pub use pipeline::{BusMessage, IngestError, IngestReceipt, IngestionPipeline};
