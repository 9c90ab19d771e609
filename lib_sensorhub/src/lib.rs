//! # lib_sensorhub
//!
//! Building blocks of the sensorhub telemetry gateway: telemetry events arrive
//! from an MQTT bus (or a manual HTTP submission), are stamped and persisted,
//! land in a latest-value cache and are fanned out to every live WebSocket and
//! event-stream subscriber.
//!
//! Each top-level folder is gated behind a cargo feature of the same name; the
//! `full` feature (on by default) turns on everything.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

#[cfg(feature = "model")]
pub mod model;

#[cfg(feature = "core")]
pub mod core;

#[cfg(feature = "connections")]
pub mod connections;

#[cfg(feature = "ingestors")]
pub mod ingestors;

#[cfg(feature = "loggers")]
pub mod loggers;
