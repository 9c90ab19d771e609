//! # Loggers Module
//!
//! Process-wide `tracing` setup shared by every binary in the workspace.

pub mod tracing_setup;

pub use tracing_setup::{init_tracing, LogGuard, LogSettings};
