//! Observability infrastructure for tessera.
//!
//! Backends emit `tracing` events and spans plus `metrics` histograms of
//! query durations; this module configures where the events go.

mod logging;

pub use logging::{init_logging, parse_level};
