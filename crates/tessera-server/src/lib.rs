//! tessera-server: configuration and bootstrap of the tessera object store
//!
//! This crate wires the storage layer into an application:
//! - Configuration loading (defaults, YAML file, environment)
//! - Logging initialization
//! - Default ID generation
//! - Backend connection and paired request transactions
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │               tessera-server                │
//! ├─────────────────────────────────────────────┤
//! │  config.rs      - Configuration management  │
//! │  observability/ - Logging setup             │
//! │  helpers.rs     - ID generation             │
//! │  services.rs    - Backends and transactions │
//! └─────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod helpers;
pub mod observability;
pub mod services;

// Re-exports for convenience
pub use config::{ConfigLoadError, ServerConfig};
pub use helpers::UlidHelpers;
pub use services::{RequestTxn, Services};
