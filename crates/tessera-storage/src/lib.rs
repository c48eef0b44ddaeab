//! tessera-storage: object and permission storage backends
//!
//! This crate provides the storage layer of the tessera object store:
//! - Transactional object storage with soft deletes and namespace epochs
//! - Permission storage (principal links and access control entries)
//! - In-memory implementations for development and testing
//! - PostgreSQL implementations for production
//! - A key-value cache used to stamp pagination nonces
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │               tessera-storage               │
//! ├─────────────────────────────────────────────┤
//! │  traits.rs   - Backend and transaction APIs │
//! │  registry.rs - Backends by URL scheme       │
//! │  memory/     - In-memory implementations    │
//! │  postgres/   - PostgreSQL implementations   │
//! │  cache.rs    - Nonce cache                  │
//! └─────────────────────────────────────────────┘
//! ```

pub mod cache;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod registry;
pub mod traits;

// Re-export commonly used types
pub use cache::{spend_nonce, Cache, MemoryCache, MemoryCacheConfig};
pub use error::{StorageError, StorageResult};
pub use memory::{MemoryPermissions, MemoryStorage};
pub use postgres::{PostgresConfig, PostgresPermissions, PostgresStorage};
pub use registry::{register_builtin, Registry};
pub use traits::{
    CountOptions, Inclusion, ListOptions, PermissionBackend, PermissionTransaction, StorageBackend,
    StorageTransaction, UpdateHandle,
};
