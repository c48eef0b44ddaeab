//! In-memory backends for development and testing.

mod journal;
mod objects;
mod permissions;

pub use objects::{MemoryStorage, MemoryStorageTx};
pub use permissions::{MemoryPermissions, MemoryPermissionsTx};
