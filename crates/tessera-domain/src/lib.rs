//! tessera-domain: value types shared by every tessera backend
//!
//! This crate contains the pure, I/O-free building blocks of the object
//! store:
//! - Resource paths and millisecond epochs
//! - JSON documents with reserved metadata fields
//! - The filter language and its in-memory evaluator
//! - Sort specs, request parameters and keyset pagination tokens
//! - Access control entries
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │               tessera-domain                │
//! ├─────────────────────────────────────────────┤
//! │  path/epoch  - Addressing and versioning    │
//! │  object      - Documents and merge rules    │
//! │  value       - JSON ordering and coercions  │
//! │  filter/sort - Query language               │
//! │  params      - Query string parsing         │
//! │  pagination  - Cursor tokens                │
//! │  permission  - ACEs and principals          │
//! └─────────────────────────────────────────────┘
//! ```

pub mod epoch;
pub mod error;
pub mod filter;
pub mod helpers;
pub mod object;
pub mod pagination;
pub mod params;
pub mod path;
pub mod permission;
pub mod sort;
pub mod value;

// Re-export commonly used types at the crate root
pub use epoch::Epoch;
pub use error::{DomainError, DomainResult};
pub use filter::{Condition, ConditionSet, Filter, Operator};
pub use helpers::Helpers;
pub use object::Object;
pub use pagination::Pagination;
pub use params::Params;
pub use path::Path;
pub use permission::{Ace, PermissionSet, AUTHENTICATED, EVERYONE};
pub use sort::SortOrder;
