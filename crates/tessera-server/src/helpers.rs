//! Default callbacks handed to the backends.

use tessera_domain::Helpers;
use ulid::Ulid;

/// Mints lexicographically sortable ULIDs as object IDs.
#[derive(Debug, Clone, Copy, Default)]
pub struct UlidHelpers;

impl Helpers for UlidHelpers {
    fn next_id(&self) -> String {
        Ulid::new().to_string().to_lowercase()
    }
}
