//! Access control entries and permission sets.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::path::Path;

/// Principal carried by every user, including anonymous ones.
pub const EVERYONE: &str = "system.Everyone";
/// Principal carried by every identified user.
pub const AUTHENTICATED: &str = "system.Authenticated";

/// Access control entry: a permission on a path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ace {
    pub perm: String,
    pub path: Path,
}

impl Ace {
    pub fn new(perm: impl Into<String>, path: impl Into<Path>) -> Self {
        Self {
            perm: perm.into(),
            path: path.into(),
        }
    }
}

impl fmt::Display for Ace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.perm, self.path)
    }
}

/// Principals per permission, e.g. `{"write": ["alice", "bob"]}`.
pub type PermissionSet = BTreeMap<String, Vec<String>>;

/// Returns the implicit principals of a user: itself, plus
/// `system.Authenticated` unless anonymous, plus `system.Everyone`.
pub fn implicit_principals(user_id: &str) -> Vec<String> {
    let mut principals = vec![user_id.to_string()];
    if user_id != EVERYONE {
        if user_id != AUTHENTICATED {
            principals.push(AUTHENTICATED.to_string());
        }
        principals.push(EVERYONE.to_string());
    }
    principals
}
