//! Hierarchical resource paths.
//!
//! A path alternates namespace segments and object identifiers, e.g.
//! `/buckets/b1/collections/c1`. A path ending in `*` is a *node* path and
//! addresses every object of its namespace; any other path is a *leaf* path
//! addressing a single object.

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier used by node paths to address all children of a namespace.
pub const WILDCARD: &str = "*";

/// A resource path such as `/buckets/b1` (leaf) or `/buckets/*` (node).
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Path(String);

impl Path {
    /// Creates a path from its raw string form.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Normalizes a request URL path.
    ///
    /// A leading API version prefix (`/v1`) is stripped and collection URLs
    /// (an odd number of segments) are turned into node paths.
    pub fn normalize(url_path: &str) -> Self {
        let trimmed = trim_version_prefix(url_path);
        let separators = trimmed.bytes().filter(|b| *b == b'/').count();
        if separators % 2 == 0 {
            Self(trimmed.to_string())
        } else {
            Self(format!("{trimmed}/{WILDCARD}"))
        }
    }

    /// Joins a namespace and an object ID.
    pub fn join(namespace: &str, object_id: &str) -> Self {
        Self::normalize(&format!("{namespace}/{object_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns true for node paths (ending in `*`).
    pub fn is_node(&self) -> bool {
        self.0.ends_with(WILDCARD)
    }

    /// Splits the path into `(namespace, object_id)` at the last `/`.
    ///
    /// Paths without a separator split into two empty strings.
    pub fn split(&self) -> (&str, &str) {
        match self.0.rfind('/') {
            Some(i) => (&self.0[..i], &self.0[i + 1..]),
            None => ("", ""),
        }
    }

    pub fn namespace(&self) -> &str {
        self.split().0
    }

    pub fn object_id(&self) -> &str {
        self.split().1
    }

    /// Strips the last namespace/identifier pair.
    pub fn parent(&self) -> Path {
        let mut seen = false;
        for (i, b) in self.0.bytes().enumerate().rev() {
            if b == b'/' {
                if seen {
                    return Path(self.0[..i].to_string());
                }
                seen = true;
            }
        }
        Path::default()
    }

    /// Replaces the object ID, keeping the namespace.
    pub fn with_object_id(&self, object_id: &str) -> Path {
        let prefix = match self.0.rfind('/') {
            Some(i) => &self.0[..i],
            None => self.0.as_str(),
        };
        Path(format!("{prefix}/{object_id}"))
    }

    /// Singular resource name, e.g. `collection` for `/buckets/b/collections/c`.
    pub fn resource_name(&self) -> &str {
        let ns = self.namespace();
        let name = match ns.rfind('/') {
            Some(i) => &ns[i + 1..],
            None => ns,
        };
        name.strip_suffix('s').unwrap_or(name)
    }

    /// Reports whether `other` is addressed by this path.
    ///
    /// Node paths contain every path of the same namespace (immediate
    /// children only), leaf paths contain only themselves.
    pub fn contains(&self, other: &Path) -> bool {
        if self.is_node() {
            self.namespace() == other.namespace()
        } else {
            self == other
        }
    }

    /// Iterates over this path and all of its ancestors, ending with the
    /// empty root path.
    pub fn traverse(&self) -> Traverse {
        Traverse {
            next: Some(self.clone()),
        }
    }
}

/// Iterator returned by [`Path::traverse`].
#[derive(Debug, Clone)]
pub struct Traverse {
    next: Option<Path>,
}

impl Iterator for Traverse {
    type Item = Path;

    fn next(&mut self) -> Option<Path> {
        let current = self.next.take()?;
        if !current.is_empty() {
            self.next = Some(current.parent());
        }
        Some(current)
    }
}

fn trim_version_prefix(path: &str) -> &str {
    let Some(rest) = path.strip_prefix("/v") else {
        return path;
    };
    for (i, c) in rest.char_indices() {
        if c == '/' {
            return &rest[i..];
        }
        if !c.is_ascii_digit() {
            return path;
        }
    }
    ""
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Path {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl From<String> for Path {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl AsRef<str> for Path {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Path {
    fn borrow(&self) -> &str {
        &self.0
    }
}
