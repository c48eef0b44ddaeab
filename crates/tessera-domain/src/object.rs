//! Stored JSON documents.

use std::borrow::Cow;

use serde::de::{self, Deserializer};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::epoch::Epoch;
use crate::error::{DomainError, DomainResult};

/// Reserved field holding the object identifier.
pub const FIELD_ID: &str = "id";
/// Reserved field holding the modification epoch.
pub const FIELD_LAST_MODIFIED: &str = "last_modified";
/// Reserved field flagging tombstones.
pub const FIELD_DELETED: &str = "deleted";

/// Returns true for `id`, `last_modified` and `deleted`.
pub fn is_reserved(field: &str) -> bool {
    matches!(field, FIELD_ID | FIELD_LAST_MODIFIED | FIELD_DELETED)
}

/// A stored document: reserved metadata plus arbitrary user fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Object {
    pub id: String,
    pub mod_time: Epoch,
    pub deleted: bool,
    /// User fields. Never contains the reserved keys.
    pub extra: Map<String, Value>,
}

impl Object {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Builds an object from a JSON document, lifting out reserved keys.
    pub fn from_value(value: Value) -> DomainResult<Self> {
        let Value::Object(mut map) = value else {
            return Err(DomainError::InvalidObject {
                message: "expected a JSON object".to_string(),
            });
        };

        let id = match map.remove(FIELD_ID) {
            Some(Value::String(s)) => s,
            Some(Value::Null) | None => String::new(),
            Some(other) => crate::value::to_text(&other),
        };
        let mod_time = map
            .remove(FIELD_LAST_MODIFIED)
            .map(|v| Epoch(crate::value::to_int(&v)))
            .unwrap_or_default();
        let deleted = map
            .remove(FIELD_DELETED)
            .is_some_and(|v| crate::value::truthy(&v));
        if deleted {
            map.clear();
        }

        Ok(Self {
            id,
            mod_time,
            deleted,
            extra: map,
        })
    }

    /// Looks up a field.
    ///
    /// Reserved fields resolve to their metadata, anything else is a dotted
    /// path into `extra` (`sub.num`, `ary.0`). Returns `None` if missing.
    pub fn get(&self, field: &str) -> Option<Cow<'_, Value>> {
        match field {
            FIELD_ID => Some(Cow::Owned(Value::String(self.id.clone()))),
            FIELD_LAST_MODIFIED => Some(Cow::Owned(Value::from(self.mod_time.0))),
            FIELD_DELETED => Some(Cow::Owned(Value::Bool(self.deleted))),
            _ => lookup(&self.extra, field).map(Cow::Borrowed),
        }
    }

    /// Sets a field. Reserved fields must carry a matching JSON type,
    /// dotted paths create intermediate objects as needed.
    pub fn set(&mut self, field: &str, value: Value) -> DomainResult<()> {
        match field {
            FIELD_ID => match value {
                Value::String(s) => self.id = s,
                _ => return Err(invalid_field(field, "value is not a string")),
            },
            FIELD_LAST_MODIFIED => match value.as_i64() {
                Some(n) => self.mod_time = Epoch(n),
                None => return Err(invalid_field(field, "value is not a number")),
            },
            FIELD_DELETED => match value {
                Value::Bool(b) => self.deleted = b,
                _ => return Err(invalid_field(field, "value is not a boolean")),
            },
            _ => {
                let mut segments = field.split('.').peekable();
                let mut map = &mut self.extra;
                while let Some(seg) = segments.next() {
                    if segments.peek().is_none() {
                        map.insert(seg.to_string(), value);
                        break;
                    }
                    let slot = map
                        .entry(seg.to_string())
                        .or_insert_with(|| Value::Object(Map::new()));
                    if !slot.is_object() {
                        *slot = Value::Object(Map::new());
                    }
                    map = match slot {
                        Value::Object(inner) => inner,
                        _ => return Err(invalid_field(field, "cannot descend into value")),
                    };
                }
            }
        }
        Ok(())
    }

    /// Replaces the object with `other`: the ID if set and all user fields.
    /// The modification time keeps the maximum, deletion is sticky.
    pub fn update(&mut self, other: Object) {
        if !other.id.is_empty() {
            self.id = other.id;
        }
        self.mod_time = self.mod_time.max(other.mod_time);
        self.deleted |= other.deleted;
        self.extra = other.extra;
    }

    /// Deep-merges the user fields of `other` into this object.
    ///
    /// Nested objects merge recursively, anything else replaces the existing
    /// value. `null` values in the patch are ignored.
    pub fn patch(&mut self, other: &Object) {
        merge(&mut self.extra, &other.extra);
    }

    /// Size of the serialized JSON document in bytes.
    pub fn byte_size(&self) -> usize {
        serde_json::to_vec(self).map_or(0, |buf| buf.len())
    }

    /// Serializes the object into a JSON document.
    pub fn to_value(&self) -> Value {
        let mut map = Map::with_capacity(self.extra.len() + 3);
        map.insert(FIELD_ID.to_string(), Value::String(self.id.clone()));
        map.insert(FIELD_LAST_MODIFIED.to_string(), Value::from(self.mod_time.0));
        if self.deleted {
            map.insert(FIELD_DELETED.to_string(), Value::Bool(true));
        } else {
            map.extend(self.extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        Value::Object(map)
    }
}

fn invalid_field(field: &str, message: &str) -> DomainError {
    DomainError::InvalidField {
        field: field.to_string(),
        message: message.to_string(),
    }
}

fn lookup<'a>(map: &'a Map<String, Value>, field: &str) -> Option<&'a Value> {
    if field.is_empty() {
        return None;
    }
    if let Some(v) = map.get(field) {
        return Some(v);
    }

    let mut segments = field.split('.');
    let mut current = map.get(segments.next()?)?;
    for seg in segments {
        current = match current {
            Value::Object(inner) => inner.get(seg)?,
            Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn merge(dst: &mut Map<String, Value>, src: &Map<String, Value>) {
    for (key, value) in src {
        if value.is_null() {
            continue;
        }
        match (dst.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(patch)) => merge(existing, patch),
            (Some(existing), _) => *existing = value.clone(),
            (None, _) => {
                dst.insert(key.clone(), value.clone());
            }
        }
    }
}

impl Serialize for Object {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let extra_len = if self.deleted { 0 } else { self.extra.len() };
        let mut map = serializer.serialize_map(Some(2 + usize::from(self.deleted) + extra_len))?;
        map.serialize_entry(FIELD_ID, &self.id)?;
        map.serialize_entry(FIELD_LAST_MODIFIED, &self.mod_time)?;
        if self.deleted {
            map.serialize_entry(FIELD_DELETED, &true)?;
        } else {
            for (k, v) in &self.extra {
                map.serialize_entry(k, v)?;
            }
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Object {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Object::from_value(value).map_err(de::Error::custom)
    }
}
