//! Opaque cursor tokens for keyset pagination.

use std::collections::BTreeMap;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DomainError, DomainResult};
use crate::filter::{ConditionSet, Filter, Operator};
use crate::object::Object;
use crate::sort::SortOrder;

/// Cursor state: a single-use nonce and the sort values of the last object
/// of the previous page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pagination {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub nonce: String,
    #[serde(default, rename = "last_object", skip_serializing_if = "BTreeMap::is_empty")]
    pub last_object: BTreeMap<String, Value>,
}

impl Pagination {
    /// Captures the sort fields of `last`. Null and missing values are not
    /// stored.
    pub fn new(nonce: impl Into<String>, last: &Object, sort: &[SortOrder]) -> Self {
        let last_object = sort
            .iter()
            .filter_map(|order| {
                let value = last.get(&order.field)?;
                (!value.is_null()).then(|| (order.field.clone(), value.into_owned()))
            })
            .collect();
        Self {
            nonce: nonce.into(),
            last_object,
        }
    }

    /// Decodes a token. Returns `Ok(None)` for an empty string.
    pub fn decode(token: &str) -> DomainResult<Option<Self>> {
        if token.is_empty() {
            return Ok(None);
        }
        let invalid = || DomainError::InvalidParam {
            param: "_token".to_string(),
        };
        let raw = URL_SAFE_NO_PAD.decode(token).map_err(|_| invalid())?;
        let parsed: Option<Self> = serde_json::from_slice(&raw).map_err(|_| invalid())?;
        Ok(parsed)
    }

    /// Encodes the token as base64url JSON without padding.
    pub fn encode(&self) -> DomainResult<String> {
        let raw = serde_json::to_vec(self).map_err(|e| DomainError::Token {
            message: e.to_string(),
        })?;
        Ok(URL_SAFE_NO_PAD.encode(raw))
    }

    /// Builds the keyset conditions selecting rows strictly after the cursor.
    ///
    /// Row `p` pins every sort field before `p` with `EQ` and requires field
    /// `p` to be past the cursor (`GT`, or `LT` when descending). Sort fields
    /// absent from the cursor held a null value.
    pub fn conditions(&self, sort: &[SortOrder]) -> ConditionSet {
        if self.last_object.is_empty() {
            return ConditionSet::new();
        }

        let cursor = |field: &str| self.last_object.get(field).cloned().unwrap_or(Value::Null);
        (0..sort.len())
            .map(|pivot| {
                sort[..=pivot]
                    .iter()
                    .enumerate()
                    .map(|(i, order)| {
                        let operator = match (i == pivot, order.descending) {
                            (false, _) => Operator::Eq,
                            (true, false) => Operator::Gt,
                            (true, true) => Operator::Lt,
                        };
                        Filter::new(order.field.clone(), operator, vec![cursor(&order.field)])
                    })
                    .collect()
            })
            .collect()
    }
}
