//! Filter expressions and their in-memory evaluation.
//!
//! A [`Filter`] is parsed from a `prefix_field=value` query pair. Filters
//! combine into a [`Condition`] (logical AND) and conditions combine into a
//! [`ConditionSet`] (logical OR), which is how keyset pagination is expressed.

use std::cmp::Ordering;

use regex::RegexBuilder;
use serde_json::Value;

use crate::object::{Object, FIELD_ID, FIELD_LAST_MODIFIED};
use crate::value::{compare, is_equal, json_contains, parse_value, to_text, truthy};

/// Comparison operator of a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Lt,
    Min,
    Max,
    Not,
    Eq,
    Gt,
    In,
    Exclude,
    Like,
    Has,
    ContainsAny,
    Contains,
}

static NULL: Value = Value::Null;

/// Query-string prefixes in match order. `contains_any_` must be tried
/// before `contains_`.
const PREFIXES: &[(&str, Operator)] = &[
    ("has_", Operator::Has),
    ("min_", Operator::Min),
    ("max_", Operator::Max),
    ("lt_", Operator::Lt),
    ("gt_", Operator::Gt),
    ("eq_", Operator::Eq),
    ("not_", Operator::Not),
    ("in_", Operator::In),
    ("like_", Operator::Like),
    ("exclude_", Operator::Exclude),
    ("contains_any_", Operator::ContainsAny),
    ("contains_", Operator::Contains),
];

impl Operator {
    /// Query-string prefix of the operator.
    pub fn prefix(self) -> &'static str {
        PREFIXES
            .iter()
            .find(|(_, op)| *op == self)
            .map(|(prefix, _)| *prefix)
            .unwrap_or("eq_")
    }

    /// Operators whose value is a comma separated list.
    pub fn takes_list(self) -> bool {
        matches!(self, Operator::In | Operator::Exclude | Operator::ContainsAny)
    }
}

/// A single `field <op> values` predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub operator: Operator,
    pub values: Vec<Value>,
}

/// Filters joined by AND.
pub type Condition = Vec<Filter>;

/// Conditions joined by OR.
pub type ConditionSet = Vec<Condition>;

impl Filter {
    pub fn new(field: impl Into<String>, operator: Operator, values: Vec<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            values,
        }
    }

    /// Parses a query pair such as `gt_num=5` or `in_id=a,b`.
    pub fn parse(key: &str, raw: &str) -> Self {
        let (field, operator) = PREFIXES
            .iter()
            .find_map(|(prefix, op)| key.strip_prefix(prefix).map(|f| (f, *op)))
            .unwrap_or((key, Operator::Eq));

        let values = if operator.takes_list() {
            split_list(raw).map(parse_value).collect()
        } else {
            vec![parse_value(raw)]
        };
        Self::new(field, operator, values)
    }

    /// A filter needs a field name and at least one value.
    pub fn is_valid(&self) -> bool {
        !self.field.is_empty() && !self.values.is_empty()
    }

    /// First value, `null` when absent.
    pub fn value(&self) -> &Value {
        self.values.first().unwrap_or(&NULL)
    }

    /// Evaluates the filter against an object.
    pub fn matches(&self, obj: &Object) -> bool {
        let actual = obj.get(&self.field);
        let actual = actual.as_deref();
        let cmp = || compare(actual, Some(self.value()));

        match self.operator {
            Operator::Gt => cmp() == Ordering::Greater,
            Operator::Min => cmp() != Ordering::Less,
            Operator::Lt => cmp() == Ordering::Less,
            Operator::Max => cmp() != Ordering::Greater,
            Operator::Eq => is_equal(actual, Some(self.value())),
            Operator::Not => !is_equal(actual, Some(self.value())),
            Operator::In => self.values.iter().any(|v| is_equal(actual, Some(v))),
            Operator::Exclude => !self.values.iter().any(|v| is_equal(actual, Some(v))),
            Operator::Has => truthy(self.value()) == actual.is_some(),
            Operator::Like => self.matches_like(actual),
            Operator::Contains => {
                !is_column(&self.field) && actual.is_some_and(|a| json_contains(a, self.value()))
            }
            Operator::ContainsAny => match actual {
                Some(Value::Array(items)) if !is_column(&self.field) => items
                    .iter()
                    .any(|item| self.values.iter().any(|v| is_equal(Some(item), Some(v)))),
                _ => false,
            },
        }
    }

    fn matches_like(&self, actual: Option<&Value>) -> bool {
        if self.field == FIELD_LAST_MODIFIED {
            return false;
        }
        let escaped = regex::escape(&to_text(self.value()));
        if escaped.is_empty() {
            return false;
        }
        // wildcards anchor the pattern, plain text matches anywhere
        let pattern = if escaped.contains("\\*") {
            format!("^{}$", escaped.replace("\\*", ".*"))
        } else {
            escaped
        };
        let Ok(re) = RegexBuilder::new(&pattern).case_insensitive(true).build() else {
            return false;
        };
        match actual {
            None | Some(Value::Null) => false,
            Some(Value::String(s)) => re.is_match(s),
            Some(other) => re.is_match(&other.to_string()),
        }
    }
}

/// Fields stored as dedicated columns rather than inside the document.
pub fn is_column(field: &str) -> bool {
    field == FIELD_ID || field == FIELD_LAST_MODIFIED
}

/// Splits a comma separated list. Empty input yields nothing, a trailing
/// separator is ignored, inner empty items are kept.
fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    let mut items: Vec<&str> = raw.split(',').collect();
    if items.last().is_some_and(|s| s.is_empty()) {
        items.pop();
    }
    items.into_iter()
}

/// True if the object satisfies every filter.
pub fn matches_condition(obj: &Object, condition: &[Filter]) -> bool {
    condition.iter().all(|f| f.matches(obj))
}

/// True if the object satisfies any non-empty condition. A set without
/// non-empty conditions matches.
pub fn matches_any(obj: &Object, set: &[Condition]) -> bool {
    let mut conditions = set.iter().filter(|c| !c.is_empty()).peekable();
    conditions.peek().is_none() || conditions.any(|c| matches_condition(obj, c))
}

/// Drops empty conditions.
pub fn compact(set: &[Condition]) -> ConditionSet {
    set.iter().filter(|c| !c.is_empty()).cloned().collect()
}
