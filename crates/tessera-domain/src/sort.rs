//! Sort specifications.

use std::cmp::Ordering;

use crate::object::Object;
use crate::value::compare;

/// One sort key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortOrder {
    pub field: String,
    pub descending: bool,
}

impl SortOrder {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            descending: false,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            descending: true,
        }
    }
}

/// Parses a `_sort` value such as `-last_modified,title`.
///
/// Blank entries are skipped and repeated fields keep their first position.
pub fn parse_sort(raw: &str) -> Vec<SortOrder> {
    let mut orders: Vec<SortOrder> = Vec::new();
    for item in raw.split(',') {
        let order = match item.strip_prefix('-') {
            Some(field) if !field.is_empty() => SortOrder::desc(field),
            Some(_) => continue,
            None if item.is_empty() => continue,
            None => SortOrder::asc(item),
        };
        if orders.iter().all(|o| o.field != order.field) {
            orders.push(order);
        }
    }
    orders
}

/// Orders two objects by a list of sort keys.
pub fn compare_objects(a: &Object, b: &Object, sort: &[SortOrder]) -> Ordering {
    for order in sort {
        let (va, vb) = (a.get(&order.field), b.get(&order.field));
        let ord = compare(va.as_deref(), vb.as_deref());
        if ord != Ordering::Equal {
            return if order.descending { ord.reverse() } else { ord };
        }
    }
    Ordering::Equal
}
