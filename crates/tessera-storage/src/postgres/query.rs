//! Compiles listing options into parameterized SQL.
//!
//! Reserved fields map to the `id` and `last_modified` columns, every other
//! field is a JSON path into the `data` column. NULL comparands follow the
//! in-memory ranking where NULL sorts above every other value, and a JSON
//! `null` compares and sorts like a missing field. The mapping from operator
//! to SQL fragment lives in [`plan`].

use serde_json::Value;
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder};
use tessera_domain::filter::{compact, is_column};
use tessera_domain::value::{to_int, to_text, truthy};
use tessera_domain::{Condition, Filter, Operator, SortOrder};

use crate::traits::Inclusion;

/// SQL fragment chosen for a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fragment {
    /// Constant predicate.
    Literal(&'static str),
    IsNull,
    IsNotNull,
    /// `field <op> values`. On data fields a `required` comparison also
    /// demands the field to be present, otherwise absent fields match too.
    Compare { op: &'static str, required: bool },
}

fn plan(filter: &Filter) -> Fragment {
    use Fragment::*;

    let null = filter.values.iter().any(Value::is_null);
    let data = !is_column(&filter.field);
    let empty = filter.values.is_empty();

    match filter.operator {
        Operator::Has if truthy(filter.value()) => IsNotNull,
        Operator::Has => IsNull,
        Operator::Eq if null => IsNull,
        Operator::Eq => Compare { op: " = ", required: true },
        Operator::Not if null => IsNotNull,
        Operator::Not => Compare { op: " != ", required: false },
        Operator::Like if null || filter.field == "last_modified" => Literal("FALSE"),
        Operator::Like => Compare { op: " ILIKE ", required: true },
        // nothing is greater than NULL
        Operator::Gt if null => Literal("FALSE"),
        Operator::Gt => Compare { op: " > ", required: false },
        // everything present is less than NULL
        Operator::Lt if null => IsNotNull,
        Operator::Lt => Compare { op: " < ", required: true },
        Operator::Min if null => IsNull,
        Operator::Min => Compare { op: " >= ", required: false },
        Operator::Max if null => Literal("TRUE"),
        Operator::Max => Compare { op: " <= ", required: true },
        Operator::In if empty => Literal("FALSE"),
        Operator::In => Compare { op: " IN ", required: !null },
        Operator::Exclude if empty => Literal("TRUE"),
        Operator::Exclude => Compare { op: " NOT IN ", required: null },
        Operator::Contains if data => Compare { op: " @> ", required: true },
        Operator::ContainsAny if data => Compare { op: " && ", required: true },
        Operator::Contains | Operator::ContainsAny => Literal("FALSE"),
    }
}

/// Turns a `*` wildcard pattern into an `ILIKE` pattern. Without a wildcard
/// the value matches as a substring.
fn like_pattern(raw: &str) -> String {
    let escaped = raw
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    if escaped.contains('*') {
        escaped.replace('*', "%")
    } else {
        format!("%{escaped}%")
    }
}

/// Escapes a literal prefix for use in a `LIKE` pattern.
pub(crate) fn like_prefix(prefix: &str) -> String {
    prefix
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Builder for statements against `storage_objects`.
pub(crate) struct ObjectQuery {
    builder: QueryBuilder<'static, Postgres>,
    has_where: bool,
}

impl ObjectQuery {
    /// Starts a statement, e.g. `SELECT id FROM storage_objects`.
    pub(crate) fn new(head: &str) -> Self {
        Self {
            builder: QueryBuilder::new(head),
            has_where: false,
        }
    }

    pub(crate) fn sql(&self) -> &str {
        self.builder.sql()
    }

    pub(crate) fn builder(&mut self) -> &mut QueryBuilder<'static, Postgres> {
        &mut self.builder
    }

    fn where_(&mut self) {
        if self.has_where {
            self.builder.push(" AND ");
        } else {
            self.builder.push(" WHERE ");
            self.has_where = true;
        }
    }

    /// Restricts rows to a namespace.
    pub(crate) fn namespace(&mut self, ns: &str) {
        self.where_();
        self.builder.push("path = ");
        self.builder.push_bind(ns.to_string());
    }

    pub(crate) fn inclusion(&mut self, include: Inclusion) {
        if include == Inclusion::Live {
            self.where_();
            self.builder.push("NOT deleted");
        }
    }

    pub(crate) fn condition(&mut self, condition: &[Filter]) {
        if condition.is_empty() {
            return;
        }
        self.where_();
        self.push_condition(condition);
    }

    pub(crate) fn pagination(&mut self, set: &[Condition]) {
        let set = compact(set);
        if set.is_empty() {
            return;
        }
        self.where_();
        self.builder.push("( ");
        for (i, condition) in set.iter().enumerate() {
            if i != 0 {
                self.builder.push(" OR ");
            }
            self.push_condition(condition);
        }
        self.builder.push(" )");
    }

    pub(crate) fn order_by(&mut self, sort: &[SortOrder]) {
        if sort.is_empty() {
            return;
        }
        self.builder.push(" ORDER BY ");
        for (i, order) in sort.iter().enumerate() {
            if i != 0 {
                self.builder.push(", ");
            }
            if is_column(&order.field) {
                self.builder.push(&order.field);
            } else {
                self.push_ranked_path(&order.field);
            }
            self.builder.push(if order.descending { " DESC" } else { " ASC" });
        }
    }

    pub(crate) fn limit(&mut self, limit: usize) {
        if limit > 0 {
            self.builder.push(" LIMIT ");
            self.builder.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }
    }

    fn push_condition(&mut self, condition: &[Filter]) {
        self.builder.push("( ");
        for (i, filter) in condition.iter().enumerate() {
            if i != 0 {
                self.builder.push(" AND ");
            }
            self.push_filter(filter);
        }
        self.builder.push(" )");
    }

    fn push_filter(&mut self, filter: &Filter) {
        match plan(filter) {
            Fragment::Literal(sql) => {
                self.builder.push(sql);
            }
            Fragment::IsNull => {
                self.push_field(filter);
                self.builder.push(" IS NULL");
            }
            Fragment::IsNotNull => {
                self.push_field(filter);
                self.builder.push(" IS NOT NULL");
            }
            Fragment::Compare { op, required } => self.push_comparison(filter, op, required),
        }
    }

    fn push_comparison(&mut self, filter: &Filter, op: &str, required: bool) {
        let data = !is_column(&filter.field);
        if data {
            self.builder.push("(");
        }

        if filter.operator == Operator::ContainsAny {
            self.builder.push("jsonb_typeof(");
            self.push_field(filter);
            self.builder
                .push(") = 'array' AND (SELECT array_agg(elems) FROM jsonb_array_elements(");
            self.push_field(filter);
            self.builder.push(") elems)");
        } else {
            self.push_field(filter);
        }

        self.builder.push(op);
        self.push_values(filter);

        if data {
            if required {
                self.builder.push(" AND ");
                self.push_field(filter);
                self.builder.push(" IS NOT NULL)");
            } else {
                self.builder.push(" OR ");
                self.push_field(filter);
                self.builder.push(" IS NULL)");
            }
        }
    }

    fn push_field(&mut self, filter: &Filter) {
        if is_column(&filter.field) {
            self.builder.push(&filter.field);
            return;
        }

        match filter.operator {
            Operator::Like => self.push_path(&filter.field, "->>"),
            // presence and containment see a JSON null as a value
            Operator::Has | Operator::Contains | Operator::ContainsAny => {
                self.push_path(&filter.field, "->")
            }
            _ => self.push_ranked_path(&filter.field),
        }
    }

    fn push_path(&mut self, field: &str, last_arrow: &str) {
        self.builder.push("data");
        let mut segments = field.split('.').peekable();
        while let Some(segment) = segments.next() {
            let arrow = if segments.peek().is_none() { last_arrow } else { "->" };
            self.builder.push(arrow);
            self.builder.push_bind(segment.to_string());
        }
    }

    /// A JSON `null` ranks like a missing field.
    fn push_ranked_path(&mut self, field: &str) {
        self.builder.push("NULLIF(");
        self.push_path(field, "->");
        self.builder.push(", 'null'::jsonb)");
    }

    fn push_values(&mut self, filter: &Filter) {
        match filter.operator {
            Operator::Like => {
                self.builder.push_bind(like_pattern(&to_text(filter.value())));
            }
            Operator::ContainsAny => {
                let values: Vec<Json<Value>> = filter.values.iter().cloned().map(Json).collect();
                self.builder.push_bind(values);
            }
            Operator::In | Operator::Exclude => {
                self.builder.push("(");
                for (i, value) in filter.values.iter().enumerate() {
                    if i != 0 {
                        self.builder.push(", ");
                    }
                    self.push_value(&filter.field, value);
                }
                self.builder.push(")");
            }
            _ => self.push_value(&filter.field, filter.value()),
        }
    }

    fn push_value(&mut self, field: &str, value: &Value) {
        match field {
            "id" => {
                self.builder.push_bind(to_text(value));
            }
            "last_modified" => {
                self.builder.push_bind(to_int(value));
            }
            _ => {
                self.builder.push_bind(Json(value.clone()));
            }
        }
    }
}
