//! Backend-native filter expressions
//!
//! A small document-database query language with array-aware matching:
//! a comparison against an array field matches when any element matches.

use std::cmp::Ordering;

use serde_json::Value;

use super::Document;

/// Filter over documents
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// All sub-filters match (empty matches everything)
    And(Vec<Filter>),
    /// At least one sub-filter matches (empty matches nothing)
    Or(Vec<Filter>),
    Not(Box<Filter>),
    /// Field equals value; `Eq(f, Null)` matches missing or null
    Eq(String, Value),
    Gt(String, Value),
    Gte(String, Value),
    Lt(String, Value),
    Lte(String, Value),
    /// Field equals one of the values
    In(String, Vec<Value>),
    /// Field equals none of the values (missing fields match)
    Nin(String, Vec<Value>),
    /// Array field contains every value
    All(String, Vec<Value>),
    /// Field is present (possibly null)
    Exists(String),
    /// Field is missing or null
    IsNull(String),
    /// String field starts with prefix
    Prefix(String, String),
}

impl Filter {
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Filter::Eq(field.to_string(), value.into())
    }

    pub fn is_null(field: &str) -> Self {
        Filter::IsNull(field.to_string())
    }

    pub fn exists(field: &str) -> Self {
        Filter::Exists(field.to_string())
    }

    /// Filter matching every document
    pub fn all() -> Self {
        Filter::And(Vec::new())
    }

    /// Combine with another filter, flattening nested ANDs
    pub fn and(self, other: Filter) -> Self {
        match (self, other) {
            (Filter::And(mut a), Filter::And(b)) => {
                a.extend(b);
                Filter::And(a)
            }
            (Filter::And(mut a), other) => {
                a.push(other);
                Filter::And(a)
            }
            (this, Filter::And(mut b)) => {
                b.insert(0, this);
                Filter::And(b)
            }
            (this, other) => Filter::And(vec![this, other]),
        }
    }

    /// Evaluate the filter against a document
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::And(filters) => filters.iter().all(|f| f.matches(doc)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(doc)),
            Filter::Not(inner) => !inner.matches(doc),
            Filter::Eq(field, value) => {
                if value.is_null() {
                    return is_null_or_missing(doc, field);
                }
                any_value(doc, field, |v| v == value)
            }
            Filter::Gt(field, value) => any_value(doc, field, |v| {
                compare_same_type(v, value) == Some(Ordering::Greater)
            }),
            Filter::Gte(field, value) => any_value(doc, field, |v| {
                matches!(
                    compare_same_type(v, value),
                    Some(Ordering::Greater | Ordering::Equal)
                )
            }),
            Filter::Lt(field, value) => any_value(doc, field, |v| {
                compare_same_type(v, value) == Some(Ordering::Less)
            }),
            Filter::Lte(field, value) => any_value(doc, field, |v| {
                matches!(
                    compare_same_type(v, value),
                    Some(Ordering::Less | Ordering::Equal)
                )
            }),
            Filter::In(field, values) => values.iter().any(|value| {
                if value.is_null() {
                    is_null_or_missing(doc, field)
                } else {
                    any_value(doc, field, |v| v == value)
                }
            }),
            Filter::Nin(field, values) => {
                !Filter::In(field.clone(), values.clone()).matches(doc)
            }
            Filter::All(field, values) => match lookup(doc, field) {
                Some(Value::Array(items)) => values.iter().all(|v| items.contains(v)),
                Some(single) => values.iter().all(|v| v == single),
                None => values.is_empty(),
            },
            Filter::Exists(field) => lookup(doc, field).is_some(),
            Filter::IsNull(field) => is_null_or_missing(doc, field),
            Filter::Prefix(field, prefix) => any_value(doc, field, |v| {
                v.as_str().map(|s| s.starts_with(prefix.as_str())).unwrap_or(false)
            }),
        }
    }
}

/// Resolve a (possibly dotted) field path
pub fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut current = doc.get(first)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn is_null_or_missing(doc: &Document, field: &str) -> bool {
    matches!(lookup(doc, field), None | Some(Value::Null))
}

fn any_value<F>(doc: &Document, field: &str, pred: F) -> bool
where
    F: Fn(&Value) -> bool,
{
    match lookup(doc, field) {
        Some(Value::Array(items)) => items.iter().any(&pred),
        Some(value) => pred(value),
        None => false,
    }
}

/// Ordering between two values of the same kind (numbers or strings)
fn compare_same_type(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Total ordering used for sorting: missing/null < bool < numbers < strings < others
pub fn compare_for_sort(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None | Some(Value::Null) => 0,
            Some(Value::Bool(_)) => 1,
            Some(Value::Number(_)) => 2,
            Some(Value::String(_)) => 3,
            Some(_) => 4,
        }
    }
    match (a, b) {
        (Some(x), Some(y)) if rank(a) == rank(b) => {
            compare_same_type(x, y).unwrap_or(Ordering::Equal)
        }
        _ => rank(a).cmp(&rank(b)),
    }
}
