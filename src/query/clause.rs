//! Query IR clauses

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A typed, backend-neutral query condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum QueryClause {
    Equal { field: String, value: Value },
    Greater { field: String, value: Value },
    GreaterOrEqual { field: String, value: Value },
    LowerOrEqual { field: String, value: Value },
    /// Field is at least `value`, or unset
    GreaterOrEqualOrNull { field: String, value: Value },
    /// Event types; entries ending in `/*` match the whole class
    TypesList { values: Vec<String> },
    /// OR-ed stream selection blocks
    StreamsQuery { blocks: Vec<StreamsSelection> },
}

impl QueryClause {
    pub fn equal(field: &str, value: impl Into<Value>) -> Self {
        QueryClause::Equal {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn greater(field: &str, value: impl Into<Value>) -> Self {
        QueryClause::Greater {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn greater_or_equal(field: &str, value: impl Into<Value>) -> Self {
        QueryClause::GreaterOrEqual {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn lower_or_equal(field: &str, value: impl Into<Value>) -> Self {
        QueryClause::LowerOrEqual {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn greater_or_equal_or_null(field: &str, value: impl Into<Value>) -> Self {
        QueryClause::GreaterOrEqualOrNull {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn types_list<S: AsRef<str>>(values: &[S]) -> Self {
        QueryClause::TypesList {
            values: values.iter().map(|v| v.as_ref().to_string()).collect(),
        }
    }

    pub fn streams(blocks: Vec<StreamsSelection>) -> Self {
        QueryClause::StreamsQuery { blocks }
    }
}

/// Set expression over an event's `streamIds`
///
/// All parts must hold: `any` intersects `streamIds` (`*` lifts the
/// constraint), each group of `all` intersects `streamIds`, and no id of
/// `not` is present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamsSelection {
    #[serde(default)]
    pub any: Vec<String>,
    #[serde(default)]
    pub all: Vec<Vec<String>>,
    #[serde(default)]
    pub not: Vec<String>,
}

impl StreamsSelection {
    pub fn any<S: AsRef<str>>(ids: &[S]) -> Self {
        Self {
            any: ids.iter().map(|s| s.as_ref().to_string()).collect(),
            ..Default::default()
        }
    }

    /// Add a group of which at least one id must be present
    pub fn and_any<S: AsRef<str>>(mut self, ids: &[S]) -> Self {
        self.all.push(ids.iter().map(|s| s.as_ref().to_string()).collect());
        self
    }

    pub fn and_not<S: AsRef<str>>(mut self, ids: &[S]) -> Self {
        self.not.extend(ids.iter().map(|s| s.as_ref().to_string()));
        self
    }

    pub fn is_wildcard(&self) -> bool {
        self.any.iter().any(|id| id == "*")
    }
}
