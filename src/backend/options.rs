//! Options and write descriptions passed to a document backend

use serde_json::Value;

use super::{Document, Filter};

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// One sort key
#[derive(Debug, Clone, PartialEq)]
pub struct SortKey {
    pub field: String,
    pub order: SortOrder,
}

impl SortKey {
    pub fn ascending(field: &str) -> Self {
        Self {
            field: field.to_string(),
            order: SortOrder::Ascending,
        }
    }

    pub fn descending(field: &str) -> Self {
        Self {
            field: field.to_string(),
            order: SortOrder::Descending,
        }
    }
}

/// Options for find operations
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub sort: Vec<SortKey>,
    pub skip: usize,
    pub limit: Option<usize>,
    /// Only keep these top-level fields when set
    pub projection: Option<Vec<String>>,
}

impl FindOptions {
    pub fn sorted_by(mut self, key: SortKey) -> Self {
        self.sort.push(key);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Field-level update: `$set` then `$unset`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    pub set: Document,
    pub unset: Vec<String>,
}

impl Update {
    pub fn set(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.set.insert(field.to_string(), value.into());
        self
    }

    pub fn unset(mut self, field: &str) -> Self {
        self.unset.push(field.to_string());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.unset.is_empty()
    }

    /// Apply to a document in place
    pub fn apply(&self, doc: &mut Document) {
        for (field, value) in &self.set {
            doc.insert(field.clone(), value.clone());
        }
        for field in &self.unset {
            doc.remove(field);
        }
    }
}

/// Index definition; only unique indexes are enforced
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSpec {
    pub name: String,
    pub fields: Vec<String>,
    pub unique: bool,
    /// Only documents matching this filter participate in the index
    pub partial: Option<Filter>,
}

impl IndexSpec {
    pub fn new(name: &str, fields: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
            unique: false,
            partial: None,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn partial(mut self, filter: Filter) -> Self {
        self.partial = Some(filter);
        self
    }
}

/// One operation of a bulk write
#[derive(Debug, Clone)]
pub enum WriteOp {
    InsertOne(Document),
    ReplaceOne {
        filter: Filter,
        document: Document,
        upsert: bool,
    },
    UpdateMany {
        filter: Filter,
        update: Update,
    },
    DeleteMany(Filter),
}

/// Counters returned by a bulk write
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkWriteResult {
    pub inserted: usize,
    pub matched: usize,
    pub modified: usize,
    pub deleted: usize,
    pub upserted: usize,
}
