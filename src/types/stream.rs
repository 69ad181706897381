//! Stream types

use serde::{Deserialize, Serialize};
use serde_json::Value;

fn is_false(val: &bool) -> bool {
    !*val
}

/// A node of a user's stream tree
///
/// A deleted stream is a tombstone: only `id` and `deleted` are set.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stream {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub trashed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_by: Option<String>,
    /// Materialized from `parentId`, never stored
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Stream>,
    /// Set instead of `children` when children were not expanded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children_hidden: Option<bool>,
}

impl Stream {
    /// Create a new root stream
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Set the parent stream
    pub fn with_parent(mut self, parent_id: &str) -> Self {
        self.parent_id = Some(parent_id.to_string());
        self
    }

    /// Set the author of the creation
    pub fn with_author(mut self, author: &str) -> Self {
        self.created_by = Some(author.to_string());
        self
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.is_some()
    }

    /// Tombstone left after deleting stream `id`
    pub fn tombstone(id: &str, deleted: f64) -> Self {
        Self {
            id: id.to_string(),
            deleted: Some(deleted),
            ..Default::default()
        }
    }

    /// Copy without its materialized children
    pub(crate) fn without_children(&self) -> Self {
        Self {
            children: Vec::new(),
            children_hidden: None,
            ..self.clone()
        }
    }

    /// Depth-first search for `id` in this subtree
    pub fn find(&self, id: &str) -> Option<&Stream> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(id))
    }

    /// Ids of this stream and all its descendants
    pub fn subtree_ids(&self) -> Vec<String> {
        let mut ids = vec![self.id.clone()];
        for child in &self.children {
            ids.extend(child.subtree_ids());
        }
        ids
    }
}

/// Changes applied by a stream update
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamUpdate {
    pub name: Option<String>,
    /// `Some(None)` moves the stream to the root
    pub parent_id: Option<Option<String>>,
    pub trashed: Option<bool>,
    pub client_data: Option<Option<Value>>,
    pub modified_by: Option<String>,
}

impl StreamUpdate {
    pub(crate) fn apply(&self, stream: &mut Stream, now: f64) {
        if let Some(name) = &self.name {
            stream.name = name.clone();
        }
        if let Some(parent_id) = &self.parent_id {
            stream.parent_id = parent_id.clone();
        }
        if let Some(trashed) = self.trashed {
            stream.trashed = trashed;
        }
        if let Some(client_data) = &self.client_data {
            stream.client_data = client_data.clone();
        }
        stream.modified = Some(now);
        if let Some(author) = &self.modified_by {
            stream.modified_by = Some(author.clone());
        }
    }
}

/// Parameters of a stream tree read
#[derive(Debug, Clone, PartialEq)]
pub struct StreamsQuery {
    /// `*` for the whole forest, otherwise the root of the returned subtree
    pub id: String,
    /// Include children, or mark them with `childrenHidden`
    pub expand_children: bool,
    pub include_trashed: bool,
    /// Append tombstones (all of them, or those deleted at/after the timestamp)
    pub include_deletions: bool,
    pub deletions_since: Option<f64>,
}

impl Default for StreamsQuery {
    fn default() -> Self {
        Self {
            id: "*".to_string(),
            expand_children: true,
            include_trashed: false,
            include_deletions: false,
            deletions_since: None,
        }
    }
}

impl StreamsQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn subtree(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Self::default()
        }
    }

    pub fn with_trashed(mut self) -> Self {
        self.include_trashed = true;
        self
    }

    pub fn with_deletions(mut self) -> Self {
        self.include_deletions = true;
        self
    }

    pub fn without_children(mut self) -> Self {
        self.expand_children = false;
        self
    }
}
