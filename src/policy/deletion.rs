//! Deletion modes
//!
//! Each mode carries a fixed table of the fields stripped from a deleted
//! event's tombstone.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::integrity::set_event_integrity;
use crate::backend::Document;
use crate::error::StoreError;

/// Content-ish and authoring fields
const KEEP_AUTHORS_STRIPPED: &[&str] = &[
    "streamIds",
    "time",
    "endTime",
    "type",
    "content",
    "description",
    "clientData",
    "attachments",
    "trashed",
    "created",
    "createdBy",
];

const KEEP_NOTHING_STRIPPED: &[&str] = &[
    "streamIds",
    "time",
    "endTime",
    "type",
    "content",
    "description",
    "clientData",
    "attachments",
    "trashed",
    "created",
    "createdBy",
    "integrity",
    "modified",
    "modifiedBy",
];

/// What survives an event deletion, configured once per deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeletionMode {
    /// Tombstone keeps every field, integrity is recomputed
    KeepEverything,
    /// Tombstone and history rows keep id, modification author and integrity
    KeepAuthors,
    /// Tombstone keeps only id and deletion time; history and files are purged
    #[default]
    KeepNothing,
}

impl DeletionMode {
    /// Fields removed from the tombstone
    pub fn stripped_fields(self) -> &'static [&'static str] {
        match self {
            DeletionMode::KeepEverything => &[],
            DeletionMode::KeepAuthors => KEEP_AUTHORS_STRIPPED,
            DeletionMode::KeepNothing => KEEP_NOTHING_STRIPPED,
        }
    }

    /// Whether history rows are removed on deletion
    pub fn purges_history(self) -> bool {
        match self {
            DeletionMode::KeepEverything | DeletionMode::KeepAuthors => false,
            DeletionMode::KeepNothing => true,
        }
    }

    /// Whether surviving history rows are stripped like the tombstone
    pub fn strips_history(self) -> bool {
        match self {
            DeletionMode::KeepAuthors => true,
            DeletionMode::KeepEverything | DeletionMode::KeepNothing => false,
        }
    }

    /// Turn a live event document into its tombstone
    pub fn apply_to_tombstone(self, doc: &mut Document, deleted: f64) -> Result<(), StoreError> {
        self.strip(doc);
        doc.insert("deleted".to_string(), deleted.into());
        if self == DeletionMode::KeepEverything {
            set_event_integrity(doc)?;
        }
        Ok(())
    }

    /// Strip a history row of a deleted event
    pub fn apply_to_history_row(self, doc: &mut Document) {
        if self.strips_history() {
            self.strip(doc);
        }
    }

    fn strip(self, doc: &mut Document) {
        for field in self.stripped_fields() {
            doc.remove(*field);
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeletionMode::KeepEverything => "keep-everything",
            DeletionMode::KeepAuthors => "keep-authors",
            DeletionMode::KeepNothing => "keep-nothing",
        }
    }
}

impl fmt::Display for DeletionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeletionMode {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keep-everything" => Ok(DeletionMode::KeepEverything),
            "keep-authors" => Ok(DeletionMode::KeepAuthors),
            "keep-nothing" => Ok(DeletionMode::KeepNothing),
            other => Err(StoreError::InvalidOperation(format!(
                "unknown deletion mode '{}'",
                other
            ))),
        }
    }
}
