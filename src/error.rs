//! Error types for the data store
//!
//! Backend- and filesystem-specific failures are classified here so that
//! callers only ever see the domain kinds below.

use std::fmt;

use thiserror::Error;

use crate::attachments::AttachmentError;
use crate::backend::BackendError;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Kind of resource an error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Stream,
    Event,
    Attachment,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Stream => write!(f, "stream"),
            ResourceKind::Event => write!(f, "event"),
            ResourceKind::Attachment => write!(f, "attachment"),
        }
    }
}

/// Domain errors exposed by the store
#[derive(Debug, Error)]
pub enum StoreError {
    /// Duplicate id or unique field combination
    #[error("{resource} already exists ({conflict})")]
    ItemAlreadyExists {
        resource: ResourceKind,
        /// Human-readable description of the conflicting keys, e.g. `id=abc`
        conflict: String,
    },

    /// A referenced item (e.g. a parent stream) does not exist
    #[error("unknown referenced {resource} '{id}'")]
    UnknownReferencedResource { resource: ResourceKind, id: String },

    /// The item targeted by an update or delete does not exist
    #[error("unknown {resource} '{id}'")]
    UnknownResource { resource: ResourceKind, id: String },

    /// The requested change is structurally invalid
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A schema migration failed; startup must not proceed
    #[error("migration {version} failed: {source}")]
    MigrationFailed {
        version: String,
        #[source]
        source: Box<StoreError>,
    },

    /// Opaque wrapper for any unclassified backend or I/O failure
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl StoreError {
    /// Stable identifier of the error kind
    pub fn id(&self) -> &'static str {
        match self {
            StoreError::ItemAlreadyExists { .. } => "item-already-exists",
            StoreError::UnknownReferencedResource { .. } => "unknown-referenced-resource",
            StoreError::UnknownResource { .. } => "unknown-resource",
            StoreError::InvalidOperation(_) => "invalid-operation",
            StoreError::MigrationFailed { .. } => "migration-failed",
            StoreError::Unexpected(_) => "unexpected-error",
        }
    }

    pub(crate) fn already_exists(resource: ResourceKind, conflict: impl Into<String>) -> Self {
        StoreError::ItemAlreadyExists {
            resource,
            conflict: conflict.into(),
        }
    }

    pub(crate) fn unknown(resource: ResourceKind, id: impl Into<String>) -> Self {
        StoreError::UnknownResource {
            resource,
            id: id.into(),
        }
    }

    pub(crate) fn unknown_referenced(resource: ResourceKind, id: impl Into<String>) -> Self {
        StoreError::UnknownReferencedResource {
            resource,
            id: id.into(),
        }
    }
}

// Duplicate-key errors need the index name to be classified, which only the
// owning store knows; anything reaching this conversion is unexpected.
impl From<BackendError> for StoreError {
    fn from(e: BackendError) -> Self {
        StoreError::Unexpected(e.to_string())
    }
}

impl From<AttachmentError> for StoreError {
    fn from(e: AttachmentError) -> Self {
        match e {
            AttachmentError::NotFound { file_id, .. } => {
                StoreError::unknown(ResourceKind::Attachment, file_id)
            }
            other => StoreError::Unexpected(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Unexpected(format!("JSON error: {}", e))
    }
}
