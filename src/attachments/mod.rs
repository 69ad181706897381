//! Attachment file storage
//!
//! Files are stored outside the document backend, under
//! `<root>/<userId>/<eventId>/<fileId>`. The event store owns the metadata and
//! keeps the two in step.

mod fs;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncRead;

pub use fs::FsAttachmentStore;

/// Readable attachment payload
pub type AttachmentReader = Box<dyn AsyncRead + Send + Unpin>;

/// Errors raised by attachment storage
#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("attachment {file_id} of event {event_id} not found")]
    NotFound { event_id: String, file_id: String },

    /// A path component would escape the storage root
    #[error("invalid path component '{0}'")]
    InvalidName(String),

    /// Payload digest differs from the declared one
    #[error("integrity mismatch: expected {expected}, computed {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("attachment I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type AttachmentResult<T> = Result<T, AttachmentError>;

/// A file written by [`AttachmentStore::save`]
#[derive(Debug, Clone, PartialEq)]
pub struct SavedFile {
    pub id: String,
    pub size: u64,
    /// `sha256-<base64>` of the payload
    pub integrity: String,
}

/// File-backed attachment storage
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    /// Stream a payload to storage under a generated file id
    async fn save(
        &self,
        user_id: &str,
        event_id: &str,
        payload: &mut (dyn AsyncRead + Send + Unpin),
    ) -> AttachmentResult<SavedFile>;

    async fn read(&self, user_id: &str, event_id: &str, file_id: &str) -> AttachmentResult<AttachmentReader>;

    async fn delete(&self, user_id: &str, event_id: &str, file_id: &str) -> AttachmentResult<()>;

    async fn delete_all_for_event(&self, user_id: &str, event_id: &str) -> AttachmentResult<()>;

    async fn delete_all_for_user(&self, user_id: &str) -> AttachmentResult<()>;

    /// Ids of the files stored for an event, sorted
    async fn list_file_ids(&self, user_id: &str, event_id: &str) -> AttachmentResult<Vec<String>>;

    /// Total bytes stored for a user
    async fn usage_bytes(&self, user_id: &str) -> AttachmentResult<u64>;
}
