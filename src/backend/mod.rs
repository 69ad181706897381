//! Document backends
//!
//! The stores talk to storage exclusively through [`DocumentBackend`]:
//! collection-level find / insert / update / delete / bulk-write /
//! create-index plus sessions carrying transactions.
//!
//! Two implementations share the same in-memory engine:
//! - [`MemoryBackend`]: volatile, for tests and ephemeral deployments
//! - [`JsonlBackend`]: persists every collection as a JSONL file
//!
//! ```text
//! ┌─────────────┐   Filter / FindOptions   ┌──────────────────┐
//! │ Event/Stream│─────────────────────────►│ DocumentBackend  │
//! │   Store     │                          │ (memory | jsonl) │
//! └─────────────┘                          └────────┬─────────┘
//!                                                   │ journaled writes
//!                                           ┌───────▼────────┐
//!                                           │ Engine + undo  │
//!                                           └────────────────┘
//! ```

mod engine;
pub mod filter;
mod jsonl;
mod memory;
pub mod options;
pub mod session;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

pub use filter::Filter;
pub use jsonl::JsonlBackend;
pub use memory::MemoryBackend;
pub use options::{BulkWriteResult, FindOptions, IndexSpec, SortKey, SortOrder, Update, WriteOp};
pub use session::{current_session, DeferredWork, Session, SessionState, TransactionOptions};

/// A stored document
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Lazily evaluated sequence of documents
pub type DocumentCursor = BoxStream<'static, BackendResult<Document>>;

/// Shared collection holding events and their history rows
pub const EVENTS_COLLECTION: &str = "events";
/// Shared collection holding streams and their tombstones
pub const STREAMS_COLLECTION: &str = "streams";
/// Migration ledger collection
pub const VERSIONS_COLLECTION: &str = "versions";

/// Number of documents a cursor fetches per batch
pub const CURSOR_BATCH_SIZE: usize = 100;

/// Errors raised by document backends
#[derive(Debug, Error)]
pub enum BackendError {
    /// A unique index rejected the write
    #[error("duplicate key in {collection} for index {index}: {key}")]
    DuplicateKey {
        collection: String,
        index: String,
        key: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid session usage (double commit, nested start...)
    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("internal backend error: {0}")]
    Internal(String),
}

/// Collection-oriented document database
#[async_trait]
pub trait DocumentBackend: Send + Sync {
    /// Short backend name, for logs
    fn name(&self) -> &'static str;

    async fn create_index(&self, collection: &str, index: IndexSpec) -> BackendResult<()>;

    async fn list_collections(&self) -> BackendResult<Vec<String>>;

    /// Returns whether the collection existed
    async fn drop_collection(&self, collection: &str) -> BackendResult<bool>;

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> BackendResult<Vec<Document>>;

    async fn find_one(&self, collection: &str, filter: &Filter) -> BackendResult<Option<Document>> {
        let options = FindOptions::default().with_limit(1);
        Ok(self.find(collection, filter, &options).await?.into_iter().next())
    }

    /// Lazy cursor: matches are resolved up front, documents fetched in batches
    fn find_cursor(&self, collection: &str, filter: Filter, options: FindOptions) -> DocumentCursor;

    async fn count(&self, collection: &str, filter: &Filter) -> BackendResult<usize>;

    async fn insert_one(&self, collection: &str, document: Document) -> BackendResult<()> {
        self.bulk_write(collection, vec![WriteOp::InsertOne(document)])
            .await
            .map(|_| ())
    }

    /// Replace the first matching document; returns matched + upserted count
    async fn replace_one(
        &self,
        collection: &str,
        filter: Filter,
        document: Document,
        upsert: bool,
    ) -> BackendResult<usize> {
        let result = self
            .bulk_write(
                collection,
                vec![WriteOp::ReplaceOne {
                    filter,
                    document,
                    upsert,
                }],
            )
            .await?;
        Ok(result.matched + result.upserted)
    }

    async fn update_many(&self, collection: &str, filter: Filter, update: Update) -> BackendResult<usize> {
        let result = self
            .bulk_write(collection, vec![WriteOp::UpdateMany { filter, update }])
            .await?;
        Ok(result.modified)
    }

    async fn delete_many(&self, collection: &str, filter: Filter) -> BackendResult<usize> {
        let result = self
            .bulk_write(collection, vec![WriteOp::DeleteMany(filter)])
            .await?;
        Ok(result.deleted)
    }

    /// Ordered bulk write, applied atomically with respect to other writes;
    /// stops at the first failing operation
    async fn bulk_write(&self, collection: &str, ops: Vec<WriteOp>) -> BackendResult<BulkWriteResult>;

    /// Start a session with a transaction; waits for any other transaction
    async fn start_session(&self, options: TransactionOptions) -> BackendResult<Arc<Session>>;

    async fn commit_transaction(&self, session: &Session) -> BackendResult<()>;

    async fn abort_transaction(&self, session: &Session) -> BackendResult<()>;
}
