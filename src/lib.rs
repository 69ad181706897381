//! Userdata Store
//!
//! Multi-tenant storage for per-user streams and events, with attachment
//! files, deletion tombstones, event history and schema migrations.
//!
//! # Features
//!
//! - **Stream trees**: per-user hierarchies served from a tree cache
//! - **Events**: time-windowed queries compiled to backend filters, streamed
//!   with bounded buffering
//! - **Deletion modes**: keep everything, keep authors, or keep nothing
//! - **History**: optional snapshots of every event version
//! - **Transactions**: multi-store atomic units of work
//! - **Migrations**: versioned data layout upgrades at startup
//!
//! # Modules
//!
//! - `backend`: Document backends (in-memory, JSONL)
//! - `types`: Streams, events and attachments
//! - `query`: Event query clauses and their compiler
//! - `policy`: Deletion modes, integrity and history snapshots
//! - `attachments`: Attachment file storage
//! - `store`: Stream / event stores, transactions and the [`DataStore`] facade
//! - `migration`: Version ledger and migration runner
//! - `config`: Store configuration
//!
//! # Example
//!
//! ```no_run
//! use userdata_store::{DataStore, Event, EventsQuery, Stream, StoreConfig, StreamsSelection};
//!
//! # async fn run() -> userdata_store::StoreResult<()> {
//! let store = DataStore::open(&StoreConfig::jsonl("./data")).await?;
//! store.streams().create("alice", Stream::new("diary", "Diary")).await?;
//! store
//!     .events()
//!     .create("alice", Event::new(&["diary"], "note/txt", "hello".into(), 1_700_000_000.0))
//!     .await?;
//! let events = store
//!     .events()
//!     .get("alice", &EventsQuery::new().streams(vec![StreamsSelection::any(&["diary"])]))
//!     .await?;
//! assert_eq!(events.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod attachments;
pub mod backend;
pub mod config;
pub mod error;
pub mod migration;
pub mod policy;
pub mod query;
pub mod store;
pub mod types;
pub mod utils;

// Re-export commonly used items at crate root
pub use config::{BackendKind, StoreConfig};
pub use error::{ResourceKind, StoreError, StoreResult};
pub use policy::DeletionMode;
pub use query::{EventsQuery, QueryClause, StreamsSelection};
pub use store::{
    CachePolicy, DataStore, EventStore, EventStoreSettings, StorageInfo, StreamStore,
    StreamTreeCache, Transaction, TransactionManager,
};
pub use types::{
    Attachment, Event, EventDeletion, EventUpdate, NewAttachment, Stream, StreamUpdate,
    StreamsQuery,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
