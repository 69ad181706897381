//! Stores and the data store facade
//!
//! ```text
//!                   ┌──────────────┐
//!                   │  DataStore   │ open(): indexes, migrations
//!                   └──────┬───────┘
//!        ┌─────────────────┼────────────────────┐
//! ┌──────▼──────┐   ┌──────▼──────┐   ┌─────────▼──────────┐
//! │ StreamStore │   │ EventStore  │   │ TransactionManager │
//! │  + cache    │   │ + files     │   │                    │
//! └──────┬──────┘   └──────┬──────┘   └─────────┬──────────┘
//!        └─────────────────┴──────► DocumentBackend ◄───┘
//! ```

mod events;
pub mod stream_cache;
mod streams;
mod transactions;

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

pub use events::{EventStore, EventStoreSettings, EventStream, DEFAULT_HIGH_WATER_MARK};
pub use stream_cache::{CachePolicy, StreamTreeCache, UserStreams};
pub use streams::StreamStore;
pub use transactions::{Transaction, TransactionManager};

use crate::attachments::{AttachmentStore, FsAttachmentStore};
use crate::backend::{
    DocumentBackend, Filter, IndexSpec, JsonlBackend, MemoryBackend, EVENTS_COLLECTION,
    STREAMS_COLLECTION,
};
use crate::config::{BackendKind, StoreConfig};
use crate::error::StoreResult;
use crate::migration::{MigrationReport, MigrationRunner, VersionLedger};
use crate::types::USER_ID_FIELD;

/// Unique stream id per user
pub(crate) const STREAMS_ID_INDEX: &str = "streams_user_id_unique";
/// Unique sibling name per user; tombstones carry no name
pub(crate) const STREAMS_NAME_INDEX: &str = "streams_user_parent_name_unique";
/// Unique event id per user, history rows included
pub(crate) const EVENTS_ID_INDEX: &str = "events_user_id_unique";

/// Restrict a filter to documents that are not tombstones
pub(crate) fn live(filter: Filter) -> Filter {
    filter.and(Filter::is_null("deleted"))
}

/// Create the indexes the stores rely on; safe to call repeatedly
pub async fn ensure_indexes(backend: &dyn DocumentBackend) -> StoreResult<()> {
    backend
        .create_index(
            STREAMS_COLLECTION,
            IndexSpec::new(STREAMS_ID_INDEX, &[USER_ID_FIELD, "id"]).unique(),
        )
        .await?;
    backend
        .create_index(
            STREAMS_COLLECTION,
            IndexSpec::new(STREAMS_NAME_INDEX, &[USER_ID_FIELD, "parentId", "name"])
                .unique()
                .partial(Filter::exists("name")),
        )
        .await?;
    backend
        .create_index(
            EVENTS_COLLECTION,
            IndexSpec::new(EVENTS_ID_INDEX, &[USER_ID_FIELD, "id"]).unique(),
        )
        .await?;
    backend
        .create_index(
            EVENTS_COLLECTION,
            IndexSpec::new("events_user_head", &[USER_ID_FIELD, "headId"]),
        )
        .await?;
    Ok(())
}

/// Per-user storage figures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageInfo {
    pub events: usize,
    pub streams: usize,
    pub attachments_bytes: u64,
}

/// Entry point wiring a backend, the stores and the migrations together
pub struct DataStore {
    backend: Arc<dyn DocumentBackend>,
    streams: StreamStore,
    events: EventStore,
    transactions: TransactionManager,
    ledger: VersionLedger,
    migration_report: MigrationReport,
}

impl DataStore {
    /// Open the configured backend, create indexes and run pending migrations
    pub async fn open(config: &StoreConfig) -> StoreResult<Self> {
        let backend: Arc<dyn DocumentBackend> = match config.backend {
            BackendKind::Memory => Arc::new(MemoryBackend::new()),
            BackendKind::Jsonl => Arc::new(JsonlBackend::open(&config.data_dir)?),
        };
        let attachments: Arc<dyn AttachmentStore> =
            Arc::new(FsAttachmentStore::new(config.attachments_path()));
        Self::with_parts(backend, attachments, config).await
    }

    /// Open over an existing backend and attachment store
    pub async fn with_parts(
        backend: Arc<dyn DocumentBackend>,
        attachments: Arc<dyn AttachmentStore>,
        config: &StoreConfig,
    ) -> StoreResult<Self> {
        ensure_indexes(backend.as_ref()).await?;
        let migration_report = MigrationRunner::new(backend.clone()).run().await?;

        let cache = Arc::new(StreamTreeCache::new(config.cache_policy()));
        let store = Self {
            streams: StreamStore::new(backend.clone(), cache),
            events: EventStore::new(backend.clone(), attachments, config.event_settings()),
            transactions: TransactionManager::new(backend.clone()),
            ledger: VersionLedger::new(backend.clone()),
            backend,
            migration_report,
        };
        info!(
            backend = store.backend.name(),
            deletion_mode = %config.deletion_mode,
            history = config.history,
            "data store opened"
        );
        Ok(store)
    }

    pub fn backend(&self) -> &Arc<dyn DocumentBackend> {
        &self.backend
    }

    pub fn streams(&self) -> &StreamStore {
        &self.streams
    }

    pub fn events(&self) -> &EventStore {
        &self.events
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    pub fn ledger(&self) -> &VersionLedger {
        &self.ledger
    }

    /// What the migration runner did when this store was opened
    pub fn migration_report(&self) -> &MigrationReport {
        &self.migration_report
    }

    pub async fn storage_info(&self, user_id: &str) -> StoreResult<StorageInfo> {
        Ok(StorageInfo {
            events: self.events.count(user_id).await?,
            streams: self.streams.count(user_id).await?,
            attachments_bytes: self.events.attachments_size(user_id).await?,
        })
    }

    /// Remove everything a user owns, attachment files included
    pub async fn remove_user(&self, user_id: &str) -> StoreResult<()> {
        let events = self.events.remove_all(user_id).await?;
        let streams = self.streams.remove_all(user_id).await?;
        info!(user_id, events, streams, "user data removed");
        Ok(())
    }
}
