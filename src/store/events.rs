//! Event store
//!
//! CRUD over events, their history rows and attachments. Mutations of a head
//! event and its history run atomically; attachment files live in an
//! [`AttachmentStore`] and are kept in step with each event's `attachments`.
//! Inside a caller's transaction, file removals wait for its commit and a
//! newly saved file is discarded if it rolls back.

use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use super::transactions::atomically;
use super::{live, EVENTS_ID_INDEX};
use crate::attachments::{AttachmentError, AttachmentReader, AttachmentStore};
use crate::backend::{
    current_session, BackendError, DeferredWork, Document, DocumentBackend, Filter, FindOptions,
    SortKey, Update, WriteOp, EVENTS_COLLECTION,
};
use crate::error::{ResourceKind, StoreError, StoreResult};
use crate::policy::{history_snapshot, set_event_integrity, DeletionMode};
use crate::query::{compile, EventsQuery};
use crate::types::{
    from_document, to_document, Attachment, Event, EventDeletion, EventUpdate, NewAttachment,
    USER_ID_FIELD,
};
use crate::utils::{generate_id, now_seconds};

/// Default bound on events buffered ahead of a streaming consumer
pub const DEFAULT_HIGH_WATER_MARK: usize = 16;

/// Stream of events produced by [`EventStore::get_streamed`]
pub type EventStream = BoxStream<'static, StoreResult<Event>>;

/// Behaviour fixed per deployment
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EventStoreSettings {
    pub deletion_mode: DeletionMode,
    /// Snapshot events into history rows before each update and delete
    pub history: bool,
    pub high_water_mark: usize,
}

impl Default for EventStoreSettings {
    fn default() -> Self {
        Self {
            deletion_mode: DeletionMode::default(),
            history: false,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
        }
    }
}

/// Store for events
pub struct EventStore {
    backend: Arc<dyn DocumentBackend>,
    attachments: Arc<dyn AttachmentStore>,
    settings: EventStoreSettings,
}

fn by_id(user_id: &str, id: &str) -> Filter {
    Filter::eq(USER_ID_FIELD, user_id).and(Filter::eq("id", id))
}

/// Head event (not a history row, not deleted)
fn head(user_id: &str, id: &str) -> Filter {
    live(by_id(user_id, id)).and(Filter::is_null("headId"))
}

fn history_rows(user_id: &str, head_id: &str) -> Filter {
    Filter::eq(USER_ID_FIELD, user_id).and(Filter::eq("headId", head_id))
}

fn classify(err: BackendError, event_id: &str) -> StoreError {
    match err {
        BackendError::DuplicateKey { index, .. } if index == EVENTS_ID_INDEX => {
            StoreError::already_exists(ResourceKind::Event, format!("id={}", event_id))
        }
        other => other.into(),
    }
}

fn normalize_stream_ids(event: &mut Event) -> StoreResult<()> {
    let mut seen = std::collections::HashSet::new();
    event.stream_ids.retain(|id| seen.insert(id.clone()));
    if event.stream_ids.is_empty() {
        return Err(StoreError::InvalidOperation(
            "event must belong to at least one stream".to_string(),
        ));
    }
    Ok(())
}

/// Run `work` now, or once the ambient transaction commits
async fn after_commit(work: DeferredWork) {
    match current_session() {
        Some(session) => session.defer_until_commit(work),
        None => work.await,
    }
}

/// Serialize with a freshly computed integrity, updating `event` to match
fn sealed_document(user_id: &str, event: &mut Event) -> StoreResult<Document> {
    let mut doc = to_document(user_id, event)?;
    set_event_integrity(&mut doc)?;
    event.integrity = doc.get("integrity").and_then(|v| v.as_str()).map(str::to_string);
    Ok(doc)
}

impl EventStore {
    pub fn new(
        backend: Arc<dyn DocumentBackend>,
        attachments: Arc<dyn AttachmentStore>,
        settings: EventStoreSettings,
    ) -> Self {
        Self {
            backend,
            attachments,
            settings,
        }
    }

    pub fn settings(&self) -> EventStoreSettings {
        self.settings
    }

    /// Create an event; generates the id when empty
    pub async fn create(&self, user_id: &str, mut event: Event) -> StoreResult<Event> {
        if event.id.is_empty() {
            event.id = generate_id();
        }
        normalize_stream_ids(&mut event)?;
        if !event.attachments.is_empty() {
            return Err(StoreError::InvalidOperation(
                "attachments are added after creation".to_string(),
            ));
        }
        let now = now_seconds();
        event.head_id = None;
        event.deleted = None;
        event.created = now;
        event.modified = now;
        if event.modified_by.is_empty() {
            event.modified_by = event.created_by.clone();
        }

        let doc = sealed_document(user_id, &mut event)?;
        self.backend
            .insert_one(EVENTS_COLLECTION, doc)
            .await
            .map_err(|e| classify(e, &event.id))?;
        debug!(user_id, event_id = %event.id, "created event");
        Ok(event)
    }

    /// Live head event by id
    pub async fn get_one(&self, user_id: &str, id: &str) -> StoreResult<Option<Event>> {
        let doc = self.backend.find_one(EVENTS_COLLECTION, &head(user_id, id)).await?;
        doc.map(from_document).transpose()
    }

    async fn require_head(&self, user_id: &str, id: &str) -> StoreResult<Document> {
        self.backend
            .find_one(EVENTS_COLLECTION, &head(user_id, id))
            .await?
            .ok_or_else(|| StoreError::unknown(ResourceKind::Event, id))
    }

    pub async fn get(&self, user_id: &str, query: &EventsQuery) -> StoreResult<Vec<Event>> {
        let compiled = compile(user_id, query);
        let docs = self
            .backend
            .find(EVENTS_COLLECTION, &compiled.filter, &compiled.options)
            .await?;
        docs.into_iter().map(from_document).collect()
    }

    /// Same results as [`get`](Self::get), pulled lazily
    ///
    /// A fetch task feeds a bounded channel, so at most `high_water_mark`
    /// events wait for the consumer. A backend error is yielded as the last
    /// item.
    pub fn get_streamed(&self, user_id: &str, query: &EventsQuery) -> EventStream {
        let compiled = compile(user_id, query);
        let mut cursor = self
            .backend
            .find_cursor(EVENTS_COLLECTION, compiled.filter, compiled.options);
        let (tx, rx) = mpsc::channel(self.settings.high_water_mark.max(1));

        tokio::spawn(async move {
            while let Some(item) = cursor.next().await {
                let item = item.map_err(StoreError::from).and_then(from_document::<Event>);
                let failed = item.is_err();
                if tx.send(item).await.is_err() {
                    debug!("streaming consumer went away");
                    return;
                }
                if failed {
                    return;
                }
            }
        });
        Box::pin(ReceiverStream::new(rx))
    }

    /// History rows of an event, oldest first
    pub async fn get_history(&self, user_id: &str, id: &str) -> StoreResult<Vec<Event>> {
        let mut rows = self.get(user_id, &EventsQuery::new().history_of(id)).await?;
        rows.retain(Event::is_history);
        Ok(rows)
    }

    /// Tombstones of events deleted at or after `since`, most recent first
    pub async fn get_deletions(
        &self,
        user_id: &str,
        since: f64,
        limit: Option<usize>,
    ) -> StoreResult<Vec<EventDeletion>> {
        let filter = Filter::eq(USER_ID_FIELD, user_id)
            .and(Filter::Gte("deleted".to_string(), since.into()))
            .and(Filter::is_null("headId"));
        let options = FindOptions {
            limit,
            ..FindOptions::default().sorted_by(SortKey::descending("deleted"))
        };
        let docs = self.backend.find(EVENTS_COLLECTION, &filter, &options).await?;
        docs.into_iter().map(from_document).collect()
    }

    /// Snapshot `doc` first when history is on, then replace it with `event`
    async fn write_head(&self, user_id: &str, previous: &Document, event: &mut Event) -> StoreResult<()> {
        let mut ops = Vec::with_capacity(2);
        if self.settings.history {
            if let Some(snapshot) = history_snapshot(previous)? {
                ops.push(WriteOp::InsertOne(snapshot));
            }
        }
        ops.push(WriteOp::ReplaceOne {
            filter: head(user_id, &event.id),
            document: sealed_document(user_id, event)?,
            upsert: false,
        });
        let result = self
            .backend
            .bulk_write(EVENTS_COLLECTION, ops)
            .await
            .map_err(|e| classify(e, &event.id))?;
        if result.matched == 0 {
            return Err(StoreError::unknown(ResourceKind::Event, event.id.clone()));
        }
        Ok(())
    }

    async fn update_in_transaction(&self, user_id: &str, id: &str, changes: &EventUpdate) -> StoreResult<Event> {
        let previous = self.require_head(user_id, id).await?;
        let mut event: Event = from_document(previous.clone())?;
        changes.apply(&mut event, now_seconds());
        normalize_stream_ids(&mut event)?;
        self.write_head(user_id, &previous, &mut event).await?;
        Ok(event)
    }

    /// Merge `changes` into an event
    pub async fn update(&self, user_id: &str, id: &str, changes: EventUpdate) -> StoreResult<Event> {
        let event = atomically(&self.backend, self.update_in_transaction(user_id, id, &changes)).await?;
        debug!(user_id, event_id = id, "updated event");
        Ok(event)
    }

    /// Apply the same changes to every head event matching `query`
    pub async fn update_many(
        &self,
        user_id: &str,
        query: &EventsQuery,
        changes: EventUpdate,
    ) -> StoreResult<Vec<Event>> {
        let ids_query = query.clone().ids_only();
        atomically(&self.backend, async {
            let ids = self.get(user_id, &ids_query).await?;
            let mut updated = Vec::with_capacity(ids.len());
            for target in ids {
                updated.push(self.update_in_transaction(user_id, &target.id, &changes).await?);
            }
            Ok::<_, StoreError>(updated)
        })
        .await
    }

    /// Delete an event following the deletion mode
    pub async fn delete(&self, user_id: &str, id: &str) -> StoreResult<EventDeletion> {
        let mode = self.settings.deletion_mode;
        let (tombstone, attachments) = atomically(&self.backend, async {
            let previous = self.require_head(user_id, id).await?;
            let event: Event = from_document(previous.clone())?;

            let mut ops = Vec::new();
            if self.settings.history && !mode.purges_history() {
                if let Some(snapshot) = history_snapshot(&previous)? {
                    ops.push(WriteOp::InsertOne(snapshot));
                }
            }
            let mut tombstone = previous.clone();
            mode.apply_to_tombstone(&mut tombstone, now_seconds())?;
            ops.push(WriteOp::ReplaceOne {
                filter: head(user_id, id),
                document: tombstone.clone(),
                upsert: false,
            });
            if mode.purges_history() {
                ops.push(WriteOp::DeleteMany(history_rows(user_id, id)));
            } else if mode.strips_history() {
                ops.push(WriteOp::UpdateMany {
                    filter: history_rows(user_id, id),
                    update: Update {
                        unset: mode.stripped_fields().iter().map(|f| f.to_string()).collect(),
                        ..Update::default()
                    },
                });
            }
            self.backend.bulk_write(EVENTS_COLLECTION, ops).await?;
            Ok::<_, StoreError>((tombstone, event.attachments))
        })
        .await?;

        if !attachments.is_empty() && !tombstone.contains_key("attachments") {
            let files = self.attachments.clone();
            let (owner, event_id) = (user_id.to_string(), id.to_string());
            after_commit(Box::pin(async move {
                if let Err(e) = files.delete_all_for_event(&owner, &event_id).await {
                    warn!(user_id = %owner, event_id = %event_id, error = %e, "failed to delete attachment files");
                }
            }))
            .await;
        }
        info!(user_id, event_id = id, mode = %mode, "deleted event");
        from_document(tombstone)
    }

    /// Store a file and reference it from the event
    ///
    /// The file is written before the event is updated; if the update fails,
    /// or the ambient transaction later rolls back, the file is removed again.
    pub async fn add_attachment(
        &self,
        user_id: &str,
        event_id: &str,
        attachment: NewAttachment,
        payload: &mut (dyn AsyncRead + Send + Unpin),
    ) -> StoreResult<Event> {
        self.require_head(user_id, event_id).await?;
        let saved = self.attachments.save(user_id, event_id, payload).await?;

        if let Some(expected) = &attachment.integrity {
            if *expected != saved.integrity {
                self.discard_file(user_id, event_id, &saved.id).await;
                return Err(AttachmentError::IntegrityMismatch {
                    expected: expected.clone(),
                    actual: saved.integrity,
                }
                .into());
            }
        }

        let entry = Attachment {
            id: saved.id.clone(),
            file_name: attachment.file_name,
            attachment_type: attachment.attachment_type,
            size: saved.size,
            integrity: Some(saved.integrity),
        };
        let outcome = atomically(&self.backend, async {
            let previous = self.require_head(user_id, event_id).await?;
            let mut event: Event = from_document(previous.clone())?;
            event.attachments.push(entry);
            event.modified = now_seconds();
            self.write_head(user_id, &previous, &mut event).await?;
            Ok::<_, StoreError>(event)
        })
        .await;

        match (&outcome, current_session()) {
            (Ok(_), Some(session)) => {
                session.defer_until_abort(self.discard_work(user_id, event_id, &saved.id));
            }
            (Ok(_), None) => {}
            (Err(_), _) => self.discard_file(user_id, event_id, &saved.id).await,
        }
        outcome
    }

    /// Removal of one attachment file, logging rather than failing
    fn discard_work(&self, user_id: &str, event_id: &str, file_id: &str) -> DeferredWork {
        let files = self.attachments.clone();
        let (user_id, event_id, file_id) = (user_id.to_string(), event_id.to_string(), file_id.to_string());
        Box::pin(async move {
            match files.delete(&user_id, &event_id, &file_id).await {
                Ok(()) => {}
                Err(AttachmentError::NotFound { .. }) => {
                    warn!(%user_id, %event_id, %file_id, "attachment file already missing");
                }
                Err(e) => {
                    warn!(%user_id, %event_id, %file_id, error = %e, "failed to discard attachment file");
                }
            }
        })
    }

    async fn discard_file(&self, user_id: &str, event_id: &str, file_id: &str) {
        self.discard_work(user_id, event_id, file_id).await
    }

    /// Drop an attachment's reference, then its file
    ///
    /// The file goes once the reference removal is committed.
    pub async fn remove_attachment(&self, user_id: &str, event_id: &str, file_id: &str) -> StoreResult<Event> {
        let event = atomically(&self.backend, async {
            let previous = self.require_head(user_id, event_id).await?;
            let mut event: Event = from_document(previous.clone())?;
            if event.attachment(file_id).is_none() {
                return Err(StoreError::unknown(ResourceKind::Attachment, file_id));
            }
            event.attachments.retain(|a| a.id != file_id);
            event.modified = now_seconds();
            self.write_head(user_id, &previous, &mut event).await?;
            Ok::<_, StoreError>(event)
        })
        .await?;

        after_commit(self.discard_work(user_id, event_id, file_id)).await;
        Ok(event)
    }

    /// Metadata and content of an attachment
    pub async fn get_attachment(
        &self,
        user_id: &str,
        event_id: &str,
        file_id: &str,
    ) -> StoreResult<(Attachment, AttachmentReader)> {
        let event = self
            .get_one(user_id, event_id)
            .await?
            .ok_or_else(|| StoreError::unknown(ResourceKind::Event, event_id))?;
        let attachment = event
            .attachment(file_id)
            .cloned()
            .ok_or_else(|| StoreError::unknown(ResourceKind::Attachment, file_id))?;
        let reader = self.attachments.read(user_id, event_id, file_id).await?;
        Ok((attachment, reader))
    }

    /// Number of live head events
    pub async fn count(&self, user_id: &str) -> StoreResult<usize> {
        let filter = live(Filter::eq(USER_ID_FIELD, user_id)).and(Filter::is_null("headId"));
        Ok(self.backend.count(EVENTS_COLLECTION, &filter).await?)
    }

    pub async fn attachments_size(&self, user_id: &str) -> StoreResult<u64> {
        Ok(self.attachments.usage_bytes(user_id).await?)
    }

    /// Remove every event, history row and attachment file of a user
    pub async fn remove_all(&self, user_id: &str) -> StoreResult<usize> {
        let removed = self
            .backend
            .delete_many(EVENTS_COLLECTION, Filter::eq(USER_ID_FIELD, user_id))
            .await?;
        match current_session() {
            Some(session) => {
                let files = self.attachments.clone();
                let owner = user_id.to_string();
                session.defer_until_commit(Box::pin(async move {
                    if let Err(e) = files.delete_all_for_user(&owner).await {
                        warn!(user_id = %owner, error = %e, "failed to delete attachment files");
                    }
                }));
            }
            None => self.attachments.delete_all_for_user(user_id).await?,
        }
        info!(user_id, removed, "removed all events");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachments::FsAttachmentStore;
    use crate::backend::{
        BackendResult, BulkWriteResult, DocumentCursor, IndexSpec, MemoryBackend, Session,
        TransactionOptions,
    };
    use crate::store::{ensure_indexes, TransactionManager};
    use async_trait::async_trait;
    use futures::TryStreamExt;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    /// Memory backend whose cursors count pulled documents and can break
    /// at a given position
    struct CountingBackend {
        inner: MemoryBackend,
        pulled: Arc<AtomicUsize>,
        break_at: Option<usize>,
    }

    #[async_trait]
    impl DocumentBackend for CountingBackend {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn create_index(&self, collection: &str, index: IndexSpec) -> BackendResult<()> {
            self.inner.create_index(collection, index).await
        }

        async fn list_collections(&self) -> BackendResult<Vec<String>> {
            self.inner.list_collections().await
        }

        async fn drop_collection(&self, collection: &str) -> BackendResult<bool> {
            self.inner.drop_collection(collection).await
        }

        async fn find(
            &self,
            collection: &str,
            filter: &Filter,
            options: &FindOptions,
        ) -> BackendResult<Vec<Document>> {
            self.inner.find(collection, filter, options).await
        }

        fn find_cursor(&self, collection: &str, filter: Filter, options: FindOptions) -> DocumentCursor {
            let pulled = self.pulled.clone();
            let break_at = self.break_at;
            let cursor = self.inner.find_cursor(collection, filter, options);
            Box::pin(cursor.enumerate().map(move |(n, item)| {
                pulled.fetch_add(1, Ordering::SeqCst);
                if break_at == Some(n) {
                    return Err(BackendError::Internal("cursor broke".to_string()));
                }
                item
            }))
        }

        async fn count(&self, collection: &str, filter: &Filter) -> BackendResult<usize> {
            self.inner.count(collection, filter).await
        }

        async fn bulk_write(&self, collection: &str, ops: Vec<WriteOp>) -> BackendResult<BulkWriteResult> {
            self.inner.bulk_write(collection, ops).await
        }

        async fn start_session(&self, options: TransactionOptions) -> BackendResult<Arc<Session>> {
            self.inner.start_session(options).await
        }

        async fn commit_transaction(&self, session: &Session) -> BackendResult<()> {
            self.inner.commit_transaction(session).await
        }

        async fn abort_transaction(&self, session: &Session) -> BackendResult<()> {
            self.inner.abort_transaction(session).await
        }
    }

    async fn counting_store(
        events: usize,
        high_water_mark: usize,
        break_at: Option<usize>,
    ) -> (EventStore, Arc<AtomicUsize>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let pulled = Arc::new(AtomicUsize::new(0));
        let backend: Arc<dyn DocumentBackend> = Arc::new(CountingBackend {
            inner: MemoryBackend::new(),
            pulled: pulled.clone(),
            break_at,
        });
        let attachments = Arc::new(FsAttachmentStore::new(temp_dir.path()));
        let settings = EventStoreSettings {
            high_water_mark,
            ..Default::default()
        };
        let store = EventStore::new(backend, attachments, settings);
        for i in 0..events {
            store.create("u1", note(&format!("e{}", i), i as f64)).await.unwrap();
        }
        (store, pulled, temp_dir)
    }

    async fn store(settings: EventStoreSettings) -> (EventStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let backend: Arc<dyn DocumentBackend> = Arc::new(MemoryBackend::new());
        ensure_indexes(backend.as_ref()).await.unwrap();
        let attachments = Arc::new(FsAttachmentStore::new(temp_dir.path()));
        (EventStore::new(backend, attachments, settings), temp_dir)
    }

    fn note(id: &str, time: f64) -> Event {
        Event::new(&["diary"], "note/txt", json!("x"), time)
            .with_id(id)
            .with_author("token-1")
    }

    #[tokio::test]
    async fn test_create_sets_integrity_and_rejects_duplicates() {
        let (store, _dir) = store(EventStoreSettings::default()).await;
        let created = store.create("u1", note("e1", 10.0)).await.unwrap();
        assert!(created.integrity.as_deref().unwrap().starts_with("EVENT:0:sha256-"));
        assert_eq!(created.modified_by, "token-1");

        let err = store.create("u1", note("e1", 20.0)).await.unwrap_err();
        assert_eq!(err.id(), "item-already-exists");
        // Ids are scoped per user
        store.create("u2", note("e1", 20.0)).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_requires_streams() {
        let (store, _dir) = store(EventStoreSettings::default()).await;
        let event = Event::new(&[], "note/txt", json!("x"), 1.0);
        assert_eq!(store.create("u1", event).await.unwrap_err().id(), "invalid-operation");

        let dup = Event::new(&["a", "a", "b"], "note/txt", json!("x"), 1.0);
        let created = store.create("u1", dup).await.unwrap();
        assert_eq!(created.stream_ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_update_recomputes_integrity() {
        let (store, _dir) = store(EventStoreSettings::default()).await;
        let created = store.create("u1", note("e1", 10.0)).await.unwrap();
        let updated = store
            .update("u1", "e1", EventUpdate::content(json!("y")).by("token-2"))
            .await
            .unwrap();
        assert_ne!(updated.integrity, created.integrity);
        assert_eq!(updated.modified_by, "token-2");
        assert_eq!(store.get_one("u1", "e1").await.unwrap().unwrap(), updated);

        let err = store.update("u1", "nope", EventUpdate::default()).await.unwrap_err();
        assert_eq!(err.id(), "unknown-resource");
    }

    #[tokio::test]
    async fn test_update_many_applies_to_matches() {
        let (store, _dir) = store(EventStoreSettings {
            history: true,
            ..Default::default()
        })
        .await;
        store.create("u1", note("a", 1.0)).await.unwrap();
        store.create("u1", note("b", 2.0)).await.unwrap();
        store
            .create("u1", Event::new(&["other"], "note/txt", json!("z"), 3.0).with_id("c"))
            .await
            .unwrap();

        let query = EventsQuery::new().streams(vec![crate::query::StreamsSelection::any(&["diary"])]);
        let updated = store.update_many("u1", &query, EventUpdate::trashed(true)).await.unwrap();
        assert_eq!(updated.len(), 2);
        assert!(store.get_one("u1", "a").await.unwrap().unwrap().trashed);
        assert!(!store.get_one("u1", "c").await.unwrap().unwrap().trashed);
        assert_eq!(store.get_history("u1", "a").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_keep_authors_strips_tombstone_and_history() {
        let (store, _dir) = store(EventStoreSettings {
            deletion_mode: DeletionMode::KeepAuthors,
            history: true,
            ..Default::default()
        })
        .await;
        store.create("u1", note("e1", 10.0)).await.unwrap();
        store.update("u1", "e1", EventUpdate::content(json!("y"))).await.unwrap();

        let deletion = store.delete("u1", "e1").await.unwrap();
        assert!(deletion.retained.get("content").is_none());
        assert_eq!(deletion.retained["modifiedBy"], json!("token-1"));
        assert!(deletion.retained.contains_key("integrity"));

        let history = store.get_history("u1", "e1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|row| row.content.is_none()));
    }

    #[tokio::test]
    async fn test_keep_everything_keeps_content() {
        let (store, _dir) = store(EventStoreSettings {
            deletion_mode: DeletionMode::KeepEverything,
            ..Default::default()
        })
        .await;
        store.create("u1", note("e1", 10.0)).await.unwrap();
        let deletion = store.delete("u1", "e1").await.unwrap();
        assert_eq!(deletion.retained["content"], json!("x"));
        assert!(store.get_one("u1", "e1").await.unwrap().is_none());
        assert_eq!(store.get_deletions("u1", 0.0, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_attachment_lifecycle() {
        let (store, dir) = store(EventStoreSettings::default()).await;
        store.create("u1", note("e1", 10.0)).await.unwrap();

        let mut payload: &[u8] = b"file body";
        let event = store
            .add_attachment("u1", "e1", NewAttachment::new("a.txt", "text/plain"), &mut payload)
            .await
            .unwrap();
        assert_eq!(event.attachments.len(), 1);
        let file_id = event.attachments[0].id.clone();
        assert_eq!(event.attachments[0].size, 9);

        let (meta, mut reader) = store.get_attachment("u1", "e1", &file_id).await.unwrap();
        assert_eq!(meta.file_name, "a.txt");
        let mut body = String::new();
        reader.read_to_string(&mut body).await.unwrap();
        assert_eq!(body, "file body");

        let event = store.remove_attachment("u1", "e1", &file_id).await.unwrap();
        assert!(event.attachments.is_empty());
        let files = FsAttachmentStore::new(dir.path());
        assert!(files.list_file_ids("u1", "e1").await.unwrap().is_empty());

        let err = store.remove_attachment("u1", "e1", &file_id).await.unwrap_err();
        assert_eq!(err.id(), "unknown-resource");
    }

    #[tokio::test]
    async fn test_attachment_integrity_mismatch_discards_file() {
        let (store, dir) = store(EventStoreSettings::default()).await;
        store.create("u1", note("e1", 10.0)).await.unwrap();

        let mut payload: &[u8] = b"file body";
        let mut attachment = NewAttachment::new("a.txt", "text/plain");
        attachment.integrity = Some("sha256-wrong".to_string());
        assert!(store.add_attachment("u1", "e1", attachment, &mut payload).await.is_err());

        let files = FsAttachmentStore::new(dir.path());
        assert!(files.list_file_ids("u1", "e1").await.unwrap().is_empty());
        assert!(store.get_one("u1", "e1").await.unwrap().unwrap().attachments.is_empty());
    }

    #[tokio::test]
    async fn test_streamed_matches_get() {
        let (store, _dir) = store(EventStoreSettings {
            high_water_mark: 2,
            ..Default::default()
        })
        .await;
        for i in 0..25 {
            store.create("u1", note(&format!("e{}", i), i as f64)).await.unwrap();
        }
        let query = EventsQuery::new();
        let streamed: Vec<Event> = store.get_streamed("u1", &query).try_collect().await.unwrap();
        let fetched = store.get("u1", &query).await.unwrap();
        assert_eq!(streamed, fetched);
        assert_eq!(streamed[0].id, "e24");
    }

    #[tokio::test]
    async fn test_streamed_reader_stalls_at_high_water_mark() {
        let (store, pulled, _dir) = counting_store(40, 3, None).await;
        let mut stream = store.get_streamed("u1", &EventsQuery::new());

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.id, "e39");
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        // one delivered, a full buffer, one waiting to be sent
        let in_flight = pulled.load(Ordering::SeqCst);
        assert!(in_flight <= 1 + 3 + 1, "pulled {} documents", in_flight);

        let rest: Vec<Event> = stream.try_collect().await.unwrap();
        assert_eq!(rest.len(), 39);
        assert_eq!(pulled.load(Ordering::SeqCst), 40);
    }

    #[tokio::test]
    async fn test_streamed_error_is_last_item() {
        let (store, pulled, _dir) = counting_store(10, 16, Some(3)).await;
        let items: Vec<StoreResult<Event>> = store.get_streamed("u1", &EventsQuery::new()).collect().await;

        assert_eq!(items.len(), 4);
        assert!(items[..3].iter().all(|item| item.is_ok()));
        assert!(items[3].is_err());
        assert_eq!(pulled.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_rolled_back_delete_keeps_attachment_files() {
        let (store, dir) = store(EventStoreSettings::default()).await;
        store.create("u1", note("e1", 10.0)).await.unwrap();
        let mut payload: &[u8] = b"keep me";
        let event = store
            .add_attachment("u1", "e1", NewAttachment::new("a.txt", "text/plain"), &mut payload)
            .await
            .unwrap();
        let file_id = event.attachments[0].id.clone();
        let files = FsAttachmentStore::new(dir.path());
        let manager = TransactionManager::new(store.backend.clone());

        let result: StoreResult<()> = manager
            .with_transaction(|| async {
                store.delete("u1", "e1").await?;
                // files stay until the commit
                assert_eq!(files.list_file_ids("u1", "e1").await?.len(), 1);
                Err(StoreError::InvalidOperation("changed my mind".to_string()))
            })
            .await;
        assert!(result.is_err());
        let event = store.get_one("u1", "e1").await.unwrap().unwrap();
        assert_eq!(event.attachments.len(), 1);
        assert_eq!(files.list_file_ids("u1", "e1").await.unwrap(), vec![file_id]);

        manager
            .with_transaction(|| async { store.delete("u1", "e1").await })
            .await
            .unwrap();
        assert!(files.list_file_ids("u1", "e1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rolled_back_add_attachment_discards_file() {
        let (store, dir) = store(EventStoreSettings::default()).await;
        store.create("u1", note("e1", 10.0)).await.unwrap();
        let files = FsAttachmentStore::new(dir.path());
        let manager = TransactionManager::new(store.backend.clone());

        let result: StoreResult<()> = manager
            .with_transaction(|| async {
                let mut payload: &[u8] = b"orphan";
                store
                    .add_attachment("u1", "e1", NewAttachment::new("a.txt", "text/plain"), &mut payload)
                    .await?;
                Err(StoreError::InvalidOperation("changed my mind".to_string()))
            })
            .await;
        assert!(result.is_err());
        assert!(store.get_one("u1", "e1").await.unwrap().unwrap().attachments.is_empty());
        assert!(files.list_file_ids("u1", "e1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rolled_back_remove_attachment_keeps_file() {
        let (store, dir) = store(EventStoreSettings::default()).await;
        store.create("u1", note("e1", 10.0)).await.unwrap();
        let mut payload: &[u8] = b"still here";
        let event = store
            .add_attachment("u1", "e1", NewAttachment::new("a.txt", "text/plain"), &mut payload)
            .await
            .unwrap();
        let file_id = event.attachments[0].id.clone();
        let manager = TransactionManager::new(store.backend.clone());

        let result: StoreResult<()> = manager
            .with_transaction(|| async {
                store.remove_attachment("u1", "e1", &file_id).await?;
                Err(StoreError::InvalidOperation("changed my mind".to_string()))
            })
            .await;
        assert!(result.is_err());

        let (meta, mut reader) = store.get_attachment("u1", "e1", &file_id).await.unwrap();
        assert_eq!(meta.file_name, "a.txt");
        let mut body = String::new();
        reader.read_to_string(&mut body).await.unwrap();
        assert_eq!(body, "still here");
    }

    #[tokio::test]
    async fn test_remove_all_purges_files() {
        let (store, dir) = store(EventStoreSettings::default()).await;
        store.create("u1", note("e1", 10.0)).await.unwrap();
        let mut payload: &[u8] = b"abc";
        store
            .add_attachment("u1", "e1", NewAttachment::new("a", "text/plain"), &mut payload)
            .await
            .unwrap();
        assert_eq!(store.attachments_size("u1").await.unwrap(), 3);

        assert_eq!(store.remove_all("u1").await.unwrap(), 1);
        assert_eq!(store.count("u1").await.unwrap(), 0);
        assert!(!dir.path().join("u1").exists());
    }
}
