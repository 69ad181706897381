//! Stream store
//!
//! CRUD over each user's stream tree. Reads are served from the injected
//! [`StreamTreeCache`]; deletions leave tombstones.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use super::stream_cache::{StreamTreeCache, UserStreams};
use super::transactions::atomically;
use super::{live, STREAMS_ID_INDEX, STREAMS_NAME_INDEX};
use crate::backend::{
    current_session, BackendError, DocumentBackend, Filter, FindOptions, SortKey, WriteOp, STREAMS_COLLECTION,
};
use crate::error::{ResourceKind, StoreError, StoreResult};
use crate::types::{from_document, to_document, Stream, StreamUpdate, StreamsQuery, USER_ID_FIELD};
use crate::utils::{generate_id, now_seconds};

/// Store for streams
pub struct StreamStore {
    backend: Arc<dyn DocumentBackend>,
    cache: Arc<StreamTreeCache>,
}

impl StreamStore {
    pub fn new(backend: Arc<dyn DocumentBackend>, cache: Arc<StreamTreeCache>) -> Self {
        Self { backend, cache }
    }

    pub fn cache(&self) -> &Arc<StreamTreeCache> {
        &self.cache
    }

    fn by_id(user_id: &str, id: &str) -> Filter {
        Filter::eq(USER_ID_FIELD, user_id).and(Filter::eq("id", id))
    }

    fn classify(err: BackendError, stream: &Stream) -> StoreError {
        match err {
            BackendError::DuplicateKey { index, .. } if index == STREAMS_ID_INDEX => {
                StoreError::already_exists(ResourceKind::Stream, format!("id={}", stream.id))
            }
            BackendError::DuplicateKey { index, .. } if index == STREAMS_NAME_INDEX => {
                StoreError::already_exists(
                    ResourceKind::Stream,
                    format!(
                        "parentId={},name={}",
                        stream.parent_id.as_deref().unwrap_or("null"),
                        stream.name
                    ),
                )
            }
            other => other.into(),
        }
    }

    async fn find_live(&self, user_id: &str, id: &str) -> StoreResult<Option<Stream>> {
        let doc = self
            .backend
            .find_one(STREAMS_COLLECTION, &live(Self::by_id(user_id, id)))
            .await?;
        doc.map(from_document).transpose()
    }

    async fn require_parent(&self, user_id: &str, parent_id: &str) -> StoreResult<()> {
        match self.find_live(user_id, parent_id).await? {
            Some(_) => Ok(()),
            None => Err(StoreError::unknown_referenced(ResourceKind::Stream, parent_id)),
        }
    }

    /// Create a stream; returns it as stored
    pub async fn create(&self, user_id: &str, mut stream: Stream) -> StoreResult<Stream> {
        if stream.name.is_empty() {
            return Err(StoreError::InvalidOperation("stream name is required".to_string()));
        }
        if stream.id.is_empty() {
            stream.id = generate_id();
        }
        if let Some(parent_id) = &stream.parent_id {
            self.require_parent(user_id, parent_id).await?;
        }

        let now = now_seconds();
        stream.deleted = None;
        stream.created = Some(now);
        stream.modified = Some(now);
        if stream.modified_by.is_none() {
            stream.modified_by = stream.created_by.clone();
        }
        let stored = stream.without_children();
        let doc = to_document(user_id, &stored)?;

        // A tombstone with the same id would trip the unique index; it only
        // goes if the insert succeeds
        let tombstone = Self::by_id(user_id, &stored.id).and(Filter::exists("deleted"));
        let result = atomically(&self.backend, async {
            let purged = self.backend.delete_many(STREAMS_COLLECTION, tombstone).await?;
            if purged > 0 {
                debug!(user_id, stream_id = %stored.id, "purged tombstone before create");
            }
            self.backend
                .insert_one(STREAMS_COLLECTION, doc)
                .await
                .map_err(|e| Self::classify(e, &stored))
        })
        .await;
        self.cache.invalidate(user_id);
        result?;
        Ok(stored)
    }

    /// Read streams, see [`StreamsQuery`]
    pub async fn get(&self, user_id: &str, query: &StreamsQuery) -> StoreResult<Vec<Stream>> {
        let tree = self.load(user_id).await?;

        let mut selected: Vec<Stream> = if query.id == "*" {
            tree.forest.clone()
        } else {
            tree.forest
                .iter()
                .find_map(|root| root.find(&query.id))
                .cloned()
                .into_iter()
                .collect()
        };

        if !query.include_trashed {
            selected.retain(|s| !s.trashed);
            for stream in &mut selected {
                drop_trashed(stream);
            }
        }
        if !query.expand_children {
            for stream in &mut selected {
                stream.children.clear();
                stream.children_hidden = Some(true);
            }
        }
        if query.include_deletions {
            let since = query.deletions_since.unwrap_or(f64::MIN);
            selected.extend(
                tree.deletions
                    .iter()
                    .filter(|t| t.deleted.map(|d| d >= since).unwrap_or(false))
                    .cloned(),
            );
        }
        Ok(selected)
    }

    /// Single live stream, without children
    pub async fn get_one(&self, user_id: &str, id: &str) -> StoreResult<Option<Stream>> {
        self.find_live(user_id, id).await
    }

    /// Tree for a user, from cache or rebuilt from the backend
    async fn load(&self, user_id: &str) -> StoreResult<Arc<UserStreams>> {
        if let Some(tree) = self.cache.get(user_id) {
            return Ok(tree);
        }
        let docs = self
            .backend
            .find(
                STREAMS_COLLECTION,
                &Filter::eq(USER_ID_FIELD, user_id),
                &FindOptions::default().sorted_by(SortKey::ascending("name")),
            )
            .await?;

        let mut live_streams = Vec::new();
        let mut deletions = Vec::new();
        for doc in docs {
            let stream: Stream = from_document(doc)?;
            if stream.is_deleted() {
                deletions.push(stream);
            } else {
                live_streams.push(stream);
            }
        }
        deletions.sort_by(|a, b| b.deleted.partial_cmp(&a.deleted).unwrap_or(std::cmp::Ordering::Equal));

        let tree = Arc::new(UserStreams {
            forest: build_forest(user_id, live_streams),
            deletions,
        });
        // Reads inside a transaction may see writes that get rolled back
        if current_session().is_none() {
            self.cache.put(user_id, tree.clone());
        }
        Ok(tree)
    }

    /// Rename, move, trash or edit client data
    pub async fn update(&self, user_id: &str, id: &str, changes: StreamUpdate) -> StoreResult<Stream> {
        let mut stream = self
            .find_live(user_id, id)
            .await?
            .ok_or_else(|| StoreError::unknown(ResourceKind::Stream, id))?;

        if let Some(Some(new_parent)) = &changes.parent_id {
            let tree = self.load(user_id).await?;
            let moving = tree.forest.iter().find_map(|root| root.find(id));
            if moving.map(|s| s.find(new_parent).is_some()).unwrap_or(new_parent == id) {
                return Err(StoreError::InvalidOperation(format!(
                    "cannot move stream {} under itself or a descendant",
                    id
                )));
            }
            self.require_parent(user_id, new_parent).await?;
        }
        if changes.name.as_deref() == Some("") {
            return Err(StoreError::InvalidOperation("stream name is required".to_string()));
        }

        changes.apply(&mut stream, now_seconds());
        let result = self
            .backend
            .replace_one(
                STREAMS_COLLECTION,
                live(Self::by_id(user_id, id)),
                to_document(user_id, &stream)?,
                false,
            )
            .await;
        self.cache.invalidate(user_id);
        match result.map_err(|e| Self::classify(e, &stream))? {
            0 => Err(StoreError::unknown(ResourceKind::Stream, id)),
            _ => Ok(stream),
        }
    }

    /// Delete a stream and its descendants, leaving tombstones
    ///
    /// Returns the ids of the deleted streams, the target first.
    pub async fn delete(&self, user_id: &str, id: &str) -> StoreResult<Vec<String>> {
        let tree = self.load(user_id).await?;
        let ids = tree
            .forest
            .iter()
            .find_map(|root| root.find(id))
            .map(Stream::subtree_ids)
            .ok_or_else(|| StoreError::unknown(ResourceKind::Stream, id))?;

        let deleted = now_seconds();
        let mut ops = Vec::with_capacity(ids.len());
        for stream_id in &ids {
            ops.push(WriteOp::ReplaceOne {
                filter: live(Self::by_id(user_id, stream_id)),
                document: to_document(user_id, &Stream::tombstone(stream_id, deleted))?,
                upsert: false,
            });
        }
        let result = self.backend.bulk_write(STREAMS_COLLECTION, ops).await;
        self.cache.invalidate(user_id);
        result?;
        debug!(user_id, stream_id = id, count = ids.len(), "deleted streams");
        Ok(ids)
    }

    /// Tombstones deleted at or after `since`, most recent first
    pub async fn get_deletions(&self, user_id: &str, since: f64) -> StoreResult<Vec<Stream>> {
        let filter = Filter::eq(USER_ID_FIELD, user_id).and(Filter::Gte("deleted".to_string(), since.into()));
        let docs = self
            .backend
            .find(
                STREAMS_COLLECTION,
                &filter,
                &FindOptions::default().sorted_by(SortKey::descending("deleted")),
            )
            .await?;
        docs.into_iter().map(from_document).collect()
    }

    /// Number of live streams
    pub async fn count(&self, user_id: &str) -> StoreResult<usize> {
        Ok(self
            .backend
            .count(STREAMS_COLLECTION, &live(Filter::eq(USER_ID_FIELD, user_id)))
            .await?)
    }

    /// Remove every stream document of a user, tombstones included
    pub async fn remove_all(&self, user_id: &str) -> StoreResult<usize> {
        let result = self
            .backend
            .delete_many(STREAMS_COLLECTION, Filter::eq(USER_ID_FIELD, user_id))
            .await;
        self.cache.invalidate(user_id);
        Ok(result?)
    }
}

fn drop_trashed(stream: &mut Stream) {
    stream.children.retain(|c| !c.trashed);
    for child in &mut stream.children {
        drop_trashed(child);
    }
}

/// Assemble streams into a forest following `parentId`
fn build_forest(user_id: &str, streams: Vec<Stream>) -> Vec<Stream> {
    let known: std::collections::HashSet<String> = streams.iter().map(|s| s.id.clone()).collect();
    let mut roots = Vec::new();
    let mut children_of: HashMap<String, Vec<Stream>> = HashMap::new();
    for stream in streams {
        match stream.parent_id.clone() {
            Some(parent) if known.contains(&parent) => {
                children_of.entry(parent).or_default().push(stream)
            }
            Some(parent) => {
                warn!(user_id, stream_id = %stream.id, parent_id = %parent, "orphan stream served as root");
                roots.push(stream);
            }
            None => roots.push(stream),
        }
    }
    for root in &mut roots {
        attach_children(root, &mut children_of);
    }
    roots
}

fn attach_children(stream: &mut Stream, children_of: &mut HashMap<String, Vec<Stream>>) {
    if let Some(mut children) = children_of.remove(&stream.id) {
        for child in &mut children {
            attach_children(child, children_of);
        }
        stream.children = children;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::store::{ensure_indexes, stream_cache::CachePolicy};

    async fn store() -> StreamStore {
        let backend: Arc<dyn DocumentBackend> = Arc::new(MemoryBackend::new());
        ensure_indexes(backend.as_ref()).await.unwrap();
        StreamStore::new(backend, Arc::new(StreamTreeCache::new(CachePolicy::WriteThrough)))
    }

    #[tokio::test]
    async fn test_create_requires_existing_parent() {
        let store = store().await;
        let err = store
            .create("u1", Stream::new("child", "Child").with_parent("missing"))
            .await
            .unwrap_err();
        assert_eq!(err.id(), "unknown-referenced-resource");
    }

    #[tokio::test]
    async fn test_failed_recreate_keeps_tombstone() {
        let store = store().await;
        store.create("u1", Stream::new("a", "A")).await.unwrap();
        store.delete("u1", "a").await.unwrap();
        store.create("u1", Stream::new("b", "Taken")).await.unwrap();

        let err = store.create("u1", Stream::new("a", "Taken")).await.unwrap_err();
        assert_eq!(err.id(), "item-already-exists");

        let deletions = store.get_deletions("u1", 0.0).await.unwrap();
        assert_eq!(deletions.len(), 1);
        assert_eq!(deletions[0].id, "a");
        let query = StreamsQuery {
            include_deletions: true,
            ..StreamsQuery::all()
        };
        let ids: Vec<String> = store.get("u1", &query).await.unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["b".to_string(), "a".to_string()]);

        // recreating with a free name replaces the tombstone
        store.create("u1", Stream::new("a", "A")).await.unwrap();
        assert!(store.get_deletions("u1", 0.0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_id_and_sibling_name() {
        let store = store().await;
        store.create("u1", Stream::new("a", "A")).await.unwrap();

        let err = store.create("u1", Stream::new("a", "Other")).await.unwrap_err();
        assert_eq!(err.id(), "item-already-exists");
        let err = store.create("u1", Stream::new("b", "A")).await.unwrap_err();
        assert_eq!(err.id(), "item-already-exists");

        // Same name under another parent, or for another user, is fine
        store.create("u1", Stream::new("c", "A").with_parent("a")).await.unwrap();
        store.create("u2", Stream::new("a", "A")).await.unwrap();
    }

    #[tokio::test]
    async fn test_tree_and_expand_children() {
        let store = store().await;
        store.create("u1", Stream::new("root", "Root")).await.unwrap();
        store.create("u1", Stream::new("mid", "Mid").with_parent("root")).await.unwrap();
        store.create("u1", Stream::new("leaf", "Leaf").with_parent("mid")).await.unwrap();

        let forest = store.get("u1", &StreamsQuery::all()).await.unwrap();
        assert_eq!(forest.len(), 1);
        assert_eq!(forest[0].subtree_ids(), vec!["root", "mid", "leaf"]);

        let mid = store.get("u1", &StreamsQuery::subtree("mid").without_children()).await.unwrap();
        assert_eq!(mid.len(), 1);
        assert!(mid[0].children.is_empty());
        assert_eq!(mid[0].children_hidden, Some(true));
    }

    #[tokio::test]
    async fn test_results_are_independent_of_cache() {
        let store = store().await;
        store.create("u1", Stream::new("a", "A")).await.unwrap();
        let mut first = store.get("u1", &StreamsQuery::all()).await.unwrap();
        first[0].name = "mutated".to_string();
        let second = store.get("u1", &StreamsQuery::all()).await.unwrap();
        assert_eq!(second[0].name, "A");
    }

    #[tokio::test]
    async fn test_trashed_filtered_unless_requested() {
        let store = store().await;
        store.create("u1", Stream::new("a", "A")).await.unwrap();
        store.create("u1", Stream::new("b", "B").with_parent("a")).await.unwrap();
        store
            .update("u1", "b", StreamUpdate { trashed: Some(true), ..Default::default() })
            .await
            .unwrap();

        let visible = store.get("u1", &StreamsQuery::all()).await.unwrap();
        assert!(visible[0].children.is_empty());
        let all = store.get("u1", &StreamsQuery::all().with_trashed()).await.unwrap();
        assert_eq!(all[0].children[0].id, "b");
    }

    #[tokio::test]
    async fn test_update_rejects_cycles() {
        let store = store().await;
        store.create("u1", Stream::new("a", "A")).await.unwrap();
        store.create("u1", Stream::new("b", "B").with_parent("a")).await.unwrap();

        let err = store
            .update("u1", "a", StreamUpdate { parent_id: Some(Some("b".into())), ..Default::default() })
            .await
            .unwrap_err();
        assert_eq!(err.id(), "invalid-operation");

        let err = store
            .update("u1", "missing", StreamUpdate::default())
            .await
            .unwrap_err();
        assert_eq!(err.id(), "unknown-resource");
    }

    #[tokio::test]
    async fn test_delete_subtree_leaves_tombstones() {
        let store = store().await;
        store.create("u1", Stream::new("a", "A")).await.unwrap();
        store.create("u1", Stream::new("b", "B").with_parent("a")).await.unwrap();

        let deleted = store.delete("u1", "a").await.unwrap();
        assert_eq!(deleted, vec!["a", "b"]);
        assert!(store.get("u1", &StreamsQuery::all()).await.unwrap().is_empty());

        let tombstones = store.get_deletions("u1", 0.0).await.unwrap();
        assert_eq!(tombstones.len(), 2);
        for tombstone in tombstones {
            assert!(tombstone.parent_id.is_none());
            assert!(tombstone.name.is_empty());
            assert!(tombstone.created_by.is_none());
        }

        // Re-creating a deleted id purges its tombstone
        store.create("u1", Stream::new("a", "A again")).await.unwrap();
        assert_eq!(store.get_deletions("u1", 0.0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_all_only_touches_user() {
        let store = store().await;
        store.create("u1", Stream::new("a", "A")).await.unwrap();
        store.create("u2", Stream::new("a", "A")).await.unwrap();
        assert_eq!(store.remove_all("u1").await.unwrap(), 1);
        assert_eq!(store.count("u1").await.unwrap(), 0);
        assert_eq!(store.count("u2").await.unwrap(), 1);
    }
}
