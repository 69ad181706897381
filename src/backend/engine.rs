//! In-memory document engine shared by both backends
//!
//! Each collection keeps its documents keyed by an insertion sequence number.
//! Every write holds the collection map's write lock for its whole duration,
//! which gives per-document (and per-bulk-write) atomicity.
//!
//! One transaction lock serializes writers: a session holds it from start to
//! commit or abort, and a write outside any session takes it for the length
//! of the write (see [`Engine::write_permit`]). Nothing outside a session is
//! ever written on top of uncommitted data, so whatever is visible while a
//! permit is held is committed.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::RwLock;
use rayon::prelude::*;
use serde_json::Value;
use tokio::sync::OwnedMutexGuard;

use super::filter::{compare_for_sort, lookup};
#[cfg(test)]
use super::options::Update;
use super::options::{BulkWriteResult, FindOptions, IndexSpec, SortOrder, WriteOp};
use super::session::{current_session, Session, TransactionOptions, UndoEntry};
use super::{BackendError, BackendResult, Document, Filter};

/// Collection size above which filtering runs in parallel
const PARALLEL_SCAN_THRESHOLD: usize = 1000;

#[derive(Debug, Default, Clone)]
struct CollectionData {
    docs: BTreeMap<u64, Document>,
    indexes: Vec<IndexSpec>,
}

impl CollectionData {
    fn matching_seqs(&self, filter: &Filter) -> Vec<u64> {
        if self.docs.len() > PARALLEL_SCAN_THRESHOLD {
            let entries: Vec<(&u64, &Document)> = self.docs.iter().collect();
            entries
                .par_iter()
                .filter(|(_, doc)| filter.matches(doc))
                .map(|(seq, _)| **seq)
                .collect()
        } else {
            self.docs
                .iter()
                .filter(|(_, doc)| filter.matches(doc))
                .map(|(seq, _)| *seq)
                .collect()
        }
    }

    /// Check unique indexes for `doc` stored (or about to be stored) at `seq`
    fn check_unique(&self, collection: &str, seq: u64, doc: &Document) -> BackendResult<()> {
        for index in self.indexes.iter().filter(|i| i.unique) {
            let Some(key) = index_key(index, doc) else {
                continue;
            };
            let clash = self
                .docs
                .iter()
                .filter(|(other_seq, _)| **other_seq != seq)
                .any(|(_, other)| index_key(index, other).as_ref() == Some(&key));
            if clash {
                return Err(BackendError::DuplicateKey {
                    collection: collection.to_string(),
                    index: index.name.clone(),
                    key: Value::Array(key).to_string(),
                });
            }
        }
        Ok(())
    }
}

fn index_key(index: &IndexSpec, doc: &Document) -> Option<Vec<Value>> {
    if let Some(partial) = &index.partial {
        if !partial.matches(doc) {
            return None;
        }
    }
    Some(
        index
            .fields
            .iter()
            .map(|f| lookup(doc, f).cloned().unwrap_or(Value::Null))
            .collect(),
    )
}

fn project(doc: &Document, projection: &Option<Vec<String>>) -> Document {
    match projection {
        Some(fields) => fields
            .iter()
            .filter_map(|f| doc.get(f).map(|v| (f.clone(), v.clone())))
            .collect(),
        None => doc.clone(),
    }
}

/// Shared in-memory storage with journaled writes
#[derive(Debug)]
pub(crate) struct Engine {
    collections: RwLock<HashMap<String, CollectionData>>,
    next_seq: AtomicU64,
    next_session_id: AtomicU64,
    tx_lock: Arc<tokio::sync::Mutex<()>>,
}

impl Engine {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(1),
            next_session_id: AtomicU64::new(1),
            tx_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    fn seq(&self) -> u64 {
        self.next_seq.fetch_add(1, AtomicOrdering::SeqCst)
    }

    fn journal(session: &Option<Arc<Session>>, collection: &str, seq: u64, before: Option<Document>) {
        if let Some(session) = session {
            session.record(UndoEntry {
                collection: collection.to_string(),
                seq,
                before,
            });
        }
    }

    /// Bulk-load documents without index checks (used when opening files)
    pub fn load(&self, collection: &str, docs: Vec<Document>) {
        let mut collections = self.collections.write();
        let data = collections.entry(collection.to_string()).or_default();
        for doc in docs {
            data.docs.insert(self.seq(), doc);
        }
    }

    pub fn create_index(&self, collection: &str, index: IndexSpec) -> BackendResult<()> {
        let mut collections = self.collections.write();
        let data = collections.entry(collection.to_string()).or_default();
        data.indexes.retain(|i| i.name != index.name);
        data.indexes.push(index);
        Ok(())
    }

    pub fn list_collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn drop_collection(&self, collection: &str) -> bool {
        self.collections.write().remove(collection).is_some()
    }

    /// Snapshot of all documents in insertion order
    pub fn dump(&self, collection: &str) -> Vec<Document> {
        self.collections
            .read()
            .get(collection)
            .map(|data| data.docs.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Sequence numbers of matching documents, sorted and paginated
    pub fn matching_keys(&self, collection: &str, filter: &Filter, options: &FindOptions) -> Vec<u64> {
        let collections = self.collections.read();
        let Some(data) = collections.get(collection) else {
            return Vec::new();
        };
        let mut seqs = data.matching_seqs(filter);
        if !options.sort.is_empty() {
            seqs.sort_by(|a, b| {
                let (da, db) = (&data.docs[a], &data.docs[b]);
                for key in &options.sort {
                    let ord = compare_for_sort(lookup(da, &key.field), lookup(db, &key.field));
                    let ord = match key.order {
                        SortOrder::Ascending => ord,
                        SortOrder::Descending => ord.reverse(),
                    };
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.cmp(b)
            });
        }
        let limit = options.limit.unwrap_or(usize::MAX);
        seqs.into_iter().skip(options.skip).take(limit).collect()
    }

    /// Fetch documents by sequence number, skipping ones removed meanwhile
    pub fn fetch(&self, collection: &str, seqs: &[u64], projection: &Option<Vec<String>>) -> Vec<Document> {
        let collections = self.collections.read();
        let Some(data) = collections.get(collection) else {
            return Vec::new();
        };
        seqs.iter()
            .filter_map(|seq| data.docs.get(seq))
            .map(|doc| project(doc, projection))
            .collect()
    }

    pub fn find(&self, collection: &str, filter: &Filter, options: &FindOptions) -> Vec<Document> {
        let seqs = self.matching_keys(collection, filter, options);
        self.fetch(collection, &seqs, &options.projection)
    }

    pub fn count(&self, collection: &str, filter: &Filter) -> usize {
        self.collections
            .read()
            .get(collection)
            .map(|data| data.matching_seqs(filter).len())
            .unwrap_or(0)
    }

    #[cfg(test)]
    pub fn insert_one(&self, collection: &str, doc: Document) -> BackendResult<()> {
        self.bulk_write(collection, vec![WriteOp::InsertOne(doc)])
            .map(|_| ())
    }

    pub fn bulk_write(&self, collection: &str, ops: Vec<WriteOp>) -> BackendResult<BulkWriteResult> {
        let session = current_session();
        let mut collections = self.collections.write();
        let data = collections.entry(collection.to_string()).or_default();
        let mut result = BulkWriteResult::default();

        for op in ops {
            match op {
                WriteOp::InsertOne(doc) => {
                    let seq = self.seq();
                    data.check_unique(collection, seq, &doc)?;
                    data.docs.insert(seq, doc);
                    Self::journal(&session, collection, seq, None);
                    result.inserted += 1;
                }
                WriteOp::ReplaceOne {
                    filter,
                    document,
                    upsert,
                } => {
                    let target = data
                        .docs
                        .iter()
                        .find(|(_, doc)| filter.matches(doc))
                        .map(|(seq, _)| *seq);
                    match target {
                        Some(seq) => {
                            data.check_unique(collection, seq, &document)?;
                            let before = data.docs.insert(seq, document);
                            Self::journal(&session, collection, seq, before);
                            result.matched += 1;
                            result.modified += 1;
                        }
                        None if upsert => {
                            let seq = self.seq();
                            data.check_unique(collection, seq, &document)?;
                            data.docs.insert(seq, document);
                            Self::journal(&session, collection, seq, None);
                            result.upserted += 1;
                        }
                        None => {}
                    }
                }
                WriteOp::UpdateMany { filter, update } => {
                    for seq in data.matching_seqs(&filter) {
                        let mut updated = data.docs[&seq].clone();
                        update.apply(&mut updated);
                        data.check_unique(collection, seq, &updated)?;
                        let before = data.docs.insert(seq, updated);
                        Self::journal(&session, collection, seq, before);
                        result.matched += 1;
                        result.modified += 1;
                    }
                }
                WriteOp::DeleteMany(filter) => {
                    for seq in data.matching_seqs(&filter) {
                        let before = data.docs.remove(&seq);
                        Self::journal(&session, collection, seq, before);
                        result.deleted += 1;
                    }
                }
            }
        }
        Ok(result)
    }

    #[cfg(test)]
    pub fn replace_one(&self, collection: &str, filter: Filter, document: Document, upsert: bool) -> BackendResult<usize> {
        let result = self.bulk_write(
            collection,
            vec![WriteOp::ReplaceOne {
                filter,
                document,
                upsert,
            }],
        )?;
        Ok(result.matched + result.upserted)
    }

    #[cfg(test)]
    pub fn update_many(&self, collection: &str, filter: Filter, update: Update) -> BackendResult<usize> {
        let result = self.bulk_write(collection, vec![WriteOp::UpdateMany { filter, update }])?;
        Ok(result.modified)
    }

    #[cfg(test)]
    pub fn delete_many(&self, collection: &str, filter: Filter) -> BackendResult<usize> {
        let result = self.bulk_write(collection, vec![WriteOp::DeleteMany(filter)])?;
        Ok(result.deleted)
    }

    /// Transaction lock for a write made outside any session
    ///
    /// `None` inside a session, which already holds the lock. A task that
    /// started a session without making it current waits here forever.
    pub async fn write_permit(&self) -> Option<OwnedMutexGuard<()>> {
        if current_session().is_some() {
            return None;
        }
        Some(self.tx_lock.clone().lock_owned().await)
    }

    pub async fn start_session(&self, options: TransactionOptions) -> BackendResult<Arc<Session>> {
        if current_session().is_some() {
            return Err(BackendError::Transaction(
                "a transaction is already active for this task".to_string(),
            ));
        }
        let guard = self.tx_lock.clone().lock_owned().await;
        let id = self.next_session_id.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(Arc::new(Session::new(id, options, guard)))
    }

    pub fn commit(&self, session: &Session) -> BackendResult<()> {
        session.finish_commit()?;
        session.release();
        Ok(())
    }

    /// Replay the undo journal, restoring pre-transaction documents
    pub fn abort(&self, session: &Session) -> BackendResult<()> {
        let journal = session.finish_abort()?;
        {
            let mut collections = self.collections.write();
            for entry in journal {
                let data = collections.entry(entry.collection).or_default();
                match entry.before {
                    Some(doc) => {
                        data.docs.insert(entry.seq, doc);
                    }
                    None => {
                        data.docs.remove(&entry.seq);
                    }
                }
            }
        }
        session.release();
        Ok(())
    }
}
