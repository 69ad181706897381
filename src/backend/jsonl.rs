//! File-persisted backend
//!
//! Every collection lives in `<data_dir>/<collection>.jsonl`, one document
//! per line. The whole file is rewritten atomically after each write outside
//! a transaction, and once per touched collection on commit. Both happen
//! under the engine's transaction lock, so files only ever hold committed
//! documents.

use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::engine::Engine;
use super::memory::engine_cursor;
use super::{
    BackendError, BackendResult, BulkWriteResult, Document, DocumentBackend,
    DocumentCursor, Filter, FindOptions, IndexSpec, Session, TransactionOptions, WriteOp,
};
use crate::utils::{atomic_write_with, cleanup_temp_files};

const FILE_EXTENSION: &str = "jsonl";

/// Backend persisting collections as JSONL files
#[derive(Debug)]
pub struct JsonlBackend {
    engine: Arc<Engine>,
    data_dir: PathBuf,
    // Serializes snapshot + rename so an older snapshot never lands last
    persist_lock: tokio::sync::Mutex<()>,
}

impl JsonlBackend {
    /// Open (or create) a backend rooted at `data_dir`, loading existing files
    pub fn open<P: AsRef<Path>>(data_dir: P) -> BackendResult<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir)?;

        let cleaned = cleanup_temp_files(&data_dir)?;
        if cleaned > 0 {
            warn!(dir = %data_dir.display(), cleaned, "removed leftover temp files");
        }

        let engine = Engine::new();
        let mut loaded = 0;
        for entry in fs::read_dir(&data_dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e != FILE_EXTENSION).unwrap_or(true) {
                continue;
            }
            let Some(collection) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let docs = read_collection_file(&path)?;
            loaded += docs.len();
            engine.load(collection, docs);
        }
        info!(dir = %data_dir.display(), documents = loaded, "opened jsonl backend");

        Ok(Self {
            engine: Arc::new(engine),
            data_dir,
            persist_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn collection_path(&self, collection: &str) -> PathBuf {
        self.data_dir.join(format!("{}.{}", collection, FILE_EXTENSION))
    }

    /// Rewrite collection files; callers hold the transaction lock
    async fn persist(&self, collections: &[String]) -> BackendResult<()> {
        let _guard = self.persist_lock.lock().await;
        for collection in collections {
            let docs = self.engine.dump(collection);
            let path = self.collection_path(collection);
            let count = docs.len();
            tokio::task::spawn_blocking(move || write_collection_file(&path, &docs))
                .await
                .map_err(|e| BackendError::Internal(format!("persist task failed: {}", e)))??;
            debug!(collection = %collection, documents = count, "persisted collection");
        }
        Ok(())
    }
}

fn read_collection_file(path: &Path) -> BackendResult<Vec<Document>> {
    let reader = BufReader::new(File::open(path)?);
    let mut docs = Vec::new();
    for (line_num, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Document>(&line) {
            Ok(doc) => docs.push(doc),
            Err(e) => {
                // A torn line can only come from outside tampering: rewrites are atomic
                warn!(file = %path.display(), line = line_num + 1, error = %e, "skipping unparsable document");
            }
        }
    }
    Ok(docs)
}

fn write_collection_file(path: &Path, docs: &[Document]) -> BackendResult<()> {
    atomic_write_with(path, |w| {
        for doc in docs {
            let line = serde_json::to_string(doc)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            writeln!(w, "{}", line)?;
        }
        Ok(())
    })?;
    Ok(())
}

#[async_trait]
impl DocumentBackend for JsonlBackend {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    async fn create_index(&self, collection: &str, index: IndexSpec) -> BackendResult<()> {
        self.engine.create_index(collection, index)
    }

    async fn list_collections(&self) -> BackendResult<Vec<String>> {
        Ok(self.engine.list_collections())
    }

    async fn drop_collection(&self, collection: &str) -> BackendResult<bool> {
        let _permit = self.engine.write_permit().await;
        let existed = self.engine.drop_collection(collection);
        let path = self.collection_path(collection);
        let _guard = self.persist_lock.lock().await;
        if path.exists() {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(existed)
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> BackendResult<Vec<Document>> {
        Ok(self.engine.find(collection, filter, options))
    }

    fn find_cursor(&self, collection: &str, filter: Filter, options: FindOptions) -> DocumentCursor {
        engine_cursor(self.engine.clone(), collection, filter, options)
    }

    async fn count(&self, collection: &str, filter: &Filter) -> BackendResult<usize> {
        Ok(self.engine.count(collection, filter))
    }

    async fn bulk_write(&self, collection: &str, ops: Vec<WriteOp>) -> BackendResult<BulkWriteResult> {
        let permit = self.engine.write_permit().await;
        let outcome = self.engine.bulk_write(collection, ops);
        // Inside a session the commit persists instead. Ordered writes may
        // have applied a prefix before failing.
        if permit.is_some() {
            self.persist(&[collection.to_string()]).await?;
        }
        outcome
    }

    async fn start_session(&self, options: TransactionOptions) -> BackendResult<Arc<Session>> {
        self.engine.start_session(options).await
    }

    async fn commit_transaction(&self, session: &Session) -> BackendResult<()> {
        session.finish_commit()?;
        let persisted = self.persist(&session.touched_collections()).await;
        session.release();
        persisted
    }

    async fn abort_transaction(&self, session: &Session) -> BackendResult<()> {
        self.engine.abort(session)
    }
}
