//! Volatile backend

use std::sync::Arc;

use async_trait::async_trait;

use super::engine::Engine;
use super::{
    BackendError, BackendResult, BulkWriteResult, Document, DocumentBackend, DocumentCursor, Filter,
    FindOptions, IndexSpec, Session, TransactionOptions, WriteOp, CURSOR_BATCH_SIZE,
};

/// Backend keeping every collection in process memory
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    engine: Arc<Engine>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            engine: Arc::new(Engine::new()),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Cursor over an engine: keys are resolved once, documents fetched per batch
pub(super) fn engine_cursor(
    engine: Arc<Engine>,
    collection: &str,
    filter: Filter,
    options: FindOptions,
) -> DocumentCursor {
    let collection = collection.to_string();
    let stream = async_stream::stream! {
        let keys = engine.matching_keys(&collection, &filter, &options);
        for batch in keys.chunks(CURSOR_BATCH_SIZE) {
            let docs = engine.fetch(&collection, batch, &options.projection);
            for doc in docs {
                yield Ok::<Document, BackendError>(doc);
            }
            tokio::task::yield_now().await;
        }
    };
    Box::pin(stream)
}

#[async_trait]
impl DocumentBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn create_index(&self, collection: &str, index: IndexSpec) -> BackendResult<()> {
        self.engine.create_index(collection, index)
    }

    async fn list_collections(&self) -> BackendResult<Vec<String>> {
        Ok(self.engine.list_collections())
    }

    async fn drop_collection(&self, collection: &str) -> BackendResult<bool> {
        let _permit = self.engine.write_permit().await;
        Ok(self.engine.drop_collection(collection))
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
        let _permit = self.engine.write_permit().await;
        self.engine.bulk_write(collection, ops)
    }

    async fn start_session(&self, options: TransactionOptions) -> BackendResult<Arc<Session>> {
        self.engine.start_session(options).await
    }

    async fn commit_transaction(&self, session: &Session) -> BackendResult<()> {
        self.engine.commit(session)
    }

    async fn abort_transaction(&self, session: &Session) -> BackendResult<()> {
        self.engine.abort(session)
    }
}
