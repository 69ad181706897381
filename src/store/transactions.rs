//! Transaction manager
//!
//! A [`Transaction`] makes its backend session the ambient one for every
//! future passed to [`Transaction::run`], so store calls made inside join it
//! without any extra parameter. Beginning a transaction while one is already
//! ambient joins the outer one: only the outermost commit or rollback counts.
//!
//! A backend runs one transaction at a time, and writes outside any
//! transaction wait for it to end. Writers across all users are therefore
//! serialized while a transaction is open.

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::backend::{current_session, DocumentBackend, Session, TransactionOptions};
use crate::error::StoreResult;

/// Starts transactions with default options
#[derive(Clone)]
pub struct TransactionManager {
    backend: Arc<dyn DocumentBackend>,
    options: TransactionOptions,
}

impl TransactionManager {
    /// Primary reads, majority writes, local read concern
    pub fn new(backend: Arc<dyn DocumentBackend>) -> Self {
        Self {
            backend,
            options: TransactionOptions::default(),
        }
    }

    pub fn with_options(mut self, options: TransactionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> TransactionOptions {
        self.options
    }

    /// Begin a transaction, or join the one already ambient
    ///
    /// The transaction is only ambient inside [`Transaction::run`]. A store
    /// write made by the same task outside `run` while the handle is open
    /// waits for the transaction to end, and so never completes: keep every
    /// write inside `run` until the handle is committed or rolled back.
    pub async fn begin(&self) -> StoreResult<Transaction> {
        if let Some(session) = current_session() {
            return Ok(Transaction {
                backend: self.backend.clone(),
                session,
                joined: true,
            });
        }
        let session = self.backend.start_session(self.options).await?;
        debug!(session = session.id(), backend = self.backend.name(), "transaction started");
        Ok(Transaction {
            backend: self.backend.clone(),
            session,
            joined: false,
        })
    }

    /// Run `work` in a transaction: commit on `Ok`, roll back on `Err`
    pub async fn with_transaction<T, F, Fut>(&self, work: F) -> StoreResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let transaction = self.begin().await?;
        match transaction.run(work()).await {
            Ok(value) => {
                transaction.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = transaction.rollback().await {
                    warn!(error = %rollback, "rollback failed");
                }
                Err(e)
            }
        }
    }
}

/// Run `work` atomically: inside the ambient transaction if any, otherwise in
/// a new one
pub(crate) async fn atomically<T, Fut>(backend: &Arc<dyn DocumentBackend>, work: Fut) -> StoreResult<T>
where
    Fut: Future<Output = StoreResult<T>>,
{
    if current_session().is_some() {
        return work.await;
    }
    TransactionManager::new(backend.clone())
        .with_transaction(|| work)
        .await
}

/// An open transaction
pub struct Transaction {
    backend: Arc<dyn DocumentBackend>,
    session: Arc<Session>,
    joined: bool,
}

impl Transaction {
    pub fn id(&self) -> u64 {
        self.session.id()
    }

    /// Whether this handle joined an outer transaction
    pub fn is_joined(&self) -> bool {
        self.joined
    }

    pub fn is_active(&self) -> bool {
        self.session.is_active()
    }

    /// Run `fut` with this transaction ambient
    pub async fn run<Fut: Future>(&self, fut: Fut) -> Fut::Output {
        if self.joined {
            fut.await
        } else {
            self.session.clone().scope(fut).await
        }
    }

    /// Commit, then run the work deferred until commit
    pub async fn commit(self) -> StoreResult<()> {
        if self.joined {
            return Ok(());
        }
        let committed = self.backend.commit_transaction(&self.session).await;
        run_deferred(&self.session).await;
        committed?;
        debug!(session = self.session.id(), "transaction committed");
        Ok(())
    }

    /// Undo every write made inside the transaction, then run the work
    /// deferred until abort
    pub async fn rollback(self) -> StoreResult<()> {
        if self.joined {
            return Ok(());
        }
        let aborted = self.backend.abort_transaction(&self.session).await;
        run_deferred(&self.session).await;
        aborted?;
        debug!(session = self.session.id(), "transaction rolled back");
        Ok(())
    }
}

async fn run_deferred(session: &Session) {
    let work = session.take_deferred();
    if !work.is_empty() {
        debug!(session = session.id(), count = work.len(), "running deferred work");
    }
    for item in work {
        item.await;
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.joined || !self.session.is_active() {
            return;
        }
        warn!(session = self.session.id(), "transaction dropped while active, rolling back");
        let backend = self.backend.clone();
        let session = self.session.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = backend.abort_transaction(&session).await {
                        warn!(session = session.id(), error = %e, "rollback of dropped transaction failed");
                    }
                    run_deferred(&session).await;
                });
            }
            Err(_) => warn!(session = self.session.id(), "no runtime to roll back dropped transaction"),
        }
    }
}
