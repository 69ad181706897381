//! Backend sessions and the ambient transaction scope
//!
//! A session is made current for a future with [`Session::scope`]; every
//! backend write performed inside that future records an undo entry in the
//! session journal, so an abort can restore the pre-transaction state.
//! Sessions are serialized per backend: a session holds the backend's
//! transaction lock from start until commit or abort, and writes made
//! outside any session wait for that lock too.
//!
//! Work that must not happen before the outcome is known (removing files,
//! say) is deferred on the session and run by whoever ends it.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;

use super::{BackendError, BackendResult, Document};

// Task-local rather than thread-local: the scheduler moves tasks between
// threads at await points.
tokio::task_local! {
    static ACTIVE_SESSION: Arc<Session>;
}

/// Which member serves reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadPreference {
    #[default]
    Primary,
    PrimaryPreferred,
}

/// Acknowledgement required for writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteConcern {
    #[default]
    Majority,
    Acknowledged,
}

/// Consistency level of reads inside the transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadConcern {
    #[default]
    Local,
    Majority,
    Snapshot,
}

/// Transaction options; defaults are primary / majority / local
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransactionOptions {
    pub read_preference: ReadPreference,
    pub write_concern: WriteConcern,
    pub read_concern: ReadConcern,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Committed,
    Aborted,
}

/// Pre-image of one document touched inside a session
#[derive(Debug, Clone)]
pub(crate) struct UndoEntry {
    pub collection: String,
    pub seq: u64,
    /// `None` when the write created the document
    pub before: Option<Document>,
}

/// Side effect run once a session's outcome is known
pub type DeferredWork = BoxFuture<'static, ()>;

#[derive(Default)]
struct Deferred {
    on_commit: Vec<DeferredWork>,
    on_abort: Vec<DeferredWork>,
}

impl fmt::Debug for Deferred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("on_commit", &self.on_commit.len())
            .field("on_abort", &self.on_abort.len())
            .finish()
    }
}

/// A backend session carrying one transaction
#[derive(Debug)]
pub struct Session {
    id: u64,
    options: TransactionOptions,
    state: Mutex<SessionState>,
    journal: Mutex<Vec<UndoEntry>>,
    touched: Mutex<Vec<String>>,
    deferred: Mutex<Deferred>,
    guard: Mutex<Option<OwnedMutexGuard<()>>>,
}

impl Session {
    pub(crate) fn new(id: u64, options: TransactionOptions, guard: OwnedMutexGuard<()>) -> Self {
        Self {
            id,
            options,
            state: Mutex::new(SessionState::Active),
            journal: Mutex::new(Vec::new()),
            touched: Mutex::new(Vec::new()),
            deferred: Mutex::new(Deferred::default()),
            guard: Mutex::new(Some(guard)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn options(&self) -> TransactionOptions {
        self.options
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Run `fut` with this session as the ambient transaction
    pub async fn scope<F: Future>(self: Arc<Self>, fut: F) -> F::Output {
        ACTIVE_SESSION.scope(self, fut).await
    }

    pub(crate) fn record(&self, entry: UndoEntry) {
        let mut touched = self.touched.lock();
        if !touched.contains(&entry.collection) {
            touched.push(entry.collection.clone());
        }
        self.journal.lock().push(entry);
    }

    /// Collections written inside the session
    pub(crate) fn touched_collections(&self) -> Vec<String> {
        self.touched.lock().clone()
    }

    /// Run `work` after the transaction commits; dropped if it aborts
    pub fn defer_until_commit(&self, work: DeferredWork) {
        self.deferred.lock().on_commit.push(work);
    }

    /// Run `work` after the transaction aborts; dropped if it commits
    pub fn defer_until_abort(&self, work: DeferredWork) {
        self.deferred.lock().on_abort.push(work);
    }

    /// Deferred work matching the outcome, in registration order
    ///
    /// Empty while the session is still active. The other outcome's work is
    /// discarded.
    pub fn take_deferred(&self) -> Vec<DeferredWork> {
        let state = self.state();
        if state == SessionState::Active {
            return Vec::new();
        }
        let deferred = std::mem::take(&mut *self.deferred.lock());
        match state {
            SessionState::Committed => deferred.on_commit,
            _ => deferred.on_abort,
        }
    }

    /// Mark committed, discarding the journal
    ///
    /// The transaction lock stays held until [`release`](Self::release), so
    /// the backend can persist before another writer gets in.
    pub(crate) fn finish_commit(&self) -> BackendResult<()> {
        self.transition(SessionState::Committed)?;
        self.journal.lock().clear();
        Ok(())
    }

    /// Mark aborted, handing the journal back newest-first for replay
    pub(crate) fn finish_abort(&self) -> BackendResult<Vec<UndoEntry>> {
        self.transition(SessionState::Aborted)?;
        let mut journal = std::mem::take(&mut *self.journal.lock());
        journal.reverse();
        Ok(journal)
    }

    /// Release the transaction lock once the outcome is applied
    pub(crate) fn release(&self) {
        self.guard.lock().take();
    }

    fn transition(&self, to: SessionState) -> BackendResult<()> {
        let mut state = self.state.lock();
        if *state != SessionState::Active {
            return Err(BackendError::Transaction(format!(
                "session {} is already {:?}",
                self.id, *state
            )));
        }
        *state = to;
        Ok(())
    }
}

/// The session active for the current task, if any
pub fn current_session() -> Option<Arc<Session>> {
    ACTIVE_SESSION
        .try_with(|session| session.clone())
        .ok()
        .filter(|session| session.is_active())
}
