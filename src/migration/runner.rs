//! Migration runner
//!
//! Runs every registered migration newer than the ledger's current version,
//! in ascending order, recording start and completion of each. The first
//! failure aborts the run; its version stays started but not completed and
//! is simply run again next time.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use super::builtin::builtin_migrations;
use super::ledger::{VersionEntry, VersionLedger};
use super::version::SchemaVersion;
use super::Migration;
use crate::backend::{DocumentBackend, Filter, EVENTS_COLLECTION, STREAMS_COLLECTION};
use crate::error::{StoreError, StoreResult};

/// Layout version written by this release
pub const CURRENT_VERSION: SchemaVersion = SchemaVersion::new(1, 3, 0);

/// Layout of deployments that predate the ledger
pub const BASELINE_VERSION: SchemaVersion = SchemaVersion::new(1, 0, 0);

/// Outcome of a runner pass
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationReport {
    /// Version before the pass, `None` for a fresh install
    pub from: Option<SchemaVersion>,
    pub applied: Vec<SchemaVersion>,
    pub fresh_install: bool,
}

/// Applies pending migrations at startup
pub struct MigrationRunner {
    backend: Arc<dyn DocumentBackend>,
    ledger: VersionLedger,
    migrations: Vec<Box<dyn Migration>>,
    install_version: SchemaVersion,
}

impl MigrationRunner {
    /// Runner with the built-in migrations
    pub fn new(backend: Arc<dyn DocumentBackend>) -> Self {
        let mut runner = Self::empty(backend);
        for migration in builtin_migrations() {
            runner = runner.register(migration);
        }
        runner
    }

    /// Runner without any migration
    pub fn empty(backend: Arc<dyn DocumentBackend>) -> Self {
        Self {
            ledger: VersionLedger::new(backend.clone()),
            backend,
            migrations: Vec::new(),
            install_version: CURRENT_VERSION,
        }
    }

    pub fn register(mut self, migration: Box<dyn Migration>) -> Self {
        self.migrations.push(migration);
        self.migrations.sort_by_key(|m| m.version());
        self
    }

    /// Version recorded by a fresh install
    pub fn with_install_version(mut self, version: SchemaVersion) -> Self {
        self.install_version = version;
        self
    }

    pub fn ledger(&self) -> &VersionLedger {
        &self.ledger
    }

    /// Registered versions, ascending
    pub fn versions(&self) -> Vec<SchemaVersion> {
        self.migrations.iter().map(|m| m.version()).collect()
    }

    /// Whether the backend holds no data at all yet
    async fn is_fresh(&self) -> StoreResult<bool> {
        let collections = self.backend.list_collections().await?;
        let has_data = collections.iter().any(|name| {
            name == EVENTS_COLLECTION
                || name == STREAMS_COLLECTION
                || name.ends_with(".events")
                || name.ends_with(".streams")
        });
        if !has_data {
            return Ok(true);
        }
        let events = self.backend.count(EVENTS_COLLECTION, &Filter::all()).await?;
        let streams = self.backend.count(STREAMS_COLLECTION, &Filter::all()).await?;
        let legacy = collections.iter().any(|n| n.ends_with(".events") || n.ends_with(".streams"));
        Ok(events == 0 && streams == 0 && !legacy)
    }

    /// Bring the data layout up to date
    #[instrument(skip(self), fields(backend = self.backend.name()))]
    pub async fn run(&self) -> StoreResult<MigrationReport> {
        self.ledger.ensure_index().await?;

        let from = match self.ledger.current().await? {
            Some(current) => Some(current),
            None if self.is_fresh().await? => {
                self.ledger.record_install(self.install_version).await?;
                info!(version = %self.install_version, "fresh install recorded");
                return Ok(MigrationReport {
                    from: None,
                    applied: Vec::new(),
                    fresh_install: true,
                });
            }
            None => {
                warn!(baseline = %BASELINE_VERSION, "existing data without ledger");
                Some(BASELINE_VERSION)
            }
        };

        let mut applied = Vec::new();
        for migration in &self.migrations {
            let version = migration.version();
            if from.map(|current| version <= current).unwrap_or(false) {
                continue;
            }
            self.apply(migration.as_ref()).await?;
            applied.push(version);
        }

        if applied.is_empty() {
            info!(version = ?from.map(|v| v.to_string()), "schema up to date");
        }
        Ok(MigrationReport {
            from,
            applied,
            fresh_install: false,
        })
    }

    async fn apply(&self, migration: &dyn Migration) -> StoreResult<()> {
        let version = migration.version();
        info!(%version, description = migration.description(), "running migration");

        let failed = |source: StoreError| StoreError::MigrationFailed {
            version: version.to_string(),
            source: Box::new(source),
        };
        self.ledger.record_started(version).await.map_err(failed)?;
        migration.run(self.backend.as_ref()).await.map_err(failed)?;
        self.ledger.record_completed(version).await.map_err(failed)?;

        info!(%version, "migration completed");
        Ok(())
    }

    pub async fn entries(&self) -> StoreResult<Vec<VersionEntry>> {
        self.ledger.entries().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Document, MemoryBackend};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    struct Recording {
        version: SchemaVersion,
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl Migration for Recording {
        fn version(&self) -> SchemaVersion {
            self.version
        }

        fn description(&self) -> &'static str {
            "recording"
        }

        async fn run(&self, _backend: &dyn DocumentBackend) -> StoreResult<()> {
            self.log.lock().push(self.version.to_string());
            if self.fail {
                return Err(StoreError::Unexpected("boom".to_string()));
            }
            Ok(())
        }
    }

    fn recording(version: &str, log: &Arc<Mutex<Vec<String>>>, fail: bool) -> Box<dyn Migration> {
        Box::new(Recording {
            version: version.parse().unwrap(),
            log: log.clone(),
            fail,
        })
    }

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_fresh_install_skips_migrations() {
        let backend: Arc<dyn DocumentBackend> = Arc::new(MemoryBackend::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let runner = MigrationRunner::empty(backend)
            .register(recording("1.1.0", &log, false))
            .with_install_version(SchemaVersion::new(1, 1, 0));

        let report = runner.run().await.unwrap();
        assert!(report.fresh_install);
        assert!(log.lock().is_empty());

        let entries = runner.entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].initial_install.is_some());
    }

    #[tokio::test]
    async fn test_pending_run_in_ascending_order() {
        let backend: Arc<dyn DocumentBackend> = Arc::new(MemoryBackend::new());
        backend.insert_one("events", doc(json!({"id": "legacy"}))).await.unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let runner = MigrationRunner::empty(backend)
            .register(recording("1.10.0", &log, false))
            .register(recording("1.2.0", &log, false))
            .register(recording("0.9.0", &log, false));

        let report = runner.run().await.unwrap();
        assert_eq!(report.from, Some(BASELINE_VERSION));
        assert_eq!(*log.lock(), vec!["1.2.0", "1.10.0"]);

        // Nothing left on the second pass
        let report = runner.run().await.unwrap();
        assert!(report.applied.is_empty());
        assert_eq!(report.from, Some(SchemaVersion::new(1, 10, 0)));
    }

    #[tokio::test]
    async fn test_failure_stops_without_promoting() {
        let backend: Arc<dyn DocumentBackend> = Arc::new(MemoryBackend::new());
        backend.insert_one("events", doc(json!({"id": "legacy"}))).await.unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let runner = MigrationRunner::empty(backend.clone())
            .register(recording("1.1.0", &log, false))
            .register(recording("1.2.0", &log, true))
            .register(recording("1.3.0", &log, false));

        let err = runner.run().await.unwrap_err();
        assert_eq!(err.id(), "migration-failed");
        assert_eq!(*log.lock(), vec!["1.1.0", "1.2.0"]);
        assert_eq!(runner.ledger().current().await.unwrap(), Some(SchemaVersion::new(1, 1, 0)));

        let entries = runner.entries().await.unwrap();
        let failed = entries.iter().find(|e| e.version == "1.2.0").unwrap();
        assert!(failed.migration_started.is_some());
        assert!(failed.migration_completed.is_none());
        assert_eq!(backend.count("versions", &Filter::all()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_builtin_registry_is_ordered() {
        let runner = MigrationRunner::new(Arc::new(MemoryBackend::new()));
        assert_eq!(
            runner.versions(),
            vec![
                SchemaVersion::new(1, 1, 0),
                SchemaVersion::new(1, 2, 0),
                SchemaVersion::new(1, 3, 0)
            ]
        );
    }
}
