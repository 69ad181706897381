//! Version ledger
//!
//! One document per applied version in the `versions` collection.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::version::SchemaVersion;
use crate::backend::{DocumentBackend, Filter, FindOptions, IndexSpec, VERSIONS_COLLECTION};
use crate::error::{StoreError, StoreResult};
use crate::utils::now_seconds;

const VERSIONS_INDEX: &str = "versions_version_unique";

/// Ledger entry of one schema version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionEntry {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_started: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_completed: Option<f64>,
    /// Set instead of the migration timestamps on a fresh install
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_install: Option<f64>,
}

impl VersionEntry {
    fn new(version: SchemaVersion) -> Self {
        Self {
            version: version.to_string(),
            migration_started: None,
            migration_completed: None,
            initial_install: None,
        }
    }

    /// Whether this version's data layout is in place
    pub fn is_applied(&self) -> bool {
        self.migration_completed.is_some() || self.initial_install.is_some()
    }
}

/// Durable record of applied migrations
#[derive(Clone)]
pub struct VersionLedger {
    backend: Arc<dyn DocumentBackend>,
}

impl VersionLedger {
    pub fn new(backend: Arc<dyn DocumentBackend>) -> Self {
        Self { backend }
    }

    pub async fn ensure_index(&self) -> StoreResult<()> {
        self.backend
            .create_index(
                VERSIONS_COLLECTION,
                IndexSpec::new(VERSIONS_INDEX, &["version"]).unique(),
            )
            .await?;
        Ok(())
    }

    /// Entries ordered by version
    pub async fn entries(&self) -> StoreResult<Vec<VersionEntry>> {
        let docs = self
            .backend
            .find(VERSIONS_COLLECTION, &Filter::all(), &FindOptions::default())
            .await?;
        let mut entries = Vec::with_capacity(docs.len());
        for doc in docs {
            let entry: VersionEntry = serde_json::from_value(serde_json::Value::Object(doc))?;
            entries.push((entry.version.parse::<SchemaVersion>()?, entry));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries.into_iter().map(|(_, entry)| entry).collect())
    }

    /// Highest applied version, if any
    pub async fn current(&self) -> StoreResult<Option<SchemaVersion>> {
        let mut current = None;
        for entry in self.entries().await? {
            if entry.is_applied() {
                let version: SchemaVersion = entry.version.parse()?;
                current = current.max(Some(version));
            }
        }
        Ok(current)
    }

    async fn entry(&self, version: SchemaVersion) -> StoreResult<VersionEntry> {
        let doc = self
            .backend
            .find_one(VERSIONS_COLLECTION, &Filter::eq("version", version.to_string()))
            .await?;
        match doc {
            Some(doc) => Ok(serde_json::from_value(serde_json::Value::Object(doc))?),
            None => Ok(VersionEntry::new(version)),
        }
    }

    async fn save(&self, entry: &VersionEntry) -> StoreResult<()> {
        let doc = match serde_json::to_value(entry)? {
            serde_json::Value::Object(map) => map,
            _ => return Err(StoreError::Unexpected("ledger entry is not an object".to_string())),
        };
        self.backend
            .replace_one(
                VERSIONS_COLLECTION,
                Filter::eq("version", entry.version.clone()),
                doc,
                true,
            )
            .await?;
        Ok(())
    }

    pub async fn record_started(&self, version: SchemaVersion) -> StoreResult<()> {
        let mut entry = self.entry(version).await?;
        entry.migration_started = Some(now_seconds());
        entry.migration_completed = None;
        self.save(&entry).await
    }

    pub async fn record_completed(&self, version: SchemaVersion) -> StoreResult<()> {
        let mut entry = self.entry(version).await?;
        entry.migration_completed = Some(now_seconds());
        self.save(&entry).await
    }

    /// Seed a fresh install at `version`
    pub async fn record_install(&self, version: SchemaVersion) -> StoreResult<()> {
        let mut entry = self.entry(version).await?;
        entry.initial_install = Some(now_seconds());
        self.save(&entry).await
    }
}
