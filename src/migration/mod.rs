//! Schema migrations
//!
//! ```text
//! startup ──► MigrationRunner ──► VersionLedger ("versions")
//!                  │
//!                  └──► Migration::run (1.1.0, 1.2.0, 1.3.0, ...)
//! ```

mod builtin;
mod ledger;
mod runner;
mod version;

use async_trait::async_trait;

pub use builtin::{builtin_migrations, ComputeIntegrity, LegacyEventFields, MergeUserCollections};
pub use ledger::{VersionEntry, VersionLedger};
pub use runner::{MigrationReport, MigrationRunner, BASELINE_VERSION, CURRENT_VERSION};
pub use version::SchemaVersion;

use crate::backend::DocumentBackend;
use crate::error::StoreResult;

/// A data layout change
///
/// Implementations must be idempotent: running one twice leaves the same
/// data as running it once.
#[async_trait]
pub trait Migration: Send + Sync {
    fn version(&self) -> SchemaVersion;

    fn description(&self) -> &'static str;

    async fn run(&self, backend: &dyn DocumentBackend) -> StoreResult<()>;
}
