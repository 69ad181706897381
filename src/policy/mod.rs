//! Versioning and deletion policy
//!
//! Shared by every backend: what a deletion leaves behind, what gets
//! snapshotted before a mutation, and how integrity is computed.

mod deletion;
mod integrity;
mod versioning;

pub use deletion::DeletionMode;
pub use integrity::{event_integrity, set_event_integrity, sri_sha256};
pub use versioning::history_snapshot;
