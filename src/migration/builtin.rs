//! Built-in migrations
//!
//! Each one can be re-run after a crash: destination data is rewritten per
//! owner and source documents are selected by their content.

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use super::version::SchemaVersion;
use super::Migration;
use crate::backend::{
    DocumentBackend, Filter, FindOptions, WriteOp, EVENTS_COLLECTION, STREAMS_COLLECTION,
};
use crate::error::StoreResult;
use crate::policy::set_event_integrity;
use crate::types::USER_ID_FIELD;

/// Every built-in migration, in no particular order
pub fn builtin_migrations() -> Vec<Box<dyn Migration>> {
    vec![
        Box::new(MergeUserCollections),
        Box::new(LegacyEventFields),
        Box::new(ComputeIntegrity),
    ]
}

fn owner_filter(user_id: &str) -> Filter {
    Filter::eq(USER_ID_FIELD, user_id)
}

fn by_owner_and_id(doc: &crate::backend::Document) -> Filter {
    let mut filter = Filter::all();
    for field in [USER_ID_FIELD, "id"] {
        if let Some(value) = doc.get(field) {
            filter = filter.and(Filter::Eq(field.to_string(), value.clone()));
        }
    }
    filter
}

/// 1.1.0: `<userId>.events` / `<userId>.streams` into the shared collections
pub struct MergeUserCollections;

#[async_trait]
impl Migration for MergeUserCollections {
    fn version(&self) -> SchemaVersion {
        SchemaVersion::new(1, 1, 0)
    }

    fn description(&self) -> &'static str {
        "merge per-user collections into shared events and streams"
    }

    async fn run(&self, backend: &dyn DocumentBackend) -> StoreResult<()> {
        for collection in backend.list_collections().await? {
            let Some((user_id, shared)) = split_user_collection(&collection) else {
                continue;
            };
            let docs = backend
                .find(&collection, &Filter::all(), &FindOptions::default())
                .await?;
            let count = docs.len();

            let mut ops = Vec::with_capacity(count + 1);
            ops.push(WriteOp::DeleteMany(owner_filter(user_id)));
            for mut doc in docs {
                doc.insert(USER_ID_FIELD.to_string(), Value::String(user_id.to_string()));
                ops.push(WriteOp::InsertOne(doc));
            }
            backend.bulk_write(shared, ops).await?;
            backend.drop_collection(&collection).await?;
            info!(user_id, collection = %collection, documents = count, "merged user collection");
        }
        Ok(())
    }
}

fn split_user_collection(name: &str) -> Option<(&str, &'static str)> {
    if let Some(user_id) = name.strip_suffix(".events") {
        return (!user_id.is_empty()).then_some((user_id, EVENTS_COLLECTION));
    }
    if let Some(user_id) = name.strip_suffix(".streams") {
        return (!user_id.is_empty()).then_some((user_id, STREAMS_COLLECTION));
    }
    None
}

/// 1.2.0: single `streamId` to `streamIds`, `duration` to `endTime`
pub struct LegacyEventFields;

#[async_trait]
impl Migration for LegacyEventFields {
    fn version(&self) -> SchemaVersion {
        SchemaVersion::new(1, 2, 0)
    }

    fn description(&self) -> &'static str {
        "convert streamId and duration event fields"
    }

    async fn run(&self, backend: &dyn DocumentBackend) -> StoreResult<()> {
        let legacy = Filter::Or(vec![Filter::exists("streamId"), Filter::exists("duration")]);
        let docs = backend
            .find(EVENTS_COLLECTION, &legacy, &FindOptions::default())
            .await?;
        let count = docs.len();

        let mut ops = Vec::with_capacity(count);
        for mut doc in docs {
            if let Some(stream_id) = doc.remove("streamId") {
                if !doc.contains_key("streamIds") && !stream_id.is_null() {
                    doc.insert("streamIds".to_string(), Value::Array(vec![stream_id]));
                }
            }
            if let Some(duration) = doc.remove("duration") {
                let time = doc.get("time").and_then(Value::as_f64);
                let end_time = match (time, duration.as_f64()) {
                    (Some(time), Some(duration)) => Value::from(time + duration),
                    (Some(time), None) if !duration.is_null() => Value::from(time),
                    _ => Value::Null,
                };
                doc.insert("endTime".to_string(), end_time);
            }
            ops.push(WriteOp::ReplaceOne {
                filter: by_owner_and_id(&doc).and(legacy.clone()),
                document: doc,
                upsert: false,
            });
        }
        if !ops.is_empty() {
            backend.bulk_write(EVENTS_COLLECTION, ops).await?;
        }
        info!(events = count, "converted legacy event fields");
        Ok(())
    }
}

/// 1.3.0: compute `integrity` where it is missing
pub struct ComputeIntegrity;

#[async_trait]
impl Migration for ComputeIntegrity {
    fn version(&self) -> SchemaVersion {
        SchemaVersion::new(1, 3, 0)
    }

    fn description(&self) -> &'static str {
        "compute missing event integrity"
    }

    async fn run(&self, backend: &dyn DocumentBackend) -> StoreResult<()> {
        // Bare tombstones carry no integrity on purpose
        let missing = Filter::is_null("integrity").and(Filter::is_null("deleted"));
        let docs = backend
            .find(EVENTS_COLLECTION, &missing, &FindOptions::default())
            .await?;
        let count = docs.len();

        let mut ops = Vec::with_capacity(count);
        for mut doc in docs {
            set_event_integrity(&mut doc)?;
            ops.push(WriteOp::ReplaceOne {
                filter: by_owner_and_id(&doc).and(missing.clone()),
                document: doc,
                upsert: false,
            });
        }
        if !ops.is_empty() {
            backend.bulk_write(EVENTS_COLLECTION, ops).await?;
        }
        info!(events = count, "computed missing integrity");
        Ok(())
    }
}
