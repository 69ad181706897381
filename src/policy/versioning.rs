//! History snapshots

use serde_json::Value;

use super::integrity::set_event_integrity;
use crate::backend::Document;
use crate::error::StoreResult;
use crate::utils::generate_id;

/// Copy of `doc` stored as a history row of its event
///
/// The row gets a fresh id and points back with `headId`. Integrity covers
/// the id, so a sealed head yields a row sealed under its own id.
pub fn history_snapshot(doc: &Document) -> StoreResult<Option<Document>> {
    let Some(head_id) = doc.get("id").and_then(Value::as_str).map(str::to_string) else {
        return Ok(None);
    };
    let mut snapshot = doc.clone();
    snapshot.insert("id".to_string(), Value::String(generate_id()));
    snapshot.insert("headId".to_string(), Value::String(head_id));
    if snapshot.contains_key("integrity") {
        set_event_integrity(&mut snapshot)?;
    }
    Ok(Some(snapshot))
}
