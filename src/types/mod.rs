//! Data types for the store
//!
//! Streams and events are exchanged with callers as typed structs and stored
//! as documents carrying an extra leading `userId` field.

mod event;
mod stream;

pub use event::{Attachment, Event, EventDeletion, EventUpdate, NewAttachment};
pub use stream::{Stream, StreamUpdate, StreamsQuery};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::backend::Document;
use crate::error::{StoreError, StoreResult};

/// Owner field present on every stored document
pub const USER_ID_FIELD: &str = "userId";

/// Serialize an item into a document owned by `user_id`
pub(crate) fn to_document<T: Serialize>(user_id: &str, item: &T) -> StoreResult<Document> {
    match serde_json::to_value(item)? {
        serde_json::Value::Object(mut map) => {
            map.insert(USER_ID_FIELD.to_string(), user_id.into());
            Ok(map)
        }
        other => Err(StoreError::Unexpected(format!(
            "expected an object, serialized {}",
            other
        ))),
    }
}

/// Deserialize a stored document, dropping the owner field
pub(crate) fn from_document<T: DeserializeOwned>(mut doc: Document) -> StoreResult<T> {
    doc.remove(USER_ID_FIELD);
    Ok(serde_json::from_value(serde_json::Value::Object(doc))?)
}
