//! Integrity hashes
//!
//! Event integrity is `EVENT:0:sha256-<base64>` over the canonical JSON of the
//! event document. Canonical here means sorted keys and no `integrity`,
//! `headId` or owner field.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::backend::Document;
use crate::error::StoreResult;
use crate::types::USER_ID_FIELD;

const EVENT_PREFIX: &str = "EVENT:0:";

/// `sha256-<base64>` of raw bytes
pub fn sri_sha256(digest: &[u8]) -> String {
    format!("sha256-{}", STANDARD.encode(digest))
}

/// Integrity string of an event document
pub fn event_integrity(doc: &Document) -> StoreResult<String> {
    let mut canonical = doc.clone();
    canonical.remove("integrity");
    canonical.remove("headId");
    canonical.remove(USER_ID_FIELD);
    // Map is ordered by key, so this serialization is canonical
    let bytes = serde_json::to_vec(&Value::Object(canonical))?;
    Ok(format!("{}{}", EVENT_PREFIX, sri_sha256(&Sha256::digest(&bytes))))
}

/// Recompute and store the integrity of an event document
pub fn set_event_integrity(doc: &mut Document) -> StoreResult<()> {
    let integrity = event_integrity(doc)?;
    doc.insert("integrity".to_string(), Value::String(integrity));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_integrity_ignores_bookkeeping_fields() {
        let plain = doc(json!({"id": "e", "content": 1}));
        let decorated = doc(json!({
            "id": "e",
            "content": 1,
            "userId": "u",
            "headId": "h",
            "integrity": "whatever"
        }));
        assert_eq!(event_integrity(&plain).unwrap(), event_integrity(&decorated).unwrap());
    }

    #[test]
    fn test_integrity_changes_with_content() {
        let a = event_integrity(&doc(json!({"id": "e", "content": 1}))).unwrap();
        let b = event_integrity(&doc(json!({"id": "e", "content": 2}))).unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with("EVENT:0:sha256-"));
    }

    #[test]
    fn test_sri_of_empty_input() {
        assert_eq!(
            sri_sha256(&Sha256::digest(b"")),
            "sha256-47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU="
        );
    }
}
