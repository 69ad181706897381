//! Event types

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::Document;

/// Metadata of a file attached to an event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: String,
    pub file_name: String,
    #[serde(rename = "type")]
    pub attachment_type: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
}

/// Caller-supplied description of an attachment being added
#[derive(Debug, Clone, PartialEq)]
pub struct NewAttachment {
    pub file_name: String,
    pub attachment_type: String,
    /// Checked against the computed digest when set
    pub integrity: Option<String>,
}

impl NewAttachment {
    pub fn new(file_name: &str, attachment_type: &str) -> Self {
        Self {
            file_name: file_name.to_string(),
            attachment_type: attachment_type.to_string(),
            integrity: None,
        }
    }
}

/// A timestamped record in one or more streams
///
/// History rows share this shape, with `head_id` pointing at the live event.
/// `end_time == None` on a live event means it is still running.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    #[serde(default)]
    pub stream_ids: Vec<String>,
    #[serde(rename = "type", default)]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(default)]
    pub time: f64,
    #[serde(default)]
    pub end_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_data: Option<Value>,
    #[serde(default)]
    pub trashed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
    #[serde(default)]
    pub created: f64,
    #[serde(default)]
    pub created_by: String,
    #[serde(default)]
    pub modified: f64,
    #[serde(default)]
    pub modified_by: String,
}

impl Event {
    /// Instant event (`end_time == time`); the id is generated on create when empty
    pub fn new(stream_ids: &[&str], event_type: &str, content: Value, time: f64) -> Self {
        Self {
            stream_ids: stream_ids.iter().map(|s| s.to_string()).collect(),
            event_type: event_type.to_string(),
            content: Some(content),
            time,
            end_time: Some(time),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }

    pub fn with_duration(mut self, duration: f64) -> Self {
        self.end_time = Some(self.time + duration);
        self
    }

    /// Mark as running: no end time yet
    pub fn running(mut self) -> Self {
        self.end_time = None;
        self
    }

    pub fn with_author(mut self, author: &str) -> Self {
        self.created_by = author.to_string();
        self.modified_by = author.to_string();
        self
    }

    /// Duration in seconds, `None` while running
    pub fn duration(&self) -> Option<f64> {
        self.end_time.map(|end| end - self.time)
    }

    pub fn is_running(&self) -> bool {
        self.end_time.is_none()
    }

    pub fn is_history(&self) -> bool {
        self.head_id.is_some()
    }

    pub fn attachment(&self, file_id: &str) -> Option<&Attachment> {
        self.attachments.iter().find(|a| a.id == file_id)
    }
}

/// Changes applied by an event update
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventUpdate {
    pub stream_ids: Option<Vec<String>>,
    pub event_type: Option<String>,
    pub content: Option<Value>,
    pub time: Option<f64>,
    /// `Some(None)` makes the event running
    pub end_time: Option<Option<f64>>,
    pub description: Option<Option<String>>,
    pub client_data: Option<Option<Value>>,
    pub trashed: Option<bool>,
    pub modified_by: Option<String>,
}

impl EventUpdate {
    pub fn content(content: Value) -> Self {
        Self {
            content: Some(content),
            ..Default::default()
        }
    }

    pub fn trashed(trashed: bool) -> Self {
        Self {
            trashed: Some(trashed),
            ..Default::default()
        }
    }

    pub fn by(mut self, author: &str) -> Self {
        self.modified_by = Some(author.to_string());
        self
    }

    pub(crate) fn apply(&self, event: &mut Event, now: f64) {
        if let Some(stream_ids) = &self.stream_ids {
            event.stream_ids = stream_ids.clone();
        }
        if let Some(event_type) = &self.event_type {
            event.event_type = event_type.clone();
        }
        if let Some(content) = &self.content {
            event.content = Some(content.clone());
        }
        if let Some(time) = self.time {
            // Keep instant events instant when only the time moves
            if self.end_time.is_none() && event.end_time == Some(event.time) {
                event.end_time = Some(time);
            }
            event.time = time;
        }
        if let Some(end_time) = self.end_time {
            event.end_time = end_time;
        }
        if let Some(description) = &self.description {
            event.description = description.clone();
        }
        if let Some(client_data) = &self.client_data {
            event.client_data = client_data.clone();
        }
        if let Some(trashed) = self.trashed {
            event.trashed = trashed;
        }
        event.modified = now;
        if let Some(author) = &self.modified_by {
            event.modified_by = author.clone();
        }
    }
}

/// Tombstone of a deleted event, with whatever fields the deletion mode kept
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDeletion {
    pub id: String,
    pub deleted: f64,
    #[serde(flatten)]
    pub retained: Document,
}
