use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::protocol::OCTET_STREAM;
use crate::serde_utils;

/// Caller-declared description of a payload. Sent verbatim as the JSON body
/// of the session-creation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadMetadata {
    pub name: String,
    /// Declared total size in bytes. Authoritative for chunk bounds and completion.
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "serde_utils::optional_timestamp_millis"
    )]
    pub last_modified: Option<SystemTime>,
    /// Caller-defined fields, forwarded as-is.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl UploadMetadata {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            mime_type: None,
            last_modified: None,
            fields: Map::new(),
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn with_last_modified(mut self, last_modified: SystemTime) -> Self {
        self.last_modified = Some(last_modified);
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// MIME type declared to the server, defaulting to `application/octet-stream`.
    pub fn content_type(&self) -> &str {
        self.mime_type.as_deref().unwrap_or(OCTET_STREAM)
    }
}
