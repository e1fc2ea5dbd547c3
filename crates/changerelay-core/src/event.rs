//! Change event types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Kind of mutation a change event describes.
///
/// On the wire the operation is a lowercase string. Strings outside the known
/// set decode to [`OperationType::Unrecognized`] instead of failing, and are
/// routed as a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OperationType {
    Insert,
    Update,
    Delete,
    Replace,
    Unrecognized,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Insert => "insert",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
            OperationType::Replace => "replace",
            OperationType::Unrecognized => "unrecognized",
        }
    }

    /// Case-insensitive parse; never fails.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "insert" => OperationType::Insert,
            "update" => OperationType::Update,
            "delete" => OperationType::Delete,
            "replace" => OperationType::Replace,
            _ => OperationType::Unrecognized,
        }
    }

    pub fn is_recognized(&self) -> bool {
        !matches!(self, OperationType::Unrecognized)
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for OperationType {
    fn from(value: String) -> Self {
        OperationType::parse(&value)
    }
}

impl From<OperationType> for String {
    fn from(op: OperationType) -> Self {
        op.as_str().to_string()
    }
}

/// A single mutation observed on a source collection.
///
/// Produced by the change feed and immutable once observed; it only lives for
/// the duration of one dispatch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEvent {
    /// Unique event identifier
    pub id: String,

    /// Source collection the mutation happened in
    pub collection: String,

    pub operation: OperationType,

    /// Document identity, when the feed provides one
    pub document_key: Option<serde_json::Value>,

    /// Full document (or change description for updates/deletes)
    pub document: serde_json::Value,

    /// When the event was observed by this process
    pub observed_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(
        collection: impl Into<String>,
        operation: OperationType,
        document: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            collection: collection.into(),
            operation,
            document_key: None,
            document,
            observed_at: Utc::now(),
        }
    }

    pub fn insert(collection: impl Into<String>, document: serde_json::Value) -> Self {
        Self::new(collection, OperationType::Insert, document)
    }

    pub fn update(collection: impl Into<String>, document: serde_json::Value) -> Self {
        Self::new(collection, OperationType::Update, document)
    }

    pub fn delete(collection: impl Into<String>, document: serde_json::Value) -> Self {
        Self::new(collection, OperationType::Delete, document)
    }

    pub fn replace(collection: impl Into<String>, document: serde_json::Value) -> Self {
        Self::new(collection, OperationType::Replace, document)
    }

    pub fn with_document_key(mut self, key: serde_json::Value) -> Self {
        self.document_key = Some(key);
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}
