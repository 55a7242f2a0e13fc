//! Pending operation records.
//!
//! Local changes are not pushed as they happen. Each mutation leaves a
//! [`SyncRecord`] behind, and the push phase replays those records against
//! the remote collection.

use crate::{CollectionName, Document, EntityId, RecordId};
use serde::{Deserialize, Serialize};

/// The kind of change a pending record represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
}

impl SyncOperation {
    /// Lowercase name, used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOperation::Create => "create",
            SyncOperation::Update => "update",
            SyncOperation::Delete => "delete",
        }
    }
}

impl std::fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A mutation waiting to be pushed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRecord {
    /// Ledger record ID
    #[serde(rename = "_id")]
    pub id: RecordId,
    /// The document this record is about
    pub entity_id: EntityId,
    /// Collection the document belongs to
    pub collection: CollectionName,
    /// What to do with the document remotely
    pub operation: SyncOperation,
    /// Document state at the time the change was recorded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<Document>,
}

impl SyncRecord {
    /// Create a new pending record.
    pub fn new(
        id: impl Into<RecordId>,
        operation: SyncOperation,
        collection: impl Into<CollectionName>,
        entity_id: impl Into<EntityId>,
        entity: Option<Document>,
    ) -> Self {
        Self {
            id: id.into(),
            entity_id: entity_id.into(),
            collection: collection.into(),
            operation,
            entity,
        }
    }

    /// Whether the record targets a document that only exists locally.
    pub fn is_local_entity(&self) -> bool {
        self.entity.as_ref().is_some_and(Document::is_local)
    }
}
