//! Document types for storing data.
//!
//! A document is an open key/value map with three reserved fields:
//! `_id`, `_acl` and `_kmd`. The reserved fields get real structure here,
//! everything else lives in the flattened `fields` bag.

use crate::{error::Result, EntityId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key of the document identifier.
pub const ID_FIELD: &str = "_id";
/// Key of the access control value.
pub const ACL_FIELD: &str = "_acl";
/// Key of the metadata sub-document.
pub const METADATA_FIELD: &str = "_kmd";

/// Fields that survive projection even when not requested.
pub const PROTECTED_FIELDS: [&str; 2] = [ID_FIELD, ACL_FIELD];

/// Metadata associated with a document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Entity creation time as reported by the server
    #[serde(rename = "ect", default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    /// Last modified time as reported by the server
    #[serde(rename = "lmt", default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    /// Created offline and never assigned a server identity
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub local: bool,
    /// Anything else the server put in the metadata (auth tokens, etc.)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A document held by a store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Unique identifier within a collection
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<EntityId>,
    /// Ownership and visibility, treated as an opaque value
    #[serde(rename = "_acl", default, skip_serializing_if = "Option::is_none")]
    pub acl: Option<Value>,
    /// Document metadata
    #[serde(rename = "_kmd", default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    /// User fields
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Document {
    /// Create an empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a document with the given id.
    pub fn with_id(id: impl Into<EntityId>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    /// Build a document from a JSON value.
    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Convert the document into a JSON value.
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Get the id, if assigned.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Set a user field, returning the document for chaining.
    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    /// Get a user field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Whether the document was created offline and is unknown to the server.
    pub fn is_local(&self) -> bool {
        self.metadata.as_ref().is_some_and(|m| m.local)
    }

    /// Assign a locally generated id and flag the document as local.
    pub fn mark_local(&mut self, id: impl Into<EntityId>) {
        self.id = Some(id.into());
        self.metadata.get_or_insert_with(Metadata::default).local = true;
    }

    /// Prepare a local document for its first remote create: the server
    /// assigns the real id, so the local id and flag are dropped.
    pub fn without_local_identity(&self) -> Self {
        let mut doc = self.clone();
        if doc.is_local() {
            doc.id = None;
            if let Some(metadata) = doc.metadata.as_mut() {
                metadata.local = false;
            }
            if doc.metadata.as_ref() == Some(&Metadata::default()) {
                doc.metadata = None;
            }
        }
        doc
    }

    /// This document under the id the server assigned it, no longer local.
    pub fn with_server_id(&self, id: impl Into<EntityId>) -> Self {
        let mut doc = self.without_local_identity();
        doc.id = Some(id.into());
        doc
    }
}
