// Copyright 2025 Tailrace Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Change stream event representation.
//!
//! This module defines the event type that flows through the replication
//! pipeline: one mutation notification from the source deployment, carrying
//! the operation kind, the namespace it happened in, the document key, the
//! full current document when the operation has one, and the opaque resume
//! token that marks the event's position in the feed.
//!
//! # Examples
//!
//! ```rust
//! use tailrace_core::event::{ChangeEvent, OperationType, Namespace};
//! use bson::doc;
//! use chrono::Utc;
//!
//! let event = ChangeEvent {
//!     operation: OperationType::Insert,
//!     namespace: Namespace::new("shop", "orders"),
//!     document_key: Some(doc! { "_id": 1 }),
//!     full_document: Some(doc! { "_id": 1, "total": 42 }),
//!     cluster_time: Utc::now(),
//!     resume_token: doc! { "_data": "8263..." },
//! };
//!
//! assert!(event.is_insert());
//! assert_eq!(event.collection_name(), "orders");
//! ```

use bson::Document;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// Error that can occur when converting from the driver's change stream event.
#[derive(Debug, Clone)]
pub enum ConversionError {
    /// Failed to convert the resume token to a BSON document
    ResumeTokenConversion(String),
}

impl fmt::Display for ConversionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversionError::ResumeTokenConversion(msg) => {
                write!(f, "failed to convert resume token: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConversionError {}

/// Change stream operation kinds.
///
/// Only [`Insert`](OperationType::Insert), [`Update`](OperationType::Update),
/// [`Replace`](OperationType::Replace) and [`Delete`](OperationType::Delete)
/// are replicated; the remaining kinds are logged and skipped by targets.
///
/// The `Unknown` variant allows forward compatibility with server versions
/// that introduce new operation types.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum OperationType {
    /// A document was inserted into a collection
    Insert,

    /// A document was updated in place
    Update,

    /// A document was replaced entirely
    Replace,

    /// A document was deleted from a collection
    Delete,

    /// The change stream was invalidated (collection dropped, renamed, etc.)
    Invalidate,

    /// A collection was dropped
    Drop,

    /// A database was dropped
    #[serde(rename = "dropdatabase")]
    DropDatabase,

    /// A collection was renamed
    Rename,

    /// An unknown operation type from a newer server version
    ///
    /// Contains the original operation type string for logging.
    #[serde(untagged)]
    Unknown(String),
}

impl OperationType {
    /// Returns true if this operation kind is replicated to targets.
    #[inline]
    pub fn is_replicated(&self) -> bool {
        matches!(
            self,
            OperationType::Insert
                | OperationType::Update
                | OperationType::Replace
                | OperationType::Delete
        )
    }

    /// Returns the wire name of the operation, suitable for logging and
    /// metric labels.
    pub fn as_str(&self) -> &str {
        match self {
            OperationType::Insert => "insert",
            OperationType::Update => "update",
            OperationType::Replace => "replace",
            OperationType::Delete => "delete",
            OperationType::Invalidate => "invalidate",
            OperationType::Drop => "drop",
            OperationType::DropDatabase => "dropdatabase",
            OperationType::Rename => "rename",
            OperationType::Unknown(s) => s.as_str(),
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Namespace (database + collection) identifying where a change occurred.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace {
    /// Database name
    pub database: String,

    /// Collection name
    pub collection: String,
}

impl Namespace {
    /// Creates a new namespace from database and collection names.
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }

    /// Returns the fully qualified namespace as "database.collection".
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.database, self.collection)
    }
}

/// One change stream event.
///
/// This is the type that flows from the feed to the replication targets.
/// All fields are owned so events can move freely between async tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Kind of operation that occurred
    #[serde(rename = "operationType")]
    pub operation: OperationType,

    /// Namespace (database + collection) where the operation occurred
    #[serde(rename = "ns")]
    pub namespace: Namespace,

    /// Document key (`_id`, plus the shard key on sharded collections)
    ///
    /// Present for all replicated operations; absent for invalidate events.
    #[serde(rename = "documentKey", skip_serializing_if = "Option::is_none")]
    pub document_key: Option<Document>,

    /// Full document after the operation
    ///
    /// Present for insert and replace always, for update when the feed is
    /// opened with full-document lookup, and never for delete.
    #[serde(rename = "fullDocument", skip_serializing_if = "Option::is_none")]
    pub full_document: Option<Document>,

    /// Timestamp of the operation in the oplog
    #[serde(rename = "clusterTime")]
    pub cluster_time: DateTime<Utc>,

    /// Opaque position marker for this event
    ///
    /// Persisting it lets a restarted engine resume the feed from here.
    #[serde(rename = "_id")]
    pub resume_token: Document,
}

impl ChangeEvent {
    /// Returns true if this is an insert operation.
    #[inline]
    pub fn is_insert(&self) -> bool {
        self.operation == OperationType::Insert
    }

    /// Returns true if this is an update operation.
    #[inline]
    pub fn is_update(&self) -> bool {
        self.operation == OperationType::Update
    }

    /// Returns true if this is a delete operation.
    #[inline]
    pub fn is_delete(&self) -> bool {
        self.operation == OperationType::Delete
    }

    /// Returns true if this is a replace operation.
    #[inline]
    pub fn is_replace(&self) -> bool {
        self.operation == OperationType::Replace
    }

    /// Returns the collection name.
    #[inline]
    pub fn collection_name(&self) -> &str {
        &self.namespace.collection
    }

    /// Returns the database name.
    #[inline]
    pub fn database_name(&self) -> &str {
        &self.namespace.database
    }

    /// Returns the fully qualified namespace as "database.collection".
    #[inline]
    pub fn full_namespace(&self) -> String {
        self.namespace.full_name()
    }

    /// Returns the document identifier if present in the document key.
    ///
    /// Absent only for events that carry no document key (e.g. invalidate).
    pub fn document_id(&self) -> Option<&bson::Bson> {
        self.document_key.as_ref()?.get("_id")
    }

    /// Returns true if this event carries the full document.
    #[inline]
    pub fn has_full_document(&self) -> bool {
        self.full_document.is_some()
    }
}

/// Conversion from the MongoDB driver's change stream event.
///
/// Returns an error if the resume token cannot be converted to a BSON
/// document; losing the token would make the event impossible to checkpoint.
impl TryFrom<mongodb::change_stream::event::ChangeStreamEvent<Document>> for ChangeEvent {
    type Error = ConversionError;

    fn try_from(
        event: mongodb::change_stream::event::ChangeStreamEvent<Document>,
    ) -> Result<Self, Self::Error> {
        use mongodb::change_stream::event::OperationType as MongoOpType;

        let operation = match event.operation_type {
            MongoOpType::Insert => OperationType::Insert,
            MongoOpType::Update => OperationType::Update,
            MongoOpType::Delete => OperationType::Delete,
            MongoOpType::Replace => OperationType::Replace,
            MongoOpType::Invalidate => OperationType::Invalidate,
            MongoOpType::Drop => OperationType::Drop,
            MongoOpType::DropDatabase => OperationType::DropDatabase,
            MongoOpType::Rename => OperationType::Rename,
            _ => {
                // Preserve the original type string for newer server versions
                let op_str = format!("{:?}", event.operation_type);
                warn!(operation = %op_str, "unknown change stream operation type");
                OperationType::Unknown(op_str)
            }
        };

        let namespace = event
            .ns
            .map(|ns| Namespace {
                database: ns.db,
                collection: ns.coll.unwrap_or_default(),
            })
            .unwrap_or_else(|| Namespace {
                database: String::new(),
                collection: String::new(),
            });

        // MongoDB timestamps carry seconds plus an increment that orders
        // events within the same second; map the increment to nanoseconds so
        // the ordering survives the conversion.
        let cluster_time = event
            .cluster_time
            .map(|ts| {
                let seconds = ts.time as i64;
                let nanos = ts.increment * 1_000_000;
                DateTime::from_timestamp(seconds, nanos).unwrap_or_else(|| {
                    warn!(
                        time = ts.time,
                        increment = ts.increment,
                        "invalid cluster timestamp, using current time"
                    );
                    Utc::now()
                })
            })
            .unwrap_or_else(Utc::now);

        let resume_token = bson::to_document(&event.id).map_err(|e| {
            ConversionError::ResumeTokenConversion(format!(
                "failed to serialize resume token to BSON document: {}",
                e
            ))
        })?;

        Ok(Self {
            operation,
            namespace,
            document_key: event.document_key,
            full_document: event.full_document,
            cluster_time,
            resume_token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn sample_event(operation: OperationType) -> ChangeEvent {
        ChangeEvent {
            operation,
            namespace: Namespace::new("shop", "orders"),
            document_key: Some(doc! { "_id": 7 }),
            full_document: Some(doc! { "_id": 7, "total": 3 }),
            cluster_time: Utc::now(),
            resume_token: doc! { "_data": "token" },
        }
    }

    #[test]
    fn operation_predicates() {
        assert!(sample_event(OperationType::Insert).is_insert());
        assert!(sample_event(OperationType::Update).is_update());
        assert!(sample_event(OperationType::Replace).is_replace());
        assert!(sample_event(OperationType::Delete).is_delete());
    }

    #[test]
    fn replicated_kinds() {
        assert!(OperationType::Insert.is_replicated());
        assert!(OperationType::Update.is_replicated());
        assert!(OperationType::Replace.is_replicated());
        assert!(OperationType::Delete.is_replicated());
        assert!(!OperationType::Invalidate.is_replicated());
        assert!(!OperationType::Drop.is_replicated());
        assert!(!OperationType::Unknown("shardCollection".into()).is_replicated());
    }

    #[test]
    fn namespace_full_name() {
        let event = sample_event(OperationType::Insert);
        assert_eq!(event.full_namespace(), "shop.orders");
        assert_eq!(event.database_name(), "shop");
        assert_eq!(event.collection_name(), "orders");
    }

    #[test]
    fn document_id_from_key() {
        let event = sample_event(OperationType::Delete);
        assert_eq!(event.document_id(), Some(&bson::Bson::Int32(7)));

        let mut keyless = sample_event(OperationType::Insert);
        keyless.document_key = None;
        assert_eq!(keyless.document_id(), None);
    }

    #[test]
    fn serde_uses_wire_field_names() {
        let event = sample_event(OperationType::Insert);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["operationType"], "insert");
        assert_eq!(json["ns"]["database"], "shop");
        assert!(json.get("fullDocument").is_some());
        assert!(json.get("documentKey").is_some());
    }
}
