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

//! Replication targets.
//!
//! A target owns one destination connection and applies a single change
//! event to it idempotently. Updates and replaces become full-document
//! upserts keyed by the document identifier, so a destination that missed
//! an earlier event converges on the next one it receives; deletes of
//! already-missing documents are not errors.
//!
//! The orchestrator talks to targets through the [`Target`] trait: the
//! driver-backed [`ReplicationTarget`] is the production implementation,
//! and [`MockTarget`] keeps the same apply semantics in memory for tests.

use crate::config::TargetConfig;
use crate::event::{ChangeEvent, Namespace, OperationType};
use crate::metrics;
use crate::pool::{ConnectionPool, PoolError, PoolRole, PoolSpec};
use bson::{doc, Document};
use chrono::{DateTime, Utc};
use mongodb::{Client, Collection};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tracing::{debug, info, trace};

/// Point-in-time snapshot of one target's counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetStats {
    /// Target name
    pub name: String,

    /// Events successfully applied
    pub events_applied: u64,

    /// Apply errors
    pub errors: u64,

    /// When the last successful apply finished
    pub last_success_at: Option<DateTime<Utc>>,

    /// When the last apply error occurred
    pub last_error_at: Option<DateTime<Utc>>,

    /// Message of the last apply error
    pub last_error: Option<String>,
}

impl TargetStats {
    /// Fraction of apply calls that succeeded.
    ///
    /// A target that has not applied anything yet reports 1.0.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        let total = self.events_applied + self.errors;
        if total == 0 {
            1.0
        } else {
            self.events_applied as f64 / total as f64
        }
    }
}

/// Shared counter bookkeeping for target implementations.
#[derive(Debug, Default)]
struct TargetCounters {
    events_applied: AtomicU64,
    errors: AtomicU64,
    last: RwLock<LastOutcome>,
}

#[derive(Debug, Default, Clone)]
struct LastOutcome {
    success_at: Option<DateTime<Utc>>,
    error_at: Option<DateTime<Utc>>,
    error: Option<String>,
}

impl TargetCounters {
    async fn record_success(&self) {
        self.events_applied.fetch_add(1, Ordering::Relaxed);
        self.last.write().await.success_at = Some(Utc::now());
    }

    async fn record_failure(&self, message: String) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        let mut last = self.last.write().await;
        last.error_at = Some(Utc::now());
        last.error = Some(message);
    }

    async fn snapshot(&self, name: &str) -> TargetStats {
        let last = self.last.read().await.clone();
        TargetStats {
            name: name.to_string(),
            events_applied: self.events_applied.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            last_success_at: last.success_at,
            last_error_at: last.error_at,
            last_error: last.error,
        }
    }
}

/// Trait for replication destinations.
#[async_trait::async_trait]
pub trait Target: Send + Sync {
    /// Returns the target name.
    fn name(&self) -> &str;

    /// Acquires the destination connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the destination cannot be reached. Connect
    /// failures are fatal to startup; the orchestrator propagates them.
    async fn connect(&self) -> Result<(), TargetError>;

    /// Applies one change event to the destination.
    ///
    /// # Errors
    ///
    /// Returns an error if the destination rejects the write. The error is
    /// recorded in the target's counters before it is returned; the
    /// orchestrator isolates it from other targets.
    async fn apply(&self, event: &ChangeEvent) -> Result<(), TargetError>;

    /// Releases the destination connection. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be released cleanly.
    async fn close(&self) -> Result<(), TargetError>;

    /// Returns a snapshot of the target's counters.
    async fn stats(&self) -> TargetStats;
}

/// Driver-backed replication target.
///
/// Obtains its client from the [`ConnectionPool`] collaborator under the
/// `backup` role and caches resolved destination collection handles per
/// namespace.
pub struct ReplicationTarget {
    config: TargetConfig,
    pool: Arc<dyn ConnectionPool>,
    client: RwLock<Option<Client>>,
    collections: RwLock<HashMap<String, Collection<Document>>>,
    counters: TargetCounters,
}

impl ReplicationTarget {
    /// Creates a target for the given configuration and pool collaborator.
    pub fn new(config: TargetConfig, pool: Arc<dyn ConnectionPool>) -> Self {
        Self {
            config,
            pool,
            client: RwLock::new(None),
            collections: RwLock::new(HashMap::new()),
            counters: TargetCounters::default(),
        }
    }

    /// Resolves (and caches) the destination collection for a namespace.
    async fn resolve_collection(
        &self,
        namespace: &Namespace,
    ) -> Result<Collection<Document>, TargetError> {
        let key = namespace.full_name();
        if let Some(collection) = self.collections.read().await.get(&key) {
            return Ok(collection.clone());
        }

        let client =
            self.client
                .read()
                .await
                .clone()
                .ok_or_else(|| TargetError::NotConnected {
                    name: self.config.name.clone(),
                })?;

        let collection = client
            .database(&namespace.database)
            .collection::<Document>(&namespace.collection);
        self.collections.write().await.insert(key, collection.clone());
        Ok(collection)
    }

    async fn apply_inner(&self, event: &ChangeEvent) -> Result<(), TargetError> {
        let collection = self.resolve_collection(&event.namespace).await?;
        let namespace = event.full_namespace();

        let write_error = |source: mongodb::error::Error| TargetError::Write {
            namespace: namespace.clone(),
            source,
        };

        match event.operation {
            OperationType::Insert => {
                let document = event.full_document.as_ref().ok_or_else(|| {
                    TargetError::MissingDocument {
                        operation: event.operation.to_string(),
                    }
                })?;
                collection.insert_one(document).await.map_err(write_error)?;
            }
            OperationType::Update | OperationType::Replace => {
                // Full replacement keyed by the identifier, whether or not
                // this destination had a prior copy.
                let document = event.full_document.as_ref().ok_or_else(|| {
                    TargetError::MissingDocument {
                        operation: event.operation.to_string(),
                    }
                })?;
                let id = event
                    .document_id()
                    .cloned()
                    .ok_or(TargetError::MissingDocumentKey)?;
                collection
                    .replace_one(doc! { "_id": id }, document)
                    .upsert(true)
                    .await
                    .map_err(write_error)?;
            }
            OperationType::Delete => {
                let id = event
                    .document_id()
                    .cloned()
                    .ok_or(TargetError::MissingDocumentKey)?;
                // A missing document is not an error; deleted_count 0 is fine.
                collection
                    .delete_one(doc! { "_id": id })
                    .await
                    .map_err(write_error)?;
            }
            _ => {
                // Guarded by the is_replicated check in apply.
                debug!(operation = %event.operation, "apply_inner called with non-replicated operation");
            }
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl Target for ReplicationTarget {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn connect(&self) -> Result<(), TargetError> {
        self.pool
            .add_pool(PoolSpec {
                name: self.config.name.clone(),
                uri: self.config.uri.clone(),
                role: PoolRole::Backup,
                health_check: self.config.health_check.clone(),
            })
            .await?;

        let client = self.pool.get_pool(&self.config.name).await?;
        *self.client.write().await = Some(client);

        info!(destination = %self.config.name, "target connected");
        Ok(())
    }

    async fn apply(&self, event: &ChangeEvent) -> Result<(), TargetError> {
        if !event.operation.is_replicated() {
            debug!(
                destination = %self.config.name,
                operation = %event.operation,
                "ignoring non-replicated operation"
            );
            return Ok(());
        }

        if let Some(allow) = &self.config.collections {
            if !allow.iter().any(|c| c == event.collection_name()) {
                trace!(
                    destination = %self.config.name,
                    collection = event.collection_name(),
                    "collection not in target allow-list, skipping"
                );
                return Ok(());
            }
        }

        let start = std::time::Instant::now();
        match self.apply_inner(event).await {
            Ok(()) => {
                self.counters.record_success().await;
                metrics::increment_target_applied(&self.config.name, event.operation.as_str());
                metrics::record_apply_duration(start.elapsed().as_secs_f64(), &self.config.name);
                Ok(())
            }
            Err(e) => {
                self.counters.record_failure(e.to_string()).await;
                metrics::increment_target_apply_errors(&self.config.name);
                Err(e)
            }
        }
    }

    async fn close(&self) -> Result<(), TargetError> {
        if self.client.write().await.take().is_some() {
            self.collections.write().await.clear();
            self.pool.remove_pool(&self.config.name).await?;
            debug!(destination = %self.config.name, "target connection released");
        }
        Ok(())
    }

    async fn stats(&self) -> TargetStats {
        self.counters.snapshot(&self.config.name).await
    }
}

/// Errors produced by replication targets.
#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    /// The pool collaborator rejected the request
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// The target was used before `connect` succeeded
    #[error("target `{name}` is not connected")]
    NotConnected {
        /// Target name
        name: String,
    },

    /// The event carries no document key
    #[error("event is missing a document key")]
    MissingDocumentKey,

    /// The event carries no full document for an operation that needs one
    #[error("event is missing the full document for a {operation} operation")]
    MissingDocument {
        /// Operation kind of the offending event
        operation: String,
    },

    /// The destination rejected a write
    #[error("write to `{namespace}` failed: {source}")]
    Write {
        /// Fully qualified destination namespace
        namespace: String,
        /// Driver error
        #[source]
        source: mongodb::error::Error,
    },

    /// Other errors (used by test doubles)
    #[error("{0}")]
    Other(String),
}

/// In-memory target for tests.
///
/// Keeps the same convergence semantics as [`ReplicationTarget`]: inserts,
/// updates and replaces store the full document keyed by namespace and
/// identifier, deletes remove it, and everything else is ignored. Failure
/// modes can be injected for isolation tests.
#[derive(Debug)]
pub struct MockTarget {
    name: String,
    documents: Mutex<HashMap<String, Document>>,
    fail_applies: AtomicBool,
    fail_connect: AtomicBool,
    connected: AtomicBool,
    gate: Option<Arc<Semaphore>>,
    counters: TargetCounters,
}

impl MockTarget {
    /// Creates a healthy mock target.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            documents: Mutex::new(HashMap::new()),
            fail_applies: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            gate: None,
            counters: TargetCounters::default(),
        }
    }

    /// Creates a mock target whose `apply` always fails.
    #[must_use]
    pub fn failing(name: impl Into<String>) -> Self {
        let target = Self::new(name);
        target.fail_applies.store(true, Ordering::Relaxed);
        target
    }

    /// Creates a mock target whose `connect` fails.
    #[must_use]
    pub fn with_connect_failure(name: impl Into<String>) -> Self {
        let target = Self::new(name);
        target.fail_connect.store(true, Ordering::Relaxed);
        target
    }

    /// Creates a mock target whose `apply` blocks until the gate has a
    /// permit available. Each apply consumes one permit.
    #[must_use]
    pub fn gated(name: impl Into<String>, gate: Arc<Semaphore>) -> Self {
        let mut target = Self::new(name);
        target.gate = Some(gate);
        target
    }

    /// Switches apply failures on or off.
    pub fn set_failing(&self, failing: bool) {
        self.fail_applies.store(failing, Ordering::Relaxed);
    }

    /// Returns true if `connect` has been called without a later `close`.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Returns the stored document for a namespace and identifier.
    pub async fn document(&self, namespace: &str, id: &bson::Bson) -> Option<Document> {
        self.documents
            .lock()
            .await
            .get(&Self::key(namespace, id))
            .cloned()
    }

    /// Returns the number of stored documents.
    pub async fn document_count(&self) -> usize {
        self.documents.lock().await.len()
    }

    fn key(namespace: &str, id: &bson::Bson) -> String {
        format!("{}:{}", namespace, id)
    }
}

#[async_trait::async_trait]
impl Target for MockTarget {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<(), TargetError> {
        if self.fail_connect.load(Ordering::Relaxed) {
            return Err(TargetError::Other("simulated connect failure".to_string()));
        }
        self.connected.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn apply(&self, event: &ChangeEvent) -> Result<(), TargetError> {
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|_| TargetError::Other("apply gate closed".to_string()))?
                .forget();
        }

        if self.fail_applies.load(Ordering::Relaxed) {
            let err = TargetError::Other("simulated apply failure".to_string());
            self.counters.record_failure(err.to_string()).await;
            return Err(err);
        }

        if !event.operation.is_replicated() {
            return Ok(());
        }

        let id = event
            .document_id()
            .cloned()
            .ok_or(TargetError::MissingDocumentKey)?;
        let key = Self::key(&event.full_namespace(), &id);

        match event.operation {
            OperationType::Insert | OperationType::Update | OperationType::Replace => {
                let document = event.full_document.clone().ok_or_else(|| {
                    TargetError::MissingDocument {
                        operation: event.operation.to_string(),
                    }
                })?;
                self.documents.lock().await.insert(key, document);
            }
            OperationType::Delete => {
                self.documents.lock().await.remove(&key);
            }
            _ => {}
        }

        self.counters.record_success().await;
        Ok(())
    }

    async fn close(&self) -> Result<(), TargetError> {
        self.connected.store(false, Ordering::Relaxed);
        Ok(())
    }

    async fn stats(&self) -> TargetStats {
        self.counters.snapshot(&self.name).await
    }
}
