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

//! Change feed collaborator.
//!
//! The orchestrator consumes events through the [`EventSource`] /
//! [`FeedHandle`] pair: `probe` checks that the upstream deployment can
//! serve a durable, resumable change feed, `open` starts delivery with a
//! server-side filter pipeline and an optional resume position, and the
//! handle yields events until it errors, is closed, or the upstream drops
//! it. [`MongoEventSource`] implements the pair on the official driver's
//! change streams; [`MockEventSource`] scripts feed sessions in memory for
//! tests.

use crate::event::{ChangeEvent, ConversionError};
use bson::{doc, Document};
use futures::StreamExt;
use mongodb::{
    change_stream::{
        event::{ChangeStreamEvent, ResumeToken},
        ChangeStream,
    },
    options::{ChangeStreamOptions, FullDocumentType},
    Client,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Operation kinds the feed is restricted to.
///
/// Everything else (invalidate, drop, rename, ...) is filtered server-side.
pub const REPLICATED_OPERATIONS: [&str; 4] = ["insert", "update", "replace", "delete"];

/// Builds the server-side `$match` pipeline for the feed.
///
/// The operation-kind restriction is always present; the collection
/// allow-list is added when configured.
pub fn build_match_stage(collections: Option<&[String]>) -> Vec<Document> {
    let mut matcher = doc! {
        "operationType": { "$in": REPLICATED_OPERATIONS.to_vec() }
    };
    if let Some(collections) = collections {
        matcher.insert("ns.coll", doc! { "$in": collections.to_vec() });
    }
    vec![doc! { "$match": matcher }]
}

/// Options for opening a feed session.
#[derive(Debug, Clone, Default)]
pub struct FeedOptions {
    /// Server-side filter pipeline
    pub pipeline: Vec<Document>,

    /// Resume position from the checkpoint store, absent on cold start
    pub resume_after: Option<Document>,
}

/// Trait for the upstream feed collaborator.
#[async_trait::async_trait]
pub trait EventSource: Send + Sync {
    /// Checks that the deployment can serve a resumable change feed.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::Unsupported`] when it cannot, or a connection
    /// error when the probe itself fails.
    async fn probe(&self) -> Result<(), FeedError>;

    /// Opens a live feed session.
    ///
    /// # Errors
    ///
    /// Returns an error if the feed cannot be opened (bad resume position,
    /// connection failure, ...).
    async fn open(&self, options: FeedOptions) -> Result<Box<dyn FeedHandle>, FeedError>;
}

/// A live feed session.
#[async_trait::async_trait]
pub trait FeedHandle: Send + std::fmt::Debug {
    /// Waits for the next feed message.
    ///
    /// Returns `None` when the feed has closed (explicitly or upstream).
    async fn next(&mut self) -> Option<Result<ChangeEvent, FeedError>>;

    /// Stops delivery and releases the session.
    async fn close(&mut self);
}

/// Errors produced by the feed collaborator.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    /// Transport-level disruption
    #[error("feed connection error: {message}")]
    Connection {
        /// Human-readable error message
        message: String,
        /// Underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The deployment cannot serve change streams
    #[error("the source deployment does not support change streams: {reason}")]
    Unsupported {
        /// Why the capability probe failed
        reason: String,
    },

    /// A delivered event could not be converted
    #[error(transparent)]
    Conversion(#[from] ConversionError),
}

impl From<mongodb::error::Error> for FeedError {
    fn from(err: mongodb::error::Error) -> Self {
        Self::Connection {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

/// Change feed backed by MongoDB change streams.
pub struct MongoEventSource {
    client: Client,
    database: String,
}

impl MongoEventSource {
    /// Creates a source over an existing client.
    pub fn new(client: Client, database: impl Into<String>) -> Self {
        Self {
            client,
            database: database.into(),
        }
    }

    /// Connects to the deployment at `uri` and watches `database`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URI cannot be parsed.
    pub async fn connect(uri: &str, database: impl Into<String>) -> Result<Self, FeedError> {
        let client = Client::with_uri_str(uri).await?;
        Ok(Self::new(client, database))
    }

    /// Converts a checkpoint token document into the driver's resume token.
    fn to_resume_token(token: &Document) -> Option<ResumeToken> {
        match bson::to_vec(token)
            .map_err(|e| Box::new(e) as Box<dyn std::error::Error>)
            .and_then(|bytes| {
                bson::from_slice::<ResumeToken>(&bytes)
                    .map_err(|e| Box::new(e) as Box<dyn std::error::Error>)
            }) {
            Ok(resume_token) => Some(resume_token),
            Err(e) => {
                warn!(error = %e, "persisted checkpoint token is unusable, starting fresh");
                None
            }
        }
    }
}

#[async_trait::async_trait]
impl EventSource for MongoEventSource {
    async fn probe(&self) -> Result<(), FeedError> {
        let reply = self
            .client
            .database("admin")
            .run_command(doc! { "hello": 1 })
            .await?;

        // Change streams need an oplog: a replica set member reports
        // `setName`, a mongos reports `msg: "isdbgrid"`. A bare standalone
        // reports neither.
        let is_replica_set = reply.get("setName").is_some();
        let is_sharded = reply.get_str("msg").map(|m| m == "isdbgrid").unwrap_or(false);

        if is_replica_set || is_sharded {
            debug!(database = %self.database, "change stream capability confirmed");
            Ok(())
        } else {
            Err(FeedError::Unsupported {
                reason: "the deployment is a standalone server without an oplog".to_string(),
            })
        }
    }

    async fn open(&self, options: FeedOptions) -> Result<Box<dyn FeedHandle>, FeedError> {
        let database = self.client.database(&self.database);

        let mut stream_options = ChangeStreamOptions::default();
        stream_options.full_document = Some(FullDocumentType::UpdateLookup);
        if let Some(token) = &options.resume_after {
            stream_options.resume_after = Self::to_resume_token(token);
        }

        let resuming = stream_options.resume_after.is_some();
        let stream = if options.pipeline.is_empty() {
            database.watch().with_options(stream_options).await?
        } else {
            database
                .watch()
                .pipeline(options.pipeline.clone())
                .with_options(stream_options)
                .await?
        };

        info!(database = %self.database, resuming, "change feed opened");
        Ok(Box::new(MongoFeedHandle {
            stream: Some(stream),
        }))
    }
}

/// Live change stream session.
struct MongoFeedHandle {
    stream: Option<ChangeStream<ChangeStreamEvent<Document>>>,
}

impl std::fmt::Debug for MongoFeedHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MongoFeedHandle").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl FeedHandle for MongoFeedHandle {
    async fn next(&mut self) -> Option<Result<ChangeEvent, FeedError>> {
        let stream = self.stream.as_mut()?;
        match stream.next().await {
            Some(Ok(raw)) => Some(ChangeEvent::try_from(raw).map_err(FeedError::from)),
            Some(Err(e)) => Some(Err(FeedError::from(e))),
            None => None,
        }
    }

    async fn close(&mut self) {
        // Dropping the change stream closes the server-side cursor.
        self.stream = None;
        debug!("change feed closed");
    }
}

/// Scripted feed for tests.
///
/// Each call to [`MockEventSource::session`] enqueues one feed session and
/// returns its sender; `open` pops sessions in order and fails when none
/// are left, which makes reconnect exhaustion easy to script.
#[derive(Debug)]
pub struct MockEventSource {
    sessions: Mutex<VecDeque<mpsc::UnboundedReceiver<Result<ChangeEvent, FeedError>>>>,
    supported: AtomicBool,
    probes: AtomicU32,
    opens: AtomicU32,
    last_options: Mutex<Option<FeedOptions>>,
}

impl Default for MockEventSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEventSource {
    /// Creates a source with change stream support and no sessions.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(VecDeque::new()),
            supported: AtomicBool::new(true),
            probes: AtomicU32::new(0),
            opens: AtomicU32::new(0),
            last_options: Mutex::new(None),
        }
    }

    /// Enqueues a feed session; messages sent on the returned sender are
    /// yielded by the session's handle. Dropping the sender closes the feed.
    pub async fn session(&self) -> mpsc::UnboundedSender<Result<ChangeEvent, FeedError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.lock().await.push_back(rx);
        tx
    }

    /// Switches the capability probe outcome.
    pub fn set_supported(&self, supported: bool) {
        self.supported.store(supported, Ordering::Relaxed);
    }

    /// Number of `probe` calls so far.
    pub fn probe_count(&self) -> u32 {
        self.probes.load(Ordering::Relaxed)
    }

    /// Number of `open` calls so far.
    pub fn open_count(&self) -> u32 {
        self.opens.load(Ordering::Relaxed)
    }

    /// Options passed to the most recent `open` call.
    pub async fn last_options(&self) -> Option<FeedOptions> {
        self.last_options.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl EventSource for MockEventSource {
    async fn probe(&self) -> Result<(), FeedError> {
        self.probes.fetch_add(1, Ordering::Relaxed);
        if self.supported.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(FeedError::Unsupported {
                reason: "mock deployment has no change stream support".to_string(),
            })
        }
    }

    async fn open(&self, options: FeedOptions) -> Result<Box<dyn FeedHandle>, FeedError> {
        self.opens.fetch_add(1, Ordering::Relaxed);
        *self.last_options.lock().await = Some(options);

        match self.sessions.lock().await.pop_front() {
            Some(receiver) => Ok(Box::new(MockFeedHandle {
                receiver: Some(receiver),
            })),
            None => Err(FeedError::Connection {
                message: "no scripted feed session available".to_string(),
                source: None,
            }),
        }
    }
}

/// Handle over one scripted session.
struct MockFeedHandle {
    receiver: Option<mpsc::UnboundedReceiver<Result<ChangeEvent, FeedError>>>,
}

impl std::fmt::Debug for MockFeedHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockFeedHandle").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl FeedHandle for MockFeedHandle {
    async fn next(&mut self) -> Option<Result<ChangeEvent, FeedError>> {
        match self.receiver.as_mut() {
            Some(receiver) => receiver.recv().await,
            None => None,
        }
    }

    async fn close(&mut self) {
        self.receiver = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Namespace, OperationType};
    use chrono::Utc;

    #[test]
    fn match_stage_restricts_operations() {
        let pipeline = build_match_stage(None);
        assert_eq!(pipeline.len(), 1);

        let matcher = pipeline[0].get_document("$match").unwrap();
        let ops = matcher
            .get_document("operationType")
            .unwrap()
            .get_array("$in")
            .unwrap();
        assert_eq!(ops.len(), 4);
        assert!(matcher.get("ns.coll").is_none());
    }

    #[test]
    fn match_stage_includes_allow_list() {
        let collections = vec!["orders".to_string(), "customers".to_string()];
        let pipeline = build_match_stage(Some(&collections));

        let matcher = pipeline[0].get_document("$match").unwrap();
        let allowed = matcher
            .get_document("ns.coll")
            .unwrap()
            .get_array("$in")
            .unwrap();
        assert_eq!(allowed.len(), 2);
    }

    #[tokio::test]
    async fn mock_source_probe_can_be_unsupported() {
        let source = MockEventSource::new();
        assert!(source.probe().await.is_ok());

        source.set_supported(false);
        let err = source.probe().await.unwrap_err();
        assert!(matches!(err, FeedError::Unsupported { .. }));
        assert_eq!(source.probe_count(), 2);
    }

    #[tokio::test]
    async fn mock_session_yields_events_then_closes() {
        let source = MockEventSource::new();
        let sender = source.session().await;

        let mut handle = source.open(FeedOptions::default()).await.unwrap();

        let event = ChangeEvent {
            operation: OperationType::Insert,
            namespace: Namespace::new("db", "c"),
            document_key: Some(doc! { "_id": 1 }),
            full_document: Some(doc! { "_id": 1 }),
            cluster_time: Utc::now(),
            resume_token: doc! { "_data": "t" },
        };
        sender.send(Ok(event.clone())).unwrap();

        let received = handle.next().await.unwrap().unwrap();
        assert_eq!(received, event);

        drop(sender);
        assert!(handle.next().await.is_none());
    }

    #[tokio::test]
    async fn mock_open_fails_without_sessions() {
        let source = MockEventSource::new();
        let err = source.open(FeedOptions::default()).await.unwrap_err();
        assert!(matches!(err, FeedError::Connection { .. }));
        assert_eq!(source.open_count(), 1);
    }
}
