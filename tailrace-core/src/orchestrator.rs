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

//! Change feed orchestration.
//!
//! The [`Orchestrator`] drives the whole pipeline: it probes the source for
//! change feed capability, connects every replication target, loads the last
//! checkpoint, opens the feed resuming from it, and then consumes events one
//! at a time: fan-out to all targets concurrently, settle, advance the
//! checkpoint, repeat. Transient feed disruptions self-heal through a
//! bounded exponential-backoff reconnect; only configuration errors, startup
//! failures and reconnect exhaustion surface to the caller.
//!
//! # Ordering and the checkpoint invariant
//!
//! Event processing is strictly serialized: event *N+1* is not touched until
//! event *N*'s fan-out and checkpoint write have settled. Within one event,
//! the fan-out is the only concurrency, and it is a settle-all join: one
//! target's failure neither stops the others nor aborts the pipeline. The
//! checkpoint is advanced only after the fan-out settles, so a crash replays
//! at most the one event that was in flight.
//!
//! # Example
//!
//! ```rust,no_run
//! use tailrace_core::config::{SyncConfig, TargetConfig};
//! use tailrace_core::orchestrator::Orchestrator;
//! # use tailrace_core::checkpoint::{CheckpointStore, CheckpointError, CheckpointToken};
//! # struct SomeStore;
//! # #[async_trait::async_trait]
//! # impl CheckpointStore for SomeStore {
//! #     async fn load(&self) -> Result<Option<CheckpointToken>, CheckpointError> { Ok(None) }
//! #     async fn save(&self, _t: &CheckpointToken) -> Result<(), CheckpointError> { Ok(()) }
//! #     async fn clear(&self) -> Result<(), CheckpointError> { Ok(()) }
//! # }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SyncConfig::builder()
//!     .source_uri("mongodb://primary:27017")
//!     .database("shop")
//!     .target(TargetConfig::new("dr-site", "mongodb://backup:27017"))
//!     .build()?;
//!
//! let store = SomeStore;
//! let mut engine = Orchestrator::for_mongodb(config, store).await?;
//! engine.start().await?;
//! // ... later ...
//! engine.stop().await;
//! # Ok(())
//! # }
//! ```

use crate::checkpoint::{CheckpointStore, CheckpointToken};
use crate::config::{ConfigError, SyncConfig};
use crate::feed::{build_match_stage, EventSource, FeedError, FeedHandle, FeedOptions};
use crate::feed::MongoEventSource;
use crate::metrics::{self, EngineStatus};
use crate::pool::MongoPool;
use crate::target::{ReplicationTarget, Target, TargetError, TargetStats};
use crate::event::ChangeEvent;
use chrono::{DateTime, Utc};
use futures::future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, trace, warn};

/// Maximum number of feed reconnect attempts before the engine parks.
const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Base delay of the reconnect backoff (milliseconds).
const RECONNECT_BASE_DELAY_MS: u64 = 1000;

/// What to do when the probe says the deployment cannot serve a feed.
const UNSUPPORTED_REMEDIATION: &str = "change streams require a replica set or sharded \
     cluster; initialize a single-node replica set with rs.initiate() or point the engine \
     at a cluster member";

/// Returns the sleep before reconnect attempt `attempt` (zero-based).
///
/// The schedule is fixed: 1s, 2s, 4s, 8s, 16s.
fn reconnect_backoff(attempt: u32) -> Duration {
    Duration::from_millis(RECONNECT_BASE_DELAY_MS.saturating_mul(1u64 << attempt))
}

/// Aggregate counters, shared with the event loop task.
#[derive(Debug, Clone, Default)]
struct Counters {
    events_seen: u64,
    events_synced: u64,
    errors: u64,
    started_at: Option<DateTime<Utc>>,
    last_event_at: Option<DateTime<Utc>>,
}

/// Point-in-time snapshot of the engine, with per-target detail.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorStats {
    /// Whether the engine is consuming the feed
    pub running: bool,

    /// Whether a reconnect is in progress
    pub reconnecting: bool,

    /// Events received from the feed
    pub events_seen: u64,

    /// Events whose fan-out settled (regardless of per-target outcomes)
    pub events_synced: u64,

    /// Feed errors plus per-target apply errors
    pub errors: u64,

    /// When the engine last started
    pub started_at: Option<DateTime<Utc>>,

    /// When the last event arrived
    pub last_event_at: Option<DateTime<Utc>>,

    /// Per-target counter snapshots
    pub targets: Vec<TargetStats>,
}

/// State shared between the handle and the event loop task.
struct Inner<S> {
    config: SyncConfig,
    source: Arc<dyn EventSource>,
    store: S,
    targets: Vec<Arc<dyn Target>>,
    counters: RwLock<Counters>,
    running: RwLock<bool>,
    reconnecting: AtomicBool,
}

/// Outcome of a reconnect that did not exhaust its attempts.
enum ReconnectOutcome {
    /// A fresh feed handle was installed
    Resumed,
    /// The engine was stopped while reconnecting
    StopRequested,
}

/// The change feed orchestrator.
///
/// Owns the feed session, the targets and the checkpoint store for one
/// replication run. Starting a running engine fails with
/// [`OrchestratorError::AlreadyRunning`]; stopping a stopped one is a no-op.
pub struct Orchestrator<S: CheckpointStore> {
    inner: Arc<Inner<S>>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    loop_task: Option<JoinHandle<Result<(), OrchestratorError>>>,
}

impl<S: CheckpointStore> std::fmt::Debug for Orchestrator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator").finish_non_exhaustive()
    }
}

impl<S: CheckpointStore + 'static> Orchestrator<S> {
    /// Creates an orchestrator over injected collaborators.
    ///
    /// The configuration is validated here even though the builder already
    /// validated it; an invalid or disabled configuration never yields an
    /// orchestrator.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::ConfigInvalid`] for a malformed config
    /// and [`OrchestratorError::Disabled`] when replication is switched off.
    pub fn new(
        config: SyncConfig,
        store: S,
        source: Arc<dyn EventSource>,
        targets: Vec<Arc<dyn Target>>,
    ) -> Result<Self, OrchestratorError> {
        config.validate()?;
        if !config.enabled {
            return Err(OrchestratorError::Disabled);
        }

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                source,
                store,
                targets,
                counters: RwLock::new(Counters::default()),
                running: RwLock::new(false),
                reconnecting: AtomicBool::new(false),
            }),
            shutdown_tx: None,
            loop_task: None,
        })
    }

    /// Creates an orchestrator with the MongoDB-backed collaborators: a
    /// change stream feed over the configured source deployment and one
    /// pooled [`ReplicationTarget`] per configured target.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid or the source URI cannot
    /// be parsed. No connections are attempted here; that happens in
    /// [`start`](Self::start).
    pub async fn for_mongodb(config: SyncConfig, store: S) -> Result<Self, OrchestratorError> {
        config.validate()?;

        let source = Arc::new(
            MongoEventSource::connect(&config.source_uri, config.database.clone()).await?,
        );

        let pool = Arc::new(MongoPool::new());
        let targets = config
            .targets
            .iter()
            .map(|target| {
                Arc::new(ReplicationTarget::new(target.clone(), pool.clone())) as Arc<dyn Target>
            })
            .collect();

        Self::new(config, store, source, targets)
    }

    /// Starts the engine.
    ///
    /// Probes the source for change feed capability, connects every target
    /// (fail-fast: a partial target set is not allowed to start serving),
    /// loads the last checkpoint, opens the feed resuming from it, and
    /// spawns the event loop.
    ///
    /// # Errors
    ///
    /// - [`OrchestratorError::AlreadyRunning`] when called twice
    /// - [`OrchestratorError::EnvironmentUnsupported`] when the deployment
    ///   cannot serve a durable, resumable change feed
    /// - [`OrchestratorError::TargetConnect`] when any destination is
    ///   unreachable
    /// - [`OrchestratorError::Feed`] when the feed cannot be opened
    #[instrument(skip(self), fields(database = %self.inner.config.database))]
    pub async fn start(&mut self) -> Result<(), OrchestratorError> {
        let inner = Arc::clone(&self.inner);
        let mut running = inner.running.write().await;
        if *running {
            return Err(OrchestratorError::AlreadyRunning);
        }

        info!(targets = inner.targets.len(), "starting replication engine");

        let handle = Inner::open_pipeline(&inner).await?;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx);

        inner.counters.write().await.started_at = Some(Utc::now());
        *running = true;
        drop(running);

        metrics::set_engine_status(EngineStatus::Running);
        metrics::set_connected_targets(self.inner.targets.len());

        let inner = Arc::clone(&self.inner);
        self.loop_task = Some(tokio::spawn(Inner::event_loop(inner, handle, shutdown_rx)));

        info!("replication engine started");
        Ok(())
    }

    /// Stops the engine. Idempotent.
    ///
    /// Signals the event loop, which closes the feed handle (unblocking any
    /// pending read), then closes all targets concurrently. An apply
    /// already in flight is left to finish or fail naturally.
    #[instrument(skip(self))]
    pub async fn stop(&mut self) {
        {
            let mut running = self.inner.running.write().await;
            if !*running && self.loop_task.is_none() {
                debug!("stop requested but engine is not running");
                return;
            }
            *running = false;
        }

        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }

        if let Some(task) = self.loop_task.take() {
            match task.await {
                Ok(Ok(())) => debug!("event loop stopped"),
                Ok(Err(e)) => error!(error = %e, "event loop stopped with error"),
                Err(e) => error!(error = %e, "event loop panicked"),
            }
        }

        Inner::<S>::close_targets(&self.inner.targets).await;

        metrics::set_engine_status(EngineStatus::Stopped);
        metrics::set_connected_targets(0);

        let counters = self.inner.counters.read().await.clone();
        info!(
            events_seen = counters.events_seen,
            events_synced = counters.events_synced,
            errors = counters.errors,
            "replication engine stopped"
        );
    }

    /// Returns true while the event loop is meant to be consuming the feed.
    pub async fn is_running(&self) -> bool {
        *self.inner.running.read().await
    }

    /// Returns aggregate counters plus a per-target snapshot.
    pub async fn stats(&self) -> OrchestratorStats {
        let counters = self.inner.counters.read().await.clone();
        let mut targets = Vec::with_capacity(self.inner.targets.len());
        for target in &self.inner.targets {
            targets.push(target.stats().await);
        }

        OrchestratorStats {
            running: *self.inner.running.read().await,
            reconnecting: self.inner.reconnecting.load(Ordering::SeqCst),
            events_seen: counters.events_seen,
            events_synced: counters.events_synced,
            errors: counters.errors,
            started_at: counters.started_at,
            last_event_at: counters.last_event_at,
            targets,
        }
    }
}

impl<S: CheckpointStore + 'static> Inner<S> {
    /// Probes the source, connects targets fail-fast, loads the checkpoint
    /// and opens the feed. Shared between `start` and the reconnect loop.
    async fn open_pipeline(inner: &Arc<Self>) -> Result<Box<dyn FeedHandle>, OrchestratorError> {
        if let Err(e) = inner.source.probe().await {
            return Err(Self::map_probe_error(e));
        }

        for target in &inner.targets {
            if let Err(e) = target.connect().await {
                // A partial target set must not start serving.
                Self::close_targets(&inner.targets).await;
                return Err(OrchestratorError::TargetConnect {
                    target: target.name().to_string(),
                    source: e,
                });
            }
        }

        let resume_after = Self::load_checkpoint(&inner.store).await;
        if resume_after.is_some() {
            info!("resuming feed from persisted checkpoint");
        } else {
            info!("no checkpoint found, starting feed from now");
        }

        let pipeline = build_match_stage(inner.config.collections.as_deref());
        let handle = inner
            .source
            .open(FeedOptions {
                pipeline,
                resume_after,
            })
            .await?;

        Ok(handle)
    }

    fn map_probe_error(error: FeedError) -> OrchestratorError {
        match error {
            FeedError::Unsupported { reason } => OrchestratorError::EnvironmentUnsupported {
                reason,
                remediation: UNSUPPORTED_REMEDIATION.to_string(),
            },
            other => OrchestratorError::Feed(other),
        }
    }

    /// Loads the checkpoint, downgrading failures to a cold start.
    async fn load_checkpoint(store: &S) -> Option<CheckpointToken> {
        match store.load().await {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "checkpoint load failed, treating as cold start");
                None
            }
        }
    }

    /// Persists the checkpoint best-effort: a failed write is logged and
    /// swallowed. Losing one write risks replaying a single event on the
    /// next restart, which is preferable to halting replication.
    async fn try_save_checkpoint(store: &S, token: &CheckpointToken) {
        match store.save(token).await {
            Ok(()) => {
                metrics::increment_checkpoint_saves();
                trace!("checkpoint saved");
            }
            Err(e) => {
                metrics::increment_checkpoint_save_failures();
                warn!(error = %e, "checkpoint write failed, continuing without it");
            }
        }
    }

    /// Closes all targets concurrently, logging individual failures.
    async fn close_targets(targets: &[Arc<dyn Target>]) {
        let closes = targets.iter().map(|target| target.close());
        for (target, result) in targets.iter().zip(future::join_all(closes).await) {
            if let Err(e) = result {
                warn!(destination = target.name(), error = %e, "failed to close target");
            }
        }
    }

    /// The single-consumer event loop.
    async fn event_loop(
        inner: Arc<Self>,
        mut handle: Box<dyn FeedHandle>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<(), OrchestratorError> {
        debug!("event loop started");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    handle.close().await;
                    debug!("shutdown signal received, event loop exiting");
                    return Ok(());
                }

                message = handle.next() => {
                    match message {
                        Some(Ok(event)) => {
                            Self::handle_change(&inner, event).await;
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "feed error");
                            inner.counters.write().await.errors += 1;
                            match Self::reconnect(&inner, &mut handle, &mut shutdown_rx).await? {
                                ReconnectOutcome::Resumed => {}
                                ReconnectOutcome::StopRequested => return Ok(()),
                            }
                        }
                        None => {
                            if !*inner.running.read().await {
                                return Ok(());
                            }
                            // Covers silent drops as well as explicit errors.
                            warn!("feed closed while the engine should be running");
                            match Self::reconnect(&inner, &mut handle, &mut shutdown_rx).await? {
                                ReconnectOutcome::Resumed => {}
                                ReconnectOutcome::StopRequested => return Ok(()),
                            }
                        }
                    }
                }
            }
        }
    }

    /// Processes one event: filter, transform, concurrent fan-out with a
    /// settle-all join, then checkpoint.
    ///
    /// The checkpoint advances even when every target failed to apply the
    /// event. Availability wins over durability here: failed targets
    /// converge again through idempotent upserts on the next event they do
    /// receive, and a bounded replay window is preferred over a stalled
    /// feed.
    async fn handle_change(inner: &Arc<Self>, mut event: ChangeEvent) {
        {
            let mut counters = inner.counters.write().await;
            counters.events_seen += 1;
            counters.last_event_at = Some(Utc::now());
        }
        metrics::increment_events_seen(event.operation.as_str());

        if let Some(filter) = &inner.config.filter {
            if !filter.should_keep(&event) {
                trace!(
                    operation = %event.operation,
                    collection = event.collection_name(),
                    "event dropped by filter"
                );
                metrics::increment_events_filtered();
                return;
            }
        }

        if let Some(transform) = &inner.config.transform {
            if let Some(document) = event.full_document.take() {
                event.full_document = Some(transform.apply(document));
            }
        }

        debug!(
            operation = %event.operation,
            namespace = %event.full_namespace(),
            "dispatching event to targets"
        );

        let applies = inner.targets.iter().map(|target| target.apply(&event));
        let results = future::join_all(applies).await;

        let mut failures = 0u64;
        for (target, result) in inner.targets.iter().zip(results) {
            if let Err(e) = result {
                failures += 1;
                warn!(destination = target.name(), error = %e, "target failed to apply event");
            }
        }

        {
            let mut counters = inner.counters.write().await;
            counters.errors += failures;
            counters.events_synced += 1;
        }
        metrics::increment_events_synced();

        Self::try_save_checkpoint(&inner.store, &event.resume_token).await;
    }

    /// Marks the reconnecting state around the bounded reconnect loop.
    async fn reconnect(
        inner: &Arc<Self>,
        handle: &mut Box<dyn FeedHandle>,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Result<ReconnectOutcome, OrchestratorError> {
        if inner.reconnecting.swap(true, Ordering::SeqCst) {
            // The event loop is strictly serial; a second trigger can only
            // mean a logic change elsewhere.
            debug!("reconnect already in progress");
        }
        metrics::set_engine_status(EngineStatus::Reconnecting);

        let result = Self::reconnect_loop(inner, handle, shutdown_rx).await;

        inner.reconnecting.store(false, Ordering::SeqCst);
        match &result {
            Ok(ReconnectOutcome::Resumed) => metrics::set_engine_status(EngineStatus::Running),
            _ => metrics::set_engine_status(EngineStatus::Stopped),
        }

        result
    }

    /// Bounded reconnect: each attempt closes the feed and all targets,
    /// sleeps the fixed backoff (1s, 2s, 4s, 8s, 16s), then runs the full
    /// start sequence again. Exhaustion parks the engine in the stopped
    /// state; a caller must start it again by hand.
    async fn reconnect_loop(
        inner: &Arc<Self>,
        handle: &mut Box<dyn FeedHandle>,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Result<ReconnectOutcome, OrchestratorError> {
        for attempt in 0..MAX_RECONNECT_ATTEMPTS {
            if !*inner.running.read().await {
                return Ok(ReconnectOutcome::StopRequested);
            }

            handle.close().await;
            Self::close_targets(&inner.targets).await;

            let delay = reconnect_backoff(attempt);
            warn!(
                attempt = attempt + 1,
                max_attempts = MAX_RECONNECT_ATTEMPTS,
                delay_ms = delay.as_millis() as u64,
                "reconnecting change feed"
            );
            metrics::increment_feed_reconnects();

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.recv() => return Ok(ReconnectOutcome::StopRequested),
            }

            match Self::open_pipeline(inner).await {
                Ok(new_handle) => {
                    info!(attempt = attempt + 1, "change feed reconnected");
                    *handle = new_handle;
                    return Ok(ReconnectOutcome::Resumed);
                }
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, "reconnect attempt failed");
                }
            }
        }

        *inner.running.write().await = false;
        error!(
            attempts = MAX_RECONNECT_ATTEMPTS,
            "reconnect attempts exhausted, engine parked; a manual start is required"
        );
        Err(OrchestratorError::ReconnectExhausted {
            attempts: MAX_RECONNECT_ATTEMPTS,
        })
    }
}

/// Errors surfaced by the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// `start` was called on a running engine
    #[error("replication engine is already running")]
    AlreadyRunning,

    /// Replication is switched off in the configuration
    #[error("replication is disabled in the sync configuration")]
    Disabled,

    /// The configuration failed validation
    #[error(transparent)]
    ConfigInvalid(#[from] ConfigError),

    /// The source deployment cannot serve a durable, resumable change feed
    #[error("the source deployment cannot serve a change feed: {reason}. {remediation}")]
    EnvironmentUnsupported {
        /// Why the capability probe failed
        reason: String,
        /// What the operator can do about it
        remediation: String,
    },

    /// A destination could not be reached during startup
    #[error("target `{target}` failed to connect: {source}")]
    TargetConnect {
        /// Name of the unreachable target
        target: String,
        /// Underlying target error
        #[source]
        source: TargetError,
    },

    /// The feed could not be opened
    #[error(transparent)]
    Feed(#[from] FeedError),

    /// All reconnect attempts failed; the engine is parked
    #[error("feed reconnect attempts exhausted after {attempts} tries")]
    ReconnectExhausted {
        /// How many attempts were made
        attempts: u32,
    },
}
