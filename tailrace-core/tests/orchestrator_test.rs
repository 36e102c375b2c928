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

//! Integration tests for the change feed orchestrator.
//!
//! These drive the engine end to end over the scripted feed and in-memory
//! targets: fan-out, failure isolation, filter short-circuit, checkpoint
//! ordering, and the bounded reconnect.

use bson::{doc, Document};
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tailrace_core::checkpoint::{CheckpointError, CheckpointStore, CheckpointToken};
use tailrace_core::config::{SyncConfig, TargetConfig};
use tailrace_core::event::{ChangeEvent, Namespace, OperationType};
use tailrace_core::feed::{FeedError, MockEventSource};
use tailrace_core::orchestrator::{Orchestrator, OrchestratorError};
use tailrace_core::target::{MockTarget, Target};
use tokio::sync::{Mutex, Semaphore};

/// In-memory checkpoint store with externally observable state.
#[derive(Debug, Clone, Default)]
struct MemoryStore {
    token: Arc<Mutex<Option<Document>>>,
    saves: Arc<AtomicU64>,
    fail_saves: bool,
}

impl MemoryStore {
    fn failing() -> Self {
        Self {
            fail_saves: true,
            ..Self::default()
        }
    }

    async fn token(&self) -> Option<Document> {
        self.token.lock().await.clone()
    }

    fn save_count(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }
}

#[async_trait::async_trait]
impl CheckpointStore for MemoryStore {
    async fn load(&self) -> Result<Option<CheckpointToken>, CheckpointError> {
        Ok(self.token.lock().await.clone())
    }

    async fn save(&self, token: &CheckpointToken) -> Result<(), CheckpointError> {
        if self.fail_saves {
            return Err(CheckpointError::Other("simulated save failure".to_string()));
        }
        *self.token.lock().await = Some(token.clone());
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn clear(&self) -> Result<(), CheckpointError> {
        *self.token.lock().await = None;
        Ok(())
    }
}

fn insert_event(collection: &str, id: i32, name: &str) -> ChangeEvent {
    ChangeEvent {
        operation: OperationType::Insert,
        namespace: Namespace::new("shop", collection),
        document_key: Some(doc! { "_id": id }),
        full_document: Some(doc! { "_id": id, "name": name }),
        cluster_time: Utc::now(),
        resume_token: doc! { "_data": format!("token-{}-{}", collection, id) },
    }
}

fn base_config() -> SyncConfig {
    SyncConfig::builder()
        .source_uri("mongodb://primary:27017")
        .database("shop")
        .target(TargetConfig::new("a", "mongodb://a:27017"))
        .target(TargetConfig::new("b", "mongodb://b:27017"))
        .build()
        .expect("valid test config")
}

/// Polls an async condition until it holds or ~100 virtual seconds pass.
///
/// Generous on purpose: the paused clock has to auto-advance through the
/// full 31s reconnect backoff schedule in some tests.
macro_rules! wait_until {
    ($cond:expr) => {
        let mut met = false;
        for _ in 0..5000 {
            if $cond {
                met = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(met, "condition not met in time: {}", stringify!($cond));
    };
}

#[tokio::test(start_paused = true)]
async fn insert_fans_out_to_all_targets_and_checkpoints_once() {
    let config = SyncConfig::builder()
        .source_uri("mongodb://primary:27017")
        .database("shop")
        .target(TargetConfig::new("a", "mongodb://a:27017"))
        .target(TargetConfig::new("b", "mongodb://b:27017"))
        .collections(vec!["orders".to_string()])
        .build()
        .unwrap();

    let source = Arc::new(MockEventSource::new());
    let sender = source.session().await;
    let store = MemoryStore::default();

    let target_a = Arc::new(MockTarget::new("a"));
    let target_b = Arc::new(MockTarget::new("b"));
    let targets: Vec<Arc<dyn Target>> = vec![target_a.clone(), target_b.clone()];

    let mut engine = Orchestrator::new(config, store.clone(), source.clone(), targets).unwrap();
    engine.start().await.unwrap();

    // The feed-side pipeline restricts operations and applies the allow-list.
    let options = source.last_options().await.unwrap();
    assert!(options.resume_after.is_none());
    let matcher = options.pipeline[0].get_document("$match").unwrap();
    assert!(matcher.get_document("operationType").is_ok());
    assert!(matcher.get_document("ns.coll").is_ok());

    let event = insert_event("orders", 1, "a");
    sender.send(Ok(event.clone())).unwrap();

    wait_until!(engine.stats().await.events_synced == 1);

    let stats = engine.stats().await;
    assert_eq!(stats.events_seen, 1);
    assert_eq!(stats.events_synced, 1);
    assert_eq!(stats.errors, 0);
    assert!(stats.last_event_at.is_some());

    for target in [&target_a, &target_b] {
        let stored = target
            .document("shop.orders", &bson::Bson::Int32(1))
            .await
            .unwrap();
        assert_eq!(stored, doc! { "_id": 1, "name": "a" });
        assert_eq!(target.stats().await.events_applied, 1);
    }

    assert_eq!(store.save_count(), 1);
    assert_eq!(store.token().await.unwrap(), event.resume_token);

    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn one_failing_target_does_not_stop_the_others() {
    let config = SyncConfig::builder()
        .source_uri("mongodb://primary:27017")
        .database("shop")
        .target(TargetConfig::new("one", "mongodb://a:27017"))
        .target(TargetConfig::new("two", "mongodb://b:27017"))
        .target(TargetConfig::new("three", "mongodb://c:27017"))
        .build()
        .unwrap();

    let source = Arc::new(MockEventSource::new());
    let sender = source.session().await;
    let store = MemoryStore::default();

    let one = Arc::new(MockTarget::new("one"));
    let two = Arc::new(MockTarget::failing("two"));
    let three = Arc::new(MockTarget::new("three"));
    let targets: Vec<Arc<dyn Target>> = vec![one.clone(), two.clone(), three.clone()];

    let mut engine = Orchestrator::new(config, store.clone(), source, targets).unwrap();
    engine.start().await.unwrap();

    sender.send(Ok(insert_event("orders", 5, "x"))).unwrap();
    wait_until!(engine.stats().await.events_synced == 1);

    // The healthy targets received the event.
    assert_eq!(one.stats().await.events_applied, 1);
    assert_eq!(three.stats().await.events_applied, 1);

    // The failing target counted its error without aborting the handler.
    let failed = two.stats().await;
    assert_eq!(failed.events_applied, 0);
    assert_eq!(failed.errors, 1);
    assert!(failed.last_error.is_some());

    // The pipeline kept going and the checkpoint still advanced.
    let stats = engine.stats().await;
    assert_eq!(stats.events_synced, 1);
    assert_eq!(stats.errors, 1);
    assert_eq!(store.save_count(), 1);
    assert!(engine.is_running().await);

    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn filtered_events_never_reach_targets_or_the_checkpoint() {
    let config = SyncConfig::builder()
        .source_uri("mongodb://primary:27017")
        .database("shop")
        .target(TargetConfig::new("a", "mongodb://a:27017"))
        .target(TargetConfig::new("b", "mongodb://b:27017"))
        .filter(|event: &ChangeEvent| event.collection_name() != "audit")
        .build()
        .unwrap();

    let source = Arc::new(MockEventSource::new());
    let sender = source.session().await;
    let store = MemoryStore::default();

    let target_a = Arc::new(MockTarget::new("a"));
    let target_b = Arc::new(MockTarget::new("b"));
    let targets: Vec<Arc<dyn Target>> = vec![target_a.clone(), target_b.clone()];

    let mut engine = Orchestrator::new(config, store.clone(), source, targets).unwrap();
    engine.start().await.unwrap();

    sender.send(Ok(insert_event("audit", 1, "dropped"))).unwrap();
    wait_until!(engine.stats().await.events_seen == 1);

    // Dropped before apply and before the checkpoint write.
    assert_eq!(engine.stats().await.events_synced, 0);
    assert_eq!(target_a.stats().await.events_applied, 0);
    assert_eq!(target_b.stats().await.events_applied, 0);
    assert_eq!(store.save_count(), 0);

    // A kept event still flows.
    sender.send(Ok(insert_event("orders", 2, "kept"))).unwrap();
    wait_until!(engine.stats().await.events_synced == 1);
    assert_eq!(target_a.stats().await.events_applied, 1);
    assert_eq!(store.save_count(), 1);

    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn transform_reshapes_the_document_before_apply() {
    let config = SyncConfig::builder()
        .source_uri("mongodb://primary:27017")
        .database("shop")
        .target(TargetConfig::new("a", "mongodb://a:27017"))
        .transform(|mut document: Document| {
            document.insert("mirrored", true);
            document
        })
        .build()
        .unwrap();

    let source = Arc::new(MockEventSource::new());
    let sender = source.session().await;
    let store = MemoryStore::default();

    let target = Arc::new(MockTarget::new("a"));
    let targets: Vec<Arc<dyn Target>> = vec![target.clone()];

    let mut engine = Orchestrator::new(config, store, source, targets).unwrap();
    engine.start().await.unwrap();

    sender.send(Ok(insert_event("orders", 3, "t"))).unwrap();
    wait_until!(engine.stats().await.events_synced == 1);

    let stored = target
        .document("shop.orders", &bson::Bson::Int32(3))
        .await
        .unwrap();
    assert_eq!(stored.get_bool("mirrored"), Ok(true));

    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn checkpoint_advances_only_after_the_fanout_settles() {
    let config = SyncConfig::builder()
        .source_uri("mongodb://primary:27017")
        .database("shop")
        .target(TargetConfig::new("slow", "mongodb://a:27017"))
        .build()
        .unwrap();

    let source = Arc::new(MockEventSource::new());
    let sender = source.session().await;
    let store = MemoryStore::default();

    let gate = Arc::new(Semaphore::new(0));
    let target = Arc::new(MockTarget::gated("slow", gate.clone()));
    let targets: Vec<Arc<dyn Target>> = vec![target.clone()];

    let mut engine = Orchestrator::new(config, store.clone(), source, targets).unwrap();
    engine.start().await.unwrap();

    sender.send(Ok(insert_event("orders", 1, "inflight"))).unwrap();
    wait_until!(engine.stats().await.events_seen == 1);

    // The apply is parked on the gate: the fan-out has not settled, so the
    // checkpoint must not reflect the event yet.
    assert_eq!(engine.stats().await.events_synced, 0);
    assert!(store.token().await.is_none());
    assert_eq!(store.save_count(), 0);

    gate.add_permits(1);
    wait_until!(engine.stats().await.events_synced == 1);
    assert_eq!(store.save_count(), 1);
    assert!(store.token().await.is_some());

    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn checkpoint_save_failures_are_swallowed() {
    let source = Arc::new(MockEventSource::new());
    let sender = source.session().await;
    let store = MemoryStore::failing();

    let target = Arc::new(MockTarget::new("a"));
    let targets: Vec<Arc<dyn Target>> = vec![target.clone()];

    let config = SyncConfig::builder()
        .source_uri("mongodb://primary:27017")
        .database("shop")
        .target(TargetConfig::new("a", "mongodb://a:27017"))
        .build()
        .unwrap();

    let mut engine = Orchestrator::new(config, store.clone(), source, targets).unwrap();
    engine.start().await.unwrap();

    sender.send(Ok(insert_event("orders", 1, "x"))).unwrap();
    sender.send(Ok(insert_event("orders", 2, "y"))).unwrap();
    wait_until!(engine.stats().await.events_synced == 2);

    // Both events were applied despite every checkpoint write failing.
    assert_eq!(target.stats().await.events_applied, 2);
    assert_eq!(store.save_count(), 0);
    assert!(engine.is_running().await);

    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn engine_resumes_from_a_persisted_checkpoint() {
    let source = Arc::new(MockEventSource::new());
    let _sender = source.session().await;

    let store = MemoryStore::default();
    let persisted = doc! { "_data": "persisted-token" };
    store.save(&persisted).await.unwrap();

    let targets: Vec<Arc<dyn Target>> = vec![Arc::new(MockTarget::new("a"))];
    let mut engine = Orchestrator::new(base_config(), store, source.clone(), targets).unwrap();
    engine.start().await.unwrap();

    let options = source.last_options().await.unwrap();
    assert_eq!(options.resume_after, Some(persisted));

    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn feed_error_reconnects_and_resumes_delivery() {
    let source = Arc::new(MockEventSource::new());
    let first = source.session().await;
    let second = source.session().await;
    let store = MemoryStore::default();

    let target = Arc::new(MockTarget::new("a"));
    let targets: Vec<Arc<dyn Target>> = vec![target.clone()];

    let config = SyncConfig::builder()
        .source_uri("mongodb://primary:27017")
        .database("shop")
        .target(TargetConfig::new("a", "mongodb://a:27017"))
        .build()
        .unwrap();

    let mut engine = Orchestrator::new(config, store, source.clone(), targets).unwrap();
    engine.start().await.unwrap();

    first.send(Ok(insert_event("orders", 1, "before"))).unwrap();
    wait_until!(engine.stats().await.events_synced == 1);

    // Transport disruption: the engine reconnects onto the second session.
    first
        .send(Err(FeedError::Connection {
            message: "socket reset".to_string(),
            source: None,
        }))
        .unwrap();

    wait_until!(source.open_count() == 2);

    second.send(Ok(insert_event("orders", 2, "after"))).unwrap();
    wait_until!(engine.stats().await.events_synced == 2);

    assert_eq!(target.stats().await.events_applied, 2);
    assert!(engine.is_running().await);

    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn reconnect_gives_up_after_five_attempts() {
    let source = Arc::new(MockEventSource::new());
    let sender = source.session().await;
    let store = MemoryStore::default();

    let targets: Vec<Arc<dyn Target>> = vec![Arc::new(MockTarget::new("a"))];
    let mut engine = Orchestrator::new(base_config(), store, source.clone(), targets).unwrap();
    engine.start().await.unwrap();
    assert_eq!(source.open_count(), 1);

    // Break the feed with no further sessions scripted: every reconnect
    // attempt fails at open.
    sender
        .send(Err(FeedError::Connection {
            message: "gone".to_string(),
            source: None,
        }))
        .unwrap();

    wait_until!(!engine.is_running().await);

    // Five reconnect attempts and no sixth: one initial open plus five.
    assert_eq!(source.open_count(), 6);
    assert_eq!(source.probe_count(), 6);

    // The engine is parked; a manual start over a fresh session revives it.
    let _session = source.session().await;
    engine.stop().await;
    engine.start().await.unwrap();
    assert!(engine.is_running().await);
    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn feed_closure_triggers_reconnect_too() {
    let source = Arc::new(MockEventSource::new());
    let first = source.session().await;
    let second = source.session().await;
    let store = MemoryStore::default();

    let target = Arc::new(MockTarget::new("a"));
    let targets: Vec<Arc<dyn Target>> = vec![target.clone()];

    let config = SyncConfig::builder()
        .source_uri("mongodb://primary:27017")
        .database("shop")
        .target(TargetConfig::new("a", "mongodb://a:27017"))
        .build()
        .unwrap();

    let mut engine = Orchestrator::new(config, store, source.clone(), targets).unwrap();
    engine.start().await.unwrap();

    // A silent drop (closed channel, no error) must also heal.
    drop(first);
    wait_until!(source.open_count() == 2);

    second.send(Ok(insert_event("orders", 1, "healed"))).unwrap();
    wait_until!(engine.stats().await.events_synced == 1);
    assert_eq!(target.stats().await.events_applied, 1);

    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stop_during_reconnect_backoff_exits_cleanly() {
    let source = Arc::new(MockEventSource::new());
    let sender = source.session().await;
    let store = MemoryStore::default();

    let targets: Vec<Arc<dyn Target>> = vec![Arc::new(MockTarget::new("a"))];
    let mut engine = Orchestrator::new(base_config(), store, source.clone(), targets).unwrap();
    engine.start().await.unwrap();

    sender
        .send(Err(FeedError::Connection {
            message: "flap".to_string(),
            source: None,
        }))
        .unwrap();

    // Stop while the reconnect loop is sleeping; it must not hang for the
    // rest of the backoff schedule.
    engine.stop().await;
    assert!(!engine.is_running().await);
}

#[tokio::test]
async fn invalid_configs_fail_before_start() {
    // Empty target list with replication enabled.
    let err = SyncConfig::builder()
        .source_uri("mongodb://primary:27017")
        .database("shop")
        .build()
        .unwrap_err();
    assert!(err.to_string().contains("no targets"));

    // Target without a URI.
    let err = SyncConfig::builder()
        .source_uri("mongodb://primary:27017")
        .database("shop")
        .target(TargetConfig::new("dr", ""))
        .build()
        .unwrap_err();
    assert!(err.to_string().contains("connection URI"));

    // A disabled config is valid but never yields an engine.
    let disabled = SyncConfig::builder()
        .enabled(false)
        .source_uri("mongodb://primary:27017")
        .database("shop")
        .build()
        .unwrap();
    let err = Orchestrator::new(
        disabled,
        MemoryStore::default(),
        Arc::new(MockEventSource::new()),
        vec![],
    )
    .unwrap_err();
    assert!(matches!(err, OrchestratorError::Disabled));
}
