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

//! Integration tests for the driver-backed replication target.
//!
//! These tests require a real MongoDB instance on localhost:27017 and are
//! marked `#[ignore]` so plain `cargo test` stays green without one:
//!
//! ```bash
//! cargo test --package tailrace-core --test target_integration_test -- --ignored
//! ```

use bson::{doc, Document};
use chrono::Utc;
use std::sync::Arc;
use tailrace_core::config::TargetConfig;
use tailrace_core::event::{ChangeEvent, Namespace, OperationType};
use tailrace_core::pool::MongoPool;
use tailrace_core::target::{ReplicationTarget, Target};

const TEST_URI: &str = "mongodb://localhost:27017";
const TEST_DB: &str = "tailrace_target_it";

fn event(operation: OperationType, collection: &str, id: i32, document: Option<Document>) -> ChangeEvent {
    ChangeEvent {
        operation,
        namespace: Namespace::new(TEST_DB, collection),
        document_key: Some(doc! { "_id": id }),
        full_document: document,
        cluster_time: Utc::now(),
        resume_token: doc! { "_data": format!("it-{}", id) },
    }
}

async fn connected_target(name: &str) -> ReplicationTarget {
    let target = ReplicationTarget::new(
        TargetConfig::new(name, TEST_URI),
        Arc::new(MongoPool::new()),
    );
    target.connect().await.expect("target connect");
    target
}

#[tokio::test]
#[ignore] // Requires MongoDB
async fn upsert_apply_converges_on_replay() {
    let target = connected_target("it-upsert").await;

    let mongo = mongodb::Client::with_uri_str(TEST_URI).await.unwrap();
    let collection = mongo.database(TEST_DB).collection::<Document>("orders");
    collection.drop().await.ok();

    let update = event(
        OperationType::Update,
        "orders",
        1,
        Some(doc! { "_id": 1, "name": "b" }),
    );

    // An update upserts whether or not the destination had a prior copy,
    // and replaying it lands on the same document.
    target.apply(&update).await.unwrap();
    target.apply(&update).await.unwrap();

    let stored = collection.find_one(doc! { "_id": 1 }).await.unwrap().unwrap();
    assert_eq!(stored, doc! { "_id": 1, "name": "b" });
    assert_eq!(
        collection.count_documents(doc! {}).await.unwrap(),
        1,
        "replay must not duplicate"
    );

    target.close().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires MongoDB
async fn delete_of_missing_document_is_not_an_error() {
    let target = connected_target("it-delete").await;

    let mongo = mongodb::Client::with_uri_str(TEST_URI).await.unwrap();
    let collection = mongo.database(TEST_DB).collection::<Document>("orders");
    collection.drop().await.ok();

    let delete = event(OperationType::Delete, "orders", 42, None);
    target.apply(&delete).await.unwrap();

    assert_eq!(target.stats().await.errors, 0);
    target.close().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires MongoDB
async fn target_allow_list_skips_other_collections() {
    let pool = Arc::new(MongoPool::new());
    let target = ReplicationTarget::new(
        TargetConfig::new("it-allow", TEST_URI).with_collections(vec!["orders".to_string()]),
        pool,
    );
    target.connect().await.unwrap();

    let mongo = mongodb::Client::with_uri_str(TEST_URI).await.unwrap();
    let skipped = mongo.database(TEST_DB).collection::<Document>("audit");
    skipped.drop().await.ok();

    let insert = event(
        OperationType::Insert,
        "audit",
        1,
        Some(doc! { "_id": 1, "note": "skipped" }),
    );
    target.apply(&insert).await.unwrap();

    assert_eq!(skipped.count_documents(doc! {}).await.unwrap(), 0);
    assert_eq!(target.stats().await.events_applied, 0);

    target.close().await.unwrap();
}
