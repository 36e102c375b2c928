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

//! Tailrace Core - change-data-capture replication engine.
//!
//! Tailrace tails a MongoDB deployment's change stream and mirrors every
//! mutation to one or more independently connected backup deployments in
//! near-real-time, with crash-safe resume via persisted checkpoints.
//!
//! # Key Components
//!
//! - **Events**: [`event`] defines the change stream event model
//! - **Configuration**: [`config`] declares and validates a replication run
//! - **Checkpoints**: [`checkpoint`] persists the feed resume position
//!   (backends live in the `tailrace-stores` crate)
//! - **Targets**: [`target`] applies events to backup destinations
//! - **Feed**: [`feed`] abstracts the upstream change stream
//! - **Orchestration**: [`orchestrator`] supervises the whole pipeline
//!
//! # Example
//!
//! ```rust
//! use tailrace_core::event::{ChangeEvent, OperationType};
//!
//! fn describe(event: &ChangeEvent) {
//!     match event.operation {
//!         OperationType::Insert => println!("new document in {}", event.collection_name()),
//!         OperationType::Delete => println!("document removed from {}", event.collection_name()),
//!         _ => println!("other operation: {}", event.operation),
//!     }
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod checkpoint;
pub mod config;
pub mod event;
pub mod feed;
pub mod filter;
pub mod metrics;
pub mod orchestrator;
pub mod pool;
pub mod target;
