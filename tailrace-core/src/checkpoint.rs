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

//! Checkpoint persistence for feed resume positions.
//!
//! The [`CheckpointStore`] trait abstracts where the engine persists the
//! resume token of the last fully dispatched event. Backends live in the
//! `tailrace-stores` crate (a JSON file and a Redis key-value store); any
//! implementation that can durably hold one small document works.
//!
//! # Failure semantics
//!
//! The orchestrator treats the store as best-effort on the hot path:
//! a failed `save` is logged and swallowed (losing one checkpoint write
//! risks replaying a single event after a restart, which is preferable to
//! halting replication), and a failed `load` is treated as a cold start.
//! Implementations should still report errors honestly; the policy lives in
//! the orchestrator, not in the store.
//!
//! # Example
//!
//! ```rust
//! use tailrace_core::checkpoint::{CheckpointStore, CheckpointError};
//! use bson::Document;
//! use std::sync::Arc;
//! use tokio::sync::Mutex;
//!
//! /// In-memory store for tests.
//! #[derive(Default)]
//! struct MemoryStore {
//!     token: Arc<Mutex<Option<Document>>>,
//! }
//!
//! #[async_trait::async_trait]
//! impl CheckpointStore for MemoryStore {
//!     async fn load(&self) -> Result<Option<Document>, CheckpointError> {
//!         Ok(self.token.lock().await.clone())
//!     }
//!
//!     async fn save(&self, token: &Document) -> Result<(), CheckpointError> {
//!         *self.token.lock().await = Some(token.clone());
//!         Ok(())
//!     }
//!
//!     async fn clear(&self) -> Result<(), CheckpointError> {
//!         *self.token.lock().await = None;
//!         Ok(())
//!     }
//! }
//! ```

use bson::Document;

/// A persisted feed resume position.
///
/// The token is opaque: the engine never inspects it, it only hands it back
/// to the feed when resuming.
pub type CheckpointToken = Document;

/// Trait for checkpoint persistence backends.
///
/// Exactly one running orchestrator owns a store at a time; no locking
/// against a second concurrent writer is implemented or assumed.
#[async_trait::async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Loads the last persisted resume token.
    ///
    /// Returns `Ok(None)` on a cold start (nothing persisted yet).
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read. The orchestrator
    /// downgrades this to a cold start.
    async fn load(&self) -> Result<Option<CheckpointToken>, CheckpointError>;

    /// Persists a resume token, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns an error if the token cannot be written. The orchestrator
    /// logs and swallows this on the event path.
    async fn save(&self, token: &CheckpointToken) -> Result<(), CheckpointError>;

    /// Removes the persisted token so the next start is a cold start.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be written.
    async fn clear(&self) -> Result<(), CheckpointError>;
}

/// Errors that can occur during checkpoint store operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Connection error
    #[error("connection error: {0}")]
    Connection(String),

    /// Other errors
    #[error("checkpoint store error: {0}")]
    Other(String),
}
