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

//! Event filter and document transform strategies.
//!
//! A [`SyncConfig`](crate::config::SyncConfig) may inject two hooks into the
//! pipeline: a predicate that decides whether an event is replicated at all,
//! and a transform applied to the full document before it reaches targets.
//! A rejected event is dropped before the transform, the target fan-out and
//! the checkpoint write.
//!
//! Both traits have blanket implementations for plain closures:
//!
//! ```rust
//! use tailrace_core::filter::{EventFilter, DocumentTransform};
//! use tailrace_core::event::ChangeEvent;
//! use bson::Document;
//!
//! let only_orders = |event: &ChangeEvent| event.collection_name() == "orders";
//! let strip_secret = |mut doc: Document| {
//!     doc.remove("secret");
//!     doc
//! };
//!
//! let _f: &dyn EventFilter = &only_orders;
//! let _t: &dyn DocumentTransform = &strip_secret;
//! ```

use crate::event::ChangeEvent;
use bson::Document;

/// Decides whether an event is replicated.
///
/// Returning `false` drops the event before the transform, the target
/// fan-out and the checkpoint write.
pub trait EventFilter: Send + Sync {
    /// Returns true if the event should flow through the pipeline.
    fn should_keep(&self, event: &ChangeEvent) -> bool;
}

impl<F> EventFilter for F
where
    F: Fn(&ChangeEvent) -> bool + Send + Sync,
{
    fn should_keep(&self, event: &ChangeEvent) -> bool {
        self(event)
    }
}

/// Reshapes the full document of an event before it is applied to targets.
///
/// The transform only sees operations that carry a full document; deletes
/// pass through untouched.
pub trait DocumentTransform: Send + Sync {
    /// Returns the document to replicate in place of the original.
    fn apply(&self, document: Document) -> Document;
}

impl<F> DocumentTransform for F
where
    F: Fn(Document) -> Document + Send + Sync,
{
    fn apply(&self, document: Document) -> Document {
        self(document)
    }
}
