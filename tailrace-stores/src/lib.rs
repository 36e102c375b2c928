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

//! Checkpoint store backends for the Tailrace replication engine.
//!
//! This crate provides implementations of the
//! [`CheckpointStore`](tailrace_core::checkpoint::CheckpointStore) trait:
//!
//! - **File** (`file` feature): a JSON token file on local disk, suitable
//!   for single-host deployments
//! - **Redis** (`redis-store` feature): the token under one fixed key in a
//!   Redis instance, for hosts without durable local disk
//!
//! # Example: file store
//!
//! ```rust,no_run
//! use tailrace_stores::file::FileStore;
//! use tailrace_core::checkpoint::CheckpointStore;
//! use bson::doc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = FileStore::with_default_path();
//!
//! let token = doc! { "_data": "8263..." };
//! store.save(&token).await?;
//! assert!(store.load().await?.is_some());
//! store.clear().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

#[cfg(feature = "file")]
pub mod file;

#[cfg(feature = "redis-store")]
pub mod redis;

use tailrace_core::checkpoint::{CheckpointError, CheckpointStore};
use tailrace_core::config::CheckpointConfig;

/// Builds the checkpoint store selected by a
/// [`CheckpointConfig`](tailrace_core::config::CheckpointConfig).
///
/// A `File` backend with no path uses
/// [`FileStore::with_default_path`](file::FileStore::with_default_path).
///
/// # Errors
///
/// Returns an error if the Redis backend cannot be reached or a selected
/// backend was compiled out.
pub async fn store_from_config(
    config: &CheckpointConfig,
) -> Result<Box<dyn CheckpointStore>, CheckpointError> {
    match config {
        #[cfg(feature = "file")]
        CheckpointConfig::File { path } => {
            let store = match path {
                Some(path) => file::FileStore::new(path.clone()),
                None => file::FileStore::with_default_path(),
            };
            Ok(Box::new(store))
        }

        #[cfg(feature = "redis-store")]
        CheckpointConfig::ExternalKv { url, key_prefix } => {
            let mut builder = redis::RedisStoreConfig::builder().url(url.clone());
            if let Some(prefix) = key_prefix {
                builder = builder.key(prefix.clone());
            }
            let store = redis::RedisStore::new(builder.build()?).await?;
            Ok(Box::new(store))
        }

        #[allow(unreachable_patterns)]
        other => Err(CheckpointError::Other(format!(
            "checkpoint backend {:?} is not compiled into this build",
            other
        ))),
    }
}
