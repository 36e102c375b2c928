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

//! File-backed checkpoint store.
//!
//! Persists the resume token as JSON at a configurable path, creating
//! parent directories on first write. A missing file is a cold start, not
//! an error, and so is an unreadable or corrupt one: the store favors
//! availability over exact resume accuracy, reporting `None` and letting
//! the engine start from the present.
//!
//! Writes go through a temp file and an atomic rename, so a crash mid-write
//! leaves the previous token intact.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tailrace_core::checkpoint::{CheckpointError, CheckpointStore, CheckpointToken};
use tokio::fs;
use tracing::{debug, warn};

/// Default token file name, a dotfile in the working directory.
pub const DEFAULT_PATH: &str = ".tailrace-checkpoint.json";

/// Checkpoint store backed by a JSON file on local disk.
///
/// # Example
///
/// ```rust,no_run
/// use tailrace_stores::file::FileStore;
/// use tailrace_core::checkpoint::CheckpointStore;
/// use bson::doc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = FileStore::new("/var/lib/tailrace/checkpoint.json");
/// store.save(&doc! { "_data": "8263..." }).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// Creates a store writing to the given path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Creates a store writing to [`DEFAULT_PATH`] in the working directory.
    #[must_use]
    pub fn with_default_path() -> Self {
        Self::new(DEFAULT_PATH)
    }

    /// Returns the token file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl CheckpointStore for FileStore {
    async fn load(&self) -> Result<Option<CheckpointToken>, CheckpointError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no checkpoint file, cold start");
                return Ok(None);
            }
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "checkpoint file unreadable, treating as cold start"
                );
                return Ok(None);
            }
        };

        match serde_json::from_slice::<CheckpointToken>(&bytes) {
            Ok(token) => {
                debug!(path = %self.path.display(), "checkpoint loaded");
                Ok(Some(token))
            }
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "checkpoint file corrupt, treating as cold start"
                );
                Ok(None)
            }
        }
    }

    async fn save(&self, token: &CheckpointToken) -> Result<(), CheckpointError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let json = serde_json::to_vec(token)
            .map_err(|e| CheckpointError::Serialization(e.to_string()))?;

        // Write-then-rename so a crash mid-write keeps the previous token.
        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, &json).await?;
        fs::rename(&staging, &self.path).await?;

        debug!(path = %self.path.display(), "checkpoint written");
        Ok(())
    }

    async fn clear(&self) -> Result<(), CheckpointError> {
        match fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!(path = %self.path.display(), "checkpoint cleared");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CheckpointError::Io(e)),
        }
    }
}
