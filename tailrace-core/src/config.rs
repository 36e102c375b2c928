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

//! Replication configuration and its validation.
//!
//! [`SyncConfig`] declares everything the engine needs before it starts:
//! the source deployment, the backup targets, the checkpoint backend, and
//! the optional filter/transform hooks. It is built once through
//! [`SyncConfig::builder`], validated before use, and immutable afterwards;
//! an invalid config never reaches the orchestrator.
//!
//! # Example
//!
//! ```rust
//! use tailrace_core::config::{SyncConfig, TargetConfig, CheckpointConfig};
//!
//! let config = SyncConfig::builder()
//!     .source_uri("mongodb://primary:27017")
//!     .database("shop")
//!     .target(TargetConfig::new("dr-site", "mongodb://backup:27017"))
//!     .collections(vec!["orders".to_string(), "customers".to_string()])
//!     .checkpoint(CheckpointConfig::File { path: None })
//!     .build()
//!     .expect("valid configuration");
//!
//! assert!(config.enabled);
//! assert_eq!(config.targets.len(), 1);
//! ```

use crate::filter::{DocumentTransform, EventFilter};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Health-check policy attached to a destination connection.
///
/// Mapped onto the driver's monitoring options by the pool collaborator:
/// `interval` becomes the heartbeat frequency, `timeout` bounds server
/// selection, and `retries` bounds the admission ping at connect time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// Whether the health check is active
    pub enabled: bool,

    /// How often the destination is probed
    pub interval: Duration,

    /// Per-probe timeout
    pub timeout: Duration,

    /// How many times the admission ping is retried at connect time
    pub retries: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(5),
            retries: 3,
        }
    }
}

/// One backup destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Unique name, used as the pool entry name and in logs and metrics
    pub name: String,

    /// Connection URI of the destination deployment
    pub uri: String,

    /// Optional allow-list of collections this target replicates
    ///
    /// When absent the target receives every collection the feed delivers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collections: Option<Vec<String>>,

    /// Optional health-check policy for the destination connection
    #[serde(rename = "healthCheck", skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckConfig>,
}

impl TargetConfig {
    /// Creates a target with a name and connection URI.
    pub fn new(name: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uri: uri.into(),
            collections: None,
            health_check: None,
        }
    }

    /// Restricts this target to the given collections.
    #[must_use]
    pub fn with_collections(mut self, collections: Vec<String>) -> Self {
        self.collections = Some(collections);
        self
    }

    /// Attaches a health-check policy to the destination connection.
    #[must_use]
    pub fn with_health_check(mut self, health_check: HealthCheckConfig) -> Self {
        self.health_check = Some(health_check);
        self
    }
}

/// Checkpoint backend selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "kebab-case")]
pub enum CheckpointConfig {
    /// JSON token file on local disk
    File {
        /// Path of the token file; defaults to a dotfile in the working
        /// directory when absent
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<PathBuf>,
    },

    /// External key-value store (Redis)
    ExternalKv {
        /// Connection URL of the key-value store
        url: String,

        /// Optional key namespace override
        #[serde(rename = "keyPrefix", skip_serializing_if = "Option::is_none")]
        key_prefix: Option<String>,
    },
}

/// Declarative replication configuration.
///
/// Loaded once at construction, validated before use, immutable thereafter.
#[derive(Clone)]
pub struct SyncConfig {
    /// Whether replication is enabled at all
    pub enabled: bool,

    /// Connection URI of the watched (source) deployment
    pub source_uri: String,

    /// Database to watch on the source deployment
    pub database: String,

    /// Backup destinations; non-empty when replication is enabled
    pub targets: Vec<TargetConfig>,

    /// Checkpoint backend selection
    pub checkpoint: Option<CheckpointConfig>,

    /// Feed-level collection allow-list
    pub collections: Option<Vec<String>>,

    /// Optional event predicate; rejected events are dropped before the
    /// transform, the fan-out and the checkpoint write
    pub filter: Option<Arc<dyn EventFilter>>,

    /// Optional document transform applied before the fan-out
    pub transform: Option<Arc<dyn DocumentTransform>>,
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("enabled", &self.enabled)
            .field("source_uri", &self.source_uri)
            .field("database", &self.database)
            .field("targets", &self.targets)
            .field("checkpoint", &self.checkpoint)
            .field("collections", &self.collections)
            .field("filter", &self.filter.as_ref().map(|_| "<filter>"))
            .field("transform", &self.transform.as_ref().map(|_| "<transform>"))
            .finish()
    }
}

impl SyncConfig {
    /// Creates a new builder for `SyncConfig`.
    #[must_use]
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::default()
    }

    /// Validates the configuration.
    ///
    /// Validation is pure: it inspects the config and returns the first
    /// problem found, touching nothing. It runs inside
    /// [`SyncConfigBuilder::build`] and again defensively when the
    /// orchestrator is constructed.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] describing the offending field when:
    /// - replication is enabled but no targets are configured
    /// - any target has an empty name or URI
    /// - any collection allow-list (per-target or feed-level) is declared
    ///   but empty
    /// - the checkpoint backend declares an empty path or URL
    /// - a health check declares a zero interval or timeout
    /// - the source URI or database is empty
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.targets.is_empty() {
            return Err(ConfigError::NoTargets);
        }

        if self.source_uri.is_empty() {
            return Err(ConfigError::MissingSourceUri);
        }
        if self.database.is_empty() {
            return Err(ConfigError::MissingDatabase);
        }

        for (index, target) in self.targets.iter().enumerate() {
            if target.name.is_empty() {
                return Err(ConfigError::MissingTargetName { index });
            }
            if target.uri.is_empty() {
                return Err(ConfigError::MissingTargetUri {
                    name: target.name.clone(),
                });
            }
            if let Some(collections) = &target.collections {
                if collections.is_empty() {
                    return Err(ConfigError::EmptyTargetCollections {
                        name: target.name.clone(),
                    });
                }
            }
            if let Some(health) = &target.health_check {
                if health.enabled && health.interval.is_zero() {
                    return Err(ConfigError::InvalidHealthCheck {
                        name: target.name.clone(),
                        reason: "interval must be greater than zero".to_string(),
                    });
                }
                if health.enabled && health.timeout.is_zero() {
                    return Err(ConfigError::InvalidHealthCheck {
                        name: target.name.clone(),
                        reason: "timeout must be greater than zero".to_string(),
                    });
                }
            }
        }

        if let Some(collections) = &self.collections {
            if collections.is_empty() {
                return Err(ConfigError::EmptyCollections);
            }
        }

        match &self.checkpoint {
            Some(CheckpointConfig::File { path: Some(path) }) if path.as_os_str().is_empty() => {
                return Err(ConfigError::EmptyCheckpointPath);
            }
            Some(CheckpointConfig::ExternalKv { url, .. }) if url.is_empty() => {
                return Err(ConfigError::EmptyCheckpointUrl);
            }
            _ => {}
        }

        Ok(())
    }
}

/// Builder for [`SyncConfig`].
#[derive(Default)]
pub struct SyncConfigBuilder {
    enabled: Option<bool>,
    source_uri: Option<String>,
    database: Option<String>,
    targets: Vec<TargetConfig>,
    checkpoint: Option<CheckpointConfig>,
    collections: Option<Vec<String>>,
    filter: Option<Arc<dyn EventFilter>>,
    transform: Option<Arc<dyn DocumentTransform>>,
}

impl SyncConfigBuilder {
    /// Enables or disables replication. Defaults to enabled.
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    /// Sets the connection URI of the watched deployment.
    #[must_use]
    pub fn source_uri(mut self, uri: impl Into<String>) -> Self {
        self.source_uri = Some(uri.into());
        self
    }

    /// Sets the database to watch.
    #[must_use]
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Adds one backup target.
    #[must_use]
    pub fn target(mut self, target: TargetConfig) -> Self {
        self.targets.push(target);
        self
    }

    /// Replaces the target list.
    #[must_use]
    pub fn targets(mut self, targets: Vec<TargetConfig>) -> Self {
        self.targets = targets;
        self
    }

    /// Selects the checkpoint backend.
    #[must_use]
    pub fn checkpoint(mut self, checkpoint: CheckpointConfig) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    /// Restricts the feed to the given collections.
    #[must_use]
    pub fn collections(mut self, collections: Vec<String>) -> Self {
        self.collections = Some(collections);
        self
    }

    /// Injects an event filter predicate.
    #[must_use]
    pub fn filter(mut self, filter: impl EventFilter + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Injects a document transform.
    #[must_use]
    pub fn transform(mut self, transform: impl DocumentTransform + 'static) -> Self {
        self.transform = Some(Arc::new(transform));
        self
    }

    /// Builds and validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when validation fails; see
    /// [`SyncConfig::validate`].
    pub fn build(self) -> Result<SyncConfig, ConfigError> {
        let config = SyncConfig {
            enabled: self.enabled.unwrap_or(true),
            source_uri: self.source_uri.unwrap_or_default(),
            database: self.database.unwrap_or_default(),
            targets: self.targets,
            checkpoint: self.checkpoint,
            collections: self.collections,
            filter: self.filter,
            transform: self.transform,
        };

        config.validate()?;
        Ok(config)
    }
}

/// Errors produced by configuration validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Replication is enabled with no targets declared
    #[error("replication is enabled but no targets are configured")]
    NoTargets,

    /// The source deployment URI is missing
    #[error("source_uri is required")]
    MissingSourceUri,

    /// The watched database is missing
    #[error("database is required")]
    MissingDatabase,

    /// A target entry has an empty name
    #[error("target at index {index} is missing a name")]
    MissingTargetName {
        /// Position of the offending target in the list
        index: usize,
    },

    /// A target entry has an empty URI
    #[error("target `{name}` is missing a connection URI")]
    MissingTargetUri {
        /// Name of the offending target
        name: String,
    },

    /// A target declares an allow-list with no entries
    #[error("target `{name}` declares an empty collection allow-list")]
    EmptyTargetCollections {
        /// Name of the offending target
        name: String,
    },

    /// The feed-level allow-list is declared with no entries
    #[error("the feed-level collection allow-list is empty")]
    EmptyCollections,

    /// The file checkpoint backend declares an empty path
    #[error("checkpoint file path is empty")]
    EmptyCheckpointPath,

    /// The key-value checkpoint backend declares an empty URL
    #[error("checkpoint key-value store URL is empty")]
    EmptyCheckpointUrl,

    /// A health-check policy is malformed
    #[error("target `{name}` health check is invalid: {reason}")]
    InvalidHealthCheck {
        /// Name of the offending target
        name: String,
        /// What is wrong with the policy
        reason: String,
    },
}
