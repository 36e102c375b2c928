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

//! Destination connection management.
//!
//! Replication targets do not open their own connections; they go through
//! the [`ConnectionPool`] collaborator. The trait mirrors the lifecycle the
//! engine needs (register a named pool entry, fetch its client, release
//! it), and [`MongoPool`] implements it on the official driver, mapping
//! the health-check policy of a [`PoolSpec`] onto the driver's monitoring
//! options and running a bounded admission ping before the entry is
//! accepted.

use crate::config::HealthCheckConfig;
use bson::doc;
use mongodb::{options::ClientOptions, Client};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Base delay for the admission ping retry backoff (milliseconds).
const PING_RETRY_DELAY_MS: u64 = 100;

/// Role a pool entry plays in the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolRole {
    /// The watched primary deployment
    Source,

    /// A backup destination
    Backup,
}

impl PoolRole {
    /// Returns the role name used in logs and connection tags.
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolRole::Source => "source",
            PoolRole::Backup => "backup",
        }
    }
}

/// Request to register one named connection pool.
#[derive(Debug, Clone)]
pub struct PoolSpec {
    /// Unique pool entry name
    pub name: String,

    /// Connection URI of the deployment
    pub uri: String,

    /// Role the connection plays
    pub role: PoolRole,

    /// Optional health-check policy
    pub health_check: Option<HealthCheckConfig>,
}

/// Trait for the connection-pool collaborator.
///
/// Targets call `add_pool` once at startup, `get_pool` to obtain the shared
/// client, and `remove_pool` on shutdown.
#[async_trait::async_trait]
pub trait ConnectionPool: Send + Sync {
    /// Registers a pool entry and verifies the destination is reachable.
    ///
    /// # Errors
    ///
    /// Returns an error if the URI is invalid or the destination does not
    /// answer the admission ping within the configured retries.
    async fn add_pool(&self, spec: PoolSpec) -> Result<(), PoolError>;

    /// Returns the client for a registered pool entry.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::NotRegistered`] if no entry with that name
    /// exists.
    async fn get_pool(&self, name: &str) -> Result<Client, PoolError>;

    /// Removes a pool entry, shutting its client down.
    ///
    /// Removing a name that was never registered is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot release the entry.
    async fn remove_pool(&self, name: &str) -> Result<(), PoolError>;
}

/// Driver-backed pool manager.
///
/// One `mongodb::Client` per registered entry; the driver multiplexes its
/// own internal connection pool behind each client, so clones are cheap and
/// shared.
#[derive(Debug, Default)]
pub struct MongoPool {
    clients: RwLock<HashMap<String, Client>>,
}

impl MongoPool {
    /// Creates an empty pool manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pings the deployment, retrying transient failures with a short
    /// doubling backoff.
    async fn admission_ping(client: &Client, name: &str, retries: u32) -> Result<(), PoolError> {
        let mut attempt = 0;
        loop {
            match client.database("admin").run_command(doc! { "ping": 1 }).await {
                Ok(_) => return Ok(()),
                Err(e) if attempt < retries => {
                    attempt += 1;
                    let delay = Duration::from_millis(
                        PING_RETRY_DELAY_MS.saturating_mul(1 << (attempt - 1)),
                    );
                    warn!(
                        pool = name,
                        attempt,
                        retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "admission ping failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(PoolError::Unreachable {
                        name: name.to_string(),
                        source: e,
                    });
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl ConnectionPool for MongoPool {
    async fn add_pool(&self, spec: PoolSpec) -> Result<(), PoolError> {
        debug!(pool = %spec.name, role = spec.role.as_str(), "registering pool entry");

        let mut options =
            ClientOptions::parse(&spec.uri)
                .await
                .map_err(|e| PoolError::InvalidUri {
                    name: spec.name.clone(),
                    source: e,
                })?;

        options.app_name = Some(format!("tailrace-{}-{}", spec.role.as_str(), spec.name));

        let mut ping_retries = 1;
        if let Some(health) = &spec.health_check {
            if health.enabled {
                options.heartbeat_freq = Some(health.interval);
                options.server_selection_timeout = Some(health.timeout);
                options.connect_timeout = Some(health.timeout);
                ping_retries = health.retries;
            }
        }

        let client = Client::with_options(options).map_err(|e| PoolError::InvalidUri {
            name: spec.name.clone(),
            source: e,
        })?;

        Self::admission_ping(&client, &spec.name, ping_retries).await?;

        let mut clients = self.clients.write().await;
        if clients.insert(spec.name.clone(), client).is_some() {
            warn!(pool = %spec.name, "replaced an existing pool entry");
        }

        info!(pool = %spec.name, role = spec.role.as_str(), "pool entry registered");
        Ok(())
    }

    async fn get_pool(&self, name: &str) -> Result<Client, PoolError> {
        self.clients
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| PoolError::NotRegistered {
                name: name.to_string(),
            })
    }

    async fn remove_pool(&self, name: &str) -> Result<(), PoolError> {
        let removed = self.clients.write().await.remove(name);
        match removed {
            Some(client) => {
                client.shutdown().await;
                debug!(pool = name, "pool entry removed");
            }
            None => {
                debug!(pool = name, "remove requested for unregistered pool entry");
            }
        }
        Ok(())
    }
}

/// Errors produced by the pool collaborator.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The connection URI could not be parsed or the client not constructed
    #[error("invalid connection URI for pool `{name}`: {source}")]
    InvalidUri {
        /// Name of the pool entry
        name: String,
        /// Driver error
        #[source]
        source: mongodb::error::Error,
    },

    /// The destination did not answer the admission ping
    #[error("destination for pool `{name}` is unreachable: {source}")]
    Unreachable {
        /// Name of the pool entry
        name: String,
        /// Driver error
        #[source]
        source: mongodb::error::Error,
    },

    /// No pool entry with the given name exists
    #[error("pool `{name}` is not registered")]
    NotRegistered {
        /// The requested name
        name: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_names() {
        assert_eq!(PoolRole::Source.as_str(), "source");
        assert_eq!(PoolRole::Backup.as_str(), "backup");
    }

    #[tokio::test]
    async fn get_unregistered_pool_fails() {
        let pool = MongoPool::new();
        let err = pool.get_pool("missing").await.unwrap_err();
        assert!(matches!(err, PoolError::NotRegistered { name } if name == "missing"));
    }

    #[tokio::test]
    async fn remove_unregistered_pool_is_not_an_error() {
        let pool = MongoPool::new();
        assert!(pool.remove_pool("missing").await.is_ok());
    }
}
