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

//! Redis-backed checkpoint store.
//!
//! Stores the serialized resume token under one fixed, namespaced key via
//! the backend's get/set/delete operations. Connections are pooled with
//! `deadpool-redis`, transient failures are retried with a short doubling
//! backoff, and an optional TTL keeps abandoned checkpoints from living in
//! Redis forever.
//!
//! # Key layout
//!
//! One key per engine instance, default:
//!
//! ```text
//! tailrace:checkpoint
//! ```
//!
//! Override the key when several engines share one Redis instance.
//!
//! # Example
//!
//! ```rust,no_run
//! use tailrace_stores::redis::{RedisStore, RedisStoreConfig};
//! use tailrace_core::checkpoint::CheckpointStore;
//! use bson::doc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RedisStoreConfig::builder()
//!     .url("redis://localhost:6379")
//!     .key("tailrace:checkpoint:shop")
//!     .build()?;
//!
//! let store = RedisStore::new(config).await?;
//! store.save(&doc! { "_data": "8263..." }).await?;
//! assert!(store.load().await?.is_some());
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use redis::{AsyncCommands, RedisError};
use std::time::Duration;
use tailrace_core::checkpoint::{CheckpointError, CheckpointStore, CheckpointToken};
use tracing::{debug, error, warn};

/// Default Redis key holding the checkpoint token.
const DEFAULT_KEY: &str = "tailrace:checkpoint";

/// Maximum number of retry attempts for transient Redis errors.
const MAX_RETRIES: u32 = 3;

/// Base delay for the retry backoff (milliseconds).
const BASE_RETRY_DELAY_MS: u64 = 100;

/// Configuration for the Redis-backed checkpoint store.
///
/// Use [`RedisStoreConfig::builder`] to construct it with validation.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Redis connection URL (e.g. "redis://localhost:6379")
    pub url: String,

    /// The fixed key the token is stored under
    pub key: String,

    /// Connection pool size (default: 10)
    pub pool_size: usize,

    /// Optional TTL for the token
    ///
    /// If set, an abandoned checkpoint expires after this duration of
    /// inactivity instead of living in Redis forever.
    pub ttl: Option<Duration>,

    /// Connection timeout (default: 5 seconds)
    pub connection_timeout: Duration,

    /// Maximum number of retries for transient errors (default: 3)
    pub max_retries: u32,
}

impl RedisStoreConfig {
    /// Creates a new builder.
    #[must_use]
    pub fn builder() -> RedisStoreConfigBuilder {
        RedisStoreConfigBuilder::default()
    }
}

/// Builder for [`RedisStoreConfig`] with validation.
#[derive(Debug, Default)]
pub struct RedisStoreConfigBuilder {
    url: Option<String>,
    key: Option<String>,
    pool_size: Option<usize>,
    ttl: Option<Duration>,
    connection_timeout: Option<Duration>,
    max_retries: Option<u32>,
}

impl RedisStoreConfigBuilder {
    /// Sets the Redis connection URL.
    ///
    /// Formats: `redis://host:port`, `redis://:password@host:port`,
    /// `rediss://host:port` for TLS.
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Sets the key the token is stored under.
    ///
    /// Default: `tailrace:checkpoint`
    #[must_use]
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Sets the connection pool size.
    ///
    /// Default: 10
    #[must_use]
    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = Some(size);
        self
    }

    /// Sets the TTL for the token.
    ///
    /// If not set, the token never expires.
    #[must_use]
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the connection timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = Some(timeout);
        self
    }

    /// Sets the maximum number of retries for transient errors.
    ///
    /// Default: 3
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is missing, the key is empty, or the
    /// pool size is 0.
    pub fn build(self) -> Result<RedisStoreConfig, CheckpointError> {
        let url = self
            .url
            .ok_or_else(|| CheckpointError::Other("Redis URL is required".to_string()))?;

        let key = self.key.unwrap_or_else(|| DEFAULT_KEY.to_string());
        if key.is_empty() {
            return Err(CheckpointError::Other(
                "checkpoint key must not be empty".to_string(),
            ));
        }

        let pool_size = self.pool_size.unwrap_or(10);
        if pool_size == 0 {
            return Err(CheckpointError::Other(
                "pool size must be greater than 0".to_string(),
            ));
        }

        Ok(RedisStoreConfig {
            url,
            key,
            pool_size,
            ttl: self.ttl,
            connection_timeout: self.connection_timeout.unwrap_or(Duration::from_secs(5)),
            max_retries: self.max_retries.unwrap_or(MAX_RETRIES),
        })
    }
}

/// Redis-backed checkpoint store.
///
/// `Send + Sync`; the underlying connection pool handles concurrent access,
/// though the engine only ever drives it from one task.
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
    config: RedisStoreConfig,
}

impl RedisStore {
    /// Creates a store with the given configuration and verifies
    /// connectivity with a PING.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot be created or Redis does not
    /// answer the PING.
    pub async fn new(config: RedisStoreConfig) -> Result<Self, CheckpointError> {
        debug!(url = %config.url, key = %config.key, "initializing Redis checkpoint store");

        let mut pool_config = PoolConfig::from_url(&config.url);
        let mut settings = pool_config.pool.take().unwrap_or_default();
        settings.max_size = config.pool_size;
        settings.timeouts.wait = Some(config.connection_timeout);
        settings.timeouts.create = Some(config.connection_timeout);
        settings.timeouts.recycle = Some(config.connection_timeout);
        pool_config.pool = Some(settings);

        let pool = pool_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| {
                error!(error = %e, "failed to create Redis connection pool");
                CheckpointError::Connection(format!("failed to create pool: {}", e))
            })?;

        let mut conn = pool.get().await.map_err(|e| {
            error!(error = %e, "failed to get connection from pool");
            CheckpointError::Connection(format!("failed to connect to Redis: {}", e))
        })?;

        redis::cmd("PING")
            .query_async::<()>(&mut *conn)
            .await
            .map_err(|e| {
                error!(error = %e, "Redis PING failed");
                CheckpointError::Connection(format!("Redis connection test failed: {}", e))
            })?;

        debug!("Redis checkpoint store initialized");
        Ok(Self { pool, config })
    }

    /// Executes a Redis operation with retry logic for transient errors.
    async fn with_retry<F, T, Fut>(&self, operation: F) -> Result<T, CheckpointError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, RedisError>>,
    {
        let mut retries = 0;
        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if Self::is_retryable(&e) && retries < self.config.max_retries => {
                    retries += 1;
                    let delay =
                        Duration::from_millis(BASE_RETRY_DELAY_MS * 2_u64.pow(retries - 1));
                    warn!(
                        attempt = retries,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Redis operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(retries, error = %e, "Redis operation failed");
                    return Err(CheckpointError::Connection(format!(
                        "Redis operation failed: {}",
                        e
                    )));
                }
            }
        }
    }

    /// Determines if a Redis error is retryable.
    fn is_retryable(error: &RedisError) -> bool {
        matches!(
            error.kind(),
            redis::ErrorKind::IoError | redis::ErrorKind::ResponseError
        )
    }

    /// Serializes a token to bytes for storage in Redis.
    fn serialize_token(token: &CheckpointToken) -> Result<Vec<u8>, CheckpointError> {
        bson::to_vec(token).map_err(|e| {
            CheckpointError::Serialization(format!("failed to serialize resume token: {}", e))
        })
    }

    /// Deserializes bytes from Redis back to a token.
    fn deserialize_token(bytes: &[u8]) -> Result<CheckpointToken, CheckpointError> {
        bson::from_slice(bytes).map_err(|e| {
            CheckpointError::Serialization(format!("failed to deserialize resume token: {}", e))
        })
    }
}

#[async_trait]
impl CheckpointStore for RedisStore {
    async fn load(&self) -> Result<Option<CheckpointToken>, CheckpointError> {
        let key = self.config.key.clone();
        let pool = self.pool.clone();

        let bytes: Option<Vec<u8>> = self
            .with_retry(|| {
                let key = key.clone();
                let pool = pool.clone();
                async move {
                    let mut conn = pool.get().await.map_err(|e| {
                        RedisError::from((
                            redis::ErrorKind::IoError,
                            "failed to get connection from pool",
                            e.to_string(),
                        ))
                    })?;
                    conn.get(&key).await
                }
            })
            .await?;

        match bytes {
            Some(data) => {
                let token = Self::deserialize_token(&data)?;
                debug!(key = %self.config.key, "checkpoint loaded from Redis");
                Ok(Some(token))
            }
            None => {
                debug!(key = %self.config.key, "no checkpoint in Redis, cold start");
                Ok(None)
            }
        }
    }

    async fn save(&self, token: &CheckpointToken) -> Result<(), CheckpointError> {
        let key = self.config.key.clone();
        let value = Self::serialize_token(token)?;
        let pool = self.pool.clone();
        let ttl = self.config.ttl;

        self.with_retry::<_, (), _>(|| {
            let key = key.clone();
            let value = value.clone();
            let pool = pool.clone();
            async move {
                let mut conn = pool.get().await.map_err(|e| {
                    RedisError::from((
                        redis::ErrorKind::IoError,
                        "failed to get connection from pool",
                        e.to_string(),
                    ))
                })?;

                if let Some(ttl) = ttl {
                    conn.set_ex(&key, &value, ttl.as_secs()).await
                } else {
                    conn.set(&key, &value).await
                }
            }
        })
        .await?;

        debug!(key = %self.config.key, "checkpoint saved to Redis");
        Ok(())
    }

    async fn clear(&self) -> Result<(), CheckpointError> {
        let key = self.config.key.clone();
        let pool = self.pool.clone();

        self.with_retry::<_, (), _>(|| {
            let key = key.clone();
            let pool = pool.clone();
            async move {
                let mut conn = pool.get().await.map_err(|e| {
                    RedisError::from((
                        redis::ErrorKind::IoError,
                        "failed to get connection from pool",
                        e.to_string(),
                    ))
                })?;
                conn.del(&key).await
            }
        })
        .await?;

        debug!(key = %self.config.key, "checkpoint cleared from Redis");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn config_builder_defaults() {
        let config = RedisStoreConfig::builder()
            .url("redis://localhost:6379")
            .build()
            .unwrap();

        assert_eq!(config.key, "tailrace:checkpoint");
        assert_eq!(config.pool_size, 10);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.connection_timeout, Duration::from_secs(5));
        assert!(config.ttl.is_none());
    }

    #[test]
    fn config_builder_overrides() {
        let config = RedisStoreConfig::builder()
            .url("redis://localhost:6379")
            .key("tailrace:checkpoint:shop")
            .pool_size(20)
            .ttl(Duration::from_secs(3600))
            .build()
            .unwrap();

        assert_eq!(config.key, "tailrace:checkpoint:shop");
        assert_eq!(config.pool_size, 20);
        assert_eq!(config.ttl, Some(Duration::from_secs(3600)));
    }

    #[test]
    fn config_builder_missing_url() {
        assert!(RedisStoreConfig::builder().build().is_err());
    }

    #[test]
    fn config_builder_zero_pool_size() {
        let result = RedisStoreConfig::builder()
            .url("redis://localhost:6379")
            .pool_size(0)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn config_builder_empty_key() {
        let result = RedisStoreConfig::builder()
            .url("redis://localhost:6379")
            .key("")
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn serialize_deserialize_token() {
        let token = doc! {
            "_data": "8263abc",
            "clusterTime": 123456789_i64,
        };

        let serialized = RedisStore::serialize_token(&token).unwrap();
        let deserialized = RedisStore::deserialize_token(&serialized).unwrap();
        assert_eq!(token, deserialized);
    }
}
