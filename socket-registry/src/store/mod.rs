//! Shared key-value store holding the membership relations.
//!
//! The trait mirrors the handful of Redis primitives the registry needs so
//! the in-process backend can stand in for Redis on a single instance and
//! in tests.

mod memory;
mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{RegistryConfig, StoreBackend};
use crate::Result;

/// One write inside an atomic transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Set { key: String, value: String },
    Del { key: String },
    HSet { key: String, field: String, value: String },
    HSetNx { key: String, field: String, value: String },
    SAdd { key: String, member: String },
    SRem { key: String, member: String },
}

impl StoreOp {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn del(key: impl Into<String>) -> Self {
        Self::Del { key: key.into() }
    }

    pub fn hset(key: impl Into<String>, field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::HSet {
            key: key.into(),
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn hset_nx(
        key: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self::HSetNx {
            key: key.into(),
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn sadd(key: impl Into<String>, member: impl Into<String>) -> Self {
        Self::SAdd {
            key: key.into(),
            member: member.into(),
        }
    }

    pub fn srem(key: impl Into<String>, member: impl Into<String>) -> Self {
        Self::SRem {
            key: key.into(),
            member: member.into(),
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Self::Set { key, .. }
            | Self::Del { key }
            | Self::HSet { key, .. }
            | Self::HSetNx { key, .. }
            | Self::SAdd { key, .. }
            | Self::SRem { key, .. } => key,
        }
    }
}

/// A message received through a pattern subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMessage {
    pub channel: String,
    pub payload: String,
}

/// An active pattern subscription on the store's pub/sub.
#[async_trait]
pub trait PatternSubscription: Send {
    /// Next message, or `None` once the underlying stream has ended.
    async fn next_message(&mut self) -> Option<StoreMessage>;

    /// Drop the pattern subscription on the server side.
    async fn unsubscribe(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait MembershipStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;
    /// Set a hash field only when it is absent. Returns true if written.
    async fn hset_nx(&self, key: &str, field: &str, value: &str) -> Result<bool>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

    /// Returns true if the member was newly added.
    async fn sadd(&self, key: &str, member: &str) -> Result<bool>;
    /// Returns true if the member was present.
    async fn srem(&self, key: &str, member: &str) -> Result<bool>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;
    async fn sismember(&self, key: &str, member: &str) -> Result<bool>;
    async fn scard(&self, key: &str) -> Result<u64>;

    /// Returns true if the key existed.
    async fn del(&self, key: &str) -> Result<bool>;
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Apply every op or none of them (MULTI/EXEC).
    async fn atomic(&self, ops: &[StoreOp]) -> Result<()>;

    /// Returns the number of subscribers that received the message.
    async fn publish(&self, channel: &str, payload: &str) -> Result<u64>;
    async fn psubscribe(&self, pattern: &str) -> Result<Box<dyn PatternSubscription>>;
}

/// Build the store selected by `config`.
pub async fn connect_store(config: &RegistryConfig) -> Result<Arc<dyn MembershipStore>> {
    match config.backend {
        StoreBackend::Redis => {
            let store = RedisStore::connect(&config.redis_url).await?;
            tracing::info!(redis_url = %config.redis_url, "Connected membership store to Redis");
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using in-process membership store; fanout will not cross instances");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}
