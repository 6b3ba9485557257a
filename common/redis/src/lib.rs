use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

// Re-exported so consumers can construct CustomRedisError in tests
pub use redis::ErrorKind as RedisErrorKind;

#[derive(Error, Debug, Clone)]
pub enum CustomRedisError {
    #[error("Not found in redis")]
    NotFound,
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Timeout error")]
    Timeout,
    #[error(transparent)]
    Redis(#[from] Arc<redis::RedisError>),
}

impl From<redis::RedisError> for CustomRedisError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            CustomRedisError::Timeout
        } else {
            CustomRedisError::Redis(Arc::new(err))
        }
    }
}

impl CustomRedisError {
    /// Create a Redis error from an ErrorKind (primarily for testing)
    pub fn from_redis_kind(kind: redis::ErrorKind, description: &'static str) -> Self {
        CustomRedisError::Redis(Arc::new(redis::RedisError::from((kind, description))))
    }

    /// True when the store itself could not answer (network, timeout, server error).
    ///
    /// Callers use this to tell "the key is absent" apart from "we don't know",
    /// which matters for anything that would otherwise write a negative result.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, CustomRedisError::Timeout | CustomRedisError::Redis(_))
    }
}

/// One write inside a [`Client::atomic_write`] transaction. Every variant
/// also (re)sets the key's TTL.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    SetEx {
        key: String,
        value: String,
        seconds: u64,
    },
    LPushExpire {
        key: String,
        value: String,
        seconds: u64,
    },
    HIncrByExpire {
        key: String,
        increments: Vec<(String, i64)>,
        seconds: u64,
    },
}

impl WriteOp {
    pub fn key(&self) -> &str {
        match self {
            WriteOp::SetEx { key, .. }
            | WriteOp::LPushExpire { key, .. }
            | WriteOp::HIncrByExpire { key, .. } => key,
        }
    }
}

/// The subset of Redis the pipeline relies on.
///
/// Keys and values are plain UTF-8 strings. TTL arguments are in the unit
/// named by the method (`seconds`, `millis`).
#[async_trait]
pub trait Client {
    /// Returns `CustomRedisError::NotFound` when the key is absent.
    async fn get(&self, k: String) -> Result<String, CustomRedisError>;
    async fn set(&self, k: String, v: String) -> Result<(), CustomRedisError>;
    async fn setex(&self, k: String, v: String, seconds: u64) -> Result<(), CustomRedisError>;
    async fn psetex(&self, k: String, v: String, millis: u64) -> Result<(), CustomRedisError>;
    async fn del(&self, k: String) -> Result<(), CustomRedisError>;
    async fn expire(&self, k: String, seconds: u64) -> Result<(), CustomRedisError>;

    /// `SET k v NX PX millis`. Returns whether the key was set.
    async fn set_nx_px(&self, k: String, v: String, millis: u64)
        -> Result<bool, CustomRedisError>;
    /// Atomically extend the TTL of `k` only while it still holds `expected`.
    async fn pexpire_if_eq(
        &self,
        k: String,
        expected: String,
        millis: u64,
    ) -> Result<bool, CustomRedisError>;
    /// Atomically delete `k` only while it still holds `expected`.
    async fn del_if_eq(&self, k: String, expected: String) -> Result<bool, CustomRedisError>;

    /// SADD followed by EXPIRE on the whole set, in one transaction.
    /// Returns whether the member was newly added.
    async fn sadd_expire(
        &self,
        k: String,
        member: String,
        seconds: u64,
    ) -> Result<bool, CustomRedisError>;
    async fn sismember(&self, k: String, member: String) -> Result<bool, CustomRedisError>;
    async fn scard(&self, k: String) -> Result<u64, CustomRedisError>;

    async fn hgetall(&self, k: String) -> Result<HashMap<String, String>, CustomRedisError>;

    /// Run every write in one MULTI/EXEC transaction: all of them apply or none do.
    async fn atomic_write(&self, ops: Vec<WriteOp>) -> Result<(), CustomRedisError>;
    async fn lrange(
        &self,
        k: String,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, CustomRedisError>;

    async fn zadd(&self, k: String, member: String, score: f64) -> Result<(), CustomRedisError>;
    /// Highest score first. Equal scores are ordered by member, descending.
    async fn zrevrange_withscores(
        &self,
        k: String,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, f64)>, CustomRedisError>;
    /// Zero-based rank in descending score order.
    async fn zrevrank(&self, k: String, member: String) -> Result<Option<u64>, CustomRedisError>;
    async fn zscore(&self, k: String, member: String) -> Result<Option<f64>, CustomRedisError>;
    /// Ranks are ascending-score ranks, as in Redis. Returns the number removed.
    async fn zremrangebyrank(
        &self,
        k: String,
        start: isize,
        stop: isize,
    ) -> Result<u64, CustomRedisError>;
}

mod client;
mod mock;

pub use client::RedisClient;
pub use mock::{MockRedisCall, MockRedisClient, MockRedisValue};
