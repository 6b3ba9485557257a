//! Stampede-safe read-through cache
//!
//! This crate provides a generic cache-aside layer over Redis. It supports:
//!
//! - Generic key-value caching with JSON values
//! - Caching of "does not exist" results as a NULL sentinel with its own TTL
//! - Jittered TTLs so keys written together don't expire together
//! - A per-key distributed lock with a lease watchdog, so one caller rebuilds
//!   a cold key while the others wait for its result
//! - Bounded fallback when the lock is contended or Redis is down
//! - Write-path population and invalidation
//! - Rich return types indicating cache source for observability
//!
//! # Example
//!
//! ```rust,ignore
//! use common_cache::{ReadThroughCache, CacheConfig, CacheSource};
//!
//! let cache = ReadThroughCache::new(
//!     redis_reader,
//!     redis_writer,
//!     CacheConfig::with_ttl("article:", 3600),
//! );
//!
//! let result = cache
//!     .get_or_load(&id, |id| async move { repository.find(*id).await })
//!     .await?;
//!
//! if let Some(article) = result.value {
//!     // Use the value
//! } else {
//!     // Item doesn't exist
//! }
//! ```

pub mod lock;
pub mod metrics;
pub mod read_through;
pub mod ttl;
pub mod types;

pub use lock::{LockConfig, LockGuard, RedisMutex};
pub use metrics::ReadThroughCacheWithMetrics;
pub use read_through::ReadThroughCache;
pub use types::{CacheConfig, CacheResult, CacheSource, NULL_SENTINEL};
