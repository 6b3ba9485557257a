//! Behavior event pipeline.
//!
//! Events published with a unique message id are consumed twice over the same
//! topic: once to apply them to the behavior store exactly once per id, and
//! once to count them in tumbling windows whose totals feed the ranking store.
//! Entity reads go through a stampede-safe cache-aside layer.
//!
//! ## Error logging
//!
//! Log errors with `{e:#}` inline or `error = ?e` as a field so the cause
//! chain stays visible. Build errors with `.context()` rather than formatting
//! the source into a new message.

pub mod aggregation;
pub mod behavior_store;
pub mod cached_repository;
pub mod clock;
pub mod config;
pub mod consumer;
pub mod dedup;
pub mod error;
pub mod event;
pub mod metrics;
pub mod metrics_consts;
pub mod producer;
pub mod ranking;
pub mod service;
pub mod transport;

pub use error::{Disposition, PipelineError};
pub use event::{ActionKind, BehaviorEvent};
