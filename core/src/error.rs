//! Error kinds surfaced by the admission subsystem.
//!
//! None of these are fatal to the process. The worst case is a sustained
//! `PAUSE`, which the throttle controller reaches on its own.

use std::time::Duration;

use thiserror::Error;

use crate::core::resources::Metric;
use crate::core::retention::MAX_RETENTION_DAYS;

/// One host metric could not be read. The sampler degrades that metric to
/// its last-known value instead of failing the snapshot.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SampleReadError {
    #[error("failed to read {metric}: {reason}")]
    Unreadable { metric: Metric, reason: String },
    #[error("host probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("host probe crashed: {0}")]
    ProbeCrashed(String),
    #[error("previous host probe read is still running")]
    StillRunning,
}

/// A trigger named a source that was never registered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown source '{name}'")]
pub struct UnknownSourceError {
    pub name: String,
}

impl UnknownSourceError {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// A scraper plugin failed mid-fetch. Retried by the queue, never here.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SourceFetchError {
    #[error("source '{name}' is not configured: {reason}")]
    NotConfigured { name: String, reason: String },
    #[error("request to '{name}' failed: {reason}")]
    Request { name: String, reason: String },
    #[error("unexpected response from '{name}': {reason}")]
    Decode { name: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("source '{0}' is already registered")]
    Duplicate(String),
    #[error("source '{0}' must allow at least one concurrent task")]
    ZeroConcurrency(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("job store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("task queue is closed")]
    Closed,
    #[error("task queue is full")]
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    pub fn invalid(key: &'static str, value: impl ToString, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Why a trigger could not even produce an admission decision.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TriggerError {
    #[error(transparent)]
    UnknownSource(#[from] UnknownSourceError),
    #[error("retention window must be between 1 and {max} days", max = MAX_RETENTION_DAYS)]
    InvalidRetentionDays,
    #[error("admitted task could not be dispatched: {0}")]
    Queue(#[from] QueueError),
}
