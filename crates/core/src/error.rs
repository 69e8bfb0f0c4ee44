use std::fmt::Display;
use std::time::Duration;

use thiserror::Error;

use crate::ObjectKey;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("object has no metadata.name")]
    MissingName,
    #[error("unexpected key format: {0:?}")]
    Malformed(String),
}

#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("cache lookup for {key} failed: {reason}")]
    Lookup { key: ObjectKey, reason: String },
}

/// Failure of a single sync attempt. Every variant is subject to the retry policy.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("sync failed: {0}")]
    Failed(String),
    #[error("sync timed out after {0:?}")]
    Timeout(Duration),
    #[error("sync panicked: {0}")]
    Panicked(String),
}

impl SyncError {
    pub fn failed(msg: impl Display) -> Self {
        SyncError::Failed(msg.to_string())
    }
}
