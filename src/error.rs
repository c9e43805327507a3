//! Error types shared across the job pipeline.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = JobError> = std::result::Result<T, E>;

/// Failures a job can end with.
///
/// Every variant except [`JobError::ChannelTransport`] is produced on the
/// server side and converted into exactly one terminal `error` event.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("rate limit exceeded for {key}, retry in {}s", retry_after.as_secs().max(1))]
    AdmissionDenied { key: String, retry_after: Duration },

    #[error("generation failed: {0}")]
    GenerationFailed(String),

    #[error("could not persist a new version after {attempts} attempts")]
    PersistenceExhausted { attempts: u32 },

    #[error("usage logging failed: {0}")]
    UsageLoggingFailed(String),

    #[error("connection lost: {0}")]
    ChannelTransport(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid job request: {0}")]
    InvalidRequest(String),
}

impl JobError {
    /// Wire code for the terminal `error` event.
    pub fn code(&self) -> ErrorCode {
        match self {
            JobError::AdmissionDenied { .. } => ErrorCode::AdmissionDenied,
            JobError::GenerationFailed(_) => ErrorCode::GenerationFailed,
            JobError::PersistenceExhausted { .. } => ErrorCode::PersistenceExhausted,
            JobError::Store(_) => ErrorCode::StoreFailed,
            JobError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            JobError::ChannelTransport(_) => ErrorCode::Transport,
            JobError::UsageLoggingFailed(_) => ErrorCode::Internal,
        }
    }
}

/// Discriminates terminal errors so operators can tell an AI failure apart
/// from a write-contention storm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    AdmissionDenied,
    GenerationFailed,
    PersistenceExhausted,
    StoreFailed,
    InvalidRequest,
    Transport,
    #[default]
    Internal,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("stored payload is not valid JSON: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("store worker failed: {0}")]
    Worker(String),

    #[error("store I/O: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        StoreError::Worker(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}
