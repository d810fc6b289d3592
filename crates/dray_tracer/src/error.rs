//! Top-level error type for the scheduler.

use dray_core::{ConfigError, InstanceId, PayloadId, SceneError};
use thiserror::Error;

use crate::comm::CommError;
use crate::transport::TransportError;

/// Errors that abort a frame.
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("Scene error: {0}")]
    Scene(#[from] SceneError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// No factory is registered under the configured adapter tag.
    #[error("unknown adapter kind '{0}'")]
    UnknownAdapter(String),

    #[error("adapter for payload {payload} failed to build: {reason}")]
    AdapterBuild { payload: PayloadId, reason: String },

    #[error("no queue for instance {0}")]
    UnknownInstance(InstanceId),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Communication error: {0}")]
    Comm(#[from] CommError),

    #[error("worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Result type for scheduler operations.
pub type TraceResult<T> = Result<T, TraceError>;
