//! Error types shared across the bridge

use thiserror::Error;

use crate::pool::SerialNumber;

/// Camera-identity pool failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("no serial numbers left for camera model {model}")]
    Exhausted { model: String },

    #[error("camera model {model} is not in the catalog")]
    UnknownModel { model: String },

    #[error("invalid serial number {raw:?}: virtual serials must be 11XXXXXXX")]
    InvalidSerial { raw: String },

    #[error("serial number {serial} is already held by another session")]
    SerialInUse { serial: SerialNumber },

    #[error("serial number {serial} is not allocated for camera model {model}")]
    NotAllocated { model: String, serial: SerialNumber },
}

/// Device memory and stream failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GpuError {
    #[error("failed to create copy stream: {0}")]
    StreamCreate(String),

    #[error("device-to-host copy failed: {0}")]
    Copy(String),

    #[error("stream synchronization failed: {0}")]
    Sync(String),

    #[error("destination buffer too small ({capacity} bytes for a {len} byte copy)")]
    ShortDestination { capacity: usize, len: usize },
}

/// Streaming backend loading failures
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to load backend library {path}: {source}")]
    Load {
        path: String,
        #[source]
        source: libloading::Error,
    },

    #[error("no backend library found (searched {searched:?})")]
    NotFound { searched: Vec<String> },
}

/// Per-frame failures. The frame is dropped, the session carries on.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FrameError {
    #[error("left image buffer is missing")]
    MissingBuffer,

    #[error("left and right images have different sizes ({left} vs {right} bytes)")]
    MismatchedBufferSizes { left: usize, right: usize },

    #[error("frame at {timestamp}s is not newer than last streamed frame at {last}s")]
    StaleTimestamp { timestamp: f64, last: f64 },

    #[error("copy issue failed: {0}")]
    Copy(GpuError),

    #[error("synchronization failed: {0}")]
    Sync(GpuError),
}

/// Session lifecycle failures. Any of these ends the session.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error(transparent)]
    PoolExhausted(PoolError),

    #[error("serial number rejected: {0}")]
    InvalidSerial(String),

    #[error("streaming backend is unavailable or older than {required}")]
    BackendIncompatible { required: String },

    #[error("backend refused to initialize streamer {streamer_id}")]
    BackendInitFailure { streamer_id: u32 },

    #[error("GPU resource failure: {0}")]
    GpuResourceFailure(GpuError),

    #[error("failed to start streaming worker: {0}")]
    WorkerSpawn(String),
}

impl From<PoolError> for SessionError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Exhausted { .. } | PoolError::UnknownModel { .. } => {
                SessionError::PoolExhausted(err)
            }
            other => SessionError::InvalidSerial(other.to_string()),
        }
    }
}

/// Configuration loading failures
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}
