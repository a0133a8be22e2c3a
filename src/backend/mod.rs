//! Streaming backend capability
//!
//! The backend encodes and transports frames; the bridge only talks to it
//! through [`StreamingBackend`]. Production builds load the vendor library at
//! runtime ([`dynamic::SdkBackend`]); tests use [`recorder::RecordingBackend`].

pub mod dynamic;
pub mod recorder;

use std::fmt;

use glam::{DQuat, DVec3};
use serde::{Deserialize, Serialize};

use crate::frame::{PixelFormat, StreamingConfig};
use crate::pool::SerialNumber;

pub use dynamic::SdkBackend;
pub use recorder::{BackendCall, RecordingBackend, StreamedFrame};

/// Backend-side identifier of one streamer instance
pub type StreamerId = u32;

/// Non-zero values are backend error codes.
pub type StatusCode = i32;

/// Oldest backend release the bridge can drive
pub const MIN_BACKEND_VERSION: BackendVersion = BackendVersion::new(5, 1, 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BackendVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl BackendVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// A newer major accepts any minor/patch; otherwise compare in order.
    pub fn satisfies(&self, required: &BackendVersion) -> bool {
        self >= required
    }
}

impl Default for BackendVersion {
    fn default() -> Self {
        MIN_BACKEND_VERSION
    }
}

impl fmt::Display for BackendVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// A materialized frame ready for the encoder: host images, backend-frame pose.
#[derive(Debug, Clone, Copy)]
pub struct OutgoingFrame<'a> {
    pub left: &'a [u8],
    pub right: Option<&'a [u8]>,
    pub timestamp_ns: u64,
    pub orientation: DQuat,
    pub linear_acceleration: DVec3,
}

/// An IMU-only sample, already in the backend frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuSample {
    pub timestamp_ns: u64,
    pub velocity: DVec3,
    pub linear_acceleration: DVec3,
    pub orientation: DQuat,
}

/// Everything the bridge needs from the encoder/transport.
///
/// Callers must check [`StreamingBackend::version`] against
/// [`MIN_BACKEND_VERSION`] before using anything else.
pub trait StreamingBackend: Send + Sync {
    /// `None` when the backend cannot report a version.
    fn version(&self) -> Option<BackendVersion>;

    fn init_streamer(&self, id: StreamerId, config: &StreamingConfig) -> bool;

    /// RGB/BGR frames and YUV frames take separate entry points.
    fn stream_frame(&self, format: PixelFormat, id: StreamerId, frame: &OutgoingFrame<'_>) -> StatusCode;

    fn close_streamer(&self, id: StreamerId);

    fn destroy_instance(&self);

    fn ingest_imu(&self, id: StreamerId, sample: &ImuSample) -> StatusCode;

    fn active_camera_identifiers(&self) -> Vec<i32>;

    /// Whether the backend accepts `serial` as a camera identity.
    fn is_serial_valid(&self, serial: SerialNumber) -> bool {
        serial > 0
    }
}

pub fn is_compatible(backend: &dyn StreamingBackend, required: &BackendVersion) -> bool {
    match backend.version() {
        Some(found) => {
            tracing::info!(%found, %required, "found streaming backend");
            found.satisfies(required)
        }
        None => {
            tracing::error!("streaming backend did not report a version");
            false
        }
    }
}
