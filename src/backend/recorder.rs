//! In-memory backend that records every call
//!
//! Stands in for the vendor library in tests and in dry runs of the binary.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use glam::{DQuat, DVec3};
use tracing::debug;

use super::{BackendVersion, ImuSample, OutgoingFrame, StatusCode, StreamerId, StreamingBackend};
use crate::frame::{PixelFormat, StreamingConfig};
use crate::pool::SerialNumber;

/// A frame as the recorder received it, images copied out.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamedFrame {
    pub format: PixelFormat,
    pub id: StreamerId,
    pub left: Vec<u8>,
    pub right: Option<Vec<u8>>,
    pub timestamp_ns: u64,
    pub orientation: DQuat,
    pub linear_acceleration: DVec3,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    Init { id: StreamerId, config: StreamingConfig },
    Stream(StreamedFrame),
    Imu { id: StreamerId, sample: ImuSample },
    Close { id: StreamerId },
    Destroy,
}

pub struct RecordingBackend {
    version: Option<BackendVersion>,
    init_result: AtomicBool,
    stream_status: AtomicI32,
    rejected_serials: Mutex<HashSet<SerialNumber>>,
    camera_identifiers: Vec<i32>,
    calls: Mutex<Vec<BackendCall>>,
}

impl RecordingBackend {
    /// A compatible backend that accepts everything.
    pub fn new() -> Self {
        Self {
            version: Some(BackendVersion::new(5, 1, 0)),
            init_result: AtomicBool::new(true),
            stream_status: AtomicI32::new(0),
            rejected_serials: Mutex::new(HashSet::new()),
            camera_identifiers: Vec::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_version(mut self, version: Option<BackendVersion>) -> Self {
        self.version = version;
        self
    }

    pub fn with_camera_identifiers(mut self, identifiers: Vec<i32>) -> Self {
        self.camera_identifiers = identifiers;
        self
    }

    pub fn set_init_result(&self, ok: bool) {
        self.init_result.store(ok, Ordering::SeqCst);
    }

    pub fn set_stream_status(&self, status: StatusCode) {
        self.stream_status.store(status, Ordering::SeqCst);
    }

    pub fn reject_serial(&self, serial: SerialNumber) {
        lock(&self.rejected_serials).insert(serial);
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        lock(&self.calls).clone()
    }

    pub fn frames(&self) -> Vec<StreamedFrame> {
        lock(&self.calls)
            .iter()
            .filter_map(|call| match call {
                BackendCall::Stream(frame) => Some(frame.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn init_configs(&self) -> Vec<StreamingConfig> {
        lock(&self.calls)
            .iter()
            .filter_map(|call| match call {
                BackendCall::Init { config, .. } => Some(config.clone()),
                _ => None,
            })
            .collect()
    }

    /// Poll until at least `count` frames have arrived.
    pub fn wait_for_frames(&self, count: usize, timeout: Duration) -> Vec<StreamedFrame> {
        let deadline = Instant::now() + timeout;
        loop {
            let frames = self.frames();
            if frames.len() >= count || Instant::now() >= deadline {
                return frames;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn record(&self, call: BackendCall) {
        lock(&self.calls).push(call);
    }
}

impl Default for RecordingBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamingBackend for RecordingBackend {
    fn version(&self) -> Option<BackendVersion> {
        self.version
    }

    fn init_streamer(&self, id: StreamerId, config: &StreamingConfig) -> bool {
        debug!(id, serial = config.serial_number, port = config.port, "recorder: init streamer");
        self.record(BackendCall::Init {
            id,
            config: config.clone(),
        });
        self.init_result.load(Ordering::SeqCst)
    }

    fn stream_frame(&self, format: PixelFormat, id: StreamerId, frame: &OutgoingFrame<'_>) -> StatusCode {
        self.record(BackendCall::Stream(StreamedFrame {
            format,
            id,
            left: frame.left.to_vec(),
            right: frame.right.map(<[u8]>::to_vec),
            timestamp_ns: frame.timestamp_ns,
            orientation: frame.orientation,
            linear_acceleration: frame.linear_acceleration,
        }));
        self.stream_status.load(Ordering::SeqCst)
    }

    fn close_streamer(&self, id: StreamerId) {
        self.record(BackendCall::Close { id });
    }

    fn destroy_instance(&self) {
        self.record(BackendCall::Destroy);
    }

    fn ingest_imu(&self, id: StreamerId, sample: &ImuSample) -> StatusCode {
        self.record(BackendCall::Imu { id, sample: *sample });
        0
    }

    fn active_camera_identifiers(&self) -> Vec<i32> {
        self.camera_identifiers.clone()
    }

    fn is_serial_valid(&self, serial: SerialNumber) -> bool {
        serial > 0 && !lock(&self.rejected_serials).contains(&serial)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
