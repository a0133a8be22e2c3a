//! Streaming session lifecycle
//!
//! ```text
//! Uninitialized ──(backend compatible)──▶ WarmingUp ──(sim time ≥ warm-up)──▶ Initializing
//!                                                                                │
//!                               Failed ◀──(serial / init / stream / thread)──────┤
//!                                                                                ▼
//!                               Stopped ◀──────────(stop / drop)────────────── Active
//! ```
//!
//! The render host calls [`StreamingSession::submit_frame`] once per tick.
//! While warming up the tick is accepted and discarded. The first tick past
//! the warm-up allocates a serial, opens the backend streamer, creates the
//! copy stream and starts the worker. Every later tick hands one frame to
//! the worker's slot without waiting for it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

use glam::{DQuat, DVec3};
use tracing::{debug, error, info, instrument, warn};

use crate::backend::{self, BackendVersion, ImuSample, StatusCode, StreamerId, StreamingBackend};
use crate::config::{Config, StreamConfig};
use crate::convert::{remap_orientation, remap_vector};
use crate::error::{FrameError, SessionError};
use crate::frame::{seconds_to_nanos, FrameDescriptor, PixelFormat, StreamingConfig, Transport};
use crate::gpu::{CopyStream, DeviceBuffer, GpuRuntime};
use crate::pipeline::{FrameSlot, SlotStats, StreamWorker, WorkerStats, WorkerStatsSnapshot};
use crate::pool::{is_virtual_model, CameraPool, SerialNumber};

static NEXT_STREAMER_ID: AtomicU32 = AtomicU32::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    WarmingUp,
    Initializing,
    Active,
    Stopped,
    /// Startup failed; terminal
    Failed,
}

/// Everything the render host supplies on one tick
#[derive(Debug, Clone, Default)]
pub struct TickInput {
    pub stream: bool,
    pub simulation_time: f64,
    pub camera_model: String,
    /// Only read for the virtual camera model
    pub serial_number: String,
    pub port: u16,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    pub ipc: bool,
    pub left: DeviceBuffer,
    /// Null or empty for mono cameras
    pub right: DeviceBuffer,
    pub orientation: DQuat,
    pub linear_acceleration: DVec3,
}

/// What happened to one tick
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Streaming is switched off on the host
    Disabled,
    /// The backend is missing or too old; nothing will ever stream
    Inactive,
    WarmingUp,
    /// This tick started the stream
    Activated,
    Enqueued,
    Rejected(FrameError),
    Failed,
}

impl TickOutcome {
    /// The host's success/failure signal
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            TickOutcome::Disabled | TickOutcome::WarmingUp | TickOutcome::Activated | TickOutcome::Enqueued
        )
    }
}

/// Session-wide settings, fixed at construction
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub warmup_secs: f64,
    pub use_system_time: bool,
    pub min_version: BackendVersion,
    pub stream: StreamConfig,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for SessionOptions {
    fn from(config: &Config) -> Self {
        Self {
            warmup_secs: config.session.warmup_secs,
            use_system_time: config.session.use_system_time,
            min_version: config.backend.min_version,
            stream: config.stream.clone(),
        }
    }
}

/// Resources held while initializing or active. Every field past `serial`
/// is filled in as startup proceeds, so a failed startup tears down exactly
/// what it acquired.
struct ActiveStream {
    model: String,
    serial: SerialNumber,
    streamer_id: StreamerId,
    stereo: bool,
    config: Option<StreamingConfig>,
    backend_open: bool,
    stream: Option<Arc<dyn CopyStream>>,
    slot: Arc<FrameSlot<FrameDescriptor>>,
    worker: Option<JoinHandle<()>>,
    stats: Option<Arc<WorkerStats>>,
}

/// One streamed camera, from warm-up to teardown
pub struct StreamingSession {
    backend: Arc<dyn StreamingBackend>,
    gpu: Arc<dyn GpuRuntime>,
    pool: Arc<CameraPool>,
    options: SessionOptions,
    state: SessionState,
    failure: Option<SessionError>,
    active: Option<ActiveStream>,
}

impl StreamingSession {
    /// Check the backend and start warming up. An incompatible backend
    /// leaves the session inactive for good.
    pub fn new(
        backend: Arc<dyn StreamingBackend>,
        gpu: Arc<dyn GpuRuntime>,
        pool: Arc<CameraPool>,
        options: SessionOptions,
    ) -> Self {
        let compatible = backend::is_compatible(backend.as_ref(), &options.min_version);
        let (state, failure) = if compatible {
            (SessionState::WarmingUp, None)
        } else {
            error!(
                required = %options.min_version,
                "error while loading the streaming backend, make sure a compatible version is installed"
            );
            (
                SessionState::Uninitialized,
                Some(SessionError::BackendIncompatible {
                    required: options.min_version.to_string(),
                }),
            )
        };

        Self {
            backend,
            gpu,
            pool,
            options,
            state,
            failure,
            active: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Why the session is inactive or failed
    pub fn failure(&self) -> Option<&SessionError> {
        self.failure.as_ref()
    }

    pub fn serial_number(&self) -> Option<SerialNumber> {
        self.active.as_ref().map(|active| active.serial)
    }

    pub fn streamer_id(&self) -> Option<StreamerId> {
        self.active.as_ref().map(|active| active.streamer_id)
    }

    pub fn streaming_config(&self) -> Option<&StreamingConfig> {
        self.active.as_ref().and_then(|active| active.config.as_ref())
    }

    pub fn slot_stats(&self) -> SlotStats {
        self.active
            .as_ref()
            .map(|active| active.slot.stats())
            .unwrap_or_default()
    }

    pub fn worker_stats(&self) -> WorkerStatsSnapshot {
        self.active
            .as_ref()
            .and_then(|active| active.stats.as_ref())
            .map(|stats| stats.snapshot())
            .unwrap_or_default()
    }

    /// Called once per render tick.
    pub fn submit_frame(&mut self, tick: &TickInput) -> TickOutcome {
        match self.state {
            SessionState::Uninitialized => TickOutcome::Inactive,
            SessionState::Stopped | SessionState::Failed => TickOutcome::Failed,
            // `start` leaves Initializing before returning, so a tick never
            // observes it. Treated as a failure rather than restarting.
            SessionState::Initializing => TickOutcome::Failed,
            _ if !tick.stream => TickOutcome::Disabled,
            SessionState::WarmingUp => {
                if tick.simulation_time < self.options.warmup_secs {
                    return TickOutcome::WarmingUp;
                }
                match self.start(tick) {
                    Ok(()) => TickOutcome::Activated,
                    Err(err) => {
                        error!(%err, "invalid streamer configuration");
                        self.failure = Some(err);
                        self.state = SessionState::Failed;
                        TickOutcome::Failed
                    }
                }
            }
            SessionState::Active => match self.enqueue(tick) {
                Ok(()) => TickOutcome::Enqueued,
                Err(err) => {
                    error!(%err, "frame rejected");
                    TickOutcome::Rejected(err)
                }
            },
        }
    }

    #[instrument(skip_all, fields(model = %tick.camera_model))]
    fn start(&mut self, tick: &TickInput) -> Result<(), SessionError> {
        self.state = SessionState::Initializing;

        let model = tick.camera_model.as_str();
        let stereo = !tick.right.is_empty();
        if stereo {
            info!("opening stereo camera");
        } else {
            info!("opening mono camera");
        }
        if let Some(entry) = self.pool.catalog().get(model) {
            if entry.stereo != stereo {
                warn!(catalog_stereo = entry.stereo, "buffers disagree with the camera model's lens count");
            }
        }

        let serial = if is_virtual_model(model) {
            self.pool.claim_virtual(&tick.serial_number)?
        } else {
            self.pool.allocate(model)?
        };

        let mut active = ActiveStream {
            model: model.to_string(),
            serial,
            streamer_id: NEXT_STREAMER_ID.fetch_add(1, Ordering::Relaxed),
            stereo,
            config: None,
            backend_open: false,
            stream: None,
            slot: Arc::new(FrameSlot::new()),
            worker: None,
            stats: None,
        };

        match self.open(&mut active, tick) {
            Ok(()) => {
                info!(
                    serial,
                    streamer_id = active.streamer_id,
                    port = tick.port,
                    "streamer initialized"
                );
                self.active = Some(active);
                self.state = SessionState::Active;
                Ok(())
            }
            Err(err) => {
                self.teardown(active);
                Err(err)
            }
        }
    }

    /// Acquire backend streamer, copy stream and worker, recording each in
    /// `active` as it succeeds.
    fn open(&self, active: &mut ActiveStream, tick: &TickInput) -> Result<(), SessionError> {
        if !self.backend.is_serial_valid(active.serial) {
            if is_virtual_model(&active.model) {
                error!(serial = active.serial, "invalid serial number, make sure it starts with 11XXXXXXX");
            } else {
                error!(serial = active.serial, "invalid serial number");
            }
            return Err(SessionError::InvalidSerial(active.serial.to_string()));
        }

        let transport = Transport::from_ipc_flag(tick.ipc);
        let stream_options = &self.options.stream;
        let config = StreamingConfig {
            width: tick.width,
            height: tick.height,
            fps: tick.fps,
            codec: stream_options.codec,
            transport,
            pixel_format: PixelFormat::select(transport, active.stereo),
            alpha_channel: stream_options.alpha_channel,
            serial_number: active.serial,
            port: tick.port,
            verbose: stream_options.verbose,
            bitrate_kbps: stream_options.bitrate_kbps,
            chunk_size: stream_options.chunk_size,
        };
        debug!(?config, "initializing streamer");

        if !self.backend.init_streamer(active.streamer_id, &config) {
            return Err(SessionError::BackendInitFailure {
                streamer_id: active.streamer_id,
            });
        }
        active.backend_open = true;
        let pixel_format = config.pixel_format;
        active.config = Some(config);

        let stream = self
            .gpu
            .create_stream()
            .map_err(SessionError::GpuResourceFailure)?;
        active.stream = Some(Arc::clone(&stream));

        let worker = StreamWorker::new(
            Arc::clone(&active.slot),
            Arc::clone(&self.backend),
            stream,
            active.streamer_id,
            pixel_format,
        );
        active.stats = Some(worker.stats());
        let handle = worker
            .spawn()
            .map_err(|err| SessionError::WorkerSpawn(err.to_string()))?;
        active.worker = Some(handle);
        Ok(())
    }

    fn enqueue(&self, tick: &TickInput) -> Result<(), FrameError> {
        let Some(active) = self.active.as_ref() else {
            return Err(FrameError::MissingBuffer);
        };

        if tick.left.is_empty() {
            return Err(FrameError::MissingBuffer);
        }
        if active.stereo {
            if tick.right.ptr.is_null() {
                return Err(FrameError::MissingBuffer);
            }
            if tick.right.len != tick.left.len {
                return Err(FrameError::MismatchedBufferSizes {
                    left: tick.left.len,
                    right: tick.right.len,
                });
            }
        }

        let timestamp = if self.options.use_system_time {
            wall_clock_seconds()
        } else {
            tick.simulation_time
        };

        active.slot.write(FrameDescriptor {
            left: tick.left,
            right: active.stereo.then_some(tick.right),
            orientation: tick.orientation,
            linear_acceleration: tick.linear_acceleration,
            timestamp,
            valid: true,
        });
        Ok(())
    }

    /// Forward an IMU-only sample. `None` unless the session is active.
    pub fn ingest_imu(
        &self,
        timestamp: f64,
        velocity: DVec3,
        linear_acceleration: DVec3,
        orientation: DQuat,
    ) -> Option<StatusCode> {
        let active = self.active.as_ref().filter(|_| self.state == SessionState::Active)?;
        let sample = ImuSample {
            timestamp_ns: seconds_to_nanos(timestamp),
            velocity: remap_vector(velocity),
            linear_acceleration: remap_vector(linear_acceleration),
            orientation: remap_orientation(orientation),
        };
        let status = self.backend.ingest_imu(active.streamer_id, &sample);
        if status != 0 {
            warn!(streamer_id = active.streamer_id, status, "backend rejected IMU sample");
        }
        Some(status)
    }

    /// Identifiers the backend currently exposes, empty when inactive.
    pub fn active_camera_identifiers(&self) -> Vec<i32> {
        if self.state == SessionState::Uninitialized {
            return Vec::new();
        }
        self.backend.active_camera_identifiers()
    }

    /// Stop streaming and release everything. The session cannot restart.
    pub fn stop(&mut self) {
        if let Some(active) = self.active.take() {
            self.teardown(active);
        }
        if self.state != SessionState::Stopped {
            info!(previous = ?self.state, "session stopped");
        }
        self.state = SessionState::Stopped;
    }

    /// Cancel, join, close backend, destroy stream, release serial. In that order.
    fn teardown(&self, mut active: ActiveStream) {
        active.slot.close();

        if let Some(worker) = active.worker.take() {
            if worker.join().is_err() {
                error!(streamer_id = active.streamer_id, "streaming thread panicked");
            }
        }

        if active.backend_open {
            self.backend.close_streamer(active.streamer_id);
            self.backend.destroy_instance();
        }

        drop(active.stream.take());

        // Failure is already logged by the pool.
        let _ = self.pool.release(&active.model, active.serial);
        debug!(streamer_id = active.streamer_id, serial = active.serial, "session resources released");
    }
}

impl Drop for StreamingSession {
    fn drop(&mut self) {
        self.stop();
    }
}

fn wall_clock_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RecordingBackend;
    use crate::gpu::SimulatedDevice;
    use crate::pool::Catalog;

    fn session(backend: Arc<RecordingBackend>) -> StreamingSession {
        let pool = Arc::new(CameraPool::new(
            Catalog::new().with_model("ZED_X", vec![40976320, 41116066], true),
        ));
        StreamingSession::new(backend, Arc::new(SimulatedDevice::new()), pool, SessionOptions::default())
    }

    fn tick(time: f64) -> TickInput {
        TickInput {
            stream: true,
            simulation_time: time,
            camera_model: "ZED_X".into(),
            port: 30000,
            fps: 30,
            width: 4,
            height: 2,
            ..TickInput::default()
        }
    }

    #[test]
    fn warm_up_ticks_are_accepted() {
        let backend = Arc::new(RecordingBackend::new());
        let mut session = session(backend.clone());
        assert_eq!(session.state(), SessionState::WarmingUp);
        assert_eq!(session.submit_frame(&tick(0.5)), TickOutcome::WarmingUp);
        assert!(session.submit_frame(&tick(0.9)).is_success());
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn disabled_stream_does_nothing() {
        let backend = Arc::new(RecordingBackend::new());
        let mut session = session(backend.clone());
        let input = TickInput {
            stream: false,
            ..tick(5.0)
        };
        assert_eq!(session.submit_frame(&input), TickOutcome::Disabled);
        assert_eq!(session.state(), SessionState::WarmingUp);
    }

    #[test]
    fn incompatible_backend_never_starts() {
        let backend = Arc::new(RecordingBackend::new().with_version(Some(BackendVersion::new(4, 8, 0))));
        let mut session = session(backend.clone());
        assert_eq!(session.state(), SessionState::Uninitialized);
        assert_eq!(session.submit_frame(&tick(10.0)), TickOutcome::Inactive);
        assert!(!TickOutcome::Inactive.is_success());
        assert!(matches!(session.failure(), Some(SessionError::BackendIncompatible { .. })));
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn mono_activation_selects_yuv() {
        let backend = Arc::new(RecordingBackend::new());
        let mut session = session(backend.clone());
        assert_eq!(session.submit_frame(&tick(1.0)), TickOutcome::Activated);

        let config = session.streaming_config().unwrap();
        assert_eq!(config.pixel_format, PixelFormat::Yuv);
        assert_eq!(config.transport, Transport::Network);
        assert_eq!(config.serial_number, 41116066);
        session.stop();
    }

    #[test]
    fn imu_samples_are_converted() {
        let backend = Arc::new(RecordingBackend::new());
        let mut session = session(backend.clone());
        assert_eq!(
            session.ingest_imu(0.5, DVec3::X, DVec3::Z, DQuat::IDENTITY),
            None
        );
        session.submit_frame(&tick(1.0));
        let yaw = DQuat::from_rotation_z(std::f64::consts::FRAC_PI_2);
        assert_eq!(session.ingest_imu(1.5, DVec3::X, DVec3::Z, yaw), Some(0));

        let imu = backend
            .calls()
            .into_iter()
            .find_map(|call| match call {
                crate::backend::BackendCall::Imu { sample, .. } => Some(sample),
                _ => None,
            })
            .unwrap();
        assert_eq!(imu.timestamp_ns, 1_500_000_000);
        assert!(imu.velocity.abs_diff_eq(DVec3::new(0.0, 0.0, 1.0), 1e-12));
        assert!(imu.linear_acceleration.abs_diff_eq(DVec3::new(0.0, -1.0, 0.0), 1e-12));
        let half = std::f64::consts::FRAC_1_SQRT_2;
        assert!(imu.orientation.abs_diff_eq(DQuat::from_xyzw(0.0, half, 0.0, half), 1e-9));
    }

    #[test]
    fn camera_identifiers_come_from_the_backend() {
        let backend = Arc::new(RecordingBackend::new().with_camera_identifiers(vec![3, 7]));
        let mut session = session(backend);
        assert_eq!(session.active_camera_identifiers(), vec![3, 7]);

        assert_eq!(session.submit_frame(&tick(1.0)), TickOutcome::Activated);
        assert_eq!(session.active_camera_identifiers(), vec![3, 7]);
    }

    #[test]
    fn incompatible_backend_lists_no_cameras() {
        let backend = Arc::new(
            RecordingBackend::new()
                .with_version(None)
                .with_camera_identifiers(vec![3, 7]),
        );
        let session = session(backend);
        assert!(session.active_camera_identifiers().is_empty());
    }

    #[test]
    fn stop_is_terminal() {
        let backend = Arc::new(RecordingBackend::new());
        let mut session = session(backend);
        session.stop();
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(session.submit_frame(&tick(2.0)), TickOutcome::Failed);
        session.stop();
        assert_eq!(session.state(), SessionState::Stopped);
    }
}
