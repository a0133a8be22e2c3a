//! Bridge between a simulated stereo camera and a video streaming backend
//!
//! Each render tick hands the bridge device-resident images plus IMU state.
//! A [`StreamingSession`] owns the lifecycle for one camera: it leases a
//! serial from the [`CameraPool`], brings the backend streamer up, and feeds
//! frames through a single-slot handoff to a background copy worker.

pub mod backend;
pub mod config;
pub mod convert;
pub mod error;
pub mod frame;
pub mod gpu;
pub mod pipeline;
pub mod pool;
pub mod session;
pub mod utils;

pub use backend::{BackendVersion, RecordingBackend, SdkBackend, StreamingBackend};
pub use config::Config;
pub use error::{BackendError, ConfigError, FrameError, GpuError, PoolError, SessionError};
pub use frame::{Codec, FrameDescriptor, PixelFormat, StreamingConfig, Transport};
pub use gpu::{CopyStream, DeviceBuffer, DevicePtr, GpuRuntime, SimulatedDevice};
pub use pool::{CameraPool, Catalog, SerialNumber};
pub use session::{SessionOptions, SessionState, StreamingSession, TickInput, TickOutcome};
