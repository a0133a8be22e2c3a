//! Vendor streaming library loaded at runtime

use std::os::raw::{c_int, c_longlong};
use std::path::Path;
use std::ptr;

use libloading::Library;
use tracing::{error, info, instrument, warn};

use super::{BackendVersion, ImuSample, OutgoingFrame, StatusCode, StreamerId, StreamingBackend};
use crate::error::BackendError;
use crate::frame::{PixelFormat, StreamingConfig, Transport};
use crate::pool::SerialNumber;

type GetVersionFn = unsafe extern "C" fn(*mut c_int, *mut c_int, *mut c_int) -> c_int;
type InitStreamerFn = unsafe extern "C" fn(c_int, *mut RawStreamingParameters) -> bool;
type StreamFn = unsafe extern "C" fn(
    c_int,
    *mut u8,
    *mut u8,
    c_longlong,
    f32,
    f32,
    f32,
    f32,
    f32,
    f32,
    f32,
) -> c_int;
type CloseStreamerFn = unsafe extern "C" fn(c_int);
type DestroyInstanceFn = unsafe extern "C" fn();
type GetIdentifiersFn = unsafe extern "C" fn(*mut c_int) -> *mut c_int;
type IngestImuFn = unsafe extern "C" fn(
    c_int,
    c_longlong,
    f32,
    f32,
    f32,
    f32,
    f32,
    f32,
    f32,
    f32,
    f32,
    f32,
) -> c_int;
type IsSerialValidFn = unsafe extern "C" fn(c_int) -> bool;

/// Layout of the library's streaming-parameters block.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct RawStreamingParameters {
    mode: c_int,
    imu_cam_q: [f32; 4],
    imu_cam_t: [f32; 3],
    image_width: c_int,
    image_height: c_int,
    codec_type: c_int,
    port: u16,
    fps: c_int,
    serial_number: c_int,
    alpha_channel_included: bool,
    input_format: c_int,
    verbose: bool,
    /// 0 = network only, 1 = IPC only, 2 = both
    transport_layer_mode: c_int,
    bitrate: c_int,
    chunk_size: u16,
}

impl From<&StreamingConfig> for RawStreamingParameters {
    fn from(config: &StreamingConfig) -> Self {
        Self {
            mode: 1,
            imu_cam_q: [0.0, 0.0, 0.0, 1.0],
            imu_cam_t: [0.0; 3],
            image_width: config.width as c_int,
            image_height: config.height as c_int,
            codec_type: config.codec.id(),
            port: config.port,
            fps: config.fps as c_int,
            serial_number: config.serial_number as c_int,
            alpha_channel_included: config.alpha_channel,
            input_format: config.pixel_format as c_int,
            verbose: config.verbose,
            transport_layer_mode: match config.transport {
                Transport::Network => 0,
                Transport::Ipc => 1,
            },
            bitrate: config.bitrate_kbps as c_int,
            chunk_size: config.chunk_size,
        }
    }
}

/// The vendor library and its entry points.
///
/// Entry points that the library does not export resolve to `None`; calling
/// them logs and reports failure, the way a missing feature would.
pub struct SdkBackend {
    get_version: Option<GetVersionFn>,
    init_streamer: Option<InitStreamerFn>,
    stream_rgb: Option<StreamFn>,
    stream_yuv: Option<StreamFn>,
    close_streamer: Option<CloseStreamerFn>,
    destroy_instance: Option<DestroyInstanceFn>,
    get_identifiers: Option<GetIdentifiersFn>,
    ingest_imu: Option<IngestImuFn>,
    is_sn_valid: Option<IsSerialValidFn>,
    // Keeps every pointer above alive; must be dropped last.
    _library: Library,
}

impl SdkBackend {
    /// Platform file name of the vendor library
    pub fn default_library_name() -> &'static str {
        if cfg!(windows) {
            "sl_zed64.dll"
        } else {
            "libsl_zed.so"
        }
    }

    #[instrument]
    pub fn load(path: &Path) -> Result<Self, BackendError> {
        // SAFETY: loading runs the library's initializers; the vendor library
        // has none with preconditions.
        let library = unsafe { Library::new(path) }.map_err(|source| BackendError::Load {
            path: path.display().to_string(),
            source,
        })?;

        // SAFETY: each type alias matches the exported C signature.
        let backend = unsafe {
            Self {
                get_version: symbol(&library, b"getZEDSDKRuntimeVersion_C\0"),
                init_streamer: symbol(&library, b"init_streamer\0"),
                stream_rgb: symbol(&library, b"stream_rgb\0"),
                stream_yuv: symbol(&library, b"stream_yuv\0"),
                close_streamer: symbol(&library, b"close_streamer\0"),
                destroy_instance: symbol(&library, b"destroy_instance\0"),
                get_identifiers: symbol(&library, b"get_virtual_camera_identifiers\0"),
                ingest_imu: symbol(&library, b"ingest_imu\0"),
                is_sn_valid: symbol(&library, b"is_sn_valid\0"),
                _library: library,
            }
        };

        info!(path = %path.display(), "loaded streaming backend library");
        Ok(backend)
    }
}

unsafe fn symbol<T: Copy>(library: &Library, name: &[u8]) -> Option<T> {
    match library.get::<T>(name) {
        Ok(sym) => Some(*sym),
        Err(err) => {
            warn!(symbol = %String::from_utf8_lossy(&name[..name.len() - 1]), %err, "backend symbol not found");
            None
        }
    }
}

impl StreamingBackend for SdkBackend {
    fn version(&self) -> Option<BackendVersion> {
        let get_version = self.get_version?;
        let (mut major, mut minor, mut patch) = (0, 0, 0);
        // SAFETY: the out-pointers are valid for the duration of the call.
        let status = unsafe { get_version(&mut major, &mut minor, &mut patch) };
        if status != 0 {
            error!(status, "backend failed to report its version");
            return None;
        }
        Some(BackendVersion::new(
            major.max(0) as u32,
            minor.max(0) as u32,
            patch.max(0) as u32,
        ))
    }

    fn init_streamer(&self, id: StreamerId, config: &StreamingConfig) -> bool {
        let Some(init) = self.init_streamer else {
            error!("backend does not export init_streamer");
            return false;
        };
        let mut params = RawStreamingParameters::from(config);
        // SAFETY: `params` outlives the call; the library copies it.
        unsafe { init(id as c_int, &mut params) }
    }

    fn stream_frame(&self, format: PixelFormat, id: StreamerId, frame: &OutgoingFrame<'_>) -> StatusCode {
        let entry = if format.is_rgb_family() {
            self.stream_rgb
        } else {
            self.stream_yuv
        };
        let Some(stream) = entry else {
            error!(?format, "backend does not export a stream entry point for this format");
            return -1;
        };

        let right = frame
            .right
            .map_or(ptr::null_mut(), |right| right.as_ptr() as *mut u8);
        let q = frame.orientation;
        let a = frame.linear_acceleration;
        // SAFETY: the library only reads the image buffers, which stay
        // borrowed until the call returns.
        unsafe {
            stream(
                id as c_int,
                frame.left.as_ptr() as *mut u8,
                right,
                frame.timestamp_ns as c_longlong,
                q.w as f32,
                q.x as f32,
                q.y as f32,
                q.z as f32,
                a.x as f32,
                a.y as f32,
                a.z as f32,
            )
        }
    }

    fn close_streamer(&self, id: StreamerId) {
        match self.close_streamer {
            // SAFETY: plain value argument.
            Some(close) => unsafe { close(id as c_int) },
            None => error!("backend does not export close_streamer"),
        }
    }

    fn destroy_instance(&self) {
        match self.destroy_instance {
            // SAFETY: no arguments.
            Some(destroy) => unsafe { destroy() },
            None => error!("backend does not export destroy_instance"),
        }
    }

    fn ingest_imu(&self, id: StreamerId, sample: &ImuSample) -> StatusCode {
        let Some(ingest) = self.ingest_imu else {
            error!("backend does not export ingest_imu");
            return -1;
        };
        let (v, a, q) = (sample.velocity, sample.linear_acceleration, sample.orientation);
        // SAFETY: plain value arguments.
        unsafe {
            ingest(
                id as c_int,
                sample.timestamp_ns as c_longlong,
                v.x as f32,
                v.y as f32,
                v.z as f32,
                a.x as f32,
                a.y as f32,
                a.z as f32,
                q.w as f32,
                q.x as f32,
                q.y as f32,
                q.z as f32,
            )
        }
    }

    fn active_camera_identifiers(&self) -> Vec<i32> {
        let Some(get_identifiers) = self.get_identifiers else {
            error!("backend does not export get_virtual_camera_identifiers");
            return Vec::new();
        };
        let mut len: c_int = 0;
        // SAFETY: the library returns `len` readable ints it keeps ownership of.
        unsafe {
            let ids = get_identifiers(&mut len);
            if ids.is_null() || len <= 0 {
                return Vec::new();
            }
            std::slice::from_raw_parts(ids, len as usize).to_vec()
        }
    }

    fn is_serial_valid(&self, serial: SerialNumber) -> bool {
        match self.is_sn_valid {
            // SAFETY: plain value argument.
            Some(is_valid) => unsafe { is_valid(serial as c_int) },
            None => serial > 0,
        }
    }
}
