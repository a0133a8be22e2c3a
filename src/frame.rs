use glam::{DQuat, DVec3};
use serde::{Deserialize, Serialize};

use crate::gpu::DeviceBuffer;
use crate::pool::SerialNumber;

/// One camera sample handed from the render thread to the streaming worker.
///
/// The image buffers are borrowed from the render pipeline and are only
/// guaranteed valid until the next render tick. The descriptor never frees
/// them.
#[derive(Debug, Clone, Copy)]
pub struct FrameDescriptor {
    pub left: DeviceBuffer,

    /// Absent for mono cameras
    pub right: Option<DeviceBuffer>,

    /// Orientation in the simulation frame
    pub orientation: DQuat,

    /// Linear acceleration in the simulation frame
    pub linear_acceleration: DVec3,

    /// Capture time, monotonic seconds
    pub timestamp: f64,

    pub valid: bool,
}

impl FrameDescriptor {
    pub fn is_stereo(&self) -> bool {
        self.right.is_some()
    }

    pub fn timestamp_ns(&self) -> u64 {
        seconds_to_nanos(self.timestamp)
    }
}

/// Negative and NaN inputs clamp to zero.
pub fn seconds_to_nanos(seconds: f64) -> u64 {
    (seconds * 1_000_000_000.0) as u64
}

/// Pixel layouts accepted by the streaming backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum PixelFormat {
    Rgb = 0,
    Bgr = 1,
    Yuv = 2,
}

impl PixelFormat {
    /// YUV for local IPC (network needs RGB/BGR) and for mono cameras, BGR otherwise.
    pub fn select(transport: Transport, stereo: bool) -> Self {
        if transport == Transport::Ipc || !stereo {
            PixelFormat::Yuv
        } else {
            PixelFormat::Bgr
        }
    }

    pub fn is_rgb_family(self) -> bool {
        matches!(self, PixelFormat::Rgb | PixelFormat::Bgr)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Network,
    Ipc,
}

impl Transport {
    /// IPC is not offered on Windows; requests for it fall back to network.
    pub fn from_ipc_flag(ipc: bool) -> Self {
        if ipc && cfg!(windows) {
            tracing::warn!("IPC mode is not available on Windows, switching back to network streaming");
            return Transport::Network;
        }
        if ipc {
            Transport::Ipc
        } else {
            Transport::Network
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    H264,
    H265,
}

impl Codec {
    pub fn id(self) -> i32 {
        match self {
            Codec::H264 => 0,
            Codec::H265 => 1,
        }
    }
}

/// Per-session streaming parameters, fixed once the session activates
#[derive(Debug, Clone, PartialEq)]
pub struct StreamingConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub codec: Codec,
    pub transport: Transport,
    pub pixel_format: PixelFormat,
    pub alpha_channel: bool,
    pub serial_number: SerialNumber,
    pub port: u16,
    pub verbose: bool,
    pub bitrate_kbps: u32,
    pub chunk_size: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mono_always_selects_yuv() {
        assert_eq!(PixelFormat::select(Transport::Network, false), PixelFormat::Yuv);
        assert_eq!(PixelFormat::select(Transport::Ipc, false), PixelFormat::Yuv);
    }

    #[test]
    fn stereo_over_network_selects_bgr() {
        assert_eq!(PixelFormat::select(Transport::Network, true), PixelFormat::Bgr);
        assert_eq!(PixelFormat::select(Transport::Ipc, true), PixelFormat::Yuv);
    }

    #[test]
    fn timestamps_convert_to_nanoseconds() {
        assert_eq!(seconds_to_nanos(1.5), 1_500_000_000);
        assert_eq!(seconds_to_nanos(-2.0), 0);
    }
}
