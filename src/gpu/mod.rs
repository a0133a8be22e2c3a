//! Device memory access for the streaming worker
//!
//! The render pipeline owns the image buffers on the device; the bridge only
//! sees their addresses. A [`GpuRuntime`] creates one [`CopyStream`] per
//! session, and the worker issues device-to-host copies on it.

#[cfg(feature = "cuda")]
pub mod cuda;
pub mod simulated;

use std::sync::Arc;

use crate::error::GpuError;

#[cfg(feature = "cuda")]
pub use cuda::CudaRuntime;
pub use simulated::SimulatedDevice;

/// Raw device address. Non-owning; zero is null.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePtr(u64);

impl DevicePtr {
    pub const NULL: DevicePtr = DevicePtr(0);

    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn addr(self) -> u64 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// A borrowed device image: address plus length in bytes.
///
/// Valid until the render pipeline's next tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceBuffer {
    pub ptr: DevicePtr,
    pub len: usize,
}

impl DeviceBuffer {
    pub const fn new(ptr: DevicePtr, len: usize) -> Self {
        Self { ptr, len }
    }

    /// Null or zero-length
    pub fn is_empty(&self) -> bool {
        self.ptr.is_null() || self.len == 0
    }
}

/// Creates per-session copy streams
pub trait GpuRuntime: Send + Sync {
    fn create_stream(&self) -> Result<Arc<dyn CopyStream>, GpuError>;
}

/// An ordered queue of device operations. Dropping the last handle destroys it.
pub trait CopyStream: Send + Sync {
    /// Enqueue a copy of `src` into the front of `dst`. The bytes are only
    /// guaranteed to be present after [`CopyStream::synchronize`].
    fn copy_to_host_async(&self, dst: &mut [u8], src: DeviceBuffer) -> Result<(), GpuError>;

    /// Block until every enqueued operation has completed. No timeout.
    fn synchronize(&self) -> Result<(), GpuError>;
}

pub(crate) fn check_destination(dst: &[u8], src: DeviceBuffer) -> Result<(), GpuError> {
    if dst.len() < src.len {
        return Err(GpuError::ShortDestination {
            capacity: dst.len(),
            len: src.len,
        });
    }
    Ok(())
}
