//! CUDA driver-API copy streams (feature `cuda`)

use std::sync::Arc;

use cudarc::driver::{result, CudaContext, CudaStream, DriverError};
use tracing::info;

use super::{check_destination, CopyStream, DeviceBuffer, GpuRuntime};
use crate::error::GpuError;

/// Copy streams on the render pipeline's device
pub struct CudaRuntime {
    ctx: Arc<CudaContext>,
}

impl CudaRuntime {
    /// Attach to the primary context of device `ordinal`, the one the
    /// renderer allocates its images in.
    pub fn new(ordinal: usize) -> Result<Self, GpuError> {
        let ctx = CudaContext::new(ordinal).map_err(|e| GpuError::StreamCreate(e.to_string()))?;
        info!(ordinal, "attached to CUDA device");
        Ok(Self { ctx })
    }
}

impl GpuRuntime for CudaRuntime {
    fn create_stream(&self) -> Result<Arc<dyn CopyStream>, GpuError> {
        let stream = self
            .ctx
            .new_stream()
            .map_err(|e| GpuError::StreamCreate(e.to_string()))?;
        Ok(Arc::new(CudaCopyStream {
            ctx: Arc::clone(&self.ctx),
            stream,
        }))
    }
}

struct CudaCopyStream {
    ctx: Arc<CudaContext>,
    stream: Arc<CudaStream>,
}

impl CudaCopyStream {
    fn bind(&self) -> Result<(), DriverError> {
        self.ctx.bind_to_thread()
    }
}

impl CopyStream for CudaCopyStream {
    fn copy_to_host_async(&self, dst: &mut [u8], src: DeviceBuffer) -> Result<(), GpuError> {
        check_destination(dst, src)?;
        self.bind().map_err(|e| GpuError::Copy(e.to_string()))?;

        // SAFETY: the render pipeline keeps `src` alive until its next tick,
        // and `dst` is host memory owned by the worker for the whole copy
        // because the worker synchronizes before touching it again.
        unsafe {
            result::memcpy_dtoh_async(&mut dst[..src.len], src.ptr.addr(), self.stream.cu_stream())
        }
        .map_err(|e| GpuError::Copy(e.to_string()))
    }

    fn synchronize(&self) -> Result<(), GpuError> {
        self.bind().map_err(|e| GpuError::Sync(e.to_string()))?;
        self.stream
            .synchronize()
            .map_err(|e| GpuError::Sync(e.to_string()))
    }
}
