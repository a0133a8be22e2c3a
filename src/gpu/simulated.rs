//! Device memory simulated in host memory
//!
//! Used when no CUDA device is available and by the test suite. Allocations
//! get stable fake device addresses; copies and synchronization can be made
//! to fail or stall on demand.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::trace;

use super::{check_destination, CopyStream, DeviceBuffer, DevicePtr, GpuRuntime};
use crate::error::GpuError;

const BASE_ADDRESS: u64 = 0x7f00_0000_0000;
const ALIGNMENT: u64 = 256;

/// Cheap to clone; clones share the same memory.
#[derive(Clone, Default)]
pub struct SimulatedDevice {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    allocations: Mutex<HashMap<u64, Vec<u8>>>,
    next_offset: AtomicU64,
    fail_stream_create: AtomicBool,
    fail_copy: AtomicBool,
    fail_sync: AtomicBool,
    sync_delay_us: AtomicU64,
    live_streams: AtomicUsize,
    copies_issued: AtomicUsize,
}

impl SimulatedDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate zeroed device memory.
    pub fn alloc(&self, len: usize) -> DeviceBuffer {
        let span = (len as u64).max(1).div_ceil(ALIGNMENT) * ALIGNMENT;
        let offset = self.inner.next_offset.fetch_add(span, Ordering::Relaxed);
        let addr = BASE_ADDRESS + offset;
        self.allocations().insert(addr, vec![0; len]);
        DeviceBuffer::new(DevicePtr::new(addr), len)
    }

    /// Allocate and fill in one step.
    pub fn upload(&self, bytes: &[u8]) -> DeviceBuffer {
        let buffer = self.alloc(bytes.len());
        self.allocations().insert(buffer.ptr.addr(), bytes.to_vec());
        buffer
    }

    /// Overwrite the start of an existing allocation, as a render pass would.
    pub fn write(&self, buffer: DeviceBuffer, bytes: &[u8]) -> Result<(), GpuError> {
        let mut allocations = self.allocations();
        let memory = allocations
            .get_mut(&buffer.ptr.addr())
            .ok_or_else(|| GpuError::Copy(format!("unknown device address {:#x}", buffer.ptr.addr())))?;
        if bytes.len() > memory.len() {
            return Err(GpuError::Copy(format!(
                "write of {} bytes overruns {} byte allocation",
                bytes.len(),
                memory.len()
            )));
        }
        memory[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn fail_stream_creation(&self, fail: bool) {
        self.inner.fail_stream_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_copies(&self, fail: bool) {
        self.inner.fail_copy.store(fail, Ordering::SeqCst);
    }

    pub fn fail_syncs(&self, fail: bool) {
        self.inner.fail_sync.store(fail, Ordering::SeqCst);
    }

    /// Make every synchronize stall, standing in for a busy device.
    pub fn set_sync_delay(&self, delay: Duration) {
        self.inner
            .sync_delay_us
            .store(delay.as_micros() as u64, Ordering::SeqCst);
    }

    /// Streams created and not yet destroyed
    pub fn live_streams(&self) -> usize {
        self.inner.live_streams.load(Ordering::SeqCst)
    }

    pub fn copies_issued(&self) -> usize {
        self.inner.copies_issued.load(Ordering::SeqCst)
    }

    fn allocations(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Vec<u8>>> {
        self.inner
            .allocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl GpuRuntime for SimulatedDevice {
    fn create_stream(&self) -> Result<Arc<dyn CopyStream>, GpuError> {
        if self.inner.fail_stream_create.load(Ordering::SeqCst) {
            return Err(GpuError::StreamCreate("simulated device refused".into()));
        }
        self.inner.live_streams.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(SimulatedStream {
            device: self.clone(),
        }))
    }
}

struct SimulatedStream {
    device: SimulatedDevice,
}

impl CopyStream for SimulatedStream {
    fn copy_to_host_async(&self, dst: &mut [u8], src: DeviceBuffer) -> Result<(), GpuError> {
        let inner = &self.device.inner;
        if inner.fail_copy.load(Ordering::SeqCst) {
            return Err(GpuError::Copy("simulated copy failure".into()));
        }
        check_destination(dst, src)?;

        let allocations = self.device.allocations();
        let memory = allocations
            .get(&src.ptr.addr())
            .ok_or_else(|| GpuError::Copy(format!("unknown device address {:#x}", src.ptr.addr())))?;
        if src.len > memory.len() {
            return Err(GpuError::Copy(format!(
                "copy of {} bytes overruns {} byte allocation",
                src.len,
                memory.len()
            )));
        }
        dst[..src.len].copy_from_slice(&memory[..src.len]);
        inner.copies_issued.fetch_add(1, Ordering::SeqCst);
        trace!(addr = src.ptr.addr(), len = src.len, "simulated device copy");
        Ok(())
    }

    fn synchronize(&self) -> Result<(), GpuError> {
        let inner = &self.device.inner;
        let delay = inner.sync_delay_us.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_micros(delay));
        }
        if inner.fail_sync.load(Ordering::SeqCst) {
            return Err(GpuError::Sync("simulated sync failure".into()));
        }
        Ok(())
    }
}

impl Drop for SimulatedStream {
    fn drop(&mut self) {
        self.device.inner.live_streams.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copies_uploaded_bytes() {
        let device = SimulatedDevice::new();
        let buffer = device.upload(&[1, 2, 3, 4]);
        let stream = device.create_stream().unwrap();

        let mut host = [0u8; 8];
        stream.copy_to_host_async(&mut host, buffer).unwrap();
        stream.synchronize().unwrap();
        assert_eq!(&host[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn allocations_do_not_overlap() {
        let device = SimulatedDevice::new();
        let a = device.alloc(300);
        let b = device.alloc(10);
        assert!(b.ptr.addr() >= a.ptr.addr() + 300);
        assert!(!a.ptr.is_null());
    }

    #[test]
    fn rejects_short_destination() {
        let device = SimulatedDevice::new();
        let buffer = device.alloc(16);
        let stream = device.create_stream().unwrap();
        let mut host = [0u8; 8];
        assert_eq!(
            stream.copy_to_host_async(&mut host, buffer),
            Err(GpuError::ShortDestination { capacity: 8, len: 16 })
        );
    }

    #[test]
    fn rejects_unknown_address() {
        let device = SimulatedDevice::new();
        let stream = device.create_stream().unwrap();
        let mut host = [0u8; 4];
        let bogus = DeviceBuffer::new(DevicePtr::new(0xdead), 4);
        assert!(matches!(
            stream.copy_to_host_async(&mut host, bogus),
            Err(GpuError::Copy(_))
        ));
    }

    #[test]
    fn tracks_stream_lifetime() {
        let device = SimulatedDevice::new();
        let stream = device.create_stream().unwrap();
        let second = Arc::clone(&stream);
        assert_eq!(device.live_streams(), 1);
        drop(stream);
        assert_eq!(device.live_streams(), 1);
        drop(second);
        assert_eq!(device.live_streams(), 0);
    }

    #[test]
    fn injected_failures() {
        let device = SimulatedDevice::new();
        device.fail_stream_creation(true);
        assert!(device.create_stream().is_err());
        device.fail_stream_creation(false);

        let stream = device.create_stream().unwrap();
        device.fail_syncs(true);
        assert!(matches!(stream.synchronize(), Err(GpuError::Sync(_))));
    }
}
