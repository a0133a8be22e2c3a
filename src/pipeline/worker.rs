//! Background streaming loop: drain the slot, copy to host, convert, forward

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam::utils::CachePadded;
use tracing::{debug, error, info, trace, warn};

use crate::backend::{OutgoingFrame, StatusCode, StreamerId, StreamingBackend};
use crate::convert::{remap_orientation, remap_vector};
use crate::error::FrameError;
use crate::frame::{FrameDescriptor, PixelFormat};
use crate::gpu::CopyStream;
use crate::pipeline::FrameSlot;

/// Counters shared between the worker and its session
#[derive(Default)]
pub struct WorkerStats {
    inner: CachePadded<Counters>,
}

#[derive(Default)]
struct Counters {
    forwarded: AtomicUsize,
    stale: AtomicUsize,
    copy_failures: AtomicUsize,
    sync_failures: AtomicUsize,
    backend_errors: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStatsSnapshot {
    pub forwarded: usize,
    pub stale: usize,
    pub copy_failures: usize,
    pub sync_failures: usize,
    pub backend_errors: usize,
}

impl WorkerStats {
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        let c = &self.inner;
        WorkerStatsSnapshot {
            forwarded: c.forwarded.load(Ordering::Relaxed),
            stale: c.stale.load(Ordering::Relaxed),
            copy_failures: c.copy_failures.load(Ordering::Relaxed),
            sync_failures: c.sync_failures.load(Ordering::Relaxed),
            backend_errors: c.backend_errors.load(Ordering::Relaxed),
        }
    }
}

/// Consumer side of a session. Owns the host scratch buffers, which grow to
/// the largest frame seen and are reused afterwards.
pub struct StreamWorker {
    slot: Arc<FrameSlot<FrameDescriptor>>,
    backend: Arc<dyn StreamingBackend>,
    stream: Arc<dyn CopyStream>,
    streamer_id: StreamerId,
    pixel_format: PixelFormat,
    left: Vec<u8>,
    right: Vec<u8>,
    last_streamed: Option<f64>,
    stats: Arc<WorkerStats>,
}

impl StreamWorker {
    pub fn new(
        slot: Arc<FrameSlot<FrameDescriptor>>,
        backend: Arc<dyn StreamingBackend>,
        stream: Arc<dyn CopyStream>,
        streamer_id: StreamerId,
        pixel_format: PixelFormat,
    ) -> Self {
        Self {
            slot,
            backend,
            stream,
            streamer_id,
            pixel_format,
            left: Vec::new(),
            right: Vec::new(),
            last_streamed: None,
            stats: Arc::new(WorkerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.stats)
    }

    /// Current scratch sizes (left, right)
    pub fn scratch_len(&self) -> (usize, usize) {
        (self.left.len(), self.right.len())
    }

    /// Run on a dedicated thread until the slot is closed.
    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("simcam-stream-{}", self.streamer_id))
            .spawn(move || self.run())
    }

    fn run(mut self) {
        info!(streamer_id = self.streamer_id, format = ?self.pixel_format, "streaming thread started");

        while let Some(frame) = self.slot.wait_and_read() {
            if !frame.valid {
                continue;
            }
            if let Err(err) = self.process(&frame) {
                self.record_drop(&err);
            }
        }

        info!(streamer_id = self.streamer_id, "streaming thread stopped");
    }

    /// Materialize one frame and hand it to the backend. Errors mean the
    /// frame was dropped; it is never retried.
    pub fn process(&mut self, frame: &FrameDescriptor) -> Result<StatusCode, FrameError> {
        if let Some(last) = self.last_streamed {
            if frame.timestamp <= last {
                return Err(FrameError::StaleTimestamp {
                    timestamp: frame.timestamp,
                    last,
                });
            }
        }

        let left_len = frame.left.len;
        let right_len = frame.right.map(|right| right.len);
        grow(&mut self.left, left_len);
        if let Some(len) = right_len {
            grow(&mut self.right, len);
        }

        let copy_started = Instant::now();
        self.stream
            .copy_to_host_async(&mut self.left[..left_len], frame.left)
            .map_err(FrameError::Copy)?;
        if let (Some(right), Some(len)) = (frame.right, right_len) {
            self.stream
                .copy_to_host_async(&mut self.right[..len], right)
                .map_err(FrameError::Copy)?;
        }
        self.stream.synchronize().map_err(FrameError::Sync)?;
        metrics::histogram!("simcam_copy_time_us").record(copy_started.elapsed().as_micros() as f64);

        let outgoing = OutgoingFrame {
            left: &self.left[..left_len],
            right: right_len.map(|len| &self.right[..len]),
            timestamp_ns: frame.timestamp_ns(),
            orientation: remap_orientation(frame.orientation),
            linear_acceleration: remap_vector(frame.linear_acceleration),
        };
        let status = self
            .backend
            .stream_frame(self.pixel_format, self.streamer_id, &outgoing);

        self.last_streamed = Some(frame.timestamp);
        self.stats.inner.forwarded.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("simcam_frames_streamed").increment(1);

        if status != 0 {
            self.stats.inner.backend_errors.fetch_add(1, Ordering::Relaxed);
            warn!(
                streamer_id = self.streamer_id,
                status,
                timestamp_ns = outgoing.timestamp_ns,
                "backend reported a streaming error"
            );
        } else {
            trace!(streamer_id = self.streamer_id, timestamp_ns = outgoing.timestamp_ns, "frame streamed");
        }
        Ok(status)
    }

    fn record_drop(&self, err: &FrameError) {
        let counters = &self.stats.inner;
        let reason = match err {
            FrameError::StaleTimestamp { .. } => {
                counters.stale.fetch_add(1, Ordering::Relaxed);
                debug!(streamer_id = self.streamer_id, %err, "skipping frame");
                "stale"
            }
            FrameError::Copy(_) => {
                counters.copy_failures.fetch_add(1, Ordering::Relaxed);
                error!(streamer_id = self.streamer_id, %err, "device copy error in streaming thread");
                "copy"
            }
            FrameError::Sync(_) => {
                counters.sync_failures.fetch_add(1, Ordering::Relaxed);
                error!(streamer_id = self.streamer_id, %err, "device stream synchronization error");
                "sync"
            }
            FrameError::MissingBuffer | FrameError::MismatchedBufferSizes { .. } => {
                warn!(streamer_id = self.streamer_id, %err, "malformed frame reached the worker");
                "malformed"
            }
        };
        metrics::counter!("simcam_frames_dropped", "reason" => reason).increment(1);
    }
}

fn grow(buffer: &mut Vec<u8>, len: usize) {
    if buffer.len() < len {
        buffer.resize(len, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RecordingBackend;
    use crate::gpu::{DeviceBuffer, GpuRuntime, SimulatedDevice};
    use glam::{DQuat, DVec3};
    use std::time::Duration;

    struct Fixture {
        device: SimulatedDevice,
        backend: Arc<RecordingBackend>,
        worker: StreamWorker,
    }

    fn fixture(format: PixelFormat) -> Fixture {
        let device = SimulatedDevice::new();
        let backend = Arc::new(RecordingBackend::new());
        let stream = device.create_stream().unwrap();
        let worker = StreamWorker::new(Arc::new(FrameSlot::new()), backend.clone(), stream, 3, format);
        Fixture {
            device,
            backend,
            worker,
        }
    }

    fn frame(left: DeviceBuffer, right: Option<DeviceBuffer>, timestamp: f64) -> FrameDescriptor {
        FrameDescriptor {
            left,
            right,
            orientation: DQuat::IDENTITY,
            linear_acceleration: DVec3::new(1.0, 2.0, 3.0),
            timestamp,
            valid: true,
        }
    }

    #[test]
    fn forwards_converted_stereo_frame() {
        let mut f = fixture(PixelFormat::Bgr);
        let left = f.device.upload(&[1, 2, 3]);
        let right = f.device.upload(&[4, 5, 6]);

        assert_eq!(f.worker.process(&frame(left, Some(right), 1.25)), Ok(0));

        let frames = f.backend.frames();
        assert_eq!(frames.len(), 1);
        let sent = &frames[0];
        assert_eq!(sent.format, PixelFormat::Bgr);
        assert_eq!(sent.id, 3);
        assert_eq!(sent.left, vec![1, 2, 3]);
        assert_eq!(sent.right, Some(vec![4, 5, 6]));
        assert_eq!(sent.timestamp_ns, 1_250_000_000);
        assert!(sent.linear_acceleration.abs_diff_eq(DVec3::new(-2.0, -3.0, 1.0), 1e-12));
    }

    #[test]
    fn mono_frame_has_no_right_image() {
        let mut f = fixture(PixelFormat::Yuv);
        let left = f.device.upload(&[9; 16]);
        f.worker.process(&frame(left, None, 2.0)).unwrap();

        let sent = &f.backend.frames()[0];
        assert_eq!(sent.right, None);
        assert_eq!(sent.format, PixelFormat::Yuv);
        assert_eq!(f.worker.scratch_len(), (16, 0));
    }

    #[test]
    fn older_frame_is_dropped() {
        let mut f = fixture(PixelFormat::Bgr);
        let left = f.device.upload(&[1]);
        f.worker.process(&frame(left, None, 1.0)).unwrap();
        assert!(matches!(
            f.worker.process(&frame(left, None, 0.9)),
            Err(FrameError::StaleTimestamp { .. })
        ));
        assert!(f.worker.process(&frame(left, None, 1.0)).is_err());

        let frames = f.backend.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].timestamp_ns, 1_000_000_000);
    }

    #[test]
    fn scratch_buffers_only_grow() {
        let mut f = fixture(PixelFormat::Bgr);
        let big = f.device.upload(&[7; 64]);
        let small = f.device.upload(&[8; 8]);

        f.worker.process(&frame(big, Some(big), 1.0)).unwrap();
        f.worker.process(&frame(small, Some(small), 2.0)).unwrap();
        assert_eq!(f.worker.scratch_len(), (64, 64));

        let frames = f.backend.frames();
        assert_eq!(frames[1].left, vec![8; 8]);
    }

    #[test]
    fn copy_failure_drops_frame_without_advancing() {
        let mut f = fixture(PixelFormat::Bgr);
        let left = f.device.upload(&[1, 1]);
        f.device.fail_copies(true);
        assert!(matches!(f.worker.process(&frame(left, None, 1.0)), Err(FrameError::Copy(_))));

        f.device.fail_copies(false);
        assert_eq!(f.worker.process(&frame(left, None, 1.0)), Ok(0));
        assert_eq!(f.backend.frames().len(), 1);
    }

    #[test]
    fn sync_failure_drops_frame() {
        let mut f = fixture(PixelFormat::Bgr);
        let left = f.device.upload(&[1]);
        f.device.fail_syncs(true);
        assert!(matches!(f.worker.process(&frame(left, None, 1.0)), Err(FrameError::Sync(_))));
        assert!(f.backend.frames().is_empty());
    }

    #[test]
    fn backend_error_is_not_fatal() {
        let mut f = fixture(PixelFormat::Bgr);
        let left = f.device.upload(&[1]);
        f.backend.set_stream_status(-3);
        assert_eq!(f.worker.process(&frame(left, None, 1.0)), Ok(-3));
        f.backend.set_stream_status(0);
        assert_eq!(f.worker.process(&frame(left, None, 2.0)), Ok(0));
        assert_eq!(f.worker.stats().snapshot().backend_errors, 1);
        assert_eq!(f.worker.stats().snapshot().forwarded, 2);
    }

    #[test]
    fn thread_drains_slot_until_closed() {
        let device = SimulatedDevice::new();
        let backend = Arc::new(RecordingBackend::new());
        let slot = Arc::new(FrameSlot::new());
        let worker = StreamWorker::new(
            slot.clone(),
            backend.clone(),
            device.create_stream().unwrap(),
            0,
            PixelFormat::Yuv,
        );
        let stats = worker.stats();
        let handle = worker.spawn().unwrap();

        let left = device.upload(&[5; 4]);
        slot.write(frame(left, None, 1.0));
        backend.wait_for_frames(1, Duration::from_secs(2));
        slot.write(frame(left, None, 0.5));
        slot.write(frame(left, None, 3.0));
        let frames = backend.wait_for_frames(2, Duration::from_secs(2));

        slot.close();
        handle.join().unwrap();

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].timestamp_ns, 3_000_000_000);
        assert_eq!(stats.snapshot().forwarded, 2);
    }
}
