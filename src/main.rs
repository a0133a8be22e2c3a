//! Simulated camera bridge
//!
//! Drives a [`StreamingSession`] from a synthetic render loop: frames are
//! painted into simulated device memory at the configured rate and streamed
//! until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;
use glam::{DQuat, DVec3};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use simcam_bridge::config::{self, Resolution};
use simcam_bridge::{
    utils, CameraPool, Config, DeviceBuffer, RecordingBackend, SdkBackend, SessionOptions, SimulatedDevice,
    StreamingBackend, StreamingSession, TickInput, TickOutcome,
};

const GRAVITY: f64 = 9.81;
const BYTES_PER_PIXEL: usize = 4;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("simcam_bridge=info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_timer(fmt::time::uptime()));
    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());
    registry.init();

    info!("Simcam bridge launching...");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;

    let pool = Arc::new(match config.catalog.clone() {
        Some(catalog) => CameraPool::new(catalog),
        None => CameraPool::with_default_catalog(),
    });

    let backend: Arc<dyn StreamingBackend> = if config.backend.dry_run {
        info!("Dry run: recording backend calls in memory");
        Arc::new(RecordingBackend::new())
    } else {
        let library = utils::locate_backend_library(config.backend.library.as_deref())?;
        info!("Using backend library: {}", library.display());
        Arc::new(SdkBackend::load(&library)?)
    };

    let device = SimulatedDevice::new();
    let mut session = StreamingSession::new(
        Arc::clone(&backend),
        Arc::new(device.clone()),
        Arc::clone(&pool),
        SessionOptions::from(&config),
    );

    let camera = &config.camera;
    let fps = config::sanitize_fps(camera.fps);
    let port = config::sanitize_port(camera.port);
    let (width, height) = Resolution::from_preset_or_default(&camera.model, &camera.resolution).dimensions();
    let stereo = pool.catalog().get(&camera.model).map_or(true, |entry| entry.stereo);

    let frame_len = width as usize * height as usize * BYTES_PER_PIXEL;
    let left = device.alloc(frame_len);
    let right = if stereo { device.alloc(frame_len) } else { DeviceBuffer::default() };

    info!(
        model = %camera.model,
        width,
        height,
        fps,
        port,
        stereo,
        "Starting render loop"
    );

    let period = 1.0 / f64::from(fps);
    let mut ticker = tokio::time::interval(Duration::from_secs_f64(period));
    let mut frame_index: u64 = 0;
    let mut pixels = vec![0u8; frame_len];
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = &mut shutdown => {
                info!("Interrupt received");
                break;
            }
        }

        let simulation_time = frame_index as f64 * period;
        frame_index += 1;

        pixels.fill((frame_index % 256) as u8);
        device.write(left, &pixels)?;
        if stereo {
            device.write(right, &pixels)?;
        }

        // Slow yaw about the simulation's up axis
        let orientation = DQuat::from_rotation_z(simulation_time * 0.1);
        let tick = TickInput {
            stream: true,
            simulation_time,
            camera_model: camera.model.clone(),
            serial_number: camera.serial_number.clone(),
            port,
            fps,
            width,
            height,
            ipc: camera.ipc,
            left,
            right,
            orientation,
            linear_acceleration: DVec3::new(0.0, 0.0, GRAVITY),
        };

        match session.submit_frame(&tick) {
            TickOutcome::Activated => {
                info!(serial = ?session.serial_number(), "Streaming started");
            }
            TickOutcome::Rejected(err) => warn!(%err, "Frame rejected"),
            TickOutcome::Inactive | TickOutcome::Failed => {
                error!(failure = ?session.failure(), "Session cannot stream");
                break;
            }
            _ => {}
        }
    }

    let slot = session.slot_stats();
    let worker = session.worker_stats();
    session.stop();
    info!(
        written = slot.written,
        overwritten = slot.overwritten,
        forwarded = worker.forwarded,
        stale = worker.stale,
        "Simcam bridge shutting down"
    );
    Ok(())
}
