//! Bridge configuration
//!
//! Sources, later ones overriding earlier ones: built-in defaults, an
//! optional TOML file, then `SIMCAM__SECTION__KEY` environment variables.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::backend::{BackendVersion, MIN_BACKEND_VERSION};
use crate::error::ConfigError;
use crate::frame::Codec;
use crate::pool::Catalog;

pub const DEFAULT_PORT: u16 = 30000;
pub const DEFAULT_FPS: u32 = 30;
pub const SUPPORTED_FPS: [u32; 3] = [15, 30, 60];
pub const ENV_PREFIX: &str = "SIMCAM";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend: BackendConfig,
    pub session: SessionConfig,
    pub stream: StreamConfig,
    pub camera: CameraConfig,
    /// Replaces the built-in catalog when present
    pub catalog: Option<Catalog>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Explicit library path; discovered when absent
    pub library: Option<PathBuf>,
    /// Record calls in memory instead of loading the vendor library
    pub dry_run: bool,
    pub min_version: BackendVersion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Simulation seconds to let the scene settle before streaming
    pub warmup_secs: f64,
    /// Stamp frames with wall-clock time instead of simulation time
    pub use_system_time: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub codec: Codec,
    pub bitrate_kbps: u32,
    pub chunk_size: u16,
    pub alpha_channel: bool,
    pub verbose: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub model: String,
    /// Only read for the virtual model
    pub serial_number: String,
    pub port: u16,
    pub fps: u32,
    pub resolution: String,
    pub ipc: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            library: None,
            dry_run: false,
            min_version: MIN_BACKEND_VERSION,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            warmup_secs: 1.0,
            use_system_time: false,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            codec: Codec::H265,
            bitrate_kbps: 8000,
            chunk_size: 4096,
            alpha_channel: true,
            verbose: false,
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            model: "ZED_X".into(),
            serial_number: String::new(),
            port: DEFAULT_PORT,
            fps: DEFAULT_FPS,
            resolution: "HD1200".into(),
            ipc: false,
        }
    }
}

impl Config {
    /// Load defaults, then `path` if given, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Toml));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::from_str(source, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }
}

/// The backend pairs each stream with the next port, so ports must be even.
pub fn sanitize_port(port: u16) -> u16 {
    if port == 0 || port % 2 == 1 {
        warn!(port, "invalid port, it must be a positive even number; using {DEFAULT_PORT}");
        return DEFAULT_PORT;
    }
    port
}

pub fn sanitize_fps(fps: u32) -> u32 {
    if !SUPPORTED_FPS.contains(&fps) {
        warn!(fps, "invalid frame rate; using {DEFAULT_FPS}");
        return DEFAULT_FPS;
    }
    fps
}

/// Named sensor resolutions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Hd4k,
    Hd1200,
    Hd1080,
    Svga,
}

impl Resolution {
    /// Parse a preset name for `model`. 4K is only offered by the UHD model.
    pub fn from_preset(model: &str, name: &str) -> Option<Self> {
        match name {
            "HD4K" if model == "ZED_XONE_UHD" => Some(Resolution::Hd4k),
            "HD1200" => Some(Resolution::Hd1200),
            "HD1080" => Some(Resolution::Hd1080),
            "SVGA" => Some(Resolution::Svga),
            _ => None,
        }
    }

    /// Unknown presets fall back to HD1200.
    pub fn from_preset_or_default(model: &str, name: &str) -> Self {
        Self::from_preset(model, name).unwrap_or_else(|| {
            warn!(model, resolution = name, "invalid resolution; defaulting to HD1200");
            Resolution::Hd1200
        })
    }

    pub fn dimensions(self) -> (u32, u32) {
        match self {
            Resolution::Hd4k => (3840, 2160),
            Resolution::Hd1200 => (1920, 1200),
            Resolution::Hd1080 => (1920, 1080),
            Resolution::Svga => (960, 600),
        }
    }
}
