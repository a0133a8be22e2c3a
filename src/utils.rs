use std::env;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::backend::SdkBackend;
use crate::error::BackendError;

/// Environment variable pointing at the vendor SDK installation
pub const SDK_ROOT_VAR: &str = "ZED_SDK_ROOT";

/// Directories searched for the vendor library, most specific first
pub fn library_search_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(root) = env::var_os(SDK_ROOT_VAR) {
        let root = PathBuf::from(root);
        dirs.push(root.join("lib"));
        dirs.push(root.join("bin"));
        dirs.push(root);
    }
    if cfg!(windows) {
        if let Some(program_files) = env::var_os("ProgramFiles") {
            dirs.push(PathBuf::from(program_files).join("ZED SDK").join("bin"));
        }
    } else {
        dirs.push(PathBuf::from("/usr/local/zed/lib"));
    }
    dirs
}

/// Find the vendor library: an explicit path wins, then the search
/// directories. With nothing found on disk, fall back to the bare file name
/// so the platform loader's own search path gets a chance.
pub fn locate_backend_library(explicit: Option<&Path>) -> Result<PathBuf, BackendError> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(BackendError::NotFound {
            searched: vec![path.display().to_string()],
        });
    }

    info!("Auto-detecting streaming backend library...");

    let name = SdkBackend::default_library_name();
    for dir in library_search_dirs() {
        let candidate = dir.join(name);
        debug!(candidate = %candidate.display(), "checking");
        if candidate.exists() {
            info!("Found backend library: {}", candidate.display());
            return Ok(candidate);
        }
    }

    Ok(PathBuf::from(name))
}
