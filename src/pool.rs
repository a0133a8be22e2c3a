//! Camera identity pool
//!
//! Every streamed camera presents itself to the backend with a serial number
//! taken from a fixed per-model catalog. The pool hands out one serial per
//! active session and takes it back on teardown. It is created once per
//! process and shared between sessions behind an `Arc`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::RangeInclusive;
use std::sync::{Mutex, MutexGuard, PoisonError};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::error::PoolError;

pub type SerialNumber = u32;

/// Sentinel model whose serial is supplied by the caller instead of the pool
pub const VIRTUAL_MODEL: &str = "VIRTUAL_ZED_X";

/// Serials the backend reserves for virtual cameras (11XXXXXXX)
pub const VIRTUAL_SERIAL_RANGE: RangeInclusive<SerialNumber> = 110_000_000..=119_999_999;

/// Serial numbers and capabilities of one camera model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub serials: Vec<SerialNumber>,
    pub stereo: bool,
}

/// One `[[catalog]]` table. Model names are values, not keys, so they keep
/// their case through the config loader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogModel {
    pub model: String,
    pub serials: Vec<SerialNumber>,
    #[serde(default = "default_stereo")]
    pub stereo: bool,
}

fn default_stereo() -> bool {
    true
}

/// Immutable model → serials table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<CatalogModel>", into = "Vec<CatalogModel>")]
pub struct Catalog {
    models: BTreeMap<String, CatalogEntry>,
}

impl From<Vec<CatalogModel>> for Catalog {
    fn from(models: Vec<CatalogModel>) -> Self {
        models.into_iter().fold(Catalog::new(), |catalog, entry| {
            catalog.with_model(entry.model, entry.serials, entry.stereo)
        })
    }
}

impl From<Catalog> for Vec<CatalogModel> {
    fn from(catalog: Catalog) -> Self {
        catalog
            .models
            .into_iter()
            .map(|(model, entry)| CatalogModel {
                model,
                serials: entry.serials,
                stereo: entry.stereo,
            })
            .collect()
    }
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, model: impl Into<String>, serials: Vec<SerialNumber>, stereo: bool) -> Self {
        self.models.insert(model.into(), CatalogEntry { serials, stereo });
        self
    }

    pub fn get(&self, model: &str) -> Option<&CatalogEntry> {
        self.models.get(model)
    }

    pub fn models(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

/// Every camera model the backend knows how to emulate
pub static DEFAULT_CATALOG: Lazy<Catalog> = Lazy::new(|| {
    Catalog::new()
        .with_model("ZED_X", vec![40976320, 41116066, 49123828, 45626933], true)
        .with_model("ZED_X_4MM", vec![47890353, 45263213, 47800035, 47706147], true)
        .with_model("ZED_XM", vec![57890353, 55263213, 57800035, 57706147], true)
        .with_model("ZED_XM_4MM", vec![50179396, 52835616, 59695059, 55043860], true)
        .with_model("ZED_XONE_UHD", vec![312015765, 312817871, 315177501, 313382320], false)
        .with_model("ZED_XONE_GS", vec![305221009, 305952675, 307526942, 307184845], false)
        .with_model("ZED_XONE_GS_4MM", vec![300605725, 302696256, 302485375, 307845777], false)
});

pub fn is_virtual_model(model: &str) -> bool {
    model == VIRTUAL_MODEL
}

#[derive(Default)]
struct PoolState {
    /// Per model, a stack: allocation pops from the back.
    available: HashMap<String, Vec<SerialNumber>>,
    allocated: HashSet<(String, SerialNumber)>,
}

/// Assigns and reclaims serial numbers. All calls are serialized.
pub struct CameraPool {
    catalog: Catalog,
    state: Mutex<PoolState>,
}

impl CameraPool {
    pub fn new(catalog: Catalog) -> Self {
        let pool = Self {
            catalog,
            state: Mutex::new(PoolState::default()),
        };
        pool.reset();
        pool
    }

    pub fn with_default_catalog() -> Self {
        Self::new(DEFAULT_CATALOG.clone())
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Restore every serial from the catalog and forget all allocations.
    ///
    /// Only safe when no session holds a serial.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.available = self
            .catalog
            .models
            .iter()
            .map(|(model, entry)| (model.clone(), entry.serials.clone()))
            .collect();
        state.allocated.clear();
    }

    /// Take the most recently added free serial of `model`.
    pub fn allocate(&self, model: &str) -> Result<SerialNumber, PoolError> {
        let mut state = self.lock();
        let Some(stack) = state.available.get_mut(model) else {
            error!(model, "unknown camera model");
            return Err(PoolError::UnknownModel { model: model.to_string() });
        };
        let Some(serial) = stack.pop() else {
            error!(model, "maximum number of cameras reached");
            return Err(PoolError::Exhausted { model: model.to_string() });
        };
        state.allocated.insert((model.to_string(), serial));
        debug!(model, serial, "serial allocated");
        Ok(serial)
    }

    /// Claim a caller-supplied serial for the virtual model.
    pub fn claim_virtual(&self, raw: &str) -> Result<SerialNumber, PoolError> {
        let serial = parse_virtual_serial(raw)?;
        let mut state = self.lock();
        if !state.allocated.insert((VIRTUAL_MODEL.to_string(), serial)) {
            error!(serial, "virtual serial already in use");
            return Err(PoolError::SerialInUse { serial });
        }
        debug!(serial, "virtual serial claimed");
        Ok(serial)
    }

    /// Give a serial back. Releasing a serial that is not held is refused,
    /// which makes double release harmless.
    pub fn release(&self, model: &str, serial: SerialNumber) -> Result<(), PoolError> {
        let mut state = self.lock();
        if !state.allocated.remove(&(model.to_string(), serial)) {
            error!(model, serial, "trying to release a serial number that is not allocated");
            return Err(PoolError::NotAllocated {
                model: model.to_string(),
                serial,
            });
        }
        if !is_virtual_model(model) {
            state.available.entry(model.to_string()).or_default().push(serial);
        }
        info!(model, serial, "serial released");
        Ok(())
    }

    /// Free serials left for `model`
    pub fn available(&self, model: &str) -> usize {
        self.lock().available.get(model).map_or(0, Vec::len)
    }

    pub fn is_allocated(&self, model: &str, serial: SerialNumber) -> bool {
        self.lock().allocated.contains(&(model.to_string(), serial))
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for CameraPool {
    fn default() -> Self {
        Self::with_default_catalog()
    }
}

pub fn parse_virtual_serial(raw: &str) -> Result<SerialNumber, PoolError> {
    raw.trim()
        .parse::<SerialNumber>()
        .ok()
        .filter(|serial| VIRTUAL_SERIAL_RANGE.contains(serial))
        .ok_or_else(|| PoolError::InvalidSerial { raw: raw.to_string() })
}
