//! Named whitelists of pano ids that bound where a task takes place.

use std::{fs, path::PathBuf, sync::Arc};

use indexmap::IndexMap;
use parking_lot::RwLock;
use rustc_hash::FxHashSet;
use tracing::{info, warn};

use crate::{
    error::{ApiError, ApiResult},
    model::PanoId,
};

pub type GeofenceSet = FxHashSet<PanoId>;

pub struct GeofenceStore {
    config_path: PathBuf,
    fences: RwLock<IndexMap<String, Arc<GeofenceSet>>>,
}

impl GeofenceStore {
    /// Loads `config/geofence_config.json` (an object mapping geofence name to
    /// an array of pano ids). A missing file just means no geofences yet.
    pub fn load(config_path: PathBuf) -> Self {
        let store = Self {
            config_path,
            fences: RwLock::new(IndexMap::new()),
        };
        if let Err(e) = store.refresh() {
            warn!("geofence config not loaded: {e}");
        }
        store
    }

    /// Re-reads the config file, replacing all fences.
    pub fn refresh(&self) -> eyre::Result<()> {
        let mut raw = fs::read(&self.config_path)?;
        let parsed: IndexMap<String, Vec<PanoId>> = simd_json::from_slice(&mut raw)?;

        let mut fences = IndexMap::new();
        for (name, ids) in parsed {
            if ids.is_empty() {
                warn!("geofence {name} is empty, skipping");
                continue;
            }
            let set: GeofenceSet = ids.into_iter().collect();
            fences.insert(name, Arc::new(set));
        }

        info!("loaded {} geofences", fences.len());
        *self.fences.write() = fences;
        Ok(())
    }

    pub fn get(&self, name: &str) -> ApiResult<Arc<GeofenceSet>> {
        self.fences
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ApiError::BadTask(format!("unknown geofence: {name}")))
    }

    pub fn names(&self) -> Vec<String> {
        self.fences.read().keys().cloned().collect()
    }
}
