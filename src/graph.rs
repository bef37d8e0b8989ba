//! Legal-move computation: a pano's links filtered down to its geofence.

use rustc_hash::FxHashSet;
use serde::Serialize;

use crate::{
    cache::Cache,
    error::{ApiError, ApiResult},
    model::PanoId,
};

#[derive(Debug, Clone, Serialize)]
pub struct Neighbour {
    pub target: PanoId,
    pub heading: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_meters: Option<f64>,
    #[serde(rename = "virtual")]
    pub is_virtual: bool,
}

/// Returns the legal neighbours of `pano` inside `fence`, ordered by heading
/// ascending. Duplicate link targets are collapsed, keeping the first.
///
/// The session engine guarantees the current pano is inside its geofence, so
/// an `out_of_geofence` here is an invariant violation, not a user error.
pub fn neighbours(
    cache: &Cache,
    fence: &FxHashSet<PanoId>,
    fence_name: &str,
    pano: &PanoId,
) -> ApiResult<Vec<Neighbour>> {
    if !fence.contains(pano) {
        return Err(ApiError::OutOfGeofence {
            pano: pano.clone(),
            geofence: fence_name.to_string(),
        });
    }

    let meta = cache.require_meta(pano)?;

    let mut seen = FxHashSet::default();
    let mut result = Vec::new();
    for link in &meta.links {
        if !fence.contains(&link.target) || !seen.insert(link.target.clone()) {
            continue;
        }

        let distance_meters = link.distance_meters.or_else(|| {
            let to = cache.get_location(&link.target)?;
            Some(meta.loc.distance_to(to))
        });

        result.push(Neighbour {
            target: link.target.clone(),
            heading: link.heading,
            distance_meters,
            is_virtual: link.is_virtual,
        });
    }

    result.sort_by(|a, b| a.heading.total_cmp(&b.heading));
    Ok(result)
}
