use std::fmt::{self, Display};

use compact_str::CompactString;
use serde::{Deserialize, Serialize};

use crate::math;

/// Opaque panorama identifier assigned by the upstream provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PanoId(pub CompactString);

impl PanoId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}
impl From<&str> for PanoId {
    fn from(value: &str) -> Self {
        Self(CompactString::from(value))
    }
}
impl Display for PanoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// y
    pub lat: f64,
    /// x
    pub lng: f64,
}

impl Location {
    #[inline]
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_valid(&self) -> bool {
        (-90. ..=90.).contains(&self.lat) && (-180. ..=180.).contains(&self.lng)
    }

    #[inline]
    pub fn distance_to(&self, other: Location) -> f64 {
        math::distance(*self, other)
    }
}

impl Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.lat, self.lng)
    }
}

/// Directed adjacency from one panorama toward a nearby one.
///
/// `heading` is true-north degrees from the owning pano toward the target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub target: PanoId,
    pub heading: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_meters: Option<f64>,
    /// Synthetic link added by the task generator to patch adjacency. Treated
    /// identically to a native link at runtime, carried for logging only.
    #[serde(default, rename = "virtual")]
    pub is_virtual: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanoMetadata {
    pub id: PanoId,
    pub loc: Location,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_date: Option<String>,
    /// True-north heading of the panorama image's centre column.
    pub center_heading: f64,
    pub links: Vec<Link>,
    /// Unix seconds at which this record was fetched from upstream.
    pub fetched_at: i64,
    pub source: String,
}

/// Expected pixel dimensions of an equirectangular panorama at a zoom level.
///
/// Tiles are 512x512; a zoom-z panorama is 2^z tiles wide and
/// max(1, 2^(z-1)) tiles tall.
pub const TILE_SIZE: u32 = 512;

pub fn tile_grid(zoom: u8) -> (u32, u32) {
    let width = 1u32 << zoom;
    let height = (width / 2).max(1);
    (width, height)
}

pub fn image_dimensions(zoom: u8) -> (u32, u32) {
    let (w, h) = tile_grid(zoom);
    (w * TILE_SIZE, h * TILE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_grid() {
        assert_eq!(tile_grid(0), (1, 1));
        assert_eq!(tile_grid(1), (2, 1));
        assert_eq!(tile_grid(2), (4, 2));
        assert_eq!(tile_grid(3), (8, 4));
    }

    #[test]
    fn test_image_dimensions() {
        assert_eq!(image_dimensions(2), (2048, 1024));
        assert_eq!(image_dimensions(0), (512, 512));
    }

    #[test]
    fn test_link_serde_virtual_flag() {
        let mut raw = br#"{"target":"p1","heading":90.0,"virtual":true}"#.to_vec();
        let link: Link = simd_json::from_slice(&mut raw).unwrap();
        assert!(link.is_virtual);
        assert_eq!(link.target, PanoId::from("p1"));
        assert_eq!(link.distance_meters, None);

        let mut raw = br#"{"target":"p2","heading":12.5}"#.to_vec();
        let link: Link = simd_json::from_slice(&mut raw).unwrap();
        assert!(!link.is_virtual);
    }

    #[test]
    fn test_location_validity() {
        assert!(Location::new(45., -69.).is_valid());
        assert!(!Location::new(91., 0.).is_valid());
        assert!(!Location::new(0., 181.).is_valid());
    }
}
