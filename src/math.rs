use crate::model::Location;

/// In meters, copied from Google Maps's code.
const EARTH_RADIUS: f64 = 6_378_137.;

/// Haversine distance between two coordinates, in meters.
#[inline]
pub fn distance(a: Location, b: Location) -> f64 {
    let theta1 = a.lat.to_radians();
    let theta2 = b.lat.to_radians();
    let delta_theta = (b.lat - a.lat).to_radians();
    let delta_lambda = (b.lng - a.lng).to_radians();

    let h = (delta_theta / 2.).sin().powi(2)
        + theta1.cos() * theta2.cos() * (delta_lambda / 2.).sin().powi(2);
    let c = 2. * h.sqrt().asin();
    EARTH_RADIUS * c
}

/// Normalizes any heading into [0, 360).
#[inline]
pub fn normalize_heading(heading: f64) -> f64 {
    let h = heading.rem_euclid(360.);
    // rem_euclid can return 360.0 for tiny negative inputs
    if h >= 360. { 0. } else { h }
}

#[cfg(test)]
mod tests {
    use geo::Distance as _;

    use super::*;

    #[test]
    fn test_distance_matches_geo() {
        let points = [
            (47.45647413331853, -69.99669220097549),
            (47.45651113331853, -69.99659220097549),
            (40.7580, -73.9855),
            (40.7484, -73.9857),
        ];
        for &(a_lat, a_lng) in &points {
            for &(b_lat, b_lng) in &points {
                let ours = distance(Location::new(a_lat, a_lng), Location::new(b_lat, b_lng));
                let theirs = geo::Haversine
                    .distance(geo::Point::new(a_lng, a_lat), geo::Point::new(b_lng, b_lat));
                assert!(
                    (ours - theirs).abs() < 0.5,
                    "{ours} != {theirs} for {a_lat},{a_lng} -> {b_lat},{b_lng}"
                );
            }
        }
    }

    #[test]
    fn test_normalize_heading() {
        assert_eq!(normalize_heading(0.), 0.);
        assert_eq!(normalize_heading(360.), 0.);
        assert_eq!(normalize_heading(-90.), 270.);
        assert_eq!(normalize_heading(725.), 5.);
        assert!(normalize_heading(359.99) < 360.);
    }

}
