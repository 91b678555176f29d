//! Geometry helpers for block classification and pair detection.
//!
//! Polygons are sequences of `(lat, lon)` vertices. The closing vertex may
//! be repeated or omitted; both forms classify identically.

/// Mean Earth radius in meters.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Even-odd ray cast: counts crossings of a horizontal ray extending east
/// from the point. Horizontal edges are skipped so they can never produce
/// a spurious crossing. Polygons with fewer than 3 vertices contain nothing.
pub fn point_in_polygon(lat: f64, lon: f64, polygon: &[(f64, f64)]) -> bool {
    if polygon.len() < 3 {
        return false;
    }

    let mut inside = false;
    let mut j = polygon.len() - 1;
    for i in 0..polygon.len() {
        let (lat_i, lon_i) = polygon[i];
        let (lat_j, lon_j) = polygon[j];
        j = i;

        if lat_i == lat_j {
            continue;
        }
        if (lat_i > lat) != (lat_j > lat) {
            let crossing_lon = lon_i + (lat - lat_i) / (lat_j - lat_i) * (lon_j - lon_i);
            if lon < crossing_lon {
                inside = !inside;
            }
        }
    }
    inside
}

/// Great-circle distance between two coordinates, in meters.
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

/// Smallest angle between two compass bearings, in degrees (0..=180).
pub fn bearing_difference(b1: f64, b2: f64) -> f64 {
    let d = (b1 - b2).abs() % 360.0;
    d.min(360.0 - d)
}
