//! Geo grid bucketing and distance/containment helpers (§4.13).
//!
//! Points are `[longitude, latitude]` pairs (GeoJSON order). The grid
//! buckets a point into a cell id string at a configurable degree
//! resolution (default 1°); `$near`/`$geoWithin` themselves are
//! evaluated directly against document coordinates in the filter
//! evaluator, index-independent, so the grid here only accelerates
//! index-assisted lookups, it is not required for correctness.

pub const DEFAULT_CELL_SIZE_DEGREES: f64 = 1.0;

const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Bucket a point into its grid cell id at `cell_size` degrees.
pub fn cell_id(lng: f64, lat: f64, cell_size: f64) -> String {
    let cx = (lng / cell_size).floor() as i64;
    let cy = (lat / cell_size).floor() as i64;
    format!("{cx}:{cy}")
}

/// Great-circle distance between two `[lng, lat]` points, in meters.
pub fn haversine_meters(a: (f64, f64), b: (f64, f64)) -> f64 {
    let (lng1, lat1) = a;
    let (lng2, lat2) = b;
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let dphi = (lat2 - lat1).to_radians();
    let dlambda = (lng2 - lng1).to_radians();
    let h = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_METERS * h.sqrt().asin()
}

/// Planar Euclidean distance between two `[x, y]` points.
pub fn euclidean(a: (f64, f64), b: (f64, f64)) -> f64 {
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}

/// Ray-casting point-in-polygon test. `polygon` is a closed or
/// open ring of `(x, y)` vertices; the last-to-first edge is implied if
/// not explicitly closed.
pub fn point_in_polygon(point: (f64, f64), polygon: &[(f64, f64)]) -> bool {
    if polygon.len() < 3 {
        return false;
    }
    let (px, py) = point;
    let mut inside = false;
    let n = polygon.len();
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = polygon[i];
        let (xj, yj) = polygon[j];
        let intersects = ((yi > py) != (yj > py))
            && (px < (xj - xi) * (py - yi) / (yj - yi) + xi);
        if intersects {
            inside = !inside;
        }
        j = i;
    }
    inside
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_id_buckets_nearby_points_together() {
        assert_eq!(cell_id(10.4, 20.4, 1.0), cell_id(10.9, 20.1, 1.0));
        assert_ne!(cell_id(10.4, 20.4, 1.0), cell_id(11.4, 20.4, 1.0));
    }

    #[test]
    fn haversine_of_identical_points_is_zero() {
        assert_eq!(haversine_meters((1.0, 1.0), (1.0, 1.0)), 0.0);
    }

    #[test]
    fn point_in_polygon_detects_inside_and_outside() {
        let square = [(0.0, 0.0), (0.0, 4.0), (4.0, 4.0), (4.0, 0.0)];
        assert!(point_in_polygon((2.0, 2.0), &square));
        assert!(!point_in_polygon((5.0, 5.0), &square));
    }
}
