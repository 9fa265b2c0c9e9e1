//! Great-circle math over WGS84 coordinates in degrees.
//!
//! All functions are pure; distances come back in metres, bearings in
//! degrees clockwise from true north.

/// Mean Earth radius in metres (IUGG).
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Haversine distance in metres between two lat/lon pairs in degrees.
pub fn distance_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    // Clamp guards acos/atan2 domain against rounding on antipodal points.
    let c = 2.0 * a.sqrt().min(1.0).atan2((1.0 - a).max(0.0).sqrt());
    EARTH_RADIUS_M * c
}

/// Initial bearing from point 1 to point 2, degrees in [0, 360).
pub fn bearing_deg(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let y = d_lambda.sin() * phi2.cos();
    let x = phi1.cos() * phi2.sin() - phi1.sin() * phi2.cos() * d_lambda.cos();
    (y.atan2(x).to_degrees() + 360.0) % 360.0
}

/// True when the point lies within `radius_m` metres of the centre.
pub fn point_in_circle(lat: f64, lon: f64, center_lat: f64, center_lon: f64, radius_m: f64) -> bool {
    distance_m(lat, lon, center_lat, center_lon) <= radius_m
}

/// Ray-cast membership test for a closed polygon of (lat, lon) vertices.
///
/// Edges are treated in planar lat/lon space, which is adequate for the
/// sub-kilometre fences this service manages. A point exactly on an edge
/// counts as inside.
pub fn point_in_polygon(lat: f64, lon: f64, vertices: &[(f64, f64)]) -> bool {
    if vertices.len() < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = vertices.len() - 1;
    for i in 0..vertices.len() {
        let (lat_i, lon_i) = vertices[i];
        let (lat_j, lon_j) = vertices[j];
        let crosses = (lon_i > lon) != (lon_j > lon);
        if crosses {
            let intersect_lat = (lat_j - lat_i) * (lon - lon_i) / (lon_j - lon_i) + lat_i;
            if lat < intersect_lat {
                inside = !inside;
            } else if (lat - intersect_lat).abs() < f64::EPSILON {
                return true;
            }
        }
        j = i;
    }
    inside
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_zero_for_same_point() {
        assert_eq!(distance_m(12.97, 77.59, 12.97, 77.59), 0.0);
    }

    #[test]
    fn test_distance_one_degree_longitude_at_equator() {
        // 1 degree of longitude at the equator is ~111.19 km.
        let d = distance_m(0.0, 0.0, 0.0, 1.0);
        assert!((d - 111_195.0).abs() < 200.0, "got {d}");
    }

    #[test]
    fn test_distance_known_city_pair() {
        // Bangalore centre to the airport, ~30.5 km great-circle.
        let d = distance_m(12.9716, 77.5946, 13.1986, 77.7066);
        assert!(d > 27_000.0 && d < 30_000.0, "got {d}");
    }

    #[test]
    fn test_distance_symmetric() {
        let a = distance_m(12.97, 77.59, 13.00, 77.60);
        let b = distance_m(13.00, 77.60, 12.97, 77.59);
        assert!((a - b).abs() < 1e-9);
    }

    #[test]
    fn test_distance_finite_and_non_negative_near_antipodes() {
        let d = distance_m(90.0, 0.0, -90.0, 180.0);
        assert!(d.is_finite() && d >= 0.0);
        // Half the Earth's circumference.
        assert!((d - std::f64::consts::PI * EARTH_RADIUS_M).abs() < 1.0);
    }

    #[test]
    fn test_bearing_due_north_and_east() {
        assert!((bearing_deg(0.0, 0.0, 1.0, 0.0) - 0.0).abs() < 1e-6);
        assert!((bearing_deg(0.0, 0.0, 0.0, 1.0) - 90.0).abs() < 1e-6);
    }

    #[test]
    fn test_bearing_range() {
        let b = bearing_deg(12.0, 77.0, 11.0, 76.0);
        assert!((0.0..360.0).contains(&b));
    }

    #[test]
    fn test_point_in_circle_boundary() {
        // ~111 m north of the centre.
        assert!(point_in_circle(0.001, 0.0, 0.0, 0.0, 120.0));
        assert!(!point_in_circle(0.001, 0.0, 0.0, 0.0, 100.0));
    }

    #[test]
    fn test_point_in_polygon_square() {
        let square = [(0.0, 0.0), (0.0, 1.0), (1.0, 1.0), (1.0, 0.0)];
        assert!(point_in_polygon(0.5, 0.5, &square));
        assert!(!point_in_polygon(1.5, 0.5, &square));
        assert!(!point_in_polygon(-0.5, 0.5, &square));
    }

    #[test]
    fn test_point_in_polygon_concave() {
        // L-shape: the notch at (0.75, 0.75) is outside.
        let l_shape = [
            (0.0, 0.0),
            (0.0, 1.0),
            (0.5, 1.0),
            (0.5, 0.5),
            (1.0, 0.5),
            (1.0, 0.0),
        ];
        assert!(point_in_polygon(0.25, 0.25, &l_shape));
        assert!(!point_in_polygon(0.75, 0.75, &l_shape));
    }

    #[test]
    fn test_point_in_polygon_degenerate() {
        assert!(!point_in_polygon(0.0, 0.0, &[]));
        assert!(!point_in_polygon(0.0, 0.0, &[(0.0, 0.0), (1.0, 1.0)]));
    }
}
