//! # Geographic Utilities
//!
//! Core geographic computations used by the journey engine.
//!
//! | Function | Description |
//! |----------|-------------|
//! | [`haversine_distance_km`] | Great-circle distance between two GPS points in km |
//! | [`to_radians`] | Degree to radian conversion |
//! | [`compute_bounds`] | Bounding box of a set of points |
//! | [`compute_center`] | Arithmetic centroid of a set of points |
//!
//! ## Example
//!
//! ```rust
//! use journey_matcher::{GpsPoint, geo_utils};
//!
//! let a = GpsPoint::new(0.0, 0.0);
//! let b = GpsPoint::new(0.0, 0.01);
//!
//! let km = geo_utils::haversine_distance_km(&a, &b);
//! assert!((km - 1.112).abs() < 0.01);
//! ```
//!
//! ## Algorithm Notes
//!
//! The haversine formula treats the Earth as a sphere of radius 6,371 km. It is
//! accurate to within about 0.5% which is well inside GPS noise for visit
//! verification at sub-kilometre radii.
//!
//! All functions expect WGS84 degrees and finite inputs. Non-finite values are
//! rejected at the ingestion boundary, or by `JourneySnapshot::sanitize`,
//! before they ever reach this module.

use crate::{Bounds, GpsPoint};

/// Mean Earth radius used by the haversine formula, in kilometres.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

// =============================================================================
// Distance Functions
// =============================================================================

/// Convert degrees to radians.
#[inline]
pub fn to_radians(degrees: f64) -> f64 {
    degrees * std::f64::consts::PI / 180.0
}

/// Calculate the great-circle distance between two GPS points using the Haversine formula.
///
/// Returns kilometres. Symmetric, exactly zero for identical points and never
/// negative.
///
/// # Example
///
/// ```rust
/// use journey_matcher::{GpsPoint, geo_utils};
///
/// let london = GpsPoint::new(51.5074, -0.1278);
/// let paris = GpsPoint::new(48.8566, 2.3522);
///
/// let distance = geo_utils::haversine_distance_km(&london, &paris);
/// assert!((distance - 343.5).abs() < 1.0);
/// ```
#[inline]
pub fn haversine_distance_km(p1: &GpsPoint, p2: &GpsPoint) -> f64 {
    let d_lat = to_radians(p2.latitude - p1.latitude);
    let d_lng = to_radians(p2.longitude - p1.longitude);
    let lat1 = to_radians(p1.latitude);
    let lat2 = to_radians(p2.latitude);

    let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);
    // Rounding can push `a` marginally outside [0, 1] for antipodal points
    let c = 2.0 * a.clamp(0.0, 1.0).sqrt().atan2((1.0 - a).clamp(0.0, 1.0).sqrt());

    EARTH_RADIUS_KM * c
}

/// Total length of a polyline in kilometres (unrounded).
///
/// Empty or single-point inputs return 0.0.
pub fn polyline_length_km(points: &[GpsPoint]) -> f64 {
    points
        .windows(2)
        .map(|w| haversine_distance_km(&w[0], &w[1]))
        .sum()
}

// =============================================================================
// Bounding Box / Centroid
// =============================================================================

/// Compute the bounding box of a set of points. `None` for empty input.
pub fn compute_bounds(points: &[GpsPoint]) -> Option<Bounds> {
    Bounds::from_points(points)
}

/// Compute the arithmetic centroid of a set of points.
///
/// Suitable for small areas such as a cluster of co-located markers. Returns
/// (0, 0) for empty input.
pub fn compute_center(points: &[GpsPoint]) -> GpsPoint {
    if points.is_empty() {
        return GpsPoint::new(0.0, 0.0);
    }

    let sum_lat: f64 = points.iter().map(|p| p.latitude).sum();
    let sum_lng: f64 = points.iter().map(|p| p.longitude).sum();
    let n = points.len() as f64;

    GpsPoint::new(sum_lat / n, sum_lng / n)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64, epsilon: f64) -> bool {
        (a - b).abs() < epsilon
    }

    #[test]
    fn test_haversine_same_point() {
        let p = GpsPoint::new(12.9716, 77.5946);
        assert_eq!(haversine_distance_km(&p, &p), 0.0);
    }

    #[test]
    fn test_haversine_symmetric() {
        let pairs = [
            (GpsPoint::new(12.9716, 77.5946), GpsPoint::new(13.0827, 80.2707)),
            (GpsPoint::new(-33.8688, 151.2093), GpsPoint::new(51.5074, -0.1278)),
            (GpsPoint::new(0.0, 179.9), GpsPoint::new(0.0, -179.9)),
        ];
        for (a, b) in pairs {
            assert_eq!(haversine_distance_km(&a, &b), haversine_distance_km(&b, &a));
            assert!(haversine_distance_km(&a, &b) >= 0.0);
        }
    }

    #[test]
    fn test_haversine_known_values() {
        // 0.01 degrees of longitude on the equator
        let d = haversine_distance_km(&GpsPoint::new(0.0, 0.0), &GpsPoint::new(0.0, 0.01));
        assert!(approx_eq(d, 1.112, 0.001));

        // 0.0005 degrees: ~56 m
        let d = haversine_distance_km(&GpsPoint::new(0.0, 0.0), &GpsPoint::new(0.0, 0.0005));
        assert!(approx_eq(d, 0.0556, 0.001));
    }

    #[test]
    fn test_haversine_uses_6371_km_radius() {
        // Quarter meridian: pi/2 * 6371 = 10007.543 km (6371.0088 would give 10007.557)
        let d = haversine_distance_km(&GpsPoint::new(0.0, 0.0), &GpsPoint::new(90.0, 0.0));
        assert!(approx_eq(d, 10007.543, 0.005));
    }

    #[test]
    fn test_haversine_antipodal_is_finite() {
        let d = haversine_distance_km(&GpsPoint::new(0.0, 0.0), &GpsPoint::new(0.0, 180.0));
        assert!(d.is_finite());
        assert!(approx_eq(d, std::f64::consts::PI * EARTH_RADIUS_KM, 0.01));
    }

    #[test]
    fn test_polyline_length() {
        assert_eq!(polyline_length_km(&[]), 0.0);
        assert_eq!(polyline_length_km(&[GpsPoint::new(1.0, 1.0)]), 0.0);

        let track = vec![
            GpsPoint::new(0.0, 0.0),
            GpsPoint::new(0.0, 0.01),
            GpsPoint::new(0.0, 0.02),
        ];
        assert!(approx_eq(polyline_length_km(&track), 2.224, 0.002));
    }

    #[test]
    fn test_compute_center() {
        let points = vec![GpsPoint::new(51.50, -0.10), GpsPoint::new(51.52, -0.12)];
        let center = compute_center(&points);
        assert!(approx_eq(center.latitude, 51.51, 1e-9));
        assert!(approx_eq(center.longitude, -0.11, 1e-9));

        let empty = compute_center(&[]);
        assert_eq!(empty, GpsPoint::new(0.0, 0.0));
    }

    #[test]
    fn test_to_radians() {
        assert!(approx_eq(to_radians(180.0), std::f64::consts::PI, 1e-12));
        assert_eq!(to_radians(0.0), 0.0);
    }
}
