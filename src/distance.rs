//! Journey distance, duration and route polyline reconstruction.
//!
//! Input pings must already be sorted ascending (see
//! [`crate::time_window::filter_by_window`]). Distance is only ever summed over
//! consecutive pairs of that one sequence.

use geo::{algorithm::simplify::Simplify, Coord, LineString};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::geo_utils::polyline_length_km;
use crate::types::Ping;
use crate::GpsPoint;

/// Distance/duration/route for one sorted ping sequence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteSummary {
    /// Sum of consecutive haversine distances, rounded to 1 decimal place
    pub total_distance_km: f64,
    /// Whole minutes between first and last ping
    pub duration_minutes: i64,
    /// Ping coordinates in chronological order
    pub route: Vec<GpsPoint>,
}

/// Round to one decimal place.
#[inline]
pub fn round_1dp(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Accumulate distance, duration and route over sorted pings.
///
/// - 0 pings: zero distance, empty route
/// - 1 ping: zero distance, route is that single point
/// - 2+ pings: rounded distance sum and whole-minute duration
pub fn accumulate(pings: &[Ping]) -> RouteSummary {
    let sorted_copy;
    let pings = if pings.windows(2).all(|w| w[0].timestamp <= w[1].timestamp) {
        pings
    } else {
        warn!(
            "[Distance] Received {} unsorted pings; sorting before accumulation",
            pings.len()
        );
        let mut owned = pings.to_vec();
        owned.sort_by_key(|p| p.timestamp);
        sorted_copy = owned;
        &sorted_copy
    };

    let route: Vec<GpsPoint> = pings.iter().map(|p| p.location).collect();

    if pings.len() < 2 {
        return RouteSummary {
            total_distance_km: 0.0,
            duration_minutes: 0,
            route,
        };
    }

    let total_distance_km = round_1dp(polyline_length_km(&route));
    let duration_minutes = match (pings.first(), pings.last()) {
        (Some(first), Some(last)) => (last.timestamp - first.timestamp).num_minutes(),
        _ => 0,
    };

    RouteSummary {
        total_distance_km,
        duration_minutes,
        route,
    }
}

/// Douglas-Peucker simplification of a route polyline for rendering.
///
/// `tolerance_deg` is the maximum deviation in degrees (0.0001 is ~11 m).
/// Order and both endpoints are preserved.
pub fn simplify_route(route: &[GpsPoint], tolerance_deg: f64) -> Vec<GpsPoint> {
    if route.len() < 3 || tolerance_deg <= 0.0 {
        return route.to_vec();
    }

    let coords: Vec<Coord<f64>> = route
        .iter()
        .map(|p| Coord {
            x: p.longitude,
            y: p.latitude,
        })
        .collect();

    LineString::new(coords)
        .simplify(&tolerance_deg)
        .coords()
        .map(|c| GpsPoint::new(c.y, c.x))
        .collect()
}
