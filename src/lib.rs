//! # Journey Matcher
//!
//! Journey reconstruction and visit verification for field agents.
//!
//! Given one agent's timestamped GPS pings, scheduled meetings, client
//! locations and expense claims for a date range, this library produces:
//! - total distance travelled and journey duration
//! - per-meeting visit records, verified against the client's stored location
//! - map-ready marker groups with co-located pins spread apart
//! - client acquisition trends and regional distribution
//!
//! ## Features
//!
//! - **`parallel`** - Enable parallel batch processing with rayon
//! - **`http`** - Enable the reqwest-backed data source
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use chrono::{NaiveDate, TimeZone, Utc};
//! use journey_matcher::{compute_journey_metrics, DateRange, EngineConfig, JourneySnapshot, Ping};
//!
//! let mut snapshot = JourneySnapshot::new("agent-1");
//! snapshot.pings = vec![
//!     Ping::new(Utc.with_ymd_and_hms(2024, 6, 3, 10, 0, 0).unwrap(), 0.0, 0.0),
//!     Ping::new(Utc.with_ymd_and_hms(2024, 6, 3, 10, 10, 0).unwrap(), 0.0, 0.01),
//! ];
//!
//! let day = DateRange::single_day(NaiveDate::from_ymd_opt(2024, 6, 3).unwrap());
//! let metrics = compute_journey_metrics(&snapshot, &day, &EngineConfig::default()).unwrap();
//! assert_eq!(metrics.total_distance_km, 1.1);
//! assert_eq!(metrics.total_duration_minutes, 10);
//! ```

use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{JourneyError, OptionExt, Result};

// Engine, verification, decluster and trend configuration
pub mod config;
pub use config::{
    DeclusterConfig, EngineConfig, RefreshConfig, TrendConfig, VerificationConfig,
};

// Geographic utilities (haversine distance, bounds, center calculations)
pub mod geo_utils;

// Canonical records
pub mod types;
pub use types::{ClientLocation, ExpenseLeg, ExpenseRecord, JourneySnapshot, Meeting, Ping};

// Date range filtering
pub mod time_window;
pub use time_window::{filter_by_window, DateRange, Timestamped};

// Distance accumulation along a ping sequence
pub mod distance;
pub use distance::{accumulate, RouteSummary};

// Meeting to ping/client matching
pub mod visits;
pub use visits::{match_visits, VisitRecord, VisitStatus};

// Per-query journey summary
pub mod metrics;
#[cfg(feature = "parallel")]
pub use metrics::compute_batch_parallel;
pub use metrics::{compute_batch, compute_journey_metrics, ExpenseSummary, JourneyMetrics};

// Marker declustering for map display
pub mod decluster;
pub use decluster::{decluster, MarkerGroup, PlacedMarker};

// Client trend and region summaries
pub mod trends;
pub use trends::{monthly_trend, region_distribution, RegionBucket, TrendBucket};

// Viewport filtering
pub mod bounds;
pub use bounds::{filter_in_bounds, ViewportIndex};

// Backend wire records and normalization
pub mod ingest;
pub use ingest::{IngestReport, Normalizer};

// Tabular visit export
pub mod report;
pub use report::{journey_report, JourneyReportRow, REPORT_COLUMNS};

// Cached collection access with degraded mode
pub mod repository;
pub use repository::{CachePolicy, CollectionSource, Freshness, Repository, Snapshot};

// Concurrent fetch, generation tagging and polling
pub mod refresh;
pub use refresh::{fetch_all, DataSource, JourneyQuery, PollHandle, RefreshCoordinator};

// Command-driven engine with lazily recomputed outputs
pub mod engine;
pub use engine::{EngineCommand, EngineEvent, EngineStats, JourneyEngine};

// HTTP data source
#[cfg(feature = "http")]
pub mod http;
#[cfg(feature = "http")]
pub use http::HttpDataSource;

// ============================================================================
// Core Types
// ============================================================================

/// A GPS coordinate with latitude and longitude.
///
/// # Example
/// ```
/// use journey_matcher::GpsPoint;
/// let point = GpsPoint::new(12.9716, 77.5946); // Bengaluru
/// assert!(point.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    /// Create a new GPS point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// Axis-aligned lat/lng rectangle, used for viewports and route extents.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl Bounds {
    /// Create bounds from GPS points.
    pub fn from_points(points: &[GpsPoint]) -> Option<Self> {
        if points.is_empty() {
            return None;
        }
        let mut min_lat = f64::MAX;
        let mut max_lat = f64::MIN;
        let mut min_lng = f64::MAX;
        let mut max_lng = f64::MIN;

        for p in points {
            min_lat = min_lat.min(p.latitude);
            max_lat = max_lat.max(p.latitude);
            min_lng = min_lng.min(p.longitude);
            max_lng = max_lng.max(p.longitude);
        }

        Some(Self {
            min_lat,
            max_lat,
            min_lng,
            max_lng,
        })
    }

    /// Get the center point of the bounds.
    pub fn center(&self) -> GpsPoint {
        GpsPoint::new(
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lng + self.max_lng) / 2.0,
        )
    }

    /// Inclusive on all four edges.
    pub fn contains(&self, point: &GpsPoint) -> bool {
        point.latitude >= self.min_lat
            && point.latitude <= self.max_lat
            && point.longitude >= self.min_lng
            && point.longitude <= self.max_lng
    }
}

/// Anything that may be drawn on a map.
pub trait Geotagged {
    /// Position of the item, `None` if it has no usable location.
    fn position(&self) -> Option<GpsPoint>;
}

impl Geotagged for GpsPoint {
    fn position(&self) -> Option<GpsPoint> {
        Some(*self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gps_point_validation() {
        assert!(GpsPoint::new(51.5074, -0.1278).is_valid());
        assert!(GpsPoint::new(-90.0, 180.0).is_valid());
        assert!(!GpsPoint::new(91.0, 0.0).is_valid());
        assert!(!GpsPoint::new(0.0, -180.5).is_valid());
        assert!(!GpsPoint::new(f64::NAN, 0.0).is_valid());
        assert!(!GpsPoint::new(0.0, f64::INFINITY).is_valid());
    }

    #[test]
    fn test_bounds_from_points() {
        assert!(Bounds::from_points(&[]).is_none());

        let bounds = Bounds::from_points(&[
            GpsPoint::new(1.0, 5.0),
            GpsPoint::new(3.0, 2.0),
            GpsPoint::new(2.0, 4.0),
        ])
        .unwrap();
        assert_eq!(bounds.min_lat, 1.0);
        assert_eq!(bounds.max_lat, 3.0);
        assert_eq!(bounds.min_lng, 2.0);
        assert_eq!(bounds.max_lng, 5.0);
        assert_eq!(bounds.center(), GpsPoint::new(2.0, 3.5));
    }

    #[test]
    fn test_bounds_contains_edges() {
        let bounds = Bounds {
            min_lat: 0.0,
            max_lat: 1.0,
            min_lng: 0.0,
            max_lng: 1.0,
        };
        assert!(bounds.contains(&GpsPoint::new(0.0, 0.0)));
        assert!(bounds.contains(&GpsPoint::new(1.0, 1.0)));
        assert!(bounds.contains(&GpsPoint::new(0.5, 1.0)));
        assert!(!bounds.contains(&GpsPoint::new(1.0001, 0.5)));
        assert!(!bounds.contains(&GpsPoint::new(0.5, -0.0001)));
    }
}
