//! Engine configuration.
//!
//! Every knob has a documented default; a config file only needs to name the
//! values it overrides.
//!
//! ```rust
//! use journey_matcher::EngineConfig;
//!
//! let json = r#"{ "verification": { "radius_km": 0.25 } }"#;
//! let config = EngineConfig::from_json_str(json).unwrap();
//! assert_eq!(config.verification.radius_km, 0.25);
//! assert_eq!(config.trends.max_months, 6);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{JourneyError, Result};

/// Visit verification policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// A visit is verified when the closest ping is strictly within this
    /// distance of the client's declared location.
    /// Default: 0.5 km
    pub radius_km: f64,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self { radius_km: 0.5 }
    }
}

/// Marker declustering layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeclusterConfig {
    /// Ring radius in degrees for small groups.
    /// Default: 0.0001 (~11 m at the equator)
    pub base_radius_deg: f64,
    /// Decimal places used to decide that two markers share a coordinate.
    /// Default: 5 (~1.1 m)
    pub key_precision: u32,
    /// Groups larger than this get a wider ring.
    /// Default: 5
    pub dense_group_threshold: usize,
    /// Ring radius multiplier for dense groups.
    /// Default: 2.0
    pub dense_radius_multiplier: f64,
}

impl Default for DeclusterConfig {
    fn default() -> Self {
        Self {
            base_radius_deg: 0.0001,
            key_precision: 5,
            dense_group_threshold: 5,
            dense_radius_multiplier: 2.0,
        }
    }
}

/// Dashboard summary sizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrendConfig {
    /// Most recent creation-month buckets kept. Default: 6
    pub max_months: usize,
    /// Largest region buckets kept. Default: 5
    pub max_regions: usize,
    /// Bucket name for clients without a region code. Default: "Unknown"
    pub unknown_region_label: String,
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            max_months: 6,
            max_regions: 5,
            unknown_region_label: "Unknown".to_string(),
        }
    }
}

/// Polling and cache lifetimes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    /// Seconds between automatic refresh cycles. Default: 30
    pub poll_interval_secs: u64,
    /// Seconds a cached client list is served before refetching. Default: 300
    pub client_cache_max_age_secs: u64,
    /// Last-good snapshots kept for degraded mode. Default: 16
    pub snapshot_cache_capacity: usize,
}

impl RefreshConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn client_cache_max_age(&self) -> Duration {
        Duration::from_secs(self.client_cache_max_age_secs)
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            client_cache_max_age_secs: 300,
            snapshot_cache_capacity: 16,
        }
    }
}

/// Top-level configuration for the journey engine.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub verification: VerificationConfig,
    pub decluster: DeclusterConfig,
    pub trends: TrendConfig,
    pub refresh: RefreshConfig,
    /// Douglas-Peucker tolerance for the rendered route, in degrees.
    /// 0 disables simplification. Default: 0.0 (full resolution)
    pub route_simplification_deg: f64,
}

impl EngineConfig {
    /// Parse a (possibly partial) JSON config and validate it.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json).map_err(|e| JourneyError::Config {
            message: format!("Invalid config JSON: {}", e),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        fn bad(message: &str) -> Result<()> {
            Err(JourneyError::Config {
                message: message.to_string(),
            })
        }

        if !(self.verification.radius_km.is_finite() && self.verification.radius_km > 0.0) {
            return bad("verification.radius_km must be a positive number");
        }
        if !(self.decluster.base_radius_deg.is_finite() && self.decluster.base_radius_deg >= 0.0) {
            return bad("decluster.base_radius_deg must be a non-negative number");
        }
        if self.decluster.key_precision > 10 {
            return bad("decluster.key_precision must be at most 10");
        }
        if !(self.decluster.dense_radius_multiplier.is_finite()
            && self.decluster.dense_radius_multiplier >= 1.0)
        {
            return bad("decluster.dense_radius_multiplier must be at least 1");
        }
        if self.trends.max_months == 0 || self.trends.max_regions == 0 {
            return bad("trends.max_months and trends.max_regions must be positive");
        }
        if self.refresh.poll_interval_secs == 0 {
            return bad("refresh.poll_interval_secs must be positive");
        }
        if self.refresh.snapshot_cache_capacity == 0 {
            return bad("refresh.snapshot_cache_capacity must be positive");
        }
        if !(self.route_simplification_deg.is_finite() && self.route_simplification_deg >= 0.0) {
            return bad("route_simplification_deg must be a non-negative number");
        }
        Ok(())
    }
}
