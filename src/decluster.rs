//! Marker declustering for co-located map points.
//!
//! Markers whose coordinates agree to `key_precision` decimal places (5 by
//! default, about 1.1 m) are grouped. A lone marker stays where it is; members
//! of a larger group are spread on a ring around the group centroid so each
//! one can be tapped.
//!
//! The ring offset is a planar approximation applied directly to latitude and
//! longitude. It is only meant for high zoom levels and does not correct for
//! longitude convergence.

use std::collections::HashMap;
use std::f64::consts::PI;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::DeclusterConfig;
use crate::geo_utils::compute_center;
use crate::{Geotagged, GpsPoint};

/// A marker with its true and displayed positions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacedMarker<T> {
    pub item: T,
    pub original: GpsPoint,
    /// Where to draw the marker. Equals `original` for groups of one.
    pub display: GpsPoint,
}

/// All markers sharing one rounded coordinate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerGroup<T> {
    /// Rounded "lat,lng" key, e.g. "12.97160,77.59460"
    pub coordinate_key: String,
    pub centroid: GpsPoint,
    pub members: Vec<PlacedMarker<T>>,
}

impl<T> MarkerGroup<T> {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Integer grid cell for a point at `precision` decimal places.
fn grid_key(point: &GpsPoint, scale: f64) -> (i64, i64) {
    (
        (point.latitude * scale).round() as i64,
        (point.longitude * scale).round() as i64,
    )
}

/// Offsets for `total` markers on a ring of `radius` degrees around `center`.
///
/// A single marker is returned unmoved.
pub fn ring_positions(center: GpsPoint, total: usize, radius: f64) -> Vec<GpsPoint> {
    if total <= 1 {
        return vec![center; total];
    }
    (0..total)
        .map(|i| {
            let angle = 2.0 * PI * i as f64 / total as f64;
            GpsPoint::new(
                center.latitude + radius * angle.cos(),
                center.longitude + radius * angle.sin(),
            )
        })
        .collect()
}

/// Group co-located items and assign each a display position.
///
/// Groups come out in order of first appearance; members keep input order.
/// Items without a position are skipped.
pub fn decluster<T: Geotagged + Clone>(
    items: &[T],
    config: &DeclusterConfig,
) -> Vec<MarkerGroup<T>> {
    let scale = 10f64.powi(config.key_precision as i32);
    let precision = config.key_precision as usize;

    let mut slots: HashMap<(i64, i64), usize> = HashMap::new();
    let mut buckets: Vec<((i64, i64), Vec<(GpsPoint, &T)>)> = Vec::new();
    let mut skipped = 0usize;

    for item in items {
        let Some(point) = item.position() else {
            skipped += 1;
            continue;
        };
        let key = grid_key(&point, scale);
        let slot = *slots.entry(key).or_insert_with(|| {
            buckets.push((key, Vec::new()));
            buckets.len() - 1
        });
        buckets[slot].1.push((point, item));
    }

    if skipped > 0 {
        debug!("[Decluster] Skipped {} item(s) without a position", skipped);
    }

    buckets
        .into_iter()
        .map(|((lat_key, lng_key), members)| {
            let coordinate_key = format!(
                "{:.*},{:.*}",
                precision,
                lat_key as f64 / scale,
                precision,
                lng_key as f64 / scale
            );

            let originals: Vec<GpsPoint> = members.iter().map(|(p, _)| *p).collect();
            let centroid = compute_center(&originals);
            let total = members.len();

            let displays = if total == 1 {
                originals.clone()
            } else {
                let multiplier = if total > config.dense_group_threshold {
                    config.dense_radius_multiplier
                } else {
                    1.0
                };
                ring_positions(centroid, total, config.base_radius_deg * multiplier)
            };

            MarkerGroup {
                coordinate_key,
                centroid,
                members: members
                    .into_iter()
                    .zip(displays)
                    .map(|((original, item), display)| PlacedMarker {
                        item: item.clone(),
                        original,
                        display,
                    })
                    .collect(),
            }
        })
        .collect()
}

/// Flatten groups into a single list of placed markers.
pub fn flatten<T>(groups: Vec<MarkerGroup<T>>) -> Vec<PlacedMarker<T>> {
    groups.into_iter().flat_map(|g| g.members).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_marker_unchanged() {
        let p = GpsPoint::new(12.971601, 77.594612);
        let groups = decluster(&[p], &DeclusterConfig::default());

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].members[0].display, p);
        assert_eq!(groups[0].members[0].original, p);
        assert_eq!(groups[0].coordinate_key, "12.97160,77.59461");
    }

    #[test]
    fn test_group_positions_pairwise_distinct() {
        let config = DeclusterConfig::default();
        for n in 2..=12 {
            let items = vec![GpsPoint::new(12.9716, 77.5946); n];
            let groups = decluster(&items, &config);
            assert_eq!(groups.len(), 1);

            let displays: Vec<GpsPoint> = groups[0].members.iter().map(|m| m.display).collect();
            for i in 0..n {
                for j in (i + 1)..n {
                    assert_ne!(displays[i], displays[j], "n={} i={} j={}", n, i, j);
                }
            }
        }
    }

    #[test]
    fn test_dense_groups_use_wider_ring() {
        let config = DeclusterConfig::default();
        let center = GpsPoint::new(10.0, 20.0);

        let small = decluster(&vec![center; 5], &config);
        let first = small[0].members[0].display;
        assert!((first.latitude - (10.0 + config.base_radius_deg)).abs() < 1e-12);

        let dense = decluster(&vec![center; 6], &config);
        let first = dense[0].members[0].display;
        assert!((first.latitude - (10.0 + 2.0 * config.base_radius_deg)).abs() < 1e-12);
    }

    #[test]
    fn test_nearby_points_share_key() {
        let items = vec![
            GpsPoint::new(1.000001, 2.000001),
            GpsPoint::new(1.000002, 2.000004),
            GpsPoint::new(1.001, 2.0),
        ];
        let groups = decluster(&items, &DeclusterConfig::default());
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 2);
        assert_eq!(groups[1].len(), 1);
        assert_eq!(groups[1].members[0].display, items[2]);
    }

    #[test]
    fn test_groups_in_first_appearance_order() {
        let a = GpsPoint::new(5.0, 5.0);
        let b = GpsPoint::new(6.0, 6.0);
        let groups = decluster(&[b, a, b], &DeclusterConfig::default());
        assert_eq!(groups[0].centroid, b);
        assert_eq!(groups[1].centroid, a);
        assert_eq!(flatten(groups).len(), 3);
    }

    #[test]
    fn test_items_without_position_skipped() {
        #[derive(Clone)]
        struct Pin(Option<GpsPoint>);
        impl Geotagged for Pin {
            fn position(&self) -> Option<GpsPoint> {
                self.0
            }
        }

        let groups = decluster(
            &[Pin(None), Pin(Some(GpsPoint::new(1.0, 1.0)))],
            &DeclusterConfig::default(),
        );
        assert_eq!(groups.len(), 1);
    }

    #[test]
    fn test_zero_radius_collapses_ring() {
        let config = DeclusterConfig {
            base_radius_deg: 0.0,
            ..DeclusterConfig::default()
        };
        let p = GpsPoint::new(3.0, 4.0);
        let groups = decluster(&[p, p], &config);
        assert!(groups[0].members.iter().all(|m| m.display == p));
    }
}
