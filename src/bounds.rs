//! Viewport filtering for large geo-tagged collections.
//!
//! [`filter_in_bounds`] is a single linear pass for one-off queries.
//! [`ViewportIndex`] bulk-loads an R-tree once and answers repeated viewport
//! queries (map pans and zooms) over tens of thousands of points.
//! Both treat the rectangle as inclusive on every edge.

use log::debug;
use rstar::{primitives::GeomWithData, RTree, AABB};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::{Bounds, Geotagged};

/// Items whose position lies inside `bounds`, in input order.
///
/// Items without a position are excluded.
pub fn filter_in_bounds<T: Geotagged + Clone>(items: &[T], bounds: &Bounds) -> Vec<T> {
    items
        .iter()
        .filter(|item| item.position().is_some_and(|p| bounds.contains(&p)))
        .cloned()
        .collect()
}

/// Parallel version of [`filter_in_bounds`].
#[cfg(feature = "parallel")]
pub fn filter_in_bounds_parallel<T: Geotagged + Clone + Send + Sync>(
    items: &[T],
    bounds: &Bounds,
) -> Vec<T> {
    items
        .par_iter()
        .filter(|item| item.position().is_some_and(|p| bounds.contains(&p)))
        .cloned()
        .collect()
}

type IndexedPoint = GeomWithData<[f64; 2], usize>;

/// R-tree over item positions for repeated viewport queries.
pub struct ViewportIndex<T> {
    tree: RTree<IndexedPoint>,
    items: Vec<T>,
}

impl<T: Geotagged> ViewportIndex<T> {
    /// Build the index. Items without a position are kept but never returned.
    pub fn new(items: Vec<T>) -> Self {
        let entries: Vec<IndexedPoint> = items
            .iter()
            .enumerate()
            .filter_map(|(i, item)| {
                item.position()
                    .map(|p| GeomWithData::new([p.longitude, p.latitude], i))
            })
            .collect();

        debug!(
            "[ViewportIndex] Indexed {} of {} items",
            entries.len(),
            items.len()
        );

        Self {
            tree: RTree::bulk_load(entries),
            items,
        }
    }

    /// Items inside `bounds`, in input order, capped at `limit` when given.
    pub fn query(&self, bounds: &Bounds, limit: Option<usize>) -> Vec<&T> {
        let envelope = AABB::from_corners(
            [bounds.min_lng, bounds.min_lat],
            [bounds.max_lng, bounds.max_lat],
        );

        let mut hits: Vec<usize> = self
            .tree
            .locate_in_envelope(&envelope)
            .map(|entry| entry.data)
            .collect();
        hits.sort_unstable();
        if let Some(limit) = limit {
            hits.truncate(limit);
        }

        hits.into_iter().map(|i| &self.items[i]).collect()
    }

    /// Number of items that have a position.
    pub fn indexed_len(&self) -> usize {
        self.tree.size()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GpsPoint;

    fn viewport() -> Bounds {
        Bounds {
            min_lat: 10.0,
            max_lat: 11.0,
            min_lng: 20.0,
            max_lng: 21.0,
        }
    }

    fn grid() -> Vec<GpsPoint> {
        // 0.25 degree grid from (9.5, 19.5) to (11.5, 21.5)
        let mut points = Vec::new();
        for i in 0..9 {
            for j in 0..9 {
                points.push(GpsPoint::new(9.5 + i as f64 * 0.25, 19.5 + j as f64 * 0.25));
            }
        }
        points
    }

    #[test]
    fn test_filter_inclusive_edges() {
        let items = vec![
            GpsPoint::new(10.0, 20.0),
            GpsPoint::new(11.0, 21.0),
            GpsPoint::new(10.5, 20.5),
            GpsPoint::new(11.0000001, 20.5),
            GpsPoint::new(10.5, 19.9999999),
        ];
        let inside = filter_in_bounds(&items, &viewport());
        assert_eq!(inside, items[..3].to_vec());
    }

    #[test]
    fn test_filter_empty() {
        let items: Vec<GpsPoint> = vec![];
        assert!(filter_in_bounds(&items, &viewport()).is_empty());
    }

    #[test]
    fn test_index_matches_linear_filter() {
        let points = grid();
        let expected = filter_in_bounds(&points, &viewport());
        assert_eq!(expected.len(), 25);

        let index = ViewportIndex::new(points);
        let found: Vec<GpsPoint> = index.query(&viewport(), None).into_iter().copied().collect();
        assert_eq!(found, expected);
    }

    #[test]
    fn test_index_limit() {
        let index = ViewportIndex::new(grid());
        assert_eq!(index.query(&viewport(), Some(7)).len(), 7);
        assert_eq!(index.len(), 81);
        assert_eq!(index.indexed_len(), 81);
    }

    #[test]
    fn test_index_outside_viewport() {
        let index = ViewportIndex::new(grid());
        let far = Bounds {
            min_lat: -50.0,
            max_lat: -40.0,
            min_lng: 100.0,
            max_lng: 110.0,
        };
        assert!(index.query(&far, None).is_empty());
    }
}
