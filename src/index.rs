//! R-tree over the points of one dataset.
//!
//! The index stores positions into the dataset's item slice, not the points
//! themselves, and remembers which dataset it was built from so a mismatched
//! pairing can be detected.

use rstar::{RTree, RTreeObject, AABB};

use crate::{Bounds, DatasetId, PointSet};

/// Point entry stored in the tree.
#[derive(Debug, Clone, Copy, PartialEq)]
struct IndexedPoint {
    idx: usize,
    x: f64,
    y: f64,
}

impl RTreeObject for IndexedPoint {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point([self.x, self.y])
    }
}

/// Spatial index over a [`PointSet`].
///
/// Read-only after [`PointIndex::build`]; safe to share across threads.
#[derive(Debug)]
pub struct PointIndex {
    tree: RTree<IndexedPoint>,
    dataset: DatasetId,
}

impl PointIndex {
    /// Bulk-load an index over every point with finite coordinates.
    pub fn build(points: &PointSet) -> Self {
        let entries: Vec<IndexedPoint> = points
            .items()
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_finite())
            .map(|(idx, p)| IndexedPoint { idx, x: p.x, y: p.y })
            .collect();

        let skipped = points.len() - entries.len();
        if skipped > 0 {
            log::warn!(
                "[PointIndex] Skipped {} points with non-finite coordinates in {}",
                skipped,
                points.name()
            );
        }

        Self {
            tree: RTree::bulk_load(entries),
            dataset: points.id(),
        }
    }

    /// Identity of the dataset this index was built from.
    pub fn dataset(&self) -> DatasetId {
        self.dataset
    }

    pub fn len(&self) -> usize {
        self.tree.size()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }

    /// Positions of all points inside `bounds` (edges inclusive), in ascending order.
    pub fn query(&self, bounds: &Bounds) -> Vec<usize> {
        let envelope = AABB::from_corners([bounds.min_x, bounds.min_y], [bounds.max_x, bounds.max_y]);
        let mut hits: Vec<usize> = self
            .tree
            .locate_in_envelope(&envelope)
            .map(|p| p.idx)
            .collect();
        hits.sort_unstable();
        hits
    }
}
