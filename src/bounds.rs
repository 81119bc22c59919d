//! Axis-aligned boxes in block space, with chunk-grid iteration.

use serde::{Deserialize, Serialize};

/// A box in block coordinates: `origin` is the minimum corner, `size` the
/// extent along each axis. The maximum corner is exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub origin: (i32, i32, i32),
    pub size: (i32, i32, i32),
}

impl BoundingBox {
    pub fn new(origin: (i32, i32, i32), size: (i32, i32, i32)) -> BoundingBox {
        BoundingBox { origin, size }
    }

    /// Build from two arbitrary corners (inclusive of both).
    pub fn from_corners(a: (i32, i32, i32), b: (i32, i32, i32)) -> BoundingBox {
        let min = (a.0.min(b.0), a.1.min(b.1), a.2.min(b.2));
        let max = (a.0.max(b.0), a.1.max(b.1), a.2.max(b.2));
        BoundingBox {
            origin: min,
            size: (max.0 - min.0 + 1, max.1 - min.1 + 1, max.2 - min.2 + 1),
        }
    }

    pub fn min(&self) -> (i32, i32, i32) {
        self.origin
    }

    /// Exclusive maximum corner.
    pub fn max(&self) -> (i32, i32, i32) {
        (
            self.origin.0 + self.size.0,
            self.origin.1 + self.size.1,
            self.origin.2 + self.size.2,
        )
    }

    pub fn volume(&self) -> i64 {
        self.size.0 as i64 * self.size.1 as i64 * self.size.2 as i64
    }

    pub fn contains_point(&self, x: i32, y: i32, z: i32) -> bool {
        let (mx, my, mz) = self.max();
        x >= self.origin.0 && x < mx && y >= self.origin.1 && y < my && z >= self.origin.2 && z < mz
    }

    // ── Chunk grid ──

    pub fn min_cx(&self) -> i32 {
        self.origin.0 >> 4
    }

    /// Exclusive upper chunk-x bound.
    pub fn max_cx(&self) -> i32 {
        (self.max().0 + 15) >> 4
    }

    pub fn min_cz(&self) -> i32 {
        self.origin.2 >> 4
    }

    pub fn max_cz(&self) -> i32 {
        (self.max().2 + 15) >> 4
    }

    /// Every chunk position the box touches.
    pub fn chunk_positions(&self) -> impl Iterator<Item = (i32, i32)> {
        let (min_cx, max_cx) = (self.min_cx(), self.max_cx());
        let (min_cz, max_cz) = (self.min_cz(), self.max_cz());
        (min_cx..max_cx).flat_map(move |cx| (min_cz..max_cz).map(move |cz| (cx, cz)))
    }

    pub fn chunk_count(&self) -> usize {
        ((self.max_cx() - self.min_cx()) as usize) * ((self.max_cz() - self.min_cz()) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_corners_is_inclusive() {
        let b = BoundingBox::from_corners((3, 5, -2), (0, 5, 4));
        assert_eq!(b.origin, (0, 5, -2));
        assert_eq!(b.size, (4, 1, 7));
        assert!(b.contains_point(3, 5, 4));
        assert!(!b.contains_point(4, 5, 4));
    }

    #[test]
    fn test_chunk_positions_cover_touched_chunks() {
        // Box straddling four chunks around the origin.
        let b = BoundingBox::new((-8, 0, -8), (16, 1, 16));
        let chunks: Vec<(i32, i32)> = b.chunk_positions().collect();
        assert_eq!(chunks.len(), 4);
        assert!(chunks.contains(&(-1, -1)));
        assert!(chunks.contains(&(-1, 0)));
        assert!(chunks.contains(&(0, -1)));
        assert!(chunks.contains(&(0, 0)));
        assert_eq!(b.chunk_count(), 4);
    }

    #[test]
    fn test_single_block_box() {
        let b = BoundingBox::new((17, 64, 33), (1, 1, 1));
        let chunks: Vec<(i32, i32)> = b.chunk_positions().collect();
        assert_eq!(chunks, vec![(1, 2)]);
        assert_eq!(b.volume(), 1);
    }
}
