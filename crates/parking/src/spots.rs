//! Fixed grid mapping from detection boxes to parking spot identifiers.

use ml_core::BoundingBox;

/// Parking spot identifier, `1..=rows * columns`.
pub type SpotId = u32;

/// Maps a box centre onto a `rows` x `columns` grid laid over the frame.
///
/// Spots are numbered left to right within a row and rows top to bottom, so
/// the default 2 x 6 grid yields spots 1..=6 in the top half and 7..=12 in the
/// bottom half.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpotMapper {
    rows: u32,
    columns: u32,
}

impl Default for SpotMapper {
    fn default() -> Self {
        Self {
            rows: 2,
            columns: 6,
        }
    }
}

impl SpotMapper {
    pub fn new(rows: u32, columns: u32) -> Self {
        Self {
            rows: rows.max(1),
            columns: columns.max(1),
        }
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    pub fn columns(&self) -> u32 {
        self.columns
    }

    pub fn spot_count(&self) -> u32 {
        self.rows * self.columns
    }

    /// Spot under the centre of `bbox`, using the integer midpoint of the
    /// pixel-truncated corners.
    pub fn map(&self, bbox: &BoundingBox, width: u32, height: u32) -> Option<SpotId> {
        let cx = (bbox.x1.floor() as i64 + bbox.x2.floor() as i64).div_euclid(2);
        let cy = (bbox.y1.floor() as i64 + bbox.y2.floor() as i64).div_euclid(2);
        self.map_point(cx, cy, width, height)
    }

    /// Spot containing the pixel `(cx, cy)`.
    ///
    /// Points left of or beyond the frame width are off-grid. Vertically,
    /// everything at or below the last row boundary belongs to the last row.
    pub fn map_point(&self, cx: i64, cy: i64, width: u32, height: u32) -> Option<SpotId> {
        if width == 0 || height == 0 || cx < 0 || cy < 0 {
            return None;
        }
        let column = (cx as f64 / width as f64 * self.columns as f64).floor() as i64;
        if column < 0 || column >= self.columns as i64 {
            return None;
        }
        let height = height as i64;
        let rows = self.rows as i64;
        let row = (0..rows)
            .find(|r| cy < ((r + 1) * height) / rows)
            .unwrap_or(rows - 1);
        Some((row * self.columns as i64 + column + 1) as SpotId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const W: u32 = 640;
    const H: u32 = 480;

    fn bbox_around(cx: f32, cy: f32) -> BoundingBox {
        BoundingBox::new(cx - 10.0, cy - 10.0, cx + 10.0, cy + 10.0)
    }

    #[test]
    fn default_layout_matches_two_rows_of_six() {
        let mapper = SpotMapper::default();
        assert_eq!(mapper.spot_count(), 12);
        assert_eq!(mapper.map(&bbox_around(10.0, 10.0), W, H), Some(1));
        assert_eq!(mapper.map(&bbox_around(630.0, 10.0), W, H), Some(6));
        assert_eq!(mapper.map(&bbox_around(10.0, 400.0), W, H), Some(7));
        assert_eq!(mapper.map(&bbox_around(630.0, 400.0), W, H), Some(12));
        assert_eq!(mapper.map(&bbox_around(250.0, 100.0), W, H), Some(3));
        assert_eq!(mapper.map(&bbox_around(250.0, 300.0), W, H), Some(9));
    }

    #[test]
    fn row_boundary_is_half_height() {
        let mapper = SpotMapper::default();
        assert_eq!(mapper.map_point(0, 239, W, H), Some(1));
        assert_eq!(mapper.map_point(0, 240, W, H), Some(7));
        // Below the frame still counts as the bottom row.
        assert_eq!(mapper.map_point(0, 900, W, H), Some(7));
    }

    #[test]
    fn centre_at_right_edge_is_off_grid() {
        let mapper = SpotMapper::default();
        assert_eq!(mapper.map_point(639, 0, W, H), Some(6));
        assert_eq!(mapper.map_point(640, 0, W, H), None);
        assert_eq!(mapper.map_point(640, 400, W, H), None);
        assert_eq!(mapper.map_point(-1, 0, W, H), None);
    }

    #[test]
    fn columns_partition_each_half() {
        let mapper = SpotMapper::default();
        for (cy, first) in [(0, 1u32), (H as i64 - 1, 7u32)] {
            let mut previous = first;
            let mut seen = std::collections::BTreeSet::new();
            for x in 0..W as i64 {
                let spot = mapper.map_point(x, cy, W, H).unwrap();
                assert!(spot >= first && spot < first + 6);
                assert!(spot == previous || spot == previous + 1);
                previous = spot;
                seen.insert(spot);
            }
            assert_eq!(seen.len(), 6);
        }
    }

    #[test]
    fn midpoint_uses_floor_division() {
        let mapper = SpotMapper::default();
        // (106 + 107) / 2 = 106 -> column floor(106 / 640 * 6) = 0
        let bbox = BoundingBox::new(106.0, 0.0, 107.0, 1.0);
        assert_eq!(mapper.map(&bbox, W, H), Some(1));
        let bbox = BoundingBox::new(106.0, 0.0, 108.0, 1.0);
        assert_eq!(mapper.map(&bbox, W, H), Some(2));
    }

    #[test]
    fn custom_grid() {
        let mapper = SpotMapper::new(3, 4);
        assert_eq!(mapper.spot_count(), 12);
        assert_eq!(mapper.map_point(0, 0, 400, 300), Some(1));
        assert_eq!(mapper.map_point(399, 150, 400, 300), Some(8));
        assert_eq!(mapper.map_point(399, 299, 400, 300), Some(12));
        assert_eq!(SpotMapper::new(0, 0).spot_count(), 1);
    }
}
