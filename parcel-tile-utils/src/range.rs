use serde::Serialize;

use crate::{TileCoord, bbox_to_xyz};

/// An inclusive rectangle of tiles at one zoom level.
///
/// ```
/// # use parcel_tile_utils::TileRange;
/// let range = TileRange::new(15, 10, 20, 12, 21);
/// assert_eq!(range.len(), 6);
/// assert_eq!(range.iter().next().unwrap().to_string(), "15/10/20");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRange {
    pub zoom: u8,
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
}

impl Serialize for TileRange {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        serializer.collect_str(&format_args!(
            "{}: ({},{}) - ({},{})",
            self.zoom, self.min_x, self.min_y, self.max_x, self.max_y
        ))
    }
}

impl TileRange {
    /// # Panics
    ///
    /// Panics if `min_x > max_x` or `min_y > max_y`.
    #[must_use]
    pub fn new(zoom: u8, min_x: u32, min_y: u32, max_x: u32, max_y: u32) -> Self {
        assert!(min_x <= max_x, "min_x {min_x} > max_x {max_x}");
        assert!(min_y <= max_y, "min_y {min_y} > max_y {max_y}");
        Self {
            zoom,
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// All tiles at `zoom` intersecting the WGS84 bounding box.
    #[must_use]
    pub fn covering(left: f64, bottom: f64, right: f64, top: f64, zoom: u8) -> Self {
        let (min_x, min_y, max_x, max_y) = bbox_to_xyz(left, bottom, right, top, zoom);
        Self::new(
            zoom,
            min_x.min(max_x),
            min_y.min(max_y),
            max_x.max(min_x),
            max_y.max(min_y),
        )
    }

    /// Number of tiles in the range.
    #[must_use]
    pub fn len(&self) -> u64 {
        if self.is_empty() {
            return 0;
        }
        u64::from(self.max_x - self.min_x + 1) * u64::from(self.max_y - self.min_y + 1)
    }

    /// True for a range built field by field with a minimum past its maximum.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.min_x > self.max_x || self.min_y > self.max_y
    }

    #[must_use]
    pub fn contains(&self, tile: TileCoord) -> bool {
        tile.z == self.zoom
            && (self.min_x..=self.max_x).contains(&tile.x)
            && (self.min_y..=self.max_y).contains(&tile.y)
    }

    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.zoom == other.zoom
            && self.min_x <= other.max_x
            && other.min_x <= self.max_x
            && self.min_y <= other.max_y
            && other.min_y <= self.max_y
    }

    /// Tiles in row-major order: west to east within a row, rows north to south.
    pub fn iter(&self) -> impl Iterator<Item = TileCoord> + use<> {
        let Self {
            zoom,
            min_x,
            min_y,
            max_x,
            max_y,
        } = *self;
        (min_y..=max_y).flat_map(move |y| (min_x..=max_x).map(move |x| TileCoord { z: zoom, x, y }))
    }

    /// Splits `other` into the pieces lying outside `self`.
    ///
    /// The west and east strips take the full height of `other`; the north and south strips
    /// are limited to the columns shared with `self` so no two pieces intersect.
    fn outside_parts(&self, other: &Self) -> impl Iterator<Item = Self> {
        let zoom = other.zoom;
        let shared_min_x = other.min_x.max(self.min_x);
        let shared_max_x = other.max_x.min(self.max_x);

        let west = (other.min_x < self.min_x)
            .then(|| Self::new(zoom, other.min_x, other.min_y, self.min_x - 1, other.max_y));
        let east = (other.max_x > self.max_x)
            .then(|| Self::new(zoom, self.max_x + 1, other.min_y, other.max_x, other.max_y));
        let north = (other.min_y < self.min_y)
            .then(|| Self::new(zoom, shared_min_x, other.min_y, shared_max_x, self.min_y - 1));
        let south = (other.max_y > self.max_y)
            .then(|| Self::new(zoom, shared_min_x, self.max_y + 1, shared_max_x, other.max_y));

        [west, east, north, south].into_iter().flatten()
    }
}

/// Adds `range` to `ranges`, keeping only the tiles no existing range covers yet.
///
/// Ranges of different zoom levels never overlap. After the call, no tile is
/// contained in more than one element of `ranges`.
pub fn push_disjoint(ranges: &mut Vec<TileRange>, range: TileRange) {
    let Some(existing) = ranges.iter().find(|r| r.overlaps(&range)).copied() else {
        ranges.push(range);
        return;
    };
    for part in existing.outside_parts(&range) {
        push_disjoint(ranges, part);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn push_checked(ranges: &mut Vec<TileRange>, range: TileRange) {
        push_disjoint(ranges, range);
        for (i, a) in ranges.iter().enumerate() {
            for b in &ranges[i + 1..] {
                assert!(!a.overlaps(b), "{a:?} overlaps {b:?}");
            }
        }
    }

    #[test]
    fn range_len() {
        assert_eq!(TileRange::new(3, 5, 5, 5, 5).len(), 1);
        assert_eq!(TileRange::new(3, 0, 0, 7, 7).len(), 64);
        assert_eq!(TileRange::new(10, 100, 200, 102, 203).len(), 12);
        assert!(!TileRange::new(3, 5, 5, 5, 5).is_empty());
    }

    #[test]
    fn inverted_range_is_empty() {
        let range = TileRange {
            zoom: 4,
            min_x: 3,
            min_y: 1,
            max_x: 2,
            max_y: 5,
        };
        assert!(range.is_empty());
        assert_eq!(range.len(), 0);
        assert_eq!(range.iter().count(), 0);
    }

    #[test]
    fn overlap_detection() {
        let center = TileRange::new(5, 10, 10, 12, 12);
        assert!(center.overlaps(&TileRange::new(5, 12, 12, 14, 14)));
        assert!(center.overlaps(&TileRange::new(5, 11, 11, 11, 11)));
        assert!(center.overlaps(&TileRange::new(5, 8, 11, 20, 11)));
        assert!(!center.overlaps(&TileRange::new(5, 13, 10, 13, 12)));
        assert!(!center.overlaps(&TileRange::new(5, 10, 9, 12, 9)));
        assert!(!center.overlaps(&TileRange::new(6, 10, 10, 12, 12)));
    }

    #[test]
    fn iterates_row_major() {
        let tiles: Vec<String> = TileRange::new(2, 1, 2, 2, 3)
            .iter()
            .map(|t| t.to_string())
            .collect();
        assert_eq!(tiles, vec!["2/1/2", "2/2/2", "2/1/3", "2/2/3"]);
    }

    #[test]
    fn identical_range_adds_nothing() {
        let mut ranges = Vec::new();
        push_checked(&mut ranges, TileRange::new(4, 1, 1, 3, 3));
        push_checked(&mut ranges, TileRange::new(4, 1, 1, 3, 3));
        push_checked(&mut ranges, TileRange::new(4, 2, 2, 2, 2));
        assert_eq!(ranges, vec![TileRange::new(4, 1, 1, 3, 3)]);
    }

    #[test]
    fn partial_overlap_is_split() {
        let mut ranges = Vec::new();
        push_checked(&mut ranges, TileRange::new(4, 2, 2, 3, 3));
        push_checked(&mut ranges, TileRange::new(4, 1, 1, 4, 2));
        assert_eq!(
            ranges,
            vec![
                TileRange::new(4, 2, 2, 3, 3),
                TileRange::new(4, 1, 1, 1, 2),
                TileRange::new(4, 4, 1, 4, 2),
                TileRange::new(4, 2, 1, 3, 1),
            ]
        );
    }

    #[test]
    fn union_covers_every_tile_once() {
        let inputs = [
            TileRange::new(6, 10, 10, 20, 14),
            TileRange::new(6, 15, 12, 25, 30),
            TileRange::new(6, 0, 0, 12, 11),
            TileRange::new(6, 18, 0, 19, 40),
            TileRange::new(7, 10, 10, 20, 14),
        ];
        let mut ranges = Vec::new();
        for r in inputs {
            push_checked(&mut ranges, r);
        }

        let expected: HashSet<TileCoord> = inputs.iter().flat_map(TileRange::iter).collect();
        let total: u64 = ranges.iter().map(TileRange::len).sum();
        let actual: HashSet<TileCoord> = ranges.iter().flat_map(TileRange::iter).collect();
        assert_eq!(actual, expected);
        assert_eq!(total, expected.len() as u64);
    }

    #[test]
    fn covering_bbox() {
        let range = TileRange::covering(-124.8489, 24.3963, -66.8854, 49.3843, 14);
        insta::assert_yaml_snapshot!(range, @r#""14: (2509,5599) - (5147,7046)""#);
        assert!(range.contains(TileCoord { z: 14, x: 2509, y: 7046 }));
        assert!(!range.contains(TileCoord { z: 13, x: 2509, y: 7046 }));
    }
}
