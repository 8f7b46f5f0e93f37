//! Bounding boxes and affected-tile computation.
//!
//! A `BoundingBox` is carried on the wire as `[[minLon, minLat], [maxLon,
//! maxLat]]`. The empty default has inverted infinite corners so that
//! folding geometry extents record by record with [`BoundingBox::union`]
//! starts from a box that any real extent replaces; an empty box is not
//! valid and is rejected before tile enumeration.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::mercator;

/// An axis-aligned geographic box: `((min_lon, min_lat), (max_lon, max_lat))`.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct BoundingBox(pub (f64, f64), pub (f64, f64));

impl BoundingBox {
    /// Grows this box to cover `other`.
    pub fn union(&mut self, other: &Self) -> &mut Self {
        self.0 = (self.0 .0.min(other.0 .0), self.0 .1.min(other.0 .1));
        self.1 = (self.1 .0.max(other.1 .0), self.1 .1.max(other.1 .1));
        self
    }

    /// Covers a single point. Degenerate boxes are fine: a point geometry
    /// still affects the tiles containing it.
    pub fn from_point(lon: f64, lat: f64) -> Self {
        BoundingBox((lon, lat), (lon, lat))
    }

    pub fn is_valid(&self) -> bool {
        self.0 .0 <= self.1 .0 && self.0 .1 <= self.1 .1
    }

    /// Whether two boxes share any point. Touching edges count.
    pub fn intersects(&self, other: &Self) -> bool {
        self.0 .0 <= other.1 .0
            && other.0 .0 <= self.1 .0
            && self.0 .1 <= other.1 .1
            && other.0 .1 <= self.1 .1
    }
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self(
            (f64::INFINITY, f64::INFINITY),
            (f64::NEG_INFINITY, f64::NEG_INFINITY),
        )
    }
}

/// One tile of the power-of-two tiling scheme. Value semantics only; used
/// as a set element to deduplicate invalidation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tile {
    pub zoom: u64,
    pub x: u64,
    pub y: u64,
}

/// The inclusive tile rectangle covering `bbox` at one zoom level.
///
/// The north-west corner converts to the low x and low y of the range
/// (tile y grows southwards), so both ranges run low to high.
fn tile_range(zoom: u64, bbox: &BoundingBox) -> (u64, u64, u64, u64) {
    let (x_min, y_min) = mercator::tile_index(zoom, bbox.0 .0, bbox.1 .1);
    let (x_max, y_max) = mercator::tile_index(zoom, bbox.1 .0, bbox.0 .1);
    (x_min, x_max, y_min, y_max)
}

/// Every tile covering `bbox` at every zoom level from 0 to `max_zoom`
/// inclusive. Inverted boxes are rejected before any enumeration happens.
pub fn affected_tiles(max_zoom: u64, bbox: &BoundingBox) -> Result<HashSet<Tile>, Error> {
    if !bbox.is_valid() {
        return Err(Error::InvalidBoundingBox(*bbox));
    }
    let mut tiles = HashSet::new();
    for zoom in 0..=max_zoom {
        let (x_min, x_max, y_min, y_max) = tile_range(zoom, bbox);
        for x in x_min..=x_max {
            for y in y_min..=y_max {
                tiles.insert(Tile { zoom, x, y });
            }
        }
    }
    Ok(tiles)
}

/// The cardinality [`affected_tiles`] would produce, without materializing
/// the set. Shares the corner math with the enumeration so the two cannot
/// drift.
pub fn count_tiles(max_zoom: u64, bbox: &BoundingBox) -> Result<u64, Error> {
    if !bbox.is_valid() {
        return Err(Error::InvalidBoundingBox(*bbox));
    }
    let mut count = 0;
    for zoom in 0..=max_zoom {
        let (x_min, x_max, y_min, y_max) = tile_range(zoom, bbox);
        count += (x_max - x_min + 1) * (y_max - y_min + 1);
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_union() {
        let mut a = BoundingBox((0., 0.), (1., 1.));
        a.union(&BoundingBox((2., 2.), (3., 3.)));
        assert_eq!(BoundingBox((0., 0.), (3., 3.)), a);
    }

    #[test]
    fn test_union_from_empty() {
        let mut empty = BoundingBox::default();
        let a = BoundingBox((0., 0.), (1., 1.));
        empty.union(&a);
        assert_eq!(a, empty);
    }

    #[test]
    fn test_validity() {
        assert!(BoundingBox((0., 0.), (1., 1.)).is_valid());
        assert!(BoundingBox::from_point(4.2, 45.1).is_valid());
        assert!(!BoundingBox((1., 0.), (0., 1.)).is_valid());
        assert!(!BoundingBox((0., 1.), (1., 0.)).is_valid());
        assert!(!BoundingBox::default().is_valid());
    }

    #[test]
    fn test_inverted_box_is_rejected() {
        let inverted = BoundingBox((3., 45.), (2., 46.));
        assert!(matches!(
            affected_tiles(10, &inverted),
            Err(Error::InvalidBoundingBox(_))
        ));
        assert!(matches!(
            count_tiles(10, &inverted),
            Err(Error::InvalidBoundingBox(_))
        ));
    }

    #[test]
    fn test_zoom_zero_is_one_tile() {
        let bbox = BoundingBox((-10., -10.), (10., 10.));
        let tiles = affected_tiles(0, &bbox).expect("valid box");
        assert_eq!(1, tiles.len());
        assert!(tiles.contains(&Tile { zoom: 0, x: 0, y: 0 }));
    }

    #[test]
    fn test_count_matches_enumeration() {
        let boxes = [
            BoundingBox((2.25, 48.81), (2.42, 48.90)),
            BoundingBox((-0.6, 44.8), (-0.5, 44.9)),
            BoundingBox::from_point(2.3522, 48.8566),
            BoundingBox((-10., -10.), (10., 10.)),
        ];
        for bbox in &boxes {
            for max_zoom in [0, 5, 10, 12] {
                let tiles = affected_tiles(max_zoom, bbox).expect("valid box");
                let count = count_tiles(max_zoom, bbox).expect("valid box");
                assert_eq!(tiles.len() as u64, count);
            }
        }
    }

    #[test]
    fn test_every_zoom_level_is_covered() {
        let bbox = BoundingBox((2.25, 48.81), (2.42, 48.90));
        let tiles = affected_tiles(12, &bbox).expect("valid box");
        for zoom in 0..=12 {
            assert!(tiles.iter().any(|t| t.zoom == zoom));
        }
    }

    #[test]
    fn test_affected_tiles_intersect_the_box() {
        let bbox = BoundingBox((2.25, 48.81), (2.42, 48.90));
        for tile in affected_tiles(12, &bbox).expect("valid box") {
            let envelope = mercator::tile_bbox(tile.zoom, tile.x, tile.y);
            assert!(envelope.intersects(&bbox), "{tile:?} misses the box");
        }
    }
}
