//! Web-Mercator slippy-map coordinate math.
//!
//! The two conversions below are the only place the projection formulas
//! live; everything else (affected-tile enumeration, tile envelopes for
//! queries) delegates here. Both are pure and total over the valid domain:
//! zoom >= 0, latitude strictly inside (-90, 90), longitude strictly inside
//! (-180, 180). Behavior outside that domain is unspecified.

use std::f64::consts::PI;

use crate::tiles::BoundingBox;

/// Converts a geographic point to the tile containing it at `zoom`.
pub fn tile_index(zoom: u64, lon: f64, lat: f64) -> (u64, u64) {
    let n = 2f64.powi(zoom as i32);
    let x = ((lon + 180.0) / 360.0 * n).floor();
    let y = ((1.0 - lat.to_radians().tan().asinh() / PI) / 2.0 * n).floor();
    (x as u64, y as u64)
}

/// Returns the north-west corner of a tile as (longitude, latitude) degrees.
pub fn nw_corner(zoom: u64, x: u64, y: u64) -> (f64, f64) {
    let n = 2f64.powi(zoom as i32);
    let lon = x as f64 / n * 360.0 - 180.0;
    let lat = (PI * (1.0 - 2.0 * y as f64 / n)).sinh().atan().to_degrees();
    (lon, lat)
}

/// Returns the geographic envelope of a tile.
///
/// The south-east corner is the north-west corner of the diagonal neighbor,
/// so adjacent tile envelopes share edges exactly.
pub fn tile_bbox(zoom: u64, x: u64, y: u64) -> BoundingBox {
    let (min_lon, max_lat) = nw_corner(zoom, x, y);
    let (max_lon, min_lat) = nw_corner(zoom, x + 1, y + 1);
    BoundingBox((min_lon, min_lat), (max_lon, max_lat))
}

#[cfg(test)]
mod tests {
    use assert_approx_eq::assert_approx_eq;

    use super::*;

    #[test]
    fn test_tile_index_paris() {
        // Gare de l'Est, zoom 10
        assert_eq!((518, 352), tile_index(10, 2.3522, 48.8566));
    }

    #[test]
    fn test_tile_index_zoom_zero_is_single_tile() {
        assert_eq!((0, 0), tile_index(0, -179.9, 85.0));
        assert_eq!((0, 0), tile_index(0, 179.9, -85.0));
    }

    #[test]
    fn test_nw_corner_longitudes_are_linear() {
        let (lon, _) = nw_corner(10, 518, 352);
        assert_approx_eq!(2.109375, lon);
        let (lon, lat) = nw_corner(1, 1, 1);
        assert_approx_eq!(0.0, lon);
        assert_approx_eq!(0.0, lat);
    }

    #[test]
    fn test_round_trip_brackets_the_point() {
        let cases = [
            (10, 2.3522, 48.8566),
            (14, -0.5793, 44.8378),
            (5, 139.6917, 35.6895),
            (18, 7.4194, 43.7306),
        ];
        for (zoom, lon, lat) in cases {
            let (x, y) = tile_index(zoom, lon, lat);
            let (west, north) = nw_corner(zoom, x, y);
            let (east, south) = nw_corner(zoom, x + 1, y + 1);
            // The tile's envelope must bracket the original point.
            assert!(west <= lon && lon < east);
            assert!(south < lat && lat <= north);
        }
    }

    #[test]
    fn test_tile_bbox_edges_are_shared() {
        let a = tile_bbox(10, 511, 340);
        let b = tile_bbox(10, 512, 340);
        assert_approx_eq!(a.1 .0, b.0 .0);
    }
}
