//! Spherical Web Mercator (EPSG:3857) helpers and the tile-pixel projection.
//!
//! Vector tile geometry is stored in tile-local integer pixels: the origin is the
//! north-west corner of the tile and pixel rows grow towards the south. Web Mercator
//! northing (and latitude) grows towards the north. [`TileProjection`] is the single place
//! where that flip happens; forgetting it produces coordinates that look plausible but sit
//! mirrored across the tile row, often in the ocean.

use std::f64::consts::PI;

use crate::TileCoord;

pub const EARTH_CIRCUMFERENCE: f64 = 40_075_016.685_578_5;
pub const EARTH_RADIUS: f64 = EARTH_CIRCUMFERENCE / 2.0 / PI;

/// Latitude of the top edge of the Web Mercator square, `atan(sinh(π))` in degrees.
pub const MAX_LATITUDE: f64 = 85.051_128_779_806_59;

const HALF_CIRCUMFERENCE: f64 = EARTH_CIRCUMFERENCE / 2.0;

/// Converts WGS84 longitude/latitude to Web Mercator meters.
#[must_use]
pub fn wgs84_to_webmercator(lon: f64, lat: f64) -> (f64, f64) {
    let x = lon * PI / 180.0 * EARTH_RADIUS;
    let y_sin = lat.to_radians().sin();
    let y = EARTH_RADIUS / 2.0 * ((1.0 + y_sin) / (1.0 - y_sin)).ln();
    (x, y)
}

/// Converts Web Mercator meters back to WGS84 longitude/latitude.
#[must_use]
pub fn webmercator_to_wgs84(x: f64, y: f64) -> (f64, f64) {
    let lng = (x / EARTH_RADIUS).to_degrees();
    let lat = f64::atan(f64::sinh(y / EARTH_RADIUS)).to_degrees();
    (lng, lat)
}

/// Column and row of the tile containing the given point at `zoom`.
///
/// Points beyond the Web Mercator square (poles, longitudes past ±180) land in the edge tiles.
#[must_use]
#[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn tile_index(lng: f64, lat: f64, zoom: u8) -> (u32, u32) {
    let tile_size = EARTH_CIRCUMFERENCE / f64::from(1_u32 << zoom);
    let (x, y) = wgs84_to_webmercator(
        lng.clamp(-180.0, 180.0),
        lat.clamp(-MAX_LATITUDE, MAX_LATITUDE),
    );
    let last = f64::from((1_u32 << zoom) - 1);
    let col = ((x + HALF_CIRCUMFERENCE) / tile_size).floor().clamp(0.0, last) as u32;
    let row = ((HALF_CIRCUMFERENCE - y) / tile_size).floor().clamp(0.0, last) as u32;
    (col, row)
}

/// Converts a WGS84 bounding box to an inclusive `(min_x, min_y, max_x, max_y)` tile range.
///
/// The north-west corner determines the minimum row because XYZ rows grow southwards.
#[must_use]
pub fn bbox_to_xyz(left: f64, bottom: f64, right: f64, top: f64, zoom: u8) -> (u32, u32, u32, u32) {
    let (min_x, min_y) = tile_index(left, top, zoom);
    let (max_x, max_y) = tile_index(right, bottom, zoom);
    (min_x, min_y, max_x, max_y)
}

/// Projection between tile-local pixels of one tile and WGS84.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileProjection {
    tile: TileCoord,
    extent: u32,
    /// Web Mercator meters per tile pixel.
    scale: f64,
    /// Web Mercator easting of the tile's west edge.
    west: f64,
    /// Web Mercator northing of the tile's north edge.
    north: f64,
}

impl TileProjection {
    /// # Panics
    ///
    /// Panics if `extent` is zero.
    #[must_use]
    pub fn new(tile: TileCoord, extent: u32) -> Self {
        assert!(extent > 0, "tile extent must be positive");
        let tile_size = EARTH_CIRCUMFERENCE / f64::from(1_u32 << tile.z);
        Self {
            tile,
            extent,
            scale: tile_size / f64::from(extent),
            west: -HALF_CIRCUMFERENCE + f64::from(tile.x) * tile_size,
            north: HALF_CIRCUMFERENCE - f64::from(tile.y) * tile_size,
        }
    }

    #[must_use]
    pub fn tile(&self) -> TileCoord {
        self.tile
    }

    #[must_use]
    pub fn extent(&self) -> u32 {
        self.extent
    }

    /// Inverse transform: tile pixel to `(lon, lat)` in degrees.
    ///
    /// Pixels in the tile buffer (outside `0..=extent`) are allowed; results are clamped to
    /// the valid WGS84 range.
    #[must_use]
    pub fn to_wgs84(&self, px: f64, py: f64) -> (f64, f64) {
        let x = self.west + px * self.scale;
        let y = self.north - py * self.scale;
        let (lon, lat) = webmercator_to_wgs84(x, y);
        (lon.clamp(-180.0, 180.0), lat.clamp(-90.0, 90.0))
    }

    /// Forward transform: `(lon, lat)` in degrees to fractional tile pixels.
    #[must_use]
    pub fn to_pixel(&self, lon: f64, lat: f64) -> (f64, f64) {
        let (x, y) = wgs84_to_webmercator(lon, lat);
        ((x - self.west) / self.scale, (self.north - y) / self.scale)
    }

    /// Projects a ring of integer tile pixels to `(lon, lat)` pairs.
    #[must_use]
    pub fn project_ring(&self, ring: &[(i32, i32)]) -> Vec<(f64, f64)> {
        ring.iter()
            .map(|&(px, py)| self.to_wgs84(f64::from(px), f64::from(py)))
            .collect()
    }
}
