#![doc = include_str!("../README.md")]

mod coord;
pub use coord::{ParseTileCoordError, TileCoord, TileScheme};

mod encoding;
pub use encoding::{Encoding, decode_payload};

mod mercator;
pub use mercator::{
    EARTH_CIRCUMFERENCE, EARTH_RADIUS, MAX_LATITUDE, TileProjection, bbox_to_xyz, tile_index,
    webmercator_to_wgs84, wgs84_to_webmercator,
};

mod range;
pub use range::{TileRange, push_disjoint};

/// Highest zoom level the tile grid math supports (`2^zoom` must fit into `u32`).
pub const MAX_ZOOM: u8 = 30;

/// Default coordinate extent of a vector tile, as used by most tile servers.
pub const DEFAULT_EXTENT: u32 = 4096;
