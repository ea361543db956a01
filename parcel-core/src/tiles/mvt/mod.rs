//! Mapbox Vector Tile geometry.
//!
//! Only polygon features are of interest. Their command streams are turned into rings of
//! tile-local pixel coordinates, grouped into polygons by winding order, and tagged with the
//! parcel id read from a feature attribute or the feature id.

mod decode;
pub use decode::{DecodeStats, DecodedTile, MvtDecoder, TileFeature, TilePolygon, TileRing};

#[cfg(any(test, feature = "test-fixtures"))]
mod encode;
#[cfg(any(test, feature = "test-fixtures"))]
pub use encode::{ParcelLayerBuilder, encode_point, encode_polygons, encode_tile};

mod error;
pub use error::{CommandStreamError, DecodeError};
