use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::MAX_ZOOM;

/// Address of one cell of the XYZ ("slippy map") tile grid.
///
/// Row `y = 0` is the northernmost row. Invariant: `x, y < 2^z`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileCoord {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

impl TileCoord {
    /// Creates a tile coordinate, returning `None` if `x` or `y` fall outside the grid of zoom `z`.
    #[must_use]
    pub fn new_checked(z: u8, x: u32, y: u32) -> Option<Self> {
        Self::is_valid(z, x, y).then_some(Self { z, x, y })
    }

    #[must_use]
    pub fn is_valid(z: u8, x: u32, y: u32) -> bool {
        if z > MAX_ZOOM {
            return false;
        }
        let side = 1_u32 << z;
        x < side && y < side
    }

    /// Row index of this tile in the given scheme. TMS counts rows from the south.
    #[must_use]
    pub fn row_in(&self, scheme: TileScheme) -> u32 {
        match scheme {
            TileScheme::Xyz => self.y,
            TileScheme::Tms => (1_u32 << self.z) - 1 - self.y,
        }
    }
}

impl Display for TileCoord {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ParseTileCoordError {
    #[error("tile coordinate '{0}' must have the form z/x/y")]
    Format(String),
    #[error("tile coordinate '{0}' lies outside the tile grid of its zoom level")]
    OutOfRange(String),
}

impl FromStr for TileCoord {
    type Err = ParseTileCoordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split('/');
        let (Some(z), Some(x), Some(y), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ParseTileCoordError::Format(s.to_string()));
        };
        let parse_err = |_| ParseTileCoordError::Format(s.to_string());
        let z = z.parse::<u8>().map_err(parse_err)?;
        let x = x.parse::<u32>().map_err(parse_err)?;
        let y = y.parse::<u32>().map_err(parse_err)?;
        Self::new_checked(z, x, y).ok_or_else(|| ParseTileCoordError::OutOfRange(s.to_string()))
    }
}

/// Row numbering used by a tile server.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TileScheme {
    /// XYZ (aka. "slippy map") scheme where Y=0 is at the top
    #[default]
    Xyz,
    /// TMS scheme where Y=0 is at the bottom
    Tms,
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("0/0/0", Ok(TileCoord { z: 0, x: 0, y: 0 }))]
    #[case(" 15/20654/14000 ", Ok(TileCoord { z: 15, x: 20654, y: 14000 }))]
    #[case("1/2/0", Err(ParseTileCoordError::OutOfRange("1/2/0".to_string())))]
    #[case("1/0", Err(ParseTileCoordError::Format("1/0".to_string())))]
    #[case("1/0/0/0", Err(ParseTileCoordError::Format("1/0/0/0".to_string())))]
    #[case("a/0/0", Err(ParseTileCoordError::Format("a/0/0".to_string())))]
    fn parse_tile_coord(#[case] input: &str, #[case] expected: Result<TileCoord, ParseTileCoordError>) {
        assert_eq!(input.parse::<TileCoord>(), expected);
    }

    #[test]
    fn display_roundtrip() {
        let tile = TileCoord { z: 12, x: 2600, y: 1700 };
        assert_eq!(tile.to_string(), "12/2600/1700");
        assert_eq!(tile.to_string().parse::<TileCoord>(), Ok(tile));
    }

    #[test]
    fn tms_row_is_flipped() {
        let tile = TileCoord { z: 3, x: 1, y: 0 };
        assert_eq!(tile.row_in(TileScheme::Xyz), 0);
        assert_eq!(tile.row_in(TileScheme::Tms), 7);
    }
}
