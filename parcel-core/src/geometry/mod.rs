mod repair;
pub use repair::{GeometryRepairError, GeometryRepairer, RepairedGeometry};

use geo::{Coord, LineString, Polygon};
use parcel_tile_utils::TileProjection;

use crate::tiles::mvt::TilePolygon;

/// Rings of a tile polygon converted to `(lon, lat)` degrees.
#[derive(Debug, Clone, PartialEq)]
pub struct GeoPolygon {
    /// Outer boundary.
    pub exterior: Vec<(f64, f64)>,
    /// Holes.
    pub interiors: Vec<Vec<(f64, f64)>>,
}

impl GeoPolygon {
    /// Projects a polygon of tile pixels with the projection of its tile.
    #[must_use]
    pub fn project(polygon: &TilePolygon, projection: &TileProjection) -> Self {
        Self {
            exterior: projection.project_ring(&polygon.exterior),
            interiors: polygon
                .interiors
                .iter()
                .map(|ring| projection.project_ring(ring))
                .collect(),
        }
    }

    pub(crate) fn to_geo(&self) -> Polygon<f64> {
        Polygon::new(
            to_line_string(&self.exterior),
            self.interiors
                .iter()
                .map(|r| to_line_string(r))
                .filter(|r| !r.0.is_empty())
                .collect(),
        )
    }
}

/// Builds a closed ring. Rings with fewer than three distinct positions come out empty.
fn to_line_string(ring: &[(f64, f64)]) -> LineString<f64> {
    let mut coords: Vec<Coord<f64>> = ring.iter().map(|&(x, y)| Coord { x, y }).collect();
    coords.dedup();
    if coords.len() > 1 && coords.first() == coords.last() {
        coords.pop();
    }
    if coords.len() < 3 {
        return LineString::new(Vec::new());
    }
    let mut line = LineString::new(coords);
    line.close();
    line
}
