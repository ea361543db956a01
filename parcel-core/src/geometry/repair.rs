use geo::{
    Area as _, BooleanOps as _, Centroid as _, GeodesicArea as _, LineString, MultiPolygon, Polygon,
    Validation as _,
};

use super::GeoPolygon;

/// A parcel geometry that survived repair.
#[derive(Debug, Clone, PartialEq)]
pub struct RepairedGeometry {
    /// Valid polygons of the parcel.
    pub geometry: MultiPolygon<f64>,
    /// `(lon, lat)` of the area-weighted centroid.
    pub centroid: (f64, f64),
    /// Geodesic area in square meters.
    pub area_m2: f64,
    /// True if the input was invalid and had to be rebuilt.
    pub rebuilt: bool,
}

/// The parcel has no usable geometry left.
#[non_exhaustive]
#[derive(thiserror::Error, Debug, PartialEq)]
pub enum GeometryRepairError {
    /// No ring had three distinct positions.
    #[error("no ring with at least three distinct positions")]
    NoRings,

    /// Every polygon was empty or a sliver.
    #[error("no polygon larger than {min_area_m2} m² left after repair")]
    OnlySlivers {
        /// The configured sliver threshold.
        min_area_m2: f64,
    },
}

/// Closes, validates and filters parcel polygons, then locates their centroid.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeometryRepairer {
    min_ring_area_m2: f64,
}

impl GeometryRepairer {
    /// Rings with a geodesic area of at most `min_ring_area_m2` are discarded.
    /// Zero-area rings are always discarded.
    #[must_use]
    pub fn new(min_ring_area_m2: f64) -> Self {
        Self {
            min_ring_area_m2: min_ring_area_m2.max(0.0),
        }
    }

    /// Repairs all parts of one parcel as seen in one tile.
    pub fn repair(&self, polygons: &[GeoPolygon]) -> Result<RepairedGeometry, GeometryRepairError> {
        let parts: Vec<Polygon<f64>> = polygons
            .iter()
            .map(GeoPolygon::to_geo)
            .filter(|p| !p.exterior().0.is_empty())
            .collect();
        if parts.is_empty() {
            return Err(GeometryRepairError::NoRings);
        }

        let mut geometry = MultiPolygon::new(parts);
        let rebuilt = !geometry.is_valid();
        if rebuilt {
            // overlaying with nothing resolves self-intersections and overlapping parts
            geometry = geometry.union(&MultiPolygon::new(Vec::new()));
        }

        let geometry = self.drop_slivers(geometry);
        if geometry.0.is_empty() {
            return Err(GeometryRepairError::OnlySlivers {
                min_area_m2: self.min_ring_area_m2,
            });
        }

        Ok(RepairedGeometry {
            centroid: centroid(&geometry),
            area_m2: geometry.geodesic_area_unsigned(),
            geometry,
            rebuilt,
        })
    }

    fn drop_slivers(&self, geometry: MultiPolygon<f64>) -> MultiPolygon<f64> {
        geometry
            .into_iter()
            .filter_map(|polygon| {
                let (exterior, interiors) = polygon.into_inner();
                if ring_area(&exterior) <= self.min_ring_area_m2 {
                    return None;
                }
                let interiors = interiors
                    .into_iter()
                    .filter(|ring| ring_area(ring) > self.min_ring_area_m2)
                    .collect();
                Some(Polygon::new(exterior, interiors))
            })
            .collect()
    }
}

fn ring_area(ring: &LineString<f64>) -> f64 {
    Polygon::new(ring.clone(), Vec::new()).geodesic_area_unsigned()
}

#[expect(clippy::cast_precision_loss)]
fn centroid(geometry: &MultiPolygon<f64>) -> (f64, f64) {
    if geometry.unsigned_area() > 0.0
        && let Some(point) = geometry.centroid()
    {
        return point.x_y();
    }
    // mean of exterior vertices, skipping the closing position
    let (sum_x, sum_y, count) = geometry
        .iter()
        .flat_map(|p| {
            let coords = &p.exterior().0;
            &coords[..coords.len().saturating_sub(1)]
        })
        .fold((0.0, 0.0, 0_usize), |(x, y, n), c| (x + c.x, y + c.y, n + 1));
    if count == 0 {
        return (0.0, 0.0);
    }
    (sum_x / count as f64, sum_y / count as f64)
}
