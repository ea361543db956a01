use geozero::mvt::tile::{self, GeomType};
use geozero::mvt::{Command, CommandInteger, Message as _, ParameterInteger, Tile};
use parcel_tile_utils::{DEFAULT_EXTENT, TileCoord, decode_payload};
use serde::Serialize;
use tracing::{debug, warn};

use super::{CommandStreamError, DecodeError};
use crate::parcels::canonical_id;

/// Ordered `(px, py)` tile pixels. Closing the ring is left to the repair step.
pub type TileRing = Vec<(i32, i32)>;

/// One exterior ring and its holes, in tile-local pixels.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TilePolygon {
    /// Outer boundary, clockwise in tile space (Y down).
    pub exterior: TileRing,
    /// Holes, counter-clockwise in tile space.
    pub interiors: Vec<TileRing>,
}

/// A polygon feature of one tile.
#[derive(Debug, Clone, PartialEq)]
pub struct TileFeature {
    /// Canonical parcel id of the feature.
    pub parcel_id: String,
    /// Pixel extent of the layer the feature was read from.
    pub extent: u32,
    /// Parts of the feature, in stream order.
    pub polygons: Vec<TilePolygon>,
}

/// Counters of a single tile decode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DecodeStats {
    /// Features looked at in the selected layers.
    pub features: u64,
    /// Points, lines and untyped features.
    pub non_polygon: u64,
    /// Features with neither an id attribute nor a feature id.
    pub missing_id: u64,
    /// Features dropped because of a corrupt command stream.
    pub corrupt: u64,
}

impl DecodeStats {
    /// Number of features skipped for any reason.
    #[must_use]
    pub fn skipped(&self) -> u64 {
        self.non_polygon + self.missing_id + self.corrupt
    }
}

/// Polygon features of one tile.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedTile {
    /// The tile the features came from.
    pub tile: TileCoord,
    /// Features that decoded cleanly.
    pub features: Vec<TileFeature>,
    /// What was skipped on the way.
    pub stats: DecodeStats,
}

/// Reads parcel polygons out of vector tile payloads.
#[derive(Debug, Clone)]
pub struct MvtDecoder {
    default_extent: u32,
    id_field: Option<String>,
    layers: Vec<String>,
}

impl Default for MvtDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_EXTENT)
    }
}

impl MvtDecoder {
    /// A decoder reading every layer and using the feature id as the parcel id.
    ///
    /// `default_extent` applies to layers that do not declare their own extent.
    #[must_use]
    pub fn new(default_extent: u32) -> Self {
        Self {
            default_extent,
            id_field: None,
            layers: Vec::new(),
        }
    }

    /// Reads the parcel id from this attribute, falling back to the feature id.
    #[must_use]
    pub fn with_id_field(mut self, id_field: Option<String>) -> Self {
        self.id_field = id_field;
        self
    }

    /// Restricts decoding to the named layers. An empty list selects all layers.
    #[must_use]
    pub fn with_layers(mut self, layers: Vec<String>) -> Self {
        self.layers = layers;
        self
    }

    fn reads_layer(&self, name: &str) -> bool {
        self.layers.is_empty() || self.layers.iter().any(|l| l == name)
    }

    /// Decodes the polygon features of one tile.
    ///
    /// An empty payload is an empty tile. Problems with individual features are logged and
    /// counted in [`DecodeStats`]; only an unreadable payload is an error.
    pub fn decode(&self, tile: TileCoord, payload: &[u8]) -> Result<DecodedTile, DecodeError> {
        let mut decoded = DecodedTile {
            tile,
            features: Vec::new(),
            stats: DecodeStats::default(),
        };
        let payload = decode_payload(payload).map_err(DecodeError::Decompress)?;
        if payload.is_empty() {
            return Ok(decoded);
        }
        let mvt = Tile::decode(payload.as_ref())
            .map_err(|e| DecodeError::InvalidTile(e.to_string()))?;

        for layer in mvt.layers.iter().filter(|l| self.reads_layer(&l.name)) {
            let extent = layer
                .extent
                .filter(|&e| e > 0)
                .unwrap_or(self.default_extent);
            for feature in &layer.features {
                decoded.stats.features += 1;
                if feature.r#type != Some(GeomType::Polygon as i32) {
                    decoded.stats.non_polygon += 1;
                    continue;
                }
                let Some(parcel_id) = self.parcel_id(layer, feature) else {
                    debug!("Skipping feature without parcel id in layer {} of {tile}", layer.name);
                    decoded.stats.missing_id += 1;
                    continue;
                };
                match decode_rings(&feature.geometry) {
                    Ok(rings) => decoded.features.push(TileFeature {
                        parcel_id,
                        extent,
                        polygons: group_rings(rings),
                    }),
                    Err(e) => {
                        warn!("Dropping parcel {parcel_id} in layer {} of {tile}: {e}", layer.name);
                        decoded.stats.corrupt += 1;
                    }
                }
            }
        }
        Ok(decoded)
    }

    fn parcel_id(&self, layer: &tile::Layer, feature: &tile::Feature) -> Option<String> {
        self.id_field
            .as_deref()
            .and_then(|field| tag_value(layer, feature, field))
            .and_then(value_to_id)
            .or_else(|| feature.id.map(|id| id.to_string()))
    }
}

fn tag_value<'a>(layer: &'a tile::Layer, feature: &tile::Feature, key: &str) -> Option<&'a tile::Value> {
    feature.tags.chunks_exact(2).find_map(|pair| {
        let name = layer.keys.get(usize::try_from(pair[0]).ok()?)?;
        if name == key {
            layer.values.get(usize::try_from(pair[1]).ok()?)
        } else {
            None
        }
    })
}

#[expect(clippy::cast_precision_loss)]
fn value_to_id(value: &tile::Value) -> Option<String> {
    if let Some(s) = &value.string_value {
        let id = canonical_id(s);
        return (!id.is_empty()).then_some(id);
    }
    if let Some(v) = value.int_value.or(value.sint_value) {
        return Some(v.to_string());
    }
    if let Some(v) = value.uint_value {
        return Some(v.to_string());
    }
    let v = value.double_value.or(value.float_value.map(f64::from))?;
    if !v.is_finite() {
        return None;
    }
    if v.fract() == 0.0 && v.abs() < (1_u64 << 53) as f64 {
        Some(format!("{v:.0}"))
    } else {
        Some(v.to_string())
    }
}

/// Replays a polygon command stream into rings.
///
/// Coordinates are cumulative over the whole stream: the cursor is not reset between rings
/// or polygon parts.
fn decode_rings(geometry: &[u32]) -> Result<Vec<TileRing>, CommandStreamError> {
    let mut rings = Vec::new();
    let mut ring = TileRing::new();
    let (mut cx, mut cy) = (0_i32, 0_i32);
    let mut pos = 0;

    while let Some(&command) = geometry.get(pos) {
        let command_pos = pos;
        pos += 1;
        let command = CommandInteger(command);
        let count = command.count();
        let id = command.id();

        if id == Command::ClosePath as u32 {
            if ring.is_empty() {
                return Err(CommandStreamError::NoCurrentRing);
            }
            rings.push(std::mem::take(&mut ring));
            continue;
        }

        if id == Command::MoveTo as u32 {
            if count != 1 {
                return Err(CommandStreamError::RepeatedMoveTo(count));
            }
            // an unclosed ring ends where the next one starts
            if !ring.is_empty() {
                rings.push(std::mem::take(&mut ring));
            }
        } else if id == Command::LineTo as u32 {
            if ring.is_empty() {
                return Err(CommandStreamError::NoCurrentRing);
            }
        } else {
            return Err(CommandStreamError::UnknownCommand(id));
        }

        for _ in 0..count {
            let (Some(&dx), Some(&dy)) = (geometry.get(pos), geometry.get(pos + 1)) else {
                return Err(CommandStreamError::Truncated(command_pos));
            };
            pos += 2;
            cx = cx
                .checked_add(ParameterInteger(dx).value())
                .ok_or(CommandStreamError::Overflow)?;
            cy = cy
                .checked_add(ParameterInteger(dy).value())
                .ok_or(CommandStreamError::Overflow)?;
            ring.push((cx, cy));
        }
    }
    if !ring.is_empty() {
        rings.push(ring);
    }
    Ok(rings)
}

/// Twice the signed area of a ring by the surveyor's formula, positive for clockwise rings
/// in tile space.
fn signed_area2(ring: &[(i32, i32)]) -> i64 {
    let Some(&first) = ring.first() else {
        return 0;
    };
    ring.iter()
        .zip(ring.iter().skip(1).chain(std::iter::once(&first)))
        .map(|(&(x0, y0), &(x1, y1))| {
            i64::from(x0) * i64::from(y1) - i64::from(x1) * i64::from(y0)
        })
        .sum()
}

/// Groups rings into polygons: a clockwise ring starts a polygon, counter-clockwise rings are
/// holes of the polygon before them. A leading hole becomes a polygon of its own.
fn group_rings(rings: Vec<TileRing>) -> Vec<TilePolygon> {
    let mut polygons: Vec<TilePolygon> = Vec::new();
    for ring in rings {
        match polygons.last_mut() {
            Some(polygon) if signed_area2(&ring) < 0 => polygon.interiors.push(ring),
            _ => polygons.push(TilePolygon {
                exterior: ring,
                interiors: Vec::new(),
            }),
        }
    }
    polygons
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;
    use crate::tiles::mvt::{ParcelLayerBuilder, encode_point, encode_polygons, encode_tile};

    const TILE: TileCoord = TileCoord { z: 15, x: 20_654, y: 14_047 };

    fn square(x: i32, y: i32, size: i32) -> TileRing {
        vec![(x, y), (x + size, y), (x + size, y + size), (x, y + size)]
    }

    fn reversed(mut ring: TileRing) -> TileRing {
        ring.reverse();
        ring
    }

    #[test]
    fn command_stream_from_the_vector_tile_documentation() {
        // polygon example of Mapbox Vector Tile 2.1, section 4.3.5.3
        let geometry = [9, 6, 12, 18, 10, 12, 24, 44, 15];
        assert_eq!(
            decode_rings(&geometry).unwrap(),
            vec![vec![(3, 6), (8, 12), (20, 34)]]
        );
    }

    #[test]
    fn cursor_carries_across_rings() {
        let polygons = [
            TilePolygon {
                exterior: square(0, 0, 10),
                interiors: vec![],
            },
            TilePolygon {
                exterior: square(100, 100, 10),
                interiors: vec![],
            },
        ];
        let rings = decode_rings(&encode_polygons(&polygons)).unwrap();
        assert_eq!(rings, vec![square(0, 0, 10), square(100, 100, 10)]);
    }

    #[test]
    fn winding_groups_holes() {
        let rings = vec![
            square(0, 0, 100),
            reversed(square(10, 10, 10)),
            reversed(square(50, 50, 10)),
            square(200, 0, 50),
        ];
        let polygons = group_rings(rings);
        assert_eq!(polygons.len(), 2);
        assert_eq!(polygons[0].interiors.len(), 2);
        assert_eq!(polygons[1].exterior, square(200, 0, 50));
        assert!(polygons[1].interiors.is_empty());
    }

    #[test]
    fn leading_hole_is_its_own_polygon() {
        let polygons = group_rings(vec![reversed(square(0, 0, 10)), square(20, 20, 5)]);
        assert_eq!(polygons.len(), 2);
    }

    #[rstest]
    #[case::unknown_command(vec![9, 0, 0, 4], CommandStreamError::UnknownCommand(4))]
    #[case::truncated(vec![9, 2, 2, 18, 2], CommandStreamError::Truncated(3))]
    #[case::line_before_move(vec![10, 2, 2], CommandStreamError::NoCurrentRing)]
    #[case::close_before_move(vec![15], CommandStreamError::NoCurrentRing)]
    #[case::double_move(vec![17, 2, 2, 4, 4], CommandStreamError::RepeatedMoveTo(2))]
    #[case::overflow(vec![9, 0xFFFF_FFFE, 0, 10, 0xFFFF_FFFE, 0], CommandStreamError::Overflow)]
    fn corrupt_streams(#[case] geometry: Vec<u32>, #[case] expected: CommandStreamError) {
        assert_eq!(decode_rings(&geometry), Err(expected));
    }

    #[test]
    fn decode_tile() {
        let mut parcels = ParcelLayerBuilder::new("parcels", 4096).with_id_field("parcel_id");
        parcels.add_tagged_polygon(
            "1001",
            &[TilePolygon {
                exterior: square(0, 0, 100),
                interiors: vec![reversed(square(10, 10, 10))],
            }],
        );
        parcels.add_tagged_polygon(
            "1002.0",
            &[TilePolygon {
                exterior: square(300, 300, 50),
                interiors: vec![],
            }],
        );
        // no attribute: falls back to the feature id
        parcels.add_polygon(Some(77), &[TilePolygon {
            exterior: square(500, 500, 20),
            interiors: vec![],
        }]);
        parcels.add_polygon(None, &[TilePolygon {
            exterior: square(600, 600, 20),
            interiors: vec![],
        }]);
        parcels.add_raw(Some(5), GeomType::Point, encode_point(1, 1));
        parcels.add_raw(Some(6), GeomType::Polygon, vec![10, 2, 2]);

        let mut labels = ParcelLayerBuilder::new("labels", 512);
        labels.add_polygon(Some(1), &[TilePolygon {
            exterior: square(0, 0, 10),
            interiors: vec![],
        }]);

        let payload = encode_tile(vec![parcels.build(), labels.build()]);
        let decoder = MvtDecoder::new(4096)
            .with_id_field(Some("parcel_id".to_string()))
            .with_layers(vec!["parcels".to_string()]);
        let decoded = decoder.decode(TILE, &payload).unwrap();

        let ids: Vec<&str> = decoded.features.iter().map(|f| f.parcel_id.as_str()).collect();
        assert_eq!(ids, vec!["1001", "1002", "77"]);
        assert_eq!(decoded.features[0].polygons[0].interiors.len(), 1);
        assert_eq!(
            decoded.stats,
            DecodeStats {
                features: 6,
                non_polygon: 1,
                missing_id: 1,
                corrupt: 1,
            }
        );

        let all_layers = MvtDecoder::new(4096).decode(TILE, &payload).unwrap();
        let label = all_layers.features.last().unwrap();
        assert_eq!(label.extent, 512);
    }

    #[test]
    fn empty_and_compressed_payloads() {
        let decoder = MvtDecoder::default();
        let empty = decoder.decode(TILE, &[]).unwrap();
        assert!(empty.features.is_empty());

        let mut layer = ParcelLayerBuilder::new("parcels", 4096);
        layer.add_polygon(Some(9), &[TilePolygon {
            exterior: square(0, 0, 10),
            interiors: vec![],
        }]);
        let compressed = gzip(&encode_tile(vec![layer.build()]));
        let decoded = decoder.decode(TILE, &compressed).unwrap();
        assert_eq!(decoded.features.len(), 1);
    }

    #[test]
    fn garbage_payload_fails_the_tile() {
        let err = MvtDecoder::default()
            .decode(TILE, b"<html>rate limited</html>")
            .unwrap_err();
        assert!(matches!(err, DecodeError::InvalidTile(_)), "{err:?}");
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        use std::io::Write as _;

        use flate2::Compression;
        use flate2::write::GzEncoder;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }
}
