use geozero::mvt::tile::{self, GeomType};
use geozero::mvt::{Command, CommandInteger, Message as _, ParameterInteger, Tile};

use super::TilePolygon;

/// Builds a vector tile layer of parcel polygons.
///
/// Builds tile fixtures; available in tests and with the `test-fixtures` feature.
#[derive(Debug)]
pub struct ParcelLayerBuilder {
    name: String,
    extent: u32,
    id_field: String,
    keys: Vec<String>,
    values: Vec<tile::Value>,
    features: Vec<tile::Feature>,
}

impl ParcelLayerBuilder {
    /// An empty layer.
    #[must_use]
    pub fn new(name: impl Into<String>, extent: u32) -> Self {
        Self {
            name: name.into(),
            extent,
            id_field: "parcel_id".to_string(),
            keys: Vec::new(),
            values: Vec::new(),
            features: Vec::new(),
        }
    }

    /// Attribute name written by [`Self::add_tagged_polygon`].
    #[must_use]
    pub fn with_id_field(mut self, id_field: impl Into<String>) -> Self {
        self.id_field = id_field.into();
        self
    }

    /// Adds a polygon feature identified by its protobuf feature id.
    pub fn add_polygon(&mut self, id: Option<u64>, polygons: &[TilePolygon]) {
        self.add_raw(id, GeomType::Polygon, encode_polygons(polygons));
    }

    /// Adds a polygon feature identified by a string attribute.
    pub fn add_tagged_polygon(&mut self, parcel_id: &str, polygons: &[TilePolygon]) {
        let key = self.key_index(self.id_field.clone());
        let value = self.value_index(parcel_id);
        self.features.push(tile::Feature {
            id: None,
            tags: vec![key, value],
            r#type: Some(GeomType::Polygon as i32),
            geometry: encode_polygons(polygons),
        });
    }

    /// Adds a feature with an arbitrary, possibly invalid, geometry command stream.
    pub fn add_raw(&mut self, id: Option<u64>, geom_type: GeomType, geometry: Vec<u32>) {
        self.features.push(tile::Feature {
            id,
            tags: Vec::new(),
            r#type: Some(geom_type as i32),
            geometry,
        });
    }

    /// Number of features added so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.features.len()
    }

    /// True when no feature has been added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Finishes the layer.
    #[must_use]
    pub fn build(self) -> tile::Layer {
        tile::Layer {
            version: 2,
            name: self.name,
            features: self.features,
            keys: self.keys,
            values: self.values,
            extent: Some(self.extent),
        }
    }

    fn key_index(&mut self, key: String) -> u32 {
        let idx = match self.keys.iter().position(|k| *k == key) {
            Some(idx) => idx,
            None => {
                self.keys.push(key);
                self.keys.len() - 1
            }
        };
        index_u32(idx)
    }

    fn value_index(&mut self, value: &str) -> u32 {
        let idx = self
            .values
            .iter()
            .position(|v| v.string_value.as_deref() == Some(value));
        let idx = idx.unwrap_or_else(|| {
            self.values.push(tile::Value {
                string_value: Some(value.to_string()),
                ..Default::default()
            });
            self.values.len() - 1
        });
        index_u32(idx)
    }
}

#[expect(clippy::cast_possible_truncation)]
fn index_u32(idx: usize) -> u32 {
    idx as u32
}

/// Serializes layers into an uncompressed vector tile.
#[must_use]
pub fn encode_tile(layers: Vec<tile::Layer>) -> Vec<u8> {
    Tile { layers }.encode_to_vec()
}

/// Command stream of a single point.
#[must_use]
pub fn encode_point(x: i32, y: i32) -> Vec<u32> {
    vec![
        CommandInteger::from(Command::MoveTo, 1),
        ParameterInteger::from(x),
        ParameterInteger::from(y),
    ]
}

/// Command stream of polygon parts, exteriors followed by their holes.
///
/// Rings may be given open or closed; a repeated first point is not written since
/// `ClosePath` implies it.
#[must_use]
pub fn encode_polygons(polygons: &[TilePolygon]) -> Vec<u32> {
    let mut encoded = Vec::new();
    let mut cursor = (0, 0);
    for polygon in polygons {
        for ring in std::iter::once(&polygon.exterior).chain(&polygon.interiors) {
            encode_ring(&mut encoded, &mut cursor, ring);
        }
    }
    encoded
}

fn encode_ring(encoded: &mut Vec<u32>, cursor: &mut (i32, i32), ring: &[(i32, i32)]) {
    let ring = match ring {
        [first, .., last] if first == last => &ring[..ring.len() - 1],
        _ => ring,
    };
    let Some((&first, rest)) = ring.split_first() else {
        return;
    };

    encoded.push(CommandInteger::from(Command::MoveTo, 1));
    push_delta(encoded, cursor, first);
    if !rest.is_empty() {
        encoded.push(CommandInteger::from(Command::LineTo, index_u32(rest.len())));
        for &point in rest {
            push_delta(encoded, cursor, point);
        }
    }
    encoded.push(CommandInteger::from(Command::ClosePath, 1));
}

fn push_delta(encoded: &mut Vec<u32>, cursor: &mut (i32, i32), (x, y): (i32, i32)) {
    encoded.push(ParameterInteger::from(x - cursor.0));
    encoded.push(ParameterInteger::from(y - cursor.1));
    *cursor = (x, y);
}
