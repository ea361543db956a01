//! Parcels reassembled from many tiles.
//!
//! A parcel that straddles tile boundaries shows up once per tile, each time clipped (with a
//! buffer) to that tile. [`Parcel::merge`] picks one observation as the representative and
//! keeps track of every tile the parcel was seen in. The choice depends only on the
//! observations, never on the order they arrive in.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parcel_tile_utils::TileCoord;
use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, serde_as};

use crate::geometry::RepairedGeometry;

/// A parcel as reconstructed from vector tiles.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parcel {
    /// Identifier shared by all tiles showing this parcel.
    pub parcel_id: String,
    /// `(lon, lat)` of the representative observation. `None` for invalid geometry.
    pub centroid: Option<(f64, f64)>,
    /// Geodesic area of the representative observation in square meters.
    pub area_m2: f64,
    /// Every tile the parcel was observed in.
    #[serde_as(as = "BTreeSet<DisplayFromStr>")]
    pub source_tiles: BTreeSet<TileCoord>,
    /// Whether any observation survived geometry repair.
    pub geometry_valid: bool,
}

impl Parcel {
    /// An observation whose geometry was repaired successfully.
    #[must_use]
    pub fn observed(parcel_id: String, tile: TileCoord, geometry: &RepairedGeometry) -> Self {
        Self {
            parcel_id,
            centroid: Some(geometry.centroid),
            area_m2: geometry.area_m2,
            source_tiles: BTreeSet::from([tile]),
            geometry_valid: true,
        }
    }

    /// An observation whose geometry could not be repaired.
    #[must_use]
    pub fn invalid(parcel_id: String, tile: TileCoord) -> Self {
        Self {
            parcel_id,
            centroid: None,
            area_m2: 0.0,
            source_tiles: BTreeSet::from([tile]),
            geometry_valid: false,
        }
    }

    /// Combines two observations of the same parcel.
    ///
    /// Valid geometry beats invalid, then the larger area wins, then the centroid decides.
    /// The result is the same whichever observation is `self`.
    #[must_use]
    pub fn merge(mut self, other: Self) -> Self {
        self.absorb(other);
        self
    }

    /// In-place form of [`Self::merge`].
    pub fn absorb(&mut self, mut other: Self) {
        debug_assert_eq!(self.parcel_id, other.parcel_id);
        if other.rank(self) == Ordering::Greater {
            std::mem::swap(self, &mut other);
        }
        self.source_tiles.append(&mut other.source_tiles);
    }

    fn rank(&self, other: &Self) -> Ordering {
        self.geometry_valid
            .cmp(&other.geometry_valid)
            .then_with(|| self.area_m2.total_cmp(&other.area_m2))
            .then_with(|| cmp_centroid(self.centroid, other.centroid))
    }
}

fn cmp_centroid(a: Option<(f64, f64)>, b: Option<(f64, f64)>) -> Ordering {
    match (a, b) {
        (Some((ax, ay)), Some((bx, by))) => ax.total_cmp(&bx).then_with(|| ay.total_cmp(&by)),
        (a, b) => a.is_some().cmp(&b.is_some()),
    }
}

/// Normalizes a parcel id read from a tile attribute or a spreadsheet.
///
/// Integer ids that went through a floating point column (`"12345.0"`) lose the fraction.
#[must_use]
pub fn canonical_id(raw: &str) -> String {
    let id = raw.trim();
    match id.strip_suffix(".0") {
        Some(int) if !int.is_empty() && int.bytes().all(|b| b.is_ascii_digit()) => int.to_string(),
        _ => id.to_string(),
    }
}

/// Output order of parcel ids: numeric ids by value, then all other ids lexicographically.
#[must_use]
pub fn cmp_parcel_ids(a: &str, b: &str) -> Ordering {
    fn numeric(id: &str) -> Option<&str> {
        (!id.is_empty() && id.bytes().all(|b| b.is_ascii_digit())).then(|| id.trim_start_matches('0'))
    }
    match (numeric(a), numeric(b)) {
        (Some(na), Some(nb)) => na.len().cmp(&nb.len()).then_with(|| na.cmp(nb)).then_with(|| a.cmp(b)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

/// Concurrent map of parcel id to the merged parcel.
///
/// Each insert locks only the shard holding that parcel id.
#[derive(Debug, Default)]
pub struct ParcelDeduplicator {
    parcels: DashMap<String, Parcel>,
}

impl ParcelDeduplicator {
    /// An empty deduplicator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an observation, merging it with what is known about the parcel.
    pub fn insert(&self, parcel: Parcel) {
        match self.parcels.entry(parcel.parcel_id.clone()) {
            Entry::Occupied(mut entry) => entry.get_mut().absorb(parcel),
            Entry::Vacant(entry) => {
                entry.insert(parcel);
            }
        }
    }

    /// Number of distinct parcel ids seen.
    #[must_use]
    pub fn len(&self) -> usize {
        self.parcels.len()
    }

    /// True when nothing was inserted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parcels.is_empty()
    }

    /// Number of parcels without a single valid observation.
    #[must_use]
    pub fn invalid_count(&self) -> usize {
        self.parcels.iter().filter(|p| !p.geometry_valid).count()
    }

    /// A copy of one parcel.
    #[must_use]
    pub fn get(&self, parcel_id: &str) -> Option<Parcel> {
        self.parcels.get(parcel_id).map(|p| p.clone())
    }

    /// Valid parcels ordered by [`cmp_parcel_ids`].
    #[must_use]
    pub fn valid_sorted(&self) -> Vec<Parcel> {
        let mut parcels: Vec<Parcel> = self
            .parcels
            .iter()
            .filter(|p| p.geometry_valid)
            .map(|p| p.clone())
            .collect();
        parcels.sort_by(|a, b| cmp_parcel_ids(&a.parcel_id, &b.parcel_id));
        parcels
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn tile(x: u32) -> TileCoord {
        TileCoord { z: 16, x, y: 100 }
    }

    fn valid(id: &str, x: u32, area: f64, centroid: (f64, f64)) -> Parcel {
        Parcel {
            parcel_id: id.to_string(),
            centroid: Some(centroid),
            area_m2: area,
            source_tiles: BTreeSet::from([tile(x)]),
            geometry_valid: true,
        }
    }

    #[test]
    fn larger_area_wins_and_tiles_union() {
        let a = valid("7", 1, 120.0, (46.1, 24.1));
        let b = valid("7", 2, 480.0, (46.2, 24.2));
        let merged = a.clone().merge(b.clone());
        assert_eq!(merged, b.clone().merge(a));
        assert_eq!(merged.centroid, Some((46.2, 24.2)));
        assert_eq!(merged.source_tiles, BTreeSet::from([tile(1), tile(2)]));
    }

    #[test]
    fn valid_beats_invalid() {
        let good = valid("7", 1, 1.0, (46.1, 24.1));
        let bad = Parcel::invalid("7".to_string(), tile(2));
        let merged = bad.clone().merge(good.clone());
        assert!(merged.geometry_valid);
        assert_eq!(merged, good.merge(bad));
    }

    #[test]
    fn equal_area_tie_breaks_on_centroid() {
        let a = valid("7", 1, 100.0, (46.1, 24.1));
        let b = valid("7", 2, 100.0, (46.1, 24.3));
        assert_eq!(a.clone().merge(b.clone()).centroid, Some((46.1, 24.3)));
        assert_eq!(b.merge(a).centroid, Some((46.1, 24.3)));
    }

    #[test]
    fn merge_is_associative() {
        let a = valid("7", 1, 100.0, (1.0, 1.0));
        let b = valid("7", 2, 300.0, (2.0, 2.0));
        let c = Parcel::invalid("7".to_string(), tile(3));
        let left = a.clone().merge(b.clone()).merge(c.clone());
        let right = a.merge(b.merge(c));
        assert_eq!(left, right);
    }

    #[test]
    fn dedup_is_order_independent() {
        let observations = vec![
            valid("10", 1, 50.0, (46.0, 24.0)),
            valid("9", 1, 10.0, (46.5, 24.5)),
            valid("10", 2, 70.0, (46.1, 24.0)),
            Parcel::invalid("11".to_string(), tile(2)),
            valid("10", 3, 20.0, (46.2, 24.0)),
        ];
        let forward = ParcelDeduplicator::new();
        observations.iter().cloned().for_each(|p| forward.insert(p));
        let backward = ParcelDeduplicator::new();
        observations.into_iter().rev().for_each(|p| backward.insert(p));

        assert_eq!(forward.valid_sorted(), backward.valid_sorted());
        assert_eq!(forward.len(), 3);
        assert_eq!(forward.invalid_count(), 1);

        let ids: Vec<String> = forward.valid_sorted().into_iter().map(|p| p.parcel_id).collect();
        assert_eq!(ids, vec!["9", "10"]);
        assert_eq!(forward.get("10").unwrap().source_tiles.len(), 3);
    }

    #[rstest]
    #[case("12345.0", "12345")]
    #[case(" 12345 ", "12345")]
    #[case("12345.05", "12345.05")]
    #[case("A-17.0", "A-17.0")]
    #[case(".0", ".0")]
    fn canonical_ids(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(canonical_id(raw), expected);
    }

    #[test]
    fn id_ordering() {
        let mut ids = vec!["b", "10", "9", "a", "009", "100"];
        ids.sort_by(|a, b| cmp_parcel_ids(a, b));
        assert_eq!(ids, vec!["009", "9", "10", "100", "a", "b"]);
    }

    #[test]
    fn journal_form() {
        let parcel = Parcel {
            source_tiles: BTreeSet::from([tile(2), tile(1)]),
            ..valid("7", 1, 12.5, (46.25, 24.5))
        };
        insta::assert_json_snapshot!(parcel, @r#"
        {
          "parcel_id": "7",
          "centroid": [
            46.25,
            24.5
          ],
          "area_m2": 12.5,
          "source_tiles": [
            "16/1/100",
            "16/2/100"
          ],
          "geometry_valid": true
        }
        "#);
    }

    #[test]
    fn journaled_parcels_restore_bit_for_bit() {
        use crate::checkpoint::{CheckpointStore, FlushPolicy, Stage};

        // xorshift, so the values are the same on every run
        let mut state = 0x2545_f491_4f6c_dd1d_u64;
        let mut next = move |low: f64, high: f64| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            #[expect(clippy::cast_precision_loss)]
            let unit = (state >> 11) as f64 / (1_u64 << 53) as f64;
            low + unit * (high - low)
        };
        let parcels: Vec<Parcel> = (0..5000)
            .map(|i| {
                let centroid = (next(46.0, 47.0), next(24.0, 25.0));
                valid(&i.to_string(), i, next(1.0, 1e6), centroid)
            })
            .collect();

        let dir = tempfile::tempdir().unwrap();
        let (mut store, _) =
            CheckpointStore::open(dir.path(), Stage::Tiles, FlushPolicy::default(), false)
                .unwrap();
        store.complete("16/1/100".to_string(), &parcels).unwrap();
        store.flush().unwrap();
        drop(store);

        let (_, journal) = CheckpointStore::<Vec<Parcel>>::open(
            dir.path(),
            Stage::Tiles,
            FlushPolicy::default(),
            false,
        )
        .unwrap();
        let restored = &journal[0].value;
        assert_eq!(restored.len(), parcels.len());
        for (before, after) in parcels.iter().zip(restored) {
            let (lon, lat) = before.centroid.unwrap();
            let (rlon, rlat) = after.centroid.unwrap();
            assert_eq!(lon.to_bits(), rlon.to_bits(), "lon of {}", before.parcel_id);
            assert_eq!(lat.to_bits(), rlat.to_bits(), "lat of {}", before.parcel_id);
            assert_eq!(before.area_m2.to_bits(), after.area_m2.to_bits());
        }
    }
}
