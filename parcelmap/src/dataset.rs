//! CSV files exchanged between the stages.
//!
//! Outputs are always rewritten as a whole: the rows go to a temporary file next to the target,
//! which then replaces it. A crash never leaves a half-written dataset behind.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};

use parcel_core::enrich::{EnrichmentRecord, FieldRegistry};
use parcel_core::parcels::{Parcel, canonical_id};
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Name of the column holding parcel ids in both datasets.
pub const PARCEL_ID_COLUMN: &str = "parcel_id";

#[derive(thiserror::Error, Debug)]
pub enum DatasetError {
    #[error("Unable to read {1}: {0}")]
    ReadError(#[source] csv::Error, PathBuf),

    #[error("Unable to write {1}: {0}")]
    WriteError(#[source] csv::Error, PathBuf),

    #[error("IO error {1}: {0}")]
    IoError(#[source] std::io::Error, PathBuf),

    #[error("Unable to replace {1}: {0}")]
    PersistError(#[source] tempfile::PersistError, PathBuf),

    #[error("{0} has no {PARCEL_ID_COLUMN} column")]
    MissingColumn(PathBuf),
}

/// Writes rows to `path` atomically. `write` receives a writer over a temporary file.
fn write_atomically<F>(path: &Path, write: F) -> Result<(), DatasetError>
where
    F: FnOnce(&mut csv::Writer<&mut File>) -> Result<(), csv::Error>,
{
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(|e| DatasetError::IoError(e, dir.to_path_buf()))?;
    let mut tmp =
        NamedTempFile::new_in(dir).map_err(|e| DatasetError::IoError(e, dir.to_path_buf()))?;
    {
        let mut writer = csv::Writer::from_writer(tmp.as_file_mut());
        write(&mut writer).map_err(|e| DatasetError::WriteError(e, path.to_path_buf()))?;
        writer
            .flush()
            .map_err(|e| DatasetError::IoError(e, path.to_path_buf()))?;
    }
    tmp.as_file()
        .sync_all()
        .map_err(|e| DatasetError::IoError(e, path.to_path_buf()))?;
    tmp.persist(path)
        .map_err(|e| DatasetError::PersistError(e, path.to_path_buf()))?;
    Ok(())
}

/// Writes the parcel centroid dataset: `parcel_id, latitude, longitude`, in the given order.
/// Parcels without a centroid are left out.
pub fn write_parcels(path: &Path, parcels: &[Parcel]) -> Result<usize, DatasetError> {
    let mut written = 0;
    write_atomically(path, |writer| {
        writer.write_record([PARCEL_ID_COLUMN, "latitude", "longitude"])?;
        for parcel in parcels {
            if let Some((lon, lat)) = parcel.centroid {
                writer.write_record([&parcel.parcel_id, &lat.to_string(), &lon.to_string()])?;
                written += 1;
            }
        }
        Ok(())
    })?;
    info!("Wrote {written} parcels to {}", path.display());
    Ok(written)
}

/// A row of the parcel dataset. The coordinates are kept as written, empty when the file has
/// no such column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputParcel {
    pub parcel_id: String,
    pub latitude: String,
    pub longitude: String,
}

/// Reads a parcel dataset, in file order.
///
/// Ids are canonicalized, so `1234.0` and `1234` are the same parcel. Empty and repeated ids
/// are dropped.
pub fn read_parcels(path: &Path) -> Result<Vec<InputParcel>, DatasetError> {
    let mut reader =
        csv::Reader::from_path(path).map_err(|e| DatasetError::ReadError(e, path.to_path_buf()))?;
    let headers = reader
        .headers()
        .map_err(|e| DatasetError::ReadError(e, path.to_path_buf()))?
        .clone();
    let position = |column: &str| headers.iter().position(|name| name.trim() == column);
    let id_column =
        position(PARCEL_ID_COLUMN).ok_or_else(|| DatasetError::MissingColumn(path.to_path_buf()))?;
    let lat_column = position("latitude");
    let lon_column = position("longitude");

    let mut seen = HashSet::new();
    let mut parcels = Vec::new();
    let mut dropped = 0_usize;
    for row in reader.records() {
        let row = row.map_err(|e| DatasetError::ReadError(e, path.to_path_buf()))?;
        let id = canonical_id(row.get(id_column).unwrap_or_default());
        if id.is_empty() || !seen.insert(id.clone()) {
            dropped += 1;
            continue;
        }
        let cell = |column: Option<usize>| {
            column
                .and_then(|c| row.get(c))
                .map(|v| v.trim().to_string())
                .unwrap_or_default()
        };
        parcels.push(InputParcel {
            parcel_id: id,
            latitude: cell(lat_column),
            longitude: cell(lon_column),
        });
    }
    if dropped > 0 {
        debug!("Dropped {dropped} empty or repeated parcel ids of {}", path.display());
    }
    info!("Read {} parcels from {}", parcels.len(), path.display());
    Ok(parcels)
}

/// Reads the parcel ids of a parcel dataset, in file order. See [`read_parcels`].
pub fn read_parcel_ids(path: &Path) -> Result<Vec<String>, DatasetError> {
    Ok(read_parcels(path)?
        .into_iter()
        .map(|parcel| parcel.parcel_id)
        .collect())
}

/// Writes the enriched dataset: the reserved columns, then the registry's attribute columns.
/// Latitude and longitude are copied from the matching row of `parcels`.
pub fn write_records(
    path: &Path,
    registry: &FieldRegistry,
    records: &[EnrichmentRecord],
    parcels: &[InputParcel],
) -> Result<(), DatasetError> {
    let locations: HashMap<&str, [&str; 2]> = parcels
        .iter()
        .map(|p| (p.parcel_id.as_str(), [p.latitude.as_str(), p.longitude.as_str()]))
        .collect();
    write_atomically(path, |writer| {
        writer.write_record(registry.header())?;
        for record in records {
            let location = locations
                .get(record.parcel_id.as_str())
                .copied()
                .unwrap_or_default();
            let row = registry.row(record, location);
            writer.write_record(row.iter().map(|cell| cell.as_bytes()))?;
        }
        Ok(())
    })?;
    info!(
        "Wrote {} records with {} attribute columns to {}",
        records.len(),
        registry.len(),
        path.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use indoc::indoc;
    use parcel_core::enrich::{ApiStatus, normalize_response};
    use parcel_tile_utils::TileCoord;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn parcel(id: &str, centroid: Option<(f64, f64)>) -> Parcel {
        Parcel {
            parcel_id: id.to_string(),
            centroid,
            area_m2: 100.0,
            source_tiles: BTreeSet::from([TileCoord { z: 16, x: 1, y: 2 }]),
            geometry_valid: centroid.is_some(),
        }
    }

    #[test]
    fn parcels_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("parcels.csv");
        let parcels = [
            parcel("A-1", Some((-122.4194, 37.7749))),
            parcel("A-2", None),
            parcel("B,1", Some((2.5, -33.0))),
        ];
        assert_eq!(write_parcels(&path, &parcels).unwrap(), 2);

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            written,
            indoc! {r#"
                parcel_id,latitude,longitude
                A-1,37.7749,-122.4194
                "B,1",-33,2.5
            "#}
        );
        assert_eq!(read_parcel_ids(&path).unwrap(), ["A-1", "B,1"]);
    }

    #[test]
    fn rewrite_replaces_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parcels.csv");
        write_parcels(&path, &[parcel("1", Some((0.0, 0.0))), parcel("2", Some((0.0, 0.0)))])
            .unwrap();
        write_parcels(&path, &[parcel("3", Some((0.0, 0.0)))]).unwrap();
        assert_eq!(read_parcel_ids(&path).unwrap(), ["3"]);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn ids_are_canonical_and_unique() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parcels.csv");
        std::fs::write(
            &path,
            indoc! {"
                latitude,parcel_id,longitude
                1,1234.0,2
                1,5678,2
                1,1234,2
                1,,2
                1, 42 ,2
            "},
        )
        .unwrap();
        assert_eq!(read_parcel_ids(&path).unwrap(), ["1234", "5678", "42"]);
    }

    #[test]
    fn locations_are_read_as_written() {
        let dir = tempfile::tempdir().unwrap();
        let with_location = dir.path().join("parcels.csv");
        std::fs::write(&with_location, "parcel_id,latitude,longitude
7.0,37.77490, -122.4
")
            .unwrap();
        assert_eq!(
            read_parcels(&with_location).unwrap(),
            [InputParcel {
                parcel_id: "7".to_string(),
                latitude: "37.77490".to_string(),
                longitude: "-122.4".to_string(),
            }]
        );

        let ids_only = dir.path().join("ids.csv");
        std::fs::write(&ids_only, "parcel_id
7
").unwrap();
        let parcels = read_parcels(&ids_only).unwrap();
        assert_eq!((parcels[0].latitude.as_str(), parcels[0].longitude.as_str()), ("", ""));
    }

    #[test]
    fn missing_id_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parcels.csv");
        std::fs::write(&path, "id,latitude\n1,2\n").unwrap();
        assert!(matches!(
            read_parcel_ids(&path),
            Err(DatasetError::MissingColumn(p)) if p == path
        ));
        assert!(matches!(
            read_parcel_ids(&dir.path().join("missing.csv")),
            Err(DatasetError::ReadError(..))
        ));
    }

    #[test]
    fn records_use_the_registry_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("enriched.csv");
        let mut registry = FieldRegistry::new();
        let mut records = Vec::new();
        let parcels = [
            InputParcel {
                parcel_id: "1".to_string(),
                latitude: "37.7749".to_string(),
                longitude: "-122.4194".to_string(),
            },
        ];
        for (id, response) in [
            ("1", json!({"zone": "R1", "data": [{"use": "home"}, {"use": "shop", "max": 2}]})),
            ("2", json!({"zone": "C2", "note": "corner, lot"})),
        ] {
            for record in normalize_response(id, &response, "data").records {
                registry.observe(&record);
                records.push(record);
            }
        }
        let missing = EnrichmentRecord::without_response("3", ApiStatus::NotFound);
        registry.observe(&missing);
        records.push(missing);
        write_records(&path, &registry, &records, &parcels).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            indoc! {r#"
                parcel_id,latitude,longitude,rule_index,api_status,zone,use,max,note
                1,37.7749,-122.4194,0,SUCCESS,R1,home,,
                1,37.7749,-122.4194,1,SUCCESS,R1,shop,2,
                2,,,0,NO_DATA_IN_LIST,C2,,,"corner, lot"
                3,,,0,NOT_FOUND,,,,
            "#}
        );
    }
}
