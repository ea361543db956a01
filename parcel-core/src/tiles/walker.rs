use std::sync::Arc;

use parcel_tile_utils::{TileCoord, TileProjection, TileRange, push_disjoint};
use tilejson::Bounds;
use tracing::{debug, info};

use super::mvt::{DecodeError, MvtDecoder};
use crate::ParcelCoreResult;
use crate::checkpoint::{CheckpointStore, JournalEntry, Stage};
use crate::fetch::{FetchEngine, ItemOutcome, Transport, TransportError};
use crate::geometry::{GeoPolygon, GeometryRepairer};
use crate::parcels::{Parcel, ParcelDeduplicator};
use crate::stats::{ProgressSink, StageReport, TileCounters};

/// Turns one tile payload into parcel observations: decode, project, repair.
#[derive(Debug, Clone)]
pub struct TileProcessor {
    decoder: MvtDecoder,
    repairer: GeometryRepairer,
}

impl TileProcessor {
    /// A processor reading tiles with `decoder` and repairing polygons with `repairer`.
    #[must_use]
    pub fn new(decoder: MvtDecoder, repairer: GeometryRepairer) -> Self {
        Self { decoder, repairer }
    }

    /// One observation per parcel feature of the tile. Features whose geometry cannot be
    /// repaired are returned as invalid observations.
    pub fn process(
        &self,
        tile: TileCoord,
        payload: &[u8],
        counters: &TileCounters,
    ) -> Result<Vec<Parcel>, DecodeError> {
        let decoded = self.decoder.decode(tile, payload)?;
        counters.add_decoded(&decoded.stats);

        let mut parcels = Vec::with_capacity(decoded.features.len());
        for feature in decoded.features {
            let projection = TileProjection::new(tile, feature.extent);
            let polygons: Vec<GeoPolygon> = feature
                .polygons
                .iter()
                .map(|p| GeoPolygon::project(p, &projection))
                .collect();
            match self.repairer.repair(&polygons) {
                Ok(repaired) => {
                    if repaired.rebuilt {
                        counters.add_rebuilt();
                    }
                    parcels.push(Parcel::observed(feature.parcel_id, tile, &repaired));
                }
                Err(e) => {
                    debug!("Parcel {} in tile {tile} has no usable geometry: {e}", feature.parcel_id);
                    counters.add_unrepairable();
                    parcels.push(Parcel::invalid(feature.parcel_id, tile));
                }
            }
        }
        Ok(parcels)
    }
}

/// Walks the tile grid over a set of bounding boxes at one zoom level and collects the parcels
/// of every tile into a shared [`ParcelDeduplicator`].
#[derive(Debug)]
pub struct TileGridWalker {
    zoom: u8,
    processor: Arc<TileProcessor>,
    counters: Arc<TileCounters>,
    parcels: Arc<ParcelDeduplicator>,
}

impl TileGridWalker {
    /// A walker over the tiles of `zoom`, collecting parcels into `parcels`.
    #[must_use]
    pub fn new(zoom: u8, processor: TileProcessor, parcels: Arc<ParcelDeduplicator>) -> Self {
        Self {
            zoom,
            processor: Arc::new(processor),
            counters: Arc::default(),
            parcels,
        }
    }

    /// The parcels collected so far.
    #[must_use]
    pub fn parcels(&self) -> &Arc<ParcelDeduplicator> {
        &self.parcels
    }

    /// Non-overlapping tile ranges covering all `bboxes`.
    #[must_use]
    pub fn plan(&self, bboxes: &[Bounds]) -> Vec<TileRange> {
        let mut ranges = Vec::new();
        for bbox in bboxes {
            let range = TileRange::covering(bbox.left, bbox.bottom, bbox.right, bbox.top, self.zoom);
            push_disjoint(&mut ranges, range);
        }
        ranges
    }

    /// Feeds the observations recorded by earlier runs back into the deduplicator.
    /// Returns the number of observations replayed.
    pub fn restore(&self, journal: Vec<JournalEntry<Vec<Parcel>>>) -> usize {
        let mut count = 0;
        for entry in journal {
            count += entry.value.len();
            for parcel in entry.value {
                self.parcels.insert(parcel);
            }
        }
        count
    }

    /// Fetches and processes every tile of `bboxes` that the checkpoint does not have yet.
    ///
    /// Tiles that fail for good are listed in the report and in the checkpoint's skipped file;
    /// they are tried again by the next run.
    pub async fn run<T>(
        &self,
        engine: &FetchEngine<T>,
        bboxes: &[Bounds],
        checkpoint: &mut CheckpointStore<Vec<Parcel>>,
        progress: &dyn ProgressSink,
    ) -> ParcelCoreResult<StageReport>
    where
        T: Transport<Request = TileCoord> + 'static,
    {
        let ranges = self.plan(bboxes);
        let total: u64 = ranges.iter().map(TileRange::len).sum();
        let tiles: Vec<TileCoord> = ranges
            .iter()
            .flat_map(TileRange::iter)
            .filter(|tile| !checkpoint.is_completed(&tile.to_string()))
            .collect();
        let already_done = total - tiles.len() as u64;
        info!(
            "Fetching {} of {total} tiles at zoom {} ({already_done} done earlier)",
            tiles.len(),
            self.zoom
        );
        progress.start(total, already_done);

        let processor = Arc::clone(&self.processor);
        let counters = Arc::clone(&self.counters);
        let parcels = Arc::clone(&self.parcels);
        let process = move |tile: &TileCoord, payload: Vec<u8>| {
            let observed = processor
                .process(*tile, &payload, &counters)
                .map_err(|e| TransportError::Malformed(e.to_string()))?;
            for parcel in &observed {
                parcels.insert(parcel.clone());
            }
            Ok(observed)
        };

        let mut skipped = Vec::new();
        let result = engine
            .run(tiles, process, |tile, outcome| {
                match outcome {
                    ItemOutcome::Succeeded { output, .. } => {
                        checkpoint.complete(tile.to_string(), &output)?;
                        progress.item_done(true);
                    }
                    ItemOutcome::Failed { .. } => {
                        skipped.push(*tile);
                        progress.item_done(false);
                    }
                }
                Ok(())
            })
            .await;
        let flushed = checkpoint.flush();
        progress.finish();
        let summary = result?;
        flushed?;

        skipped.sort_unstable();
        let skipped: Vec<String> = skipped.iter().map(ToString::to_string).collect();
        checkpoint.record_skipped(&skipped)?;

        let invalid = self.parcels.invalid_count();
        let mut report = StageReport::new(Stage::Tiles, total, already_done);
        report.fetch = summary;
        report.produced = (self.parcels.len() - invalid) as u64;
        report.invalid_geometry = invalid as u64;
        report.geometry = Some(self.counters.snapshot());
        report.skipped = skipped;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use approx::assert_relative_eq;
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::checkpoint::FlushPolicy;
    use crate::fetch::FetchConfig;
    use crate::stats::NoProgress;
    use crate::tiles::mvt::{ParcelLayerBuilder, TilePolygon, encode_tile};

    const A: TileCoord = TileCoord { z: 16, x: 100, y: 200 };
    const B: TileCoord = TileCoord { z: 16, x: 101, y: 200 };

    #[derive(Debug, Default)]
    struct TileServer {
        tiles: BTreeMap<TileCoord, Result<Vec<u8>, TransportError>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Transport for TileServer {
        type Request = TileCoord;

        async fn fetch(&self, tile: &TileCoord) -> Result<Vec<u8>, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.tiles.get(tile).cloned().unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn rect(x0: i32, y0: i32, x1: i32, y1: i32) -> TilePolygon {
        TilePolygon {
            exterior: vec![(x0, y0), (x1, y0), (x1, y1), (x0, y1)],
            interiors: vec![],
        }
    }

    fn tile_payload(parcels: &[(&str, TilePolygon)]) -> Vec<u8> {
        let mut layer = ParcelLayerBuilder::new("parcels", 4096);
        for (id, polygon) in parcels {
            layer.add_tagged_polygon(id, std::slice::from_ref(polygon));
        }
        encode_tile(vec![layer.build()])
    }

    fn server() -> TileServer {
        let collinear = TilePolygon {
            exterior: vec![(10, 10), (20, 10), (30, 10)],
            interiors: vec![],
        };
        let tile_a = tile_payload(&[
            ("P1", rect(3900, 1000, 4160, 1200)),
            ("P2", rect(100, 100, 300, 300)),
            ("P3", collinear),
        ]);
        let tile_b = tile_payload(&[("P1", rect(-64, 1000, 600, 1200))]);
        TileServer {
            tiles: BTreeMap::from([(A, Ok(tile_a)), (B, Ok(tile_b))]),
            ..TileServer::default()
        }
    }

    /// A box from the middle of tile A to the middle of tile B.
    fn bboxes() -> Vec<Bounds> {
        let (left, lat) = TileProjection::new(A, 4096).to_wgs84(2048.0, 2048.0);
        let (right, _) = TileProjection::new(B, 4096).to_wgs84(2048.0, 2048.0);
        vec![Bounds::new(left, lat, right, lat)]
    }

    fn walker() -> TileGridWalker {
        let processor = TileProcessor::new(
            MvtDecoder::default().with_id_field(Some("parcel_id".to_string())),
            GeometryRepairer::default(),
        );
        TileGridWalker::new(16, processor, Arc::default())
    }

    fn engine(server: &Arc<TileServer>) -> FetchEngine<TileServer> {
        let config = FetchConfig {
            max_retries: 0,
            ..FetchConfig::default()
        };
        FetchEngine::new(Arc::clone(server), config, CancellationToken::new())
    }

    fn open(dir: &std::path::Path) -> (CheckpointStore<Vec<Parcel>>, Vec<JournalEntry<Vec<Parcel>>>) {
        CheckpointStore::open(dir, Stage::Tiles, FlushPolicy::default(), false).unwrap()
    }

    #[test]
    fn overlapping_boxes_are_planned_once() {
        let mut boxes = bboxes();
        boxes.push(boxes[0]);
        let ranges = walker().plan(&boxes);
        assert_eq!(ranges, vec![TileRange::new(16, 100, 200, 101, 200)]);
    }

    #[tokio::test]
    async fn parcels_across_tiles_are_merged() {
        let dir = tempfile::tempdir().unwrap();
        let server = Arc::new(server());
        let walker = walker();
        let (mut checkpoint, _) = open(dir.path());

        let report = walker
            .run(&engine(&server), &bboxes(), &mut checkpoint, &NoProgress)
            .await
            .unwrap();

        assert_eq!(report.total, 2);
        assert_eq!(report.fetch.succeeded, 2);
        assert_eq!(report.produced, 2);
        assert_eq!(report.invalid_geometry, 1);
        assert!(report.skipped.is_empty());
        assert_eq!(report.geometry.unwrap().unrepairable, 1);

        let p1 = walker.parcels().get("P1").unwrap();
        assert_eq!(p1.source_tiles.iter().copied().collect::<Vec<_>>(), vec![A, B]);
        // the larger piece, seen in tile B, represents the parcel
        let (lon, _) = TileProjection::new(B, 4096).to_wgs84(268.0, 1100.0);
        assert_relative_eq!(p1.centroid.unwrap().0, lon, epsilon = 1e-9);

        let ids: Vec<_> = walker.parcels().valid_sorted().into_iter().map(|p| p.parcel_id).collect();
        assert_eq!(ids, vec!["P1", "P2"]);
    }

    #[tokio::test]
    async fn resumed_run_fetches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let server = Arc::new(server());

        let first = walker();
        let (mut checkpoint, _) = open(dir.path());
        first
            .run(&engine(&server), &bboxes(), &mut checkpoint, &NoProgress)
            .await
            .unwrap();
        drop(checkpoint);
        assert_eq!(server.calls.load(Ordering::SeqCst), 2);

        let second = walker();
        let (mut checkpoint, journal) = open(dir.path());
        assert_eq!(second.restore(journal), 4);
        let report = second
            .run(&engine(&server), &bboxes(), &mut checkpoint, &NoProgress)
            .await
            .unwrap();

        assert_eq!(server.calls.load(Ordering::SeqCst), 2);
        assert_eq!(report.already_done, 2);
        assert_eq!(report.fetch.succeeded, 0);
        assert_eq!(
            second.parcels().valid_sorted(),
            first.parcels().valid_sorted()
        );
    }

    #[tokio::test]
    async fn failed_tiles_are_skipped_and_retried_next_time() {
        let dir = tempfile::tempdir().unwrap();
        let mut broken = server();
        broken.tiles.insert(B, Ok(b"not a tile".to_vec()));
        let broken = Arc::new(broken);

        let walker = walker();
        let (mut checkpoint, _) = open(dir.path());
        let report = walker
            .run(&engine(&broken), &bboxes(), &mut checkpoint, &NoProgress)
            .await
            .unwrap();
        assert_eq!(report.skipped, vec!["16/101/200"]);
        assert!(!report.is_complete());
        assert!(checkpoint.is_completed("16/100/200"));
        assert!(!checkpoint.is_completed("16/101/200"));
        let listed = std::fs::read_to_string(checkpoint.skipped_path()).unwrap();
        assert!(listed.contains("16/101/200"));
        drop(checkpoint);

        let healthy = Arc::new(server());
        let (mut checkpoint, journal) = open(dir.path());
        let walker = self::walker();
        walker.restore(journal);
        let report = walker
            .run(&engine(&healthy), &bboxes(), &mut checkpoint, &NoProgress)
            .await
            .unwrap();
        assert_eq!(healthy.calls.load(Ordering::SeqCst), 1);
        assert!(report.is_complete());
        assert!(!checkpoint.skipped_path().exists());
        assert_eq!(
            walker.parcels().get("P1").unwrap().source_tiles.len(),
            2
        );
    }
}
