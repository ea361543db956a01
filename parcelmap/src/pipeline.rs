//! Runs the two stages of a parcel map rebuild.
//!
//! Stage 1 walks the tile grid and writes one centroid per parcel. Stage 2 reads those parcels
//! back, fetches their attributes and writes the enriched records. Each stage has its own
//! checkpoint, so either can be interrupted and resumed on its own. Both outputs are rebuilt
//! from the checkpoint journals, which makes a resumed run write the same files as a run from
//! scratch.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parcel_core::checkpoint::{CheckpointStore, FlushPolicy, Stage};
use parcel_core::enrich::{EnrichmentRecord, EnrichmentRunner, assemble};
use parcel_core::fetch::{FetchConfig, FetchEngine, Transport};
use parcel_core::geometry::GeometryRepairer;
use parcel_core::parcels::{Parcel, ParcelDeduplicator};
use parcel_core::stats::{ProgressSink, StageReport};
use parcel_core::tiles::mvt::MvtDecoder;
use parcel_core::tiles::{TileGridWalker, TileProcessor};
use parcel_tile_utils::TileCoord;
use tilejson::Bounds;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::ParcelMapResult;
use crate::dataset::{read_parcels, write_parcels, write_records};

/// Settings of the tile stage.
#[derive(Debug, Clone, PartialEq)]
pub struct TileStage {
    pub zoom: u8,
    pub bounds: Vec<Bounds>,
    /// Extent of layers that do not declare one.
    pub extent: u32,
    pub id_field: Option<String>,
    pub layers: Vec<String>,
    pub min_ring_area_m2: f64,
    /// The parcel centroid CSV.
    pub output: PathBuf,
    pub fetch: FetchConfig,
}

/// Settings of the enrichment stage.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichStage {
    /// The parcel CSV to enrich.
    pub input: PathBuf,
    pub output: PathBuf,
    pub list_field: String,
    pub fetch: FetchConfig,
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    checkpoint_dir: PathBuf,
    flush: FlushPolicy,
    fresh: bool,
    cancel: CancellationToken,
}

impl Pipeline {
    /// With `fresh`, every stage run by this pipeline discards its checkpoint first.
    /// Cancelling `cancel` stops issuing requests; completed work stays checkpointed.
    #[must_use]
    pub fn new(
        checkpoint_dir: impl Into<PathBuf>,
        flush: FlushPolicy,
        fresh: bool,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            checkpoint_dir: checkpoint_dir.into(),
            flush,
            fresh,
            cancel,
        }
    }

    #[must_use]
    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stage 1: rebuilds the parcels of `stage.bounds` and writes their centroids.
    pub async fn run_tiles<T>(
        &self,
        stage: &TileStage,
        transport: Arc<T>,
        progress: &dyn ProgressSink,
    ) -> ParcelMapResult<StageReport>
    where
        T: Transport<Request = TileCoord> + 'static,
    {
        let (mut checkpoint, journal) = CheckpointStore::<Vec<Parcel>>::open(
            &self.checkpoint_dir,
            Stage::Tiles,
            self.flush,
            self.fresh,
        )?;

        let decoder = MvtDecoder::new(stage.extent)
            .with_id_field(stage.id_field.clone())
            .with_layers(stage.layers.clone());
        let processor = TileProcessor::new(decoder, GeometryRepairer::new(stage.min_ring_area_m2));
        let parcels = Arc::new(ParcelDeduplicator::new());
        let walker = TileGridWalker::new(stage.zoom, processor, Arc::clone(&parcels));
        let restored = walker.restore(journal);
        if restored > 0 {
            info!(
                "Restored {restored} parcel observations of {} completed tiles",
                checkpoint.completed_len()
            );
        }

        let engine = FetchEngine::new(transport, stage.fetch.clone(), self.cancel.clone());
        let report = walker
            .run(&engine, &stage.bounds, &mut checkpoint, progress)
            .await?;

        write_parcels(&stage.output, &parcels.valid_sorted())?;
        Ok(report)
    }

    /// Stage 2: fetches the attributes of every parcel of `stage.input` and writes the records.
    pub async fn run_enrich<T>(
        &self,
        stage: &EnrichStage,
        transport: Arc<T>,
        progress: &dyn ProgressSink,
    ) -> ParcelMapResult<StageReport>
    where
        T: Transport<Request = String> + 'static,
    {
        let parcels = read_parcels(&stage.input)?;
        let parcel_ids: Vec<String> = parcels.iter().map(|p| p.parcel_id.clone()).collect();
        let (mut checkpoint, _) = CheckpointStore::<Vec<EnrichmentRecord>>::open(
            &self.checkpoint_dir,
            Stage::Enrich,
            self.flush,
            self.fresh,
        )?;

        let engine = FetchEngine::new(transport, stage.fetch.clone(), self.cancel.clone());
        let report = EnrichmentRunner::new(stage.list_field.as_str())
            .run(&engine, &parcel_ids, &mut checkpoint, progress)
            .await?;

        let (registry, records) =
            assemble(&parcel_ids, checkpoint.journal_entries()?, &report.skipped);
        if registry.is_empty() && !records.is_empty() {
            warn!("No response had any attribute, {} lists only parcel ids", stage.output.display());
        }
        write_records(&stage.output, &registry, &records, &parcels)?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use parcel_core::stats::NoProgress;

    use super::*;
    use crate::ParcelMapError;

    #[derive(Debug)]
    struct Unreachable;

    #[async_trait::async_trait]
    impl Transport for Unreachable {
        type Request = String;

        async fn fetch(&self, _: &String) -> Result<Vec<u8>, parcel_core::fetch::TransportError> {
            Err(parcel_core::fetch::TransportError::Status(401))
        }
    }

    #[tokio::test]
    async fn missing_input_fails_before_fetching() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::new(
            dir.path(),
            FlushPolicy::default(),
            false,
            CancellationToken::new(),
        );
        let stage = EnrichStage {
            input: dir.path().join("nope.csv"),
            output: dir.path().join("out.csv"),
            list_field: "data".to_string(),
            fetch: FetchConfig::default(),
        };
        let result = pipeline
            .run_enrich(&stage, Arc::new(Unreachable), &NoProgress)
            .await;
        assert!(matches!(result, Err(ParcelMapError::DatasetError(_))));
        assert!(!stage.output.exists());
    }

    #[tokio::test]
    async fn auth_failure_aborts_the_stage() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("parcels.csv");
        std::fs::write(&input, "parcel_id,latitude,longitude\n1,0,0\n2,0,0\n").unwrap();
        let pipeline = Pipeline::new(
            dir.path().join("ckpt"),
            FlushPolicy::default(),
            false,
            CancellationToken::new(),
        );
        let stage = EnrichStage {
            input,
            output: dir.path().join("out.csv"),
            list_field: "data".to_string(),
            fetch: FetchConfig {
                concurrency: 1,
                ..FetchConfig::default()
            },
        };
        let result = pipeline
            .run_enrich(&stage, Arc::new(Unreachable), &NoProgress)
            .await;
        assert!(matches!(
            result,
            Err(ParcelMapError::CoreError(parcel_core::ParcelCoreError::FatalTransport(_)))
        ));
        assert!(!stage.output.exists());
    }
}
