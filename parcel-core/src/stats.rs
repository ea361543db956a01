use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::checkpoint::Stage;
use crate::fetch::FetchSummary;
use crate::tiles::mvt::DecodeStats;

/// Receives progress of a stage. The default methods ignore everything.
pub trait ProgressSink: Send + Sync {
    /// The stage is about to process `total` items, `already_done` of them in earlier runs.
    fn start(&self, _total: u64, _already_done: u64) {}

    /// One item reached a final outcome.
    fn item_done(&self, _succeeded: bool) {}

    /// The stage ended, successfully or not.
    fn finish(&self) {}
}

/// Discards progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {}

/// Decode and repair counters shared by the workers of the tile stage.
#[derive(Debug, Default)]
pub struct TileCounters {
    features: AtomicU64,
    non_polygon: AtomicU64,
    missing_id: AtomicU64,
    corrupt: AtomicU64,
    rebuilt: AtomicU64,
    unrepairable: AtomicU64,
}

impl TileCounters {
    /// Adds the counters of one decoded tile.
    pub fn add_decoded(&self, stats: &DecodeStats) {
        self.features.fetch_add(stats.features, Ordering::Relaxed);
        self.non_polygon.fetch_add(stats.non_polygon, Ordering::Relaxed);
        self.missing_id.fetch_add(stats.missing_id, Ordering::Relaxed);
        self.corrupt.fetch_add(stats.corrupt, Ordering::Relaxed);
    }

    /// Counts a feature whose geometry had to be rebuilt.
    pub fn add_rebuilt(&self) {
        self.rebuilt.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a feature with no usable geometry.
    pub fn add_unrepairable(&self) {
        self.unrepairable.fetch_add(1, Ordering::Relaxed);
    }

    /// Current values.
    #[must_use]
    pub fn snapshot(&self) -> GeometryStats {
        GeometryStats {
            decode: DecodeStats {
                features: self.features.load(Ordering::Relaxed),
                non_polygon: self.non_polygon.load(Ordering::Relaxed),
                missing_id: self.missing_id.load(Ordering::Relaxed),
                corrupt: self.corrupt.load(Ordering::Relaxed),
            },
            rebuilt: self.rebuilt.load(Ordering::Relaxed),
            unrepairable: self.unrepairable.load(Ordering::Relaxed),
        }
    }
}

/// What happened to the features of the tile stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GeometryStats {
    /// Decoder counters summed over all tiles.
    #[serde(flatten)]
    pub decode: DecodeStats,
    /// Features made valid by rebuilding their polygons.
    pub rebuilt: u64,
    /// Feature observations without usable geometry.
    pub unrepairable: u64,
}

/// End-of-stage summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageReport {
    /// The stage this report covers.
    pub stage: Stage,
    /// Keys the stage covers, including those done in earlier runs.
    pub total: u64,
    /// Keys skipped because the checkpoint already had them.
    pub already_done: u64,
    /// Outcome of this run's fetches.
    pub fetch: FetchSummary,
    /// Records written by the stage: parcels or enrichment rows.
    pub produced: u64,
    /// Parcels that never had a valid geometry. Tile stage only.
    pub invalid_geometry: u64,
    /// Decode and repair counters. Tile stage only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geometry: Option<GeometryStats>,
    /// Keys that failed in this run, in key or input order.
    pub skipped: Vec<String>,
}

impl StageReport {
    /// A report with nothing fetched yet.
    #[must_use]
    pub fn new(stage: Stage, total: u64, already_done: u64) -> Self {
        Self {
            stage,
            total,
            already_done,
            fetch: FetchSummary::default(),
            produced: 0,
            invalid_geometry: 0,
            geometry: None,
            skipped: Vec::new(),
        }
    }

    /// True when every key of the stage is done.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty() && self.fetch.not_started == 0 && !self.fetch.cancelled
    }
}

impl Display for StageReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let fetch = &self.fetch;
        write!(
            f,
            "{} stage: {} keys, {} done earlier, {} succeeded ({} after retries), {} skipped after failures",
            self.stage,
            self.total,
            self.already_done,
            fetch.succeeded,
            fetch.retried_then_succeeded,
            fetch.failed,
        )?;
        if fetch.not_started > 0 {
            write!(f, ", {} not started", fetch.not_started)?;
        }
        write!(f, "; {} records", self.produced)?;
        if let Some(geometry) = &self.geometry {
            write!(
                f,
                "; {} invalid parcels, {} features skipped, {} rebuilt",
                self.invalid_geometry,
                geometry.decode.skipped(),
                geometry.rebuilt
            )?;
        }
        Ok(())
    }
}
