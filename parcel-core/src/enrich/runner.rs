use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};

use super::{ApiStatus, EnrichmentRecord, FieldRegistry, normalize_response};
use crate::ParcelCoreResult;
use crate::checkpoint::{CheckpointStore, JournalEntry, Stage};
use crate::fetch::{FetchEngine, ItemOutcome, Transport, TransportError};
use crate::stats::{ProgressSink, StageReport};

/// Fetches the attributes of every parcel and normalizes them into records.
#[derive(Debug, Clone)]
pub struct EnrichmentRunner {
    list_field: String,
}

impl EnrichmentRunner {
    /// Responses are exploded on `list_field`.
    #[must_use]
    pub fn new(list_field: impl Into<String>) -> Self {
        Self {
            list_field: list_field.into(),
        }
    }

    /// Fetches every parcel the checkpoint does not have yet and journals its records.
    ///
    /// A parcel the API does not know (404) or answers with something other than JSON is
    /// journaled as a single [`ApiStatus::NotFound`] or [`ApiStatus::JsonError`] record and not
    /// requested again. Any other failure leaves the parcel out of the journal and in
    /// [`StageReport::skipped`].
    pub async fn run<T>(
        &self,
        engine: &FetchEngine<T>,
        parcel_ids: &[String],
        checkpoint: &mut CheckpointStore<Vec<EnrichmentRecord>>,
        progress: &dyn ProgressSink,
    ) -> ParcelCoreResult<StageReport>
    where
        T: Transport<Request = String> + 'static,
    {
        let todo: Vec<String> = parcel_ids
            .iter()
            .filter(|id| !checkpoint.is_completed(id))
            .cloned()
            .collect();
        let total = parcel_ids.len() as u64;
        let already_done = total - todo.len() as u64;
        info!(
            "Fetching attributes of {} of {total} parcels ({already_done} done earlier)",
            todo.len()
        );
        progress.start(total, already_done);

        let list_field = self.list_field.clone();
        let process = move |parcel_id: &String, body: Vec<u8>| {
            let response: serde_json::Value = match serde_json::from_slice(&body) {
                Ok(response) => response,
                Err(e) => {
                    warn!("Response for parcel {parcel_id} is not JSON: {e}");
                    let record =
                        EnrichmentRecord::without_response(parcel_id, ApiStatus::JsonError);
                    return Ok::<_, TransportError>(vec![record]);
                }
            };
            let normalized = normalize_response(parcel_id, &response, &list_field);
            for warning in &normalized.warnings {
                warn!("{warning}");
            }
            Ok(normalized.records)
        };

        let mut produced = 0_u64;
        let mut skipped = Vec::new();
        let result = engine
            .run(todo, process, |parcel_id, outcome| {
                match outcome {
                    ItemOutcome::Succeeded { output, .. } => {
                        produced += output.len() as u64;
                        checkpoint.complete(parcel_id.clone(), &output)?;
                        progress.item_done(true);
                    }
                    ItemOutcome::Failed {
                        error: TransportError::Status(404),
                        ..
                    } => {
                        debug!("Parcel {parcel_id} is unknown to the API");
                        let record =
                            EnrichmentRecord::without_response(parcel_id, ApiStatus::NotFound);
                        produced += 1;
                        checkpoint.complete(parcel_id.clone(), &vec![record])?;
                        progress.item_done(true);
                    }
                    ItemOutcome::Failed { error, attempts } => {
                        debug!("Parcel {parcel_id} failed after {attempts} attempts: {error}");
                        skipped.push(parcel_id.clone());
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

        let failed: HashSet<String> = skipped.into_iter().collect();
        let skipped: Vec<String> = parcel_ids
            .iter()
            .filter(|id| failed.contains(*id))
            .cloned()
            .collect();
        checkpoint.record_skipped(&skipped)?;

        let mut report = StageReport::new(Stage::Enrich, total, already_done);
        report.fetch = summary;
        report.produced = produced;
        report.skipped = skipped;
        Ok(report)
    }
}

/// Builds the final records from the journal of all runs.
///
/// Records follow the order of `parcel_ids`, so the result does not depend on the order
/// responses arrived in. When a parcel was journaled more than once, the last entry wins.
/// Parcels of `skipped` without an entry get an [`ApiStatus::FailedAfterRetries`] record;
/// other parcels without an entry are left out.
#[must_use]
pub fn assemble(
    parcel_ids: &[String],
    journal: Vec<JournalEntry<Vec<EnrichmentRecord>>>,
    skipped: &[String],
) -> (FieldRegistry, Vec<EnrichmentRecord>) {
    let skipped: HashSet<&str> = skipped.iter().map(String::as_str).collect();
    let mut latest: HashMap<String, Vec<EnrichmentRecord>> = journal
        .into_iter()
        .map(|entry| (entry.key, entry.value))
        .collect();
    let mut registry = FieldRegistry::new();
    let mut records = Vec::new();
    for id in parcel_ids {
        if let Some(found) = latest.remove(id) {
            for record in found {
                registry.observe(&record);
                records.push(record);
            }
        } else if skipped.contains(id.as_str()) {
            records.push(EnrichmentRecord::without_response(
                id,
                ApiStatus::FailedAfterRetries,
            ));
        }
    }
    (registry, records)
}
