use crate::checkpoint::CheckpointError;
use crate::fetch::TransportError;

/// Errors that abort a pipeline stage.
///
/// Failures scoped to a single tile, parcel or feature never surface here; they are counted and
/// reported instead.
#[non_exhaustive]
#[derive(thiserror::Error, Debug)]
pub enum ParcelCoreError {
    /// The progress ledger could not be read or written.
    #[error(transparent)]
    CheckpointError(#[from] CheckpointError),

    /// The remote service rejected the run as a whole, e.g. because of missing credentials.
    #[error("remote service refused the run: {0}")]
    FatalTransport(#[source] TransportError),

    /// A worker task panicked or was aborted.
    #[error("fetch worker failed: {0}")]
    WorkerError(#[from] tokio::task::JoinError),
}

/// A convenience [`Result`] for `parcel-core` operations.
pub type ParcelCoreResult<T> = Result<T, ParcelCoreError>;
