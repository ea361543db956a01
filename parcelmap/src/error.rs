use parcel_core::ParcelCoreError;
use parcel_core::checkpoint::CheckpointError;

use crate::config::ConfigFileError;
use crate::dataset::DatasetError;

/// A convenience [`Result`] for the parcelmap crate.
pub type ParcelMapResult<T> = Result<T, ParcelMapError>;

#[derive(thiserror::Error, Debug)]
pub enum ParcelMapError {
    #[error(transparent)]
    ConfigFileError(#[from] ConfigFileError),

    #[error(transparent)]
    CoreError(#[from] ParcelCoreError),

    #[error(transparent)]
    CheckpointError(#[from] CheckpointError),

    #[error(transparent)]
    DatasetError(#[from] DatasetError),

    #[error("Unable to create the HTTP client: {0}")]
    HttpClientError(#[source] reqwest::Error),
}
