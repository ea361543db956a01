use std::ops::RangeInclusive;
use std::path::PathBuf;

use tilejson::Bounds;

pub type ConfigFileResult<T> = Result<T, ConfigFileError>;

#[derive(thiserror::Error, Debug)]
pub enum ConfigFileError {
    #[error("Unable to load config file {1}: {0}")]
    ConfigLoadError(#[source] std::io::Error, PathBuf),

    #[error("Unable to parse config file {1}: {0}")]
    ConfigParseError(#[source] subst::yaml::Error, PathBuf),

    #[error("Unable to write config file {1}: {0}")]
    ConfigWriteError(#[source] std::io::Error, PathBuf),

    #[error("Unable to serialize the configuration: {0}")]
    ConfigSerializeError(#[source] serde_yaml::Error),

    #[error("The '{0}' section is missing. Add it to the config file or pass its options on the command line.")]
    MissingSection(&'static str),

    #[error("The '{0}' setting is required")]
    MissingSetting(&'static str),

    #[error("Zoom level {0} is not supported, it must be at most {1}")]
    InvalidZoom(u8, u8),

    #[error("The tile extent must be greater than zero")]
    InvalidExtent,

    #[error(
        "{0} of bounding box '{1}' must fit into {2:?}. Please check that your bounding box is in the `min_lon,min_lat,max_lon,max_lat` format."
    )]
    InvalidBoundingBox(&'static str, Bounds, RangeInclusive<f64>),

    #[error("The URL '{url}' of '{setting}' must contain the {placeholder} placeholder")]
    MissingPlaceholder {
        setting: &'static str,
        url: String,
        placeholder: &'static str,
    },

    #[error("Invalid value of '{0}': {1}")]
    InvalidSetting(String, String),

    #[error("Invalid HTTP header '{0}'")]
    InvalidHeader(String),
}
