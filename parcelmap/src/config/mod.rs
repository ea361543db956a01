//! Configuration of a run: a YAML file with `${VAR}` substitution, overridden by the command
//! line.

mod args;
pub use args::{Args, Command, EnrichArgs, HELP_STYLES, MetaArgs, TileArgs};

pub mod env;

mod error;
pub use error::{ConfigFileError, ConfigFileResult};

mod file;
pub use file::{
    Config, DEFAULT_CHECKPOINT_DIR, DEFAULT_ENRICHED_FILE, DEFAULT_LIST_FIELD, DEFAULT_PARCELS_FILE,
    EnrichConfig, FetchSettings, MAX_ZOOM, TilesConfig, UnrecognizedKeys, UnrecognizedValues,
    parse_config, read_config,
};
