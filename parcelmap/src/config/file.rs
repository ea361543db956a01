use std::collections::{BTreeMap, HashMap, HashSet};
use std::ffi::OsStr;
use std::fs::File;
use std::io::prelude::*;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parcel_core::checkpoint::FlushPolicy;
use parcel_core::fetch::FetchConfig;
use parcel_tile_utils::{DEFAULT_EXTENT, TileScheme};
use serde::{Deserialize, Serialize};
use subst::VariableMap;
use tilejson::Bounds;
use tracing::{info, warn};

use super::{ConfigFileError, ConfigFileResult};
use crate::pipeline::{EnrichStage, TileStage};

/// Highest zoom level a parcel map can be rebuilt at.
pub const MAX_ZOOM: u8 = 24;
pub const DEFAULT_CHECKPOINT_DIR: &str = "checkpoints";
pub const DEFAULT_PARCELS_FILE: &str = "parcels.csv";
pub const DEFAULT_ENRICHED_FILE: &str = "parcels_enriched.csv";
pub const DEFAULT_LIST_FIELD: &str = "data";

pub type UnrecognizedValues = HashMap<String, serde_yaml::Value>;
pub type UnrecognizedKeys = HashSet<String>;

fn copy_unrecognized_keys(
    result: &mut UnrecognizedKeys,
    prefix: &str,
    unrecognized: &UnrecognizedValues,
) {
    result.extend(unrecognized.keys().map(|k| format!("{prefix}{k}")));
}

#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Directory of the checkpoint and journal files of both stages.
    pub checkpoint_dir: Option<PathBuf>,

    /// Number of completed keys after which the checkpoint is written to disk.
    pub flush_every: Option<usize>,

    /// Longest time between two checkpoint writes while keys are completing.
    ///
    /// Supports human-readable formats like "30s", "2m" or "1h".
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "humantime_serde"
    )]
    pub flush_interval: Option<Duration>,

    /// Stage 1: vector tiles to parcel centroids.
    pub tiles: Option<TilesConfig>,

    /// Stage 2: parcel centroids to enriched records.
    pub enrich: Option<EnrichConfig>,

    #[serde(flatten, skip_serializing)]
    pub unrecognized: UnrecognizedValues,
}

#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TilesConfig {
    /// Tile URL template with `{z}`, `{x}` and `{y}` placeholders.
    pub url: Option<String>,
    /// Row numbering of the tile server. Defaults to `xyz`.
    pub scheme: Option<TileScheme>,
    pub zoom: Option<u8>,
    /// Extent of layers that do not declare one. Defaults to 4096.
    pub extent: Option<u32>,
    /// Areas to rebuild, each as `[min_lon, min_lat, max_lon, max_lat]`. May overlap.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bounds: Vec<Bounds>,
    /// Feature attribute holding the parcel id. The feature id is used when it is missing.
    pub id_field: Option<String>,
    /// Layers holding parcels. All layers are read when empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub layers: Vec<String>,
    /// Polygons and holes up to this area are dropped as slivers.
    pub min_ring_area_m2: Option<f64>,
    /// The parcel centroid CSV.
    pub output: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "FetchSettings::is_default")]
    pub fetch: FetchSettings,
    #[serde(flatten, skip_serializing)]
    pub unrecognized: UnrecognizedValues,
}

#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EnrichConfig {
    /// Attribute API URL template with a `{parcel_id}` placeholder.
    pub url: Option<String>,
    /// Response field whose elements become separate records. Defaults to `data`.
    pub list_field: Option<String>,
    /// Parcel CSV to enrich. Defaults to the output of the tile stage.
    pub input: Option<PathBuf>,
    /// The enriched CSV.
    pub output: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "FetchSettings::is_default")]
    pub fetch: FetchSettings,
    #[serde(flatten, skip_serializing)]
    pub unrecognized: UnrecognizedValues,
}

/// Request pacing of one stage. Unset values take the defaults of [`FetchConfig`].
#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchSettings {
    /// Maximum number of requests in flight.
    pub concurrency: Option<usize>,
    /// Maximum number of requests per second.
    pub rate_limit: Option<f64>,
    pub burst: Option<u32>,
    /// Retries of a request after transient failures.
    pub max_retries: Option<usize>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "humantime_serde"
    )]
    pub backoff_base: Option<Duration>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "humantime_serde"
    )]
    pub backoff_max: Option<Duration>,
    pub jitter: Option<bool>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "humantime_serde"
    )]
    pub request_timeout: Option<Duration>,
    #[serde(flatten, skip_serializing)]
    pub unrecognized: UnrecognizedValues,
}

impl Config {
    /// Validates the configured stages and warns about unknown keys.
    pub fn finalize(&mut self) -> ConfigFileResult<UnrecognizedKeys> {
        let mut res = UnrecognizedKeys::new();
        copy_unrecognized_keys(&mut res, "", &self.unrecognized);

        if self.flush_every == Some(0) {
            return Err(invalid("flush_every", "must be greater than zero"));
        }
        if let Some(tiles) = &self.tiles {
            tiles.validate()?;
            copy_unrecognized_keys(&mut res, "tiles.", &tiles.unrecognized);
            copy_unrecognized_keys(&mut res, "tiles.fetch.", &tiles.fetch.unrecognized);
        }
        if let Some(enrich) = &self.enrich {
            enrich.validate()?;
            copy_unrecognized_keys(&mut res, "enrich.", &enrich.unrecognized);
            copy_unrecognized_keys(&mut res, "enrich.fetch.", &enrich.fetch.unrecognized);
        }

        for key in &res {
            warn!(
                "Ignoring unrecognized configuration key '{key}'. Please check your configuration file for typos."
            );
        }
        Ok(res)
    }

    #[must_use]
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.checkpoint_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CHECKPOINT_DIR))
    }

    #[must_use]
    pub fn flush_policy(&self) -> FlushPolicy {
        let default = FlushPolicy::default();
        FlushPolicy {
            every: self.flush_every.unwrap_or(default.every),
            interval: self.flush_interval.unwrap_or(default.interval),
        }
    }

    /// Settings of the tile stage, with defaults applied.
    pub fn tile_stage(&self) -> ConfigFileResult<TileStage> {
        let tiles = self
            .tiles
            .as_ref()
            .ok_or(ConfigFileError::MissingSection("tiles"))?;
        Ok(TileStage {
            zoom: tiles
                .zoom
                .ok_or(ConfigFileError::MissingSetting("tiles.zoom"))?,
            bounds: tiles.bounds.clone(),
            extent: tiles.extent.unwrap_or(DEFAULT_EXTENT),
            id_field: tiles.id_field.clone(),
            layers: tiles.layers.clone(),
            min_ring_area_m2: tiles.min_ring_area_m2.unwrap_or_default(),
            output: tiles.output_path(),
            fetch: tiles.fetch.resolve(),
        })
    }

    /// Settings of the enrichment stage, with defaults applied.
    ///
    /// Without an explicit input, the stage reads what the tile stage writes.
    pub fn enrich_stage(&self) -> ConfigFileResult<EnrichStage> {
        let enrich = self
            .enrich
            .as_ref()
            .ok_or(ConfigFileError::MissingSection("enrich"))?;
        let input = match (&enrich.input, &self.tiles) {
            (Some(input), _) => input.clone(),
            (None, Some(tiles)) => tiles.output_path(),
            (None, None) => PathBuf::from(DEFAULT_PARCELS_FILE),
        };
        Ok(EnrichStage {
            input,
            output: enrich
                .output
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_ENRICHED_FILE)),
            list_field: enrich
                .list_field
                .clone()
                .unwrap_or_else(|| DEFAULT_LIST_FIELD.to_string()),
            fetch: enrich.fetch.resolve(),
        })
    }

    pub fn save_to_file(&self, file_name: &Path) -> ConfigFileResult<()> {
        let yaml = serde_yaml::to_string(&self).map_err(ConfigFileError::ConfigSerializeError)?;
        if file_name.as_os_str() == OsStr::new("-") {
            info!("Current configuration:");
            println!("\n\n{yaml}\n");
            Ok(())
        } else {
            info!(
                "Saving config to {}, use --config to load it",
                file_name.display()
            );
            File::create(file_name)
                .map_err(|e| ConfigFileError::ConfigWriteError(e, file_name.to_path_buf()))?
                .write_all(yaml.as_bytes())
                .map_err(|e| ConfigFileError::ConfigWriteError(e, file_name.to_path_buf()))?;
            Ok(())
        }
    }
}

impl TilesConfig {
    #[must_use]
    pub fn output_path(&self) -> PathBuf {
        self.output
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PARCELS_FILE))
    }

    fn validate(&self) -> ConfigFileResult<()> {
        let url = self
            .url
            .as_deref()
            .ok_or(ConfigFileError::MissingSetting("tiles.url"))?;
        check_placeholders("tiles.url", url, &["{z}", "{x}", "{y}"])?;

        let zoom = self
            .zoom
            .ok_or(ConfigFileError::MissingSetting("tiles.zoom"))?;
        if zoom > MAX_ZOOM {
            return Err(ConfigFileError::InvalidZoom(zoom, MAX_ZOOM));
        }
        if self.extent == Some(0) {
            return Err(ConfigFileError::InvalidExtent);
        }
        if self.bounds.is_empty() {
            return Err(ConfigFileError::MissingSetting("tiles.bounds"));
        }
        check_bboxes(&self.bounds)?;
        if let Some(area) = self.min_ring_area_m2
            && !(area.is_finite() && area >= 0.0)
        {
            return Err(invalid(
                "tiles.min_ring_area_m2",
                "must be a non-negative number of square meters",
            ));
        }
        self.fetch.validate("tiles.fetch")
    }
}

impl EnrichConfig {
    fn validate(&self) -> ConfigFileResult<()> {
        let url = self
            .url
            .as_deref()
            .ok_or(ConfigFileError::MissingSetting("enrich.url"))?;
        check_placeholders("enrich.url", url, &["{parcel_id}"])?;
        if self.list_field.as_deref() == Some("") {
            return Err(invalid("enrich.list_field", "must not be empty"));
        }
        self.fetch.validate("enrich.fetch")
    }
}

impl FetchSettings {
    fn is_default(&self) -> bool {
        self == &Self::default()
    }

    /// The engine settings, with defaults for everything unset.
    #[must_use]
    pub fn resolve(&self) -> FetchConfig {
        let default = FetchConfig::default();
        FetchConfig {
            concurrency: self.concurrency.unwrap_or(default.concurrency),
            rate_limit: self.rate_limit.unwrap_or(default.rate_limit),
            burst: self.burst.unwrap_or(default.burst),
            max_retries: self.max_retries.unwrap_or(default.max_retries),
            backoff_base: self.backoff_base.unwrap_or(default.backoff_base),
            backoff_max: self.backoff_max.unwrap_or(default.backoff_max),
            jitter: self.jitter.unwrap_or(default.jitter),
            request_timeout: self.request_timeout.unwrap_or(default.request_timeout),
        }
    }

    fn validate(&self, prefix: &str) -> ConfigFileResult<()> {
        let resolved = self.resolve();
        if resolved.concurrency == 0 {
            return Err(invalid(
                &format!("{prefix}.concurrency"),
                "must be greater than zero",
            ));
        }
        if !(resolved.rate_limit.is_finite() && resolved.rate_limit > 0.0) {
            return Err(invalid(
                &format!("{prefix}.rate_limit"),
                "must be a positive number of requests per second",
            ));
        }
        if resolved.burst == 0 {
            return Err(invalid(&format!("{prefix}.burst"), "must be greater than zero"));
        }
        if resolved.backoff_base > resolved.backoff_max {
            return Err(invalid(
                &format!("{prefix}.backoff_base"),
                "must not exceed backoff_max",
            ));
        }
        if resolved.request_timeout.is_zero() {
            return Err(invalid(
                &format!("{prefix}.request_timeout"),
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

fn invalid(setting: &str, reason: &str) -> ConfigFileError {
    ConfigFileError::InvalidSetting(setting.to_string(), reason.to_string())
}

fn check_placeholders(
    setting: &'static str,
    url: &str,
    placeholders: &[&'static str],
) -> ConfigFileResult<()> {
    match placeholders.iter().find(|p| !url.contains(**p)) {
        Some(placeholder) => Err(ConfigFileError::MissingPlaceholder {
            setting,
            url: url.to_string(),
            placeholder,
        }),
        None => Ok(()),
    }
}

fn check_bboxes(boxes: &[Bounds]) -> ConfigFileResult<()> {
    for bb in boxes {
        let allowed_lon = Bounds::MAX_TILED.left..=Bounds::MAX_TILED.right;
        if !allowed_lon.contains(&bb.left) || !allowed_lon.contains(&bb.right) {
            return Err(ConfigFileError::InvalidBoundingBox(
                "longitude",
                *bb,
                allowed_lon,
            ));
        }
        let allowed_lat = Bounds::MAX_TILED.bottom..=Bounds::MAX_TILED.top;
        if !allowed_lat.contains(&bb.bottom) || !allowed_lat.contains(&bb.top) {
            return Err(ConfigFileError::InvalidBoundingBox(
                "latitude",
                *bb,
                allowed_lat,
            ));
        }
    }
    Ok(())
}

/// Reads a config file, substituting `${VAR}` references from `env`.
pub fn read_config<'a, M>(file_name: &Path, env: &'a M) -> ConfigFileResult<Config>
where
    M: VariableMap<'a>,
    M::Value: AsRef<str>,
{
    let mut file =
        File::open(file_name).map_err(|e| ConfigFileError::ConfigLoadError(e, file_name.into()))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)
        .map_err(|e| ConfigFileError::ConfigLoadError(e, file_name.into()))?;
    parse_config(&contents, env, file_name)
}

pub fn parse_config<'a, M>(contents: &str, env: &'a M, file_name: &Path) -> ConfigFileResult<Config>
where
    M: VariableMap<'a>,
    M::Value: AsRef<str>,
{
    subst::yaml::from_str(contents, env)
        .map_err(|e| ConfigFileError::ConfigParseError(e, file_name.into()))
}
