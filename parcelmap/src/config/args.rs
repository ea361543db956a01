use std::num::NonZeroUsize;
use std::path::PathBuf;

use clap::builder::Styles;
use clap::builder::styling::AnsiColor;
use clap::{Parser, Subcommand};
use tilejson::Bounds;

use super::{Config, EnrichConfig, FetchSettings, TilesConfig};

/// Defines the styles used for the CLI help output.
pub const HELP_STYLES: Styles = Styles::styled()
    .header(AnsiColor::Blue.on_default().bold())
    .usage(AnsiColor::Blue.on_default().bold())
    .literal(AnsiColor::White.on_default())
    .placeholder(AnsiColor::Green.on_default());

#[derive(Parser, Debug, PartialEq)]
#[command(
    about = "Rebuild a parcel map from vector tiles and enrich every parcel with attributes from a remote API. Interrupted runs resume where they stopped.",
    version,
    after_help = "Use RUST_LOG environment variable to control logging level, e.g. RUST_LOG=debug or RUST_LOG=parcelmap=debug.\nUse PARCELMAP_LOG_FORMAT environment variable to control output format: compact (default), bare or json.\nSee https://docs.rs/tracing-subscriber/latest/tracing_subscriber/filter/struct.EnvFilter.html for more information.",
    styles = HELP_STYLES
)]
pub struct Args {
    #[command(flatten)]
    pub meta: MetaArgs,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::Args, Debug, PartialEq, Default)]
pub struct MetaArgs {
    /// Path to config file. Command line options override its values.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
    /// Save resulting config to a file or use "-" to print to stdout.
    #[arg(long, global = true)]
    pub save_config: Option<PathBuf>,
    /// Directory of the checkpoint files. [DEFAULT: checkpoints]
    #[arg(long, global = true)]
    pub checkpoint_dir: Option<PathBuf>,
    /// Discard the checkpoints of the selected stages and start over.
    #[arg(long, global = true)]
    pub fresh: bool,
    /// Maximum number of requests in flight, per stage.
    #[arg(long, global = true)]
    pub concurrency: Option<NonZeroUsize>,
    /// Maximum number of requests per second, per stage.
    #[arg(long, global = true)]
    pub rate_limit: Option<f64>,
    /// Number of retries of a request after transient failures.
    #[arg(long, global = true)]
    pub max_retries: Option<usize>,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Rebuild parcel centroids from vector tiles.
    Tiles(TileArgs),
    /// Fetch the attributes of every parcel of a parcel CSV.
    Enrich(EnrichArgs),
    /// Run both stages, one after the other.
    Run {
        #[command(flatten)]
        tiles: TileArgs,
        #[command(flatten)]
        enrich: EnrichArgs,
    },
}

#[derive(clap::Args, Debug, PartialEq, Default)]
pub struct TileArgs {
    /// Tile URL template, e.g. `https://example.org/tiles/{z}/{x}/{y}.pbf`.
    #[arg(long)]
    pub tile_url: Option<String>,
    /// Zoom level to read parcels at.
    #[arg(short, long)]
    pub zoom: Option<u8>,
    /// Area to rebuild, in the format `min_lon,min_lat,max_lon,max_lat`. Can be specified multiple times with overlapping bounds being handled correctly.
    #[arg(long)]
    pub bbox: Vec<Bounds>,
    /// Path of the parcel centroid CSV to write. [DEFAULT: parcels.csv]
    #[arg(long)]
    pub parcels: Option<PathBuf>,
}

#[derive(clap::Args, Debug, PartialEq, Default)]
pub struct EnrichArgs {
    /// Attribute API URL template, e.g. `https://example.org/api/parcels/{parcel_id}`.
    #[arg(long)]
    pub api_url: Option<String>,
    /// Parcel CSV to enrich. Defaults to the parcel CSV of the tile stage.
    #[arg(long)]
    pub input: Option<PathBuf>,
    /// Path of the enriched CSV to write. [DEFAULT: parcels_enriched.csv]
    #[arg(long)]
    pub enriched: Option<PathBuf>,
    /// Response field whose elements become separate records. [DEFAULT: data]
    #[arg(long)]
    pub list_field: Option<String>,
}

impl Args {
    /// Applies the command line on top of the config file.
    ///
    /// The sections of the selected stages are created when the file has none.
    pub fn merge_into_config(&self, config: &mut Config) {
        if let Some(dir) = &self.meta.checkpoint_dir {
            config.checkpoint_dir = Some(dir.clone());
        }
        match &self.command {
            Command::Tiles(tiles) => tiles.merge_into(config.tiles.get_or_insert_default()),
            Command::Enrich(enrich) => enrich.merge_into(config.enrich.get_or_insert_default()),
            Command::Run { tiles, enrich } => {
                tiles.merge_into(config.tiles.get_or_insert_default());
                enrich.merge_into(config.enrich.get_or_insert_default());
            }
        }
        if let Some(tiles) = &mut config.tiles {
            self.meta.merge_into(&mut tiles.fetch);
        }
        if let Some(enrich) = &mut config.enrich {
            self.meta.merge_into(&mut enrich.fetch);
        }
    }
}

impl MetaArgs {
    fn merge_into(&self, fetch: &mut FetchSettings) {
        if let Some(concurrency) = self.concurrency {
            fetch.concurrency = Some(concurrency.get());
        }
        if let Some(rate_limit) = self.rate_limit {
            fetch.rate_limit = Some(rate_limit);
        }
        if let Some(max_retries) = self.max_retries {
            fetch.max_retries = Some(max_retries);
        }
    }
}

impl TileArgs {
    fn merge_into(&self, tiles: &mut TilesConfig) {
        if let Some(url) = &self.tile_url {
            tiles.url = Some(url.clone());
        }
        if let Some(zoom) = self.zoom {
            tiles.zoom = Some(zoom);
        }
        if !self.bbox.is_empty() {
            tiles.bounds.clone_from(&self.bbox);
        }
        if let Some(parcels) = &self.parcels {
            tiles.output = Some(parcels.clone());
        }
    }
}

impl EnrichArgs {
    fn merge_into(&self, enrich: &mut EnrichConfig) {
        if let Some(url) = &self.api_url {
            enrich.url = Some(url.clone());
        }
        if let Some(input) = &self.input {
            enrich.input = Some(input.clone());
        }
        if let Some(enriched) = &self.enriched {
            enrich.output = Some(enriched.clone());
        }
        if let Some(list_field) = &self.list_field {
            enrich.list_field = Some(list_field.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use pretty_assertions::assert_eq;

    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("parcelmap").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn cli_overrides_the_file() {
        let args = parse(&[
            "tiles",
            "--tile-url",
            "http://localhost:3000/parcels/{z}/{x}/{y}",
            "--zoom",
            "17",
            "--bbox",
            "-0.2,51.4,0.1,51.6",
            "--bbox",
            "0,51.5,0.3,51.7",
            "--concurrency",
            "4",
            "--fresh",
        ]);
        assert!(args.meta.fresh);

        let mut config = Config {
            tiles: Some(TilesConfig {
                zoom: Some(15),
                fetch: FetchSettings {
                    rate_limit: Some(5.0),
                    ..FetchSettings::default()
                },
                ..TilesConfig::default()
            }),
            ..Config::default()
        };
        args.merge_into_config(&mut config);

        let tiles = config.tiles.as_ref().unwrap();
        assert_eq!(tiles.zoom, Some(17));
        assert_eq!(tiles.bounds.len(), 2);
        assert_eq!(tiles.fetch.concurrency, Some(4));
        assert_eq!(tiles.fetch.rate_limit, Some(5.0));
        assert_eq!(config.enrich, None);
    }

    #[test]
    fn run_configures_both_stages() {
        let args = parse(&[
            "--checkpoint-dir",
            "/tmp/ckpt",
            "run",
            "--zoom",
            "16",
            "--api-url",
            "http://localhost/{parcel_id}",
            "--max-retries",
            "2",
        ]);
        let mut config = Config::default();
        args.merge_into_config(&mut config);

        assert_eq!(config.checkpoint_dir(), Path::new("/tmp/ckpt"));
        assert_eq!(config.tiles.as_ref().unwrap().zoom, Some(16));
        assert_eq!(config.tiles.as_ref().unwrap().fetch.max_retries, Some(2));
        let enrich = config.enrich.as_ref().unwrap();
        assert_eq!(enrich.url.as_deref(), Some("http://localhost/{parcel_id}"));
        assert_eq!(enrich.fetch.max_retries, Some(2));
    }

    #[test]
    fn rejects_bad_values() {
        let parse = |args: &[&str]| {
            Args::try_parse_from(std::iter::once("parcelmap").chain(args.iter().copied()))
        };
        assert!(parse(&["tiles", "--bbox", "1,2,3"]).is_err());
        assert!(parse(&["enrich", "--concurrency", "0"]).is_err());
        assert!(parse(&[]).is_err());
    }

    #[test]
    fn verify_cli() {
        use clap::CommandFactory as _;
        Args::command().debug_assert();
    }
}
