use std::sync::Arc;

use clap::Parser;
use parcel_core::checkpoint::Stage;
use parcel_core::stats::StageReport;
use parcelmap::config::env::OsEnv;
use parcelmap::config::{Args, Command, Config, ConfigFileError, read_config};
use parcelmap::logging::{
    StageProgress, ensure_parcel_core_log_level_matches, init_tracing, is_interactive,
};
use parcelmap::pipeline::Pipeline;
use parcelmap::transport::{HttpApiTransport, HttpTileTransport};
use parcelmap::{ParcelMapError, ParcelMapResult};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn log_report(report: &StageReport) {
    info!("{report}");
    if !report.is_complete() {
        warn!("The {} stage is incomplete, run again to resume it", report.stage);
    }
}

async fn run_tiles(pipeline: &Pipeline, config: &Config) -> ParcelMapResult<()> {
    let stage = config.tile_stage()?;
    let tiles = config
        .tiles
        .as_ref()
        .ok_or(ConfigFileError::MissingSection("tiles"))?;
    let transport = Arc::new(HttpTileTransport::from_config(tiles)?);
    let progress = StageProgress::new(Stage::Tiles);
    let report = pipeline.run_tiles(&stage, transport, &progress).await?;
    log_report(&report);
    Ok(())
}

async fn run_enrich(pipeline: &Pipeline, config: &Config) -> ParcelMapResult<()> {
    let stage = config.enrich_stage()?;
    let enrich = config
        .enrich
        .as_ref()
        .ok_or(ConfigFileError::MissingSection("enrich"))?;
    let transport = Arc::new(HttpApiTransport::from_config(enrich)?);
    let progress = StageProgress::new(Stage::Enrich);
    let report = pipeline.run_enrich(&stage, transport, &progress).await?;
    log_report(&report);
    Ok(())
}

async fn start(args: Args) -> ParcelMapResult<()> {
    info!("parcelmap v{VERSION}");

    let env = OsEnv;
    let mut config = if let Some(ref cfg_filename) = args.meta.config {
        info!("Using {}", cfg_filename.display());
        read_config(cfg_filename, &env).map_err(ParcelMapError::from)?
    } else {
        info!("Config file is not specified, using command line options only");
        Config::default()
    };
    args.merge_into_config(&mut config);
    config.finalize()?;

    if let Some(file_name) = &args.meta.save_config {
        config.save_to_file(file_name)?;
    } else {
        info!("Use --save-config to save or print configuration.");
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing requests in flight. Run again to resume.");
            on_signal.cancel();
        }
    });

    let pipeline = Pipeline::new(
        config.checkpoint_dir(),
        config.flush_policy(),
        args.meta.fresh,
        cancel,
    );
    match args.command {
        Command::Tiles(_) => run_tiles(&pipeline, &config).await,
        Command::Enrich(_) => run_enrich(&pipeline, &config).await,
        Command::Run { .. } => {
            run_tiles(&pipeline, &config).await?;
            if pipeline.is_cancelled() {
                warn!("Skipping the enrich stage because the run was interrupted");
                return Ok(());
            }
            run_enrich(&pipeline, &config).await
        }
    }
}

#[tokio::main]
async fn main() {
    let filter = ensure_parcel_core_log_level_matches(std::env::var("RUST_LOG").ok(), "parcelmap=");
    init_tracing(
        &filter,
        std::env::var("PARCELMAP_LOG_FORMAT").ok(),
        is_interactive(),
    );

    let args = Args::parse();
    if let Err(e) = start(args).await {
        error!("{e}");
        std::process::exit(1);
    }
}
