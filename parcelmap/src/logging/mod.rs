//! Logging initialization using `tracing` and `tracing-subscriber`.
//!
//! Output is controlled by:
//! - [`EnvFilter`]: log level filtering, from `RUST_LOG`
//! - [`LogFormat`]: output format, from `PARCELMAP_LOG_FORMAT`

use std::str::FromStr;

use tracing::level_filters::LevelFilter;
use tracing::{Level, Subscriber};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer};

mod progress;
pub use progress::{StageProgress, is_interactive};

/// Log output format, from `PARCELMAP_LOG_FORMAT`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Single-line logs with timestamps and targets.
    #[default]
    Compact,

    /// Level and message only, without ANSI colors. Suits log files and CI output.
    Bare,

    /// Newline-delimited JSON.
    Json,
}

impl LogFormat {
    fn layer<S, W>(self, writer: W) -> Box<dyn Layer<S> + Send + Sync>
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_span_events(FmtSpan::NONE);
        match self {
            Self::Compact => layer.compact().boxed(),
            Self::Bare => layer
                .compact()
                .without_time()
                .with_target(false)
                .with_ansi(false)
                .boxed(),
            Self::Json => layer.json().boxed(),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "bare" => Ok(Self::Bare),
            "json" | "jsonl" => Ok(Self::Json),
            _ => Err(format!(
                "Invalid log format '{s}'. Valid options: compact, bare or json"
            )),
        }
    }
}

// `SubscriberInitExt::init()` would also install a `LogTracer`, clashing with `init_log_bridge`.
fn set_global_default(dispatch: tracing::Dispatch) {
    if let Err(e) = tracing::dispatcher::set_global_default(dispatch) {
        eprintln!("Warning: unable to set the global tracing subscriber: {e}");
    }
}

/// Forwards `log` records of dependencies to `tracing`.
fn init_log_bridge(env_filter: &EnvFilter) {
    let mut log_builder = tracing_log::LogTracer::builder()
        .with_interest_cache(tracing_log::InterestCacheConfig::default());
    if let Some(Some(max_level)) = env_filter.max_level_hint().map(LevelFilter::into_level) {
        let max_level = match max_level {
            Level::DEBUG => log::LevelFilter::Debug,
            Level::INFO => log::LevelFilter::Info,
            Level::WARN => log::LevelFilter::Warn,
            Level::ERROR => log::LevelFilter::Error,
            Level::TRACE => log::LevelFilter::Trace,
        };
        log_builder = log_builder.with_max_level(max_level);
    }
    if let Err(e) = log_builder.init() {
        eprintln!("Warning: unable to forward log records to tracing: {e}");
    }
}

/// Initialize the global tracing subscriber for the given filter and format.
///
/// This function:
/// 1. Bridges `log` records into `tracing` events
/// 2. Filters with the provided filter string
/// 3. Formats with the provided format, or the default one
/// 4. Writes to stderr, through an `IndicatifLayer` when progress bars are shown
pub fn init_tracing(filter: &str, format: Option<String>, use_progress: bool) {
    let env_filter = EnvFilter::from_str(filter).unwrap_or_else(|_| {
        eprintln!("Warning: Invalid filter string '{filter}' passed. Since you passed a filter, you likely want to debug us, so we set the filter to debug");
        EnvFilter::new("debug")
    });

    let log_format = format
        .and_then(|s| {
            s.parse::<LogFormat>()
                .map_err(|e| {
                    eprintln!("Warning: {e}");
                    eprintln!(
                        "Falling back to default format ({:?})",
                        LogFormat::default()
                    );
                })
                .ok()
        })
        .unwrap_or_default();

    init_log_bridge(&env_filter);
    let indicatif = use_progress.then(tracing_indicatif::IndicatifLayer::new);
    let fmt_layer = match &indicatif {
        Some(bars) => log_format.layer(bars.get_stderr_writer()),
        None => log_format.layer(std::io::stderr),
    };
    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(indicatif);
    set_global_default(subscriber.into());
}

/// Makes `parcel_core` log at the level given to `replacement` (e.g. `parcelmap=`) unless
/// `RUST_LOG` sets it explicitly.
#[must_use]
pub fn ensure_parcel_core_log_level_matches(
    env_filter: Option<String>,
    replacement: &'static str,
) -> String {
    if let Some(rust_log) = env_filter {
        if rust_log.contains(replacement) && !rust_log.contains("parcel_core=") {
            if let Some(level) = rust_log
                .split(',')
                .find_map(|s| s.strip_prefix(replacement))
            {
                format!("{rust_log},parcel_core={level}")
            } else {
                rust_log
            }
        } else {
            rust_log
        }
    } else {
        format!("{replacement}info,parcel_core=info")
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(None, "parcelmap=info,parcel_core=info")]
    #[case(Some("debug"), "debug")]
    #[case(Some("parcelmap=debug"), "parcelmap=debug,parcel_core=debug")]
    #[case(Some("warn,parcelmap=trace"), "warn,parcelmap=trace,parcel_core=trace")]
    #[case(Some("parcelmap=debug,parcel_core=warn"), "parcelmap=debug,parcel_core=warn")]
    fn parcel_core_follows_parcelmap(#[case] rust_log: Option<&str>, #[case] expected: &str) {
        let filter = ensure_parcel_core_log_level_matches(rust_log.map(String::from), "parcelmap=");
        assert_eq!(filter, expected);
    }

    #[rstest]
    #[case("compact", Ok(LogFormat::Compact))]
    #[case("JSON", Ok(LogFormat::Json))]
    #[case("jsonl", Ok(LogFormat::Json))]
    #[case("Bare", Ok(LogFormat::Bare))]
    #[case(
        "pretty",
        Err("Invalid log format 'pretty'. Valid options: compact, bare or json".to_string())
    )]
    fn parse_log_format(#[case] input: &str, #[case] expected: Result<LogFormat, String>) {
        assert_eq!(input.parse::<LogFormat>(), expected);
    }
}
