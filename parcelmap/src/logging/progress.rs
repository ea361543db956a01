use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use parcel_core::checkpoint::Stage;
use parcel_core::stats::ProgressSink;

struct LogBackoff {
    last_logged: Instant,
    iteration: u64,
}

impl LogBackoff {
    fn new(last_logged: Instant) -> Self {
        Self {
            last_logged,
            iteration: 0,
        }
    }

    fn should_log(&mut self) -> bool {
        // capped so long runs still log every 1.4h (5<<10 s)
        let iteration = self.iteration.min(10);
        let delay = Duration::from_secs(5u64 << iteration);
        let elapsed = self.last_logged.elapsed();
        if elapsed > delay {
            self.last_logged = Instant::now();
            self.iteration += 1;
            true
        } else {
            false
        }
    }
}

enum MaybeInteractiveProgressBar {
    Interactive(ProgressBar),
    NonInteractive {
        log_backoff: Mutex<LogBackoff>,
        total_size: u64,
        current_size: AtomicU64,
        started_at: Instant,
    },
}

impl MaybeInteractiveProgressBar {
    fn new(total_size: u64) -> Self {
        if is_interactive() {
            let bar = ProgressBar::new(total_size);
            match ProgressStyle::default_bar().template(
                "{elapsed_precise} -> eta: {eta} [{bar:40.cyan/blue} {percent}%] {pos}/{human_len} ({per_sec}) | {msg}",
            ) {
                Ok(style) => bar.set_style(style.progress_chars("█▓▒░ ")),
                Err(e) => warn!("Invalid progress bar template: {e}"),
            }
            Self::Interactive(bar)
        } else {
            let started_at = Instant::now();
            Self::NonInteractive {
                log_backoff: Mutex::new(LogBackoff::new(started_at)),
                started_at,
                total_size,
                current_size: AtomicU64::new(0),
            }
        }
    }

    fn increment(&self, amount: u64) {
        match self {
            Self::Interactive(bar) => bar.inc(amount),
            Self::NonInteractive { current_size, .. } => {
                current_size.fetch_add(amount, Ordering::Relaxed);
            }
        }
    }

    fn update_message(&self, stage: Stage, msg: String) {
        match self {
            Self::Interactive(bar) => bar.set_message(msg),
            Self::NonInteractive {
                current_size,
                started_at,
                log_backoff,
                total_size,
            } => {
                let current = current_size.load(Ordering::Relaxed);
                let total = *total_size;
                let Ok(mut backoff) = log_backoff.lock() else {
                    return;
                };
                if backoff.should_log() {
                    let percent = current.saturating_mul(100).checked_div(total).unwrap_or(100);
                    let elapsed = started_at.elapsed();
                    info!("{stage}: {current}/{total} ({percent}%) keys in {elapsed:?}: {msg}");
                }
            }
        }
    }

    fn finish(&self) {
        if let Self::Interactive(bar) = self {
            bar.finish();
        }
    }
}

/// True when both stdout and stderr are terminals, so a progress bar can be drawn.
#[must_use]
pub fn is_interactive() -> bool {
    use std::io::IsTerminal as _;
    std::io::stdout().is_terminal() && std::io::stderr().is_terminal()
}

/// Progress of one stage: a progress bar on a terminal, throttled log lines otherwise.
pub struct StageProgress {
    stage: Stage,
    bar: OnceLock<MaybeInteractiveProgressBar>,
    succeeded: AtomicU64,
    failed: AtomicU64,
    started_at: Instant,
}

impl StageProgress {
    #[must_use]
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            bar: OnceLock::new(),
            succeeded: AtomicU64::default(),
            failed: AtomicU64::default(),
            started_at: Instant::now(),
        }
    }

    #[must_use]
    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

impl ProgressSink for StageProgress {
    fn start(&self, total: u64, already_done: u64) {
        let bar = self
            .bar
            .get_or_init(|| MaybeInteractiveProgressBar::new(total));
        bar.increment(already_done);
    }

    fn item_done(&self, succeeded: bool) {
        if succeeded {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(bar) = self.bar.get() {
            bar.increment(1);
            bar.update_message(
                self.stage,
                format!("✓ {} ✗ {}", self.succeeded(), self.failed()),
            );
        }
    }

    fn finish(&self) {
        if let Some(bar) = self.bar.get() {
            bar.finish();
        }
        let elapsed = self.started_at.elapsed();
        info!(
            "Finished {} stage: {} keys succeeded and {} failed in {elapsed:?}",
            self.stage,
            self.succeeded(),
            self.failed()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_outcomes() {
        let progress = StageProgress::new(Stage::Enrich);
        progress.start(3, 1);
        progress.item_done(true);
        progress.item_done(false);
        progress.finish();
        assert_eq!(progress.succeeded(), 1);
        assert_eq!(progress.failed(), 1);
    }

    #[test]
    fn backoff_waits_longer_every_time() {
        let mut backoff = LogBackoff::new(Instant::now());
        assert!(!backoff.should_log());
        backoff.last_logged = Instant::now() - Duration::from_secs(6);
        assert!(backoff.should_log());
        backoff.last_logged = Instant::now() - Duration::from_secs(6);
        assert!(!backoff.should_log());
        backoff.last_logged = Instant::now() - Duration::from_secs(11);
        assert!(backoff.should_log());
    }
}
