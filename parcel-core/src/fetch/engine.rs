use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder as _, ExponentialBackoff, ExponentialBuilder};
use serde::Serialize;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{FailureClass, RateLimiter, Transport, TransportError};
use crate::{ParcelCoreError, ParcelCoreResult};

/// Tuning of a [`FetchEngine`].
#[derive(Debug, Clone, PartialEq)]
pub struct FetchConfig {
    /// Maximum number of requests in flight.
    pub concurrency: usize,
    /// Maximum aggregate number of requests started per second.
    pub rate_limit: f64,
    /// Requests that may start at once before the rate limit applies.
    pub burst: u32,
    /// Attempts after the first one for transient failures.
    pub max_retries: usize,
    /// Delay before the first retry; doubled for every further one.
    pub backoff_base: Duration,
    /// Upper bound of a single backoff delay.
    pub backoff_max: Duration,
    /// Randomize backoff delays so retries of many items do not synchronize.
    pub jitter: bool,
    /// Time allowed for one attempt, including reading the body.
    pub request_timeout: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            concurrency: 40,
            rate_limit: 50.0,
            burst: 1,
            max_retries: 5,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            jitter: true,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Where an item is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Waiting for a worker slot.
    Pending,
    /// Being fetched and processed.
    InFlight,
    /// Waiting out a backoff delay after a transient failure.
    Backoff,
    /// Fetched and processed.
    Succeeded,
    /// Given up on.
    Failed,
}

/// Final result of one item, handed to the completion callback.
#[derive(Debug)]
pub enum ItemOutcome<O> {
    /// The item was fetched and processed.
    Succeeded {
        /// What the processing step produced.
        output: O,
        /// Number of attempts it took.
        attempts: u32,
    },
    /// The item failed for good.
    Failed {
        /// The last failure.
        error: TransportError,
        /// Number of attempts made.
        attempts: u32,
    },
}

impl<O> ItemOutcome<O> {
    /// The terminal state this outcome represents.
    #[must_use]
    pub fn state(&self) -> RequestState {
        match self {
            Self::Succeeded { .. } => RequestState::Succeeded,
            Self::Failed { .. } => RequestState::Failed,
        }
    }
}

/// Counters of one [`FetchEngine::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FetchSummary {
    /// Items fetched and processed.
    pub succeeded: u64,
    /// Succeeded items that needed more than one attempt.
    pub retried_then_succeeded: u64,
    /// Items that failed for good, including the exhausted ones.
    pub failed: u64,
    /// Failed items that ran out of retries.
    pub exhausted: u64,
    /// Retries scheduled in total.
    pub retries: u64,
    /// Items never finished because the run stopped early.
    pub not_started: u64,
    /// The run was cancelled.
    pub cancelled: bool,
}

struct Item<R> {
    request: Arc<R>,
    state: RequestState,
    attempts: u32,
    backoff: ExponentialBackoff,
}

struct Delayed<R> {
    due: Instant,
    seq: u64,
    item: Item<R>,
}

impl<R> PartialEq for Delayed<R> {
    fn eq(&self, other: &Self) -> bool {
        (self.due, self.seq) == (other.due, other.seq)
    }
}
impl<R> Eq for Delayed<R> {}
impl<R> PartialOrd for Delayed<R> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl<R> Ord for Delayed<R> {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

/// Bounded, rate-limited request pool over a [`Transport`].
#[derive(Debug)]
pub struct FetchEngine<T> {
    transport: Arc<T>,
    config: FetchConfig,
    limiter: Arc<RateLimiter>,
    cancel: CancellationToken,
}

impl<T: Transport + 'static> FetchEngine<T> {
    /// An engine issuing requests through `transport`. Cancelling `cancel` stops the run
    /// after the requests in flight have finished.
    #[must_use]
    pub fn new(transport: Arc<T>, config: FetchConfig, cancel: CancellationToken) -> Self {
        let limiter = Arc::new(RateLimiter::new(config.rate_limit, config.burst));
        Self {
            transport,
            config,
            limiter,
            cancel,
        }
    }

    /// The engine's tuning.
    #[must_use]
    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    fn backoff(&self) -> ExponentialBackoff {
        let builder = ExponentialBuilder::default()
            .with_min_delay(self.config.backoff_base)
            .with_max_delay(self.config.backoff_max)
            .with_factor(2.0)
            .with_max_times(self.config.max_retries);
        if self.config.jitter {
            builder.with_jitter().build()
        } else {
            builder.build()
        }
    }

    /// Fetches every request once, retrying transient failures.
    ///
    /// `process` turns a response body into the item's output on the worker that fetched it;
    /// an error from it fails the item like a transport error would. `on_done` receives the
    /// final outcome of every item, one at a time, in completion order. Its errors abort the
    /// run.
    ///
    /// A [`FailureClass::FatalGlobal`] failure stops issuing requests, lets the ones in flight
    /// finish (their outcomes are still reported) and returns the failure.
    pub async fn run<O, P, D>(
        &self,
        requests: Vec<T::Request>,
        process: P,
        mut on_done: D,
    ) -> ParcelCoreResult<FetchSummary>
    where
        O: Send + 'static,
        P: Fn(&T::Request, Vec<u8>) -> Result<O, TransportError> + Send + Sync + 'static,
        D: FnMut(&T::Request, ItemOutcome<O>) -> ParcelCoreResult<()>,
    {
        let process = Arc::new(process);
        let concurrency = self.config.concurrency.max(1);
        let mut pending: VecDeque<Item<T::Request>> = requests
            .into_iter()
            .map(|request| Item {
                request: Arc::new(request),
                state: RequestState::Pending,
                attempts: 0,
                backoff: self.backoff(),
            })
            .collect();
        let mut delayed: BinaryHeap<Reverse<Delayed<T::Request>>> = BinaryHeap::new();
        let mut in_flight = JoinSet::new();
        let mut summary = FetchSummary::default();
        let mut fatal: Option<TransportError> = None;
        let mut stopping = false;
        let mut seq = 0_u64;

        loop {
            if !stopping && self.cancel.is_cancelled() {
                info!("Cancelled, waiting for {} requests in flight", in_flight.len());
                stopping = true;
                summary.cancelled = true;
            }
            if !stopping {
                let now = Instant::now();
                while delayed.peek().is_some_and(|Reverse(d)| d.due <= now) {
                    if let Some(Reverse(Delayed { mut item, .. })) = delayed.pop() {
                        item.state = RequestState::Pending;
                        pending.push_back(item);
                    }
                }
                while in_flight.len() < concurrency {
                    let Some(mut item) = pending.pop_front() else {
                        break;
                    };
                    item.state = RequestState::InFlight;
                    item.attempts += 1;
                    let transport = Arc::clone(&self.transport);
                    let limiter = Arc::clone(&self.limiter);
                    let process = Arc::clone(&process);
                    let timeout = self.config.request_timeout;
                    in_flight.spawn(async move {
                        limiter.acquire().await;
                        let fetched =
                            tokio::time::timeout(timeout, transport.fetch(&item.request)).await;
                        let result = match fetched {
                            Ok(Ok(body)) => process(&item.request, body),
                            Ok(Err(e)) => Err(e),
                            Err(_) => Err(TransportError::Timeout(timeout)),
                        };
                        (item, result)
                    });
                }
            }

            if in_flight.is_empty() && (stopping || (pending.is_empty() && delayed.is_empty())) {
                break;
            }

            let next_due = delayed.peek().map(|Reverse(d)| d.due);
            tokio::select! {
                Some(joined) = in_flight.join_next() => {
                    let (mut item, result) = joined?;
                    match result {
                        Ok(output) => {
                            item.state = RequestState::Succeeded;
                            summary.succeeded += 1;
                            if item.attempts > 1 {
                                summary.retried_then_succeeded += 1;
                            }
                            let outcome = ItemOutcome::Succeeded { output, attempts: item.attempts };
                            on_done(&item.request, outcome)?;
                        }
                        Err(error) => match error.class() {
                            FailureClass::Retryable if stopping => {
                                summary.not_started += 1;
                            }
                            FailureClass::Retryable => {
                                if let Some(delay) = item.backoff.next() {
                                    debug!(
                                        "Attempt {} of {:?} failed ({error}), retrying in {delay:?}",
                                        item.attempts, item.request
                                    );
                                    item.state = RequestState::Backoff;
                                    summary.retries += 1;
                                    seq += 1;
                                    delayed.push(Reverse(Delayed {
                                        due: Instant::now() + delay,
                                        seq,
                                        item,
                                    }));
                                } else {
                                    warn!(
                                        "Giving up on {:?} after {} attempts: {error}",
                                        item.request, item.attempts
                                    );
                                    item.state = RequestState::Failed;
                                    summary.failed += 1;
                                    summary.exhausted += 1;
                                    let outcome = ItemOutcome::Failed { error, attempts: item.attempts };
                                    on_done(&item.request, outcome)?;
                                }
                            }
                            FailureClass::FatalItem => {
                                warn!("Failed to fetch {:?}: {error}", item.request);
                                item.state = RequestState::Failed;
                                summary.failed += 1;
                                let outcome = ItemOutcome::Failed { error, attempts: item.attempts };
                                on_done(&item.request, outcome)?;
                            }
                            FailureClass::FatalGlobal => {
                                summary.not_started += 1;
                                if !stopping {
                                    error!(
                                        "{error} while fetching {:?}, stopping after {} requests in flight",
                                        item.request,
                                        in_flight.len()
                                    );
                                    stopping = true;
                                }
                                fatal.get_or_insert(error);
                            }
                        },
                    }
                }
                () = sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() && !stopping => {}
                () = self.cancel.cancelled(), if !stopping => {}
                else => break,
            }
        }

        summary.not_started += (pending.len() + delayed.len()) as u64;
        match fatal {
            Some(error) => Err(ParcelCoreError::FatalTransport(error)),
            None => Ok(summary),
        }
    }
}
