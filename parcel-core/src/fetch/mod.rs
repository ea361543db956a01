//! Fetching many small resources from a remote service that is slow, flaky and rate limited.
//!
//! The [`FetchEngine`] keeps a bounded number of requests in flight, spaces them with a shared
//! token-bucket [`RateLimiter`] and retries transient failures with exponential backoff and
//! jitter. Every item goes through the same states:
//!
//! ```text
//! Pending -> InFlight -> Succeeded
//!               |    \-> Failed (fatal for this item, or retries exhausted)
//!               \-> Backoff -> Pending
//! ```
//!
//! Items waiting out their backoff hold neither a worker slot nor a rate limit token.

mod engine;
pub use engine::{FetchConfig, FetchEngine, FetchSummary, ItemOutcome, RequestState};

mod error;
pub use error::{FailureClass, TransportError};

mod limiter;
pub use limiter::RateLimiter;

mod transport;
pub use transport::Transport;
