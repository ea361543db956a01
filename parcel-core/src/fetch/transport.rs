use std::fmt::Debug;

use async_trait::async_trait;

use super::TransportError;

/// Raw access to the remote service.
///
/// Implementations perform exactly one attempt per call; retries, pacing and timeouts are the
/// [`FetchEngine`](super::FetchEngine)'s job.
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// What identifies one resource, e.g. a tile coordinate or a parcel id.
    type Request: Send + Sync + Debug + 'static;

    /// Fetches the body of one resource.
    ///
    /// A resource that exists but has no content is an empty body, not an error.
    async fn fetch(&self, request: &Self::Request) -> Result<Vec<u8>, TransportError>;
}
