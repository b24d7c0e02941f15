//! Remote task channel - the platform's long-poll and result endpoints.
//!
//! The channel is the only inbound work source. A poll is bounded by a timeout and
//! aborted as soon as the cancellation token fires; result delivery is best-effort.

mod error;
mod http;

pub use error::{ChannelError, ChannelErrorKind};
pub use http::HttpTaskChannel;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::task::{ResultEnvelope, Task};

/// Outcome of one `/listen` request.
#[derive(Debug)]
pub enum PollOutcome {
    /// 200 with a decodable task
    Task(Task),
    /// 204, nothing to do
    Empty,
    /// Any other status, a timeout or a transport failure
    Failed(ChannelError),
    /// The cancellation token fired while the request was outstanding
    Cancelled,
}

/// Transport to the task platform.
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// Wait for the next task. Must return [`PollOutcome::Cancelled`] promptly once
    /// `cancel` fires.
    async fn poll(&self, credential: &str, base_url: &str, cancel: &CancellationToken) -> PollOutcome;

    /// Report a task outcome. Callers log a failure and move on; it is never retried.
    async fn submit_result(
        &self,
        credential: &str,
        base_url: &str,
        envelope: &ResultEnvelope,
    ) -> Result<(), ChannelError>;
}

/// Join a base URL and an endpoint path without doubling slashes.
pub(crate) fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
}
