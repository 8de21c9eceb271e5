use std::future::Future;
use std::time::Duration;

use concord_core::ids::{ChannelId, MessageId};
use concord_core::message::Message;

/// Where a message-history fetch is anchored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchAnchor {
    /// Messages strictly older than the given id.
    Before(MessageId),
    /// Messages strictly newer than the given id.
    After(MessageId),
    /// A window centered on the given id.
    Around(MessageId),
    /// The newest messages in the channel.
    Latest,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("channel not found")]
    NotFound,
}

impl FetchError {
    /// Whether the caller may usefully retry the same request.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FetchError::NotFound)
    }
}

/// Request/response history endpoint. Returns a page of messages in
/// newest-first order; a page shorter than `limit` means the queried edge
/// is exhausted.
pub trait FetchClient: Send + Sync + 'static {
    fn fetch_messages(
        &self,
        channel_id: ChannelId,
        anchor: FetchAnchor,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<Message>, FetchError>> + Send;
}
