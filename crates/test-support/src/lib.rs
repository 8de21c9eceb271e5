//! Mock collaborators and fixture builders shared across crate tests.
//! Mocks record every call and replay scripted responses, so tests can
//! assert both outcomes and the exact traffic sent to the remote side.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use concord_core::ids::{AttachmentId, ChannelId, MessageId, UserId};
use concord_core::message::{Attachment, Message, MessageKind};
use concord_gateway::{
    AckClient, AckError, FetchAnchor, FetchClient, FetchError, SubscribeTarget, Transport,
    TransportError,
};

/// Builder for test messages; only the fields a test cares about need
/// setting.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    message: Message,
}

impl MessageBuilder {
    pub fn new(id: u64) -> Self {
        Self {
            message: Message {
                id: MessageId(id),
                channel_id: ChannelId(1),
                author_id: UserId(1),
                content: format!("test message {id}"),
                edited_at: None,
                reactions: Default::default(),
                reply_to: None,
                attachments: Vec::new(),
                pinned: false,
                kind: MessageKind::Default,
                mentions: Vec::new(),
                mention_everyone: false,
            },
        }
    }

    pub fn channel(mut self, channel_id: u64) -> Self {
        self.message.channel_id = ChannelId(channel_id);
        self
    }

    pub fn author(mut self, author_id: u64) -> Self {
        self.message.author_id = UserId(author_id);
        self
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.message.content = content.into();
        self
    }

    pub fn mentioning(mut self, user_id: u64) -> Self {
        self.message.mentions.push(UserId(user_id));
        self
    }

    pub fn mention_everyone(mut self) -> Self {
        self.message.mention_everyone = true;
        self
    }

    pub fn replying_to(mut self, message_id: u64) -> Self {
        self.message.reply_to = Some(MessageId(message_id));
        self.message.kind = MessageKind::Reply;
        self
    }

    pub fn edited(mut self) -> Self {
        self.message.edited_at = Some(chrono::Utc::now());
        self
    }

    pub fn pinned(mut self) -> Self {
        self.message.pinned = true;
        self
    }

    pub fn attachment(mut self, id: u64, filename: impl Into<String>) -> Self {
        self.message.attachments.push(Attachment {
            id: AttachmentId(id),
            filename: filename.into(),
            url: String::new(),
            size: 0,
        });
        self
    }

    pub fn build(self) -> Message {
        self.message
    }
}

/// Shorthand for the common case.
pub fn message(id: u64, channel_id: u64, author_id: u64) -> Message {
    MessageBuilder::new(id)
        .channel(channel_id)
        .author(author_id)
        .build()
}

/// A page of consecutive-id messages, newest first, as the history
/// endpoint returns them.
pub fn page(channel_id: u64, newest_id: u64, count: u64) -> Vec<Message> {
    let oldest = newest_id.saturating_sub(count.saturating_sub(1));
    (oldest..=newest_id)
        .rev()
        .map(|id| message(id, channel_id, 1))
        .collect()
}

/// One recorded call to [`MockFetchClient::fetch_messages`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordedFetch {
    pub channel_id: ChannelId,
    pub anchor: FetchAnchor,
    pub limit: u32,
}

/// History endpoint that replays scripted responses in order. When the
/// script is exhausted it serves empty pages.
#[derive(Default)]
pub struct MockFetchClient {
    responses: Mutex<VecDeque<Result<Vec<Message>, FetchError>>>,
    calls: Mutex<Vec<RecordedFetch>>,
    delay: Mutex<Option<Duration>>,
}

impl MockFetchClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, response: Result<Vec<Message>, FetchError>) -> &Self {
        self.responses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(response);
        self
    }

    pub fn enqueue_page(&self, messages: Vec<Message>) -> &Self {
        self.enqueue(Ok(messages))
    }

    pub fn enqueue_error(&self, error: FetchError) -> &Self {
        self.enqueue(Err(error))
    }

    /// Delay every response, for exercising timeouts and in-flight state.
    pub fn set_delay(&self, delay: Duration) {
        *self
            .delay
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(delay);
    }

    pub fn calls(&self) -> Vec<RecordedFetch> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

impl FetchClient for MockFetchClient {
    async fn fetch_messages(
        &self,
        channel_id: ChannelId,
        anchor: FetchAnchor,
        limit: u32,
    ) -> Result<Vec<Message>, FetchError> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(RecordedFetch {
                channel_id,
                anchor,
                limit,
            });

        let delay = *self
            .delay
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.responses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

/// One recorded call to the subscription control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportCall {
    Subscribe(SubscribeTarget),
    Unsubscribe(SubscribeTarget),
}

/// Transport that records subscribe/unsubscribe traffic in order.
#[derive(Default)]
pub struct MockTransport {
    calls: Mutex<Vec<TransportCall>>,
    fail_subscribes: Mutex<bool>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_subscribes(&self, fail: bool) {
        *self
            .fail_subscribes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = fail;
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn clear_calls(&self) {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    pub fn subscribe_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, TransportCall::Subscribe(_)))
            .count()
    }
}

impl Transport for MockTransport {
    async fn subscribe(&self, target: SubscribeTarget) -> Result<(), TransportError> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(TransportCall::Subscribe(target));
        if *self
            .fail_subscribes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
        {
            return Err(TransportError::SubscribeFailed("scripted failure".into()));
        }
        Ok(())
    }

    async fn unsubscribe(&self, target: SubscribeTarget) -> Result<(), TransportError> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(TransportCall::Unsubscribe(target));
        Ok(())
    }
}

/// Read-acknowledgment endpoint that records marks and can be scripted to
/// fail.
#[derive(Default)]
pub struct MockAckClient {
    marks: Mutex<Vec<(ChannelId, MessageId)>>,
    fail: Mutex<bool>,
}

impl MockAckClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_marks(&self, fail: bool) {
        *self
            .fail
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = fail;
    }

    pub fn marks(&self) -> Vec<(ChannelId, MessageId)> {
        self.marks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl AckClient for MockAckClient {
    async fn mark_read(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> Result<(), AckError> {
        self.marks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((channel_id, message_id));
        if *self
            .fail
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
        {
            return Err(AckError::Network("scripted failure".into()));
        }
        Ok(())
    }
}
