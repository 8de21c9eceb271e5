//! The seam between the sync engine and its remote collaborators: the typed
//! wire-event model for the persistent connection, plus the traits the
//! engine consumes for subscribing, fetching history, and acknowledging
//! reads. Implementations (websocket transport, HTTP client) live outside
//! the engine.

use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use concord_core::event::PresenceStatus;
use concord_core::ids::{ChannelId, GuildId, MessageId, UserId};
use concord_core::message::Message;

mod rest;

pub use rest::{FetchAnchor, FetchClient, FetchError};

/// One frame from the persistent connection's ordered event stream.
///
/// The wire envelope is `{"t": "EVENT_NAME", "d": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t", content = "d", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayEvent {
    MessageCreate(Message),
    MessageUpdate(Message),
    MessageDelete {
        #[serde(rename = "channelId")]
        channel_id: ChannelId,
        id: MessageId,
    },
    MessageReactionAdd(ReactionChange),
    MessageReactionRemove(ReactionChange),
    ReadStateSync {
        #[serde(rename = "channelId")]
        channel_id: ChannelId,
        #[serde(rename = "lastReadId")]
        last_read: Option<MessageId>,
        #[serde(rename = "mentionCount")]
        mention_count: u32,
    },
    PresenceUpdate {
        #[serde(rename = "userId")]
        user_id: UserId,
        status: PresenceStatus,
    },
    TypingStart {
        #[serde(rename = "channelId")]
        channel_id: ChannelId,
        #[serde(rename = "userId")]
        user_id: UserId,
        timestamp: DateTime<Utc>,
    },
    /// Emitted by the transport after it re-established the connection.
    /// The transport keeps no subscription state across this boundary.
    Reconnected,
}

impl GatewayEvent {
    /// The channel a per-channel event targets, if any.
    pub fn channel_id(&self) -> Option<ChannelId> {
        match self {
            GatewayEvent::MessageCreate(message) | GatewayEvent::MessageUpdate(message) => {
                Some(message.channel_id)
            }
            GatewayEvent::MessageDelete { channel_id, .. }
            | GatewayEvent::ReadStateSync { channel_id, .. }
            | GatewayEvent::TypingStart { channel_id, .. } => Some(*channel_id),
            GatewayEvent::MessageReactionAdd(change)
            | GatewayEvent::MessageReactionRemove(change) => Some(change.channel_id),
            GatewayEvent::PresenceUpdate { .. } | GatewayEvent::Reconnected => None,
        }
    }
}

/// A reaction added to or removed from a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionChange {
    pub channel_id: ChannelId,
    pub message_id: MessageId,
    pub user_id: UserId,
    pub emoji: String,
}

/// Parse one raw frame from the live stream. Malformed frames are an
/// expected condition (the stream is not contractually well-formed), so the
/// caller logs and drops rather than propagating.
pub fn parse_event(raw: &str) -> Result<GatewayEvent, TransportError> {
    serde_json::from_str(raw).map_err(|e| {
        warn!(error = %e, "dropping malformed gateway frame");
        TransportError::MalformedEvent(e.to_string())
    })
}

/// What a live-update subscription is keyed on: a whole guild, or a single
/// channel for guildless (DM) channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "camelCase")]
pub enum SubscribeTarget {
    Guild(GuildId),
    Channel(ChannelId),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("transport disconnected")]
    Disconnected,

    #[error("malformed event: {0}")]
    MalformedEvent(String),

    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),
}

/// The persistent connection's control surface. The ordered event stream
/// itself is delivered out-of-band as an `mpsc::Receiver<GatewayEvent>`
/// handed to the router at connect time.
pub trait Transport: Send + Sync + 'static {
    fn subscribe(
        &self,
        target: SubscribeTarget,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn unsubscribe(
        &self,
        target: SubscribeTarget,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Read-only view of the active subscription set, used by the router to
/// discard events for targets nothing is watching.
pub trait SubscriptionFilter: Send + Sync + 'static {
    fn is_subscribed(&self, target: SubscribeTarget) -> bool;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum AckError {
    #[error("network error: {0}")]
    Network(String),
}

/// Fire-and-forget read acknowledgment endpoint. Failure is logged, never
/// surfaced; local read state has already advanced by the time this is
/// called.
pub trait AckClient: Send + Sync + 'static {
    fn mark_read(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> impl Future<Output = Result<(), AckError>> + Send;
}
