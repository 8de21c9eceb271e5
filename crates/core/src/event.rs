use chrono::{DateTime, Utc};
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::ids::{ChannelId, GuildId, MessageId, UserId};
use crate::message::Message;

/// Hierarchical channel name validation and parsing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Channel(String);

impl Channel {
    /// Create a new channel, validating its format.
    pub fn new(name: impl Into<String>) -> std::result::Result<Self, crate::error::EventBusError> {
        let name = name.into();
        if Self::is_valid(&name) {
            Ok(Self(name))
        } else {
            Err(crate::error::EventBusError::InvalidChannel(name))
        }
    }

    /// Check if a channel name is valid.
    pub fn is_valid(name: &str) -> bool {
        if name.is_empty() || name.starts_with('.') || name.ends_with('.') || name.contains("..") {
            return false;
        }

        // Must be lowercase and only contain a-z, 0-9, and dots
        if name
            .chars()
            .any(|c| !matches!(c, 'a'..='z' | '0'..='9' | '.'))
        {
            return false;
        }

        let parts: Vec<&str> = name.split('.').collect();
        if parts.is_empty() {
            return false;
        }

        match parts[0] {
            "system" | "gateway" | "ui" | "sync" => {}
            _ => return false,
        }

        true
    }

    /// Get the domain of the channel.
    pub fn domain(&self) -> &str {
        self.0.split('.').next().unwrap_or("")
    }

    /// Get the full channel name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.0
    }
}

/// The standard event envelope wrapping all events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Hierarchical channel name (e.g., "sync.message.added")
    pub channel: Channel,

    /// When the event was created (UTC)
    pub timestamp: DateTime<Utc>,

    /// Unique identifier for this event
    pub id: Uuid,

    /// Optional correlation ID linking related events (e.g., request-response)
    pub correlation_id: Option<Uuid>,

    /// Source component that emitted this event
    pub source: EventSource,

    /// The typed event payload
    pub payload: EventPayload,
}

impl Event {
    /// Create a new event with a given channel and payload.
    pub fn new(channel: Channel, source: EventSource, payload: EventPayload) -> Self {
        Self {
            channel,
            timestamp: Utc::now(),
            id: Uuid::new_v4(),
            correlation_id: None,
            source,
            payload,
        }
    }

    /// Create a new event with a correlation ID.
    pub fn with_correlation(
        channel: Channel,
        source: EventSource,
        payload: EventPayload,
        correlation_id: Uuid,
    ) -> Self {
        Self {
            channel,
            timestamp: Utc::now(),
            id: Uuid::new_v4(),
            correlation_id: Some(correlation_id),
            source,
            payload,
        }
    }
}

/// Identifies the source of an event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "camelCase")]
pub enum EventSource {
    /// Core engine component, by name (e.g. "router", "pagination")
    System(String),
    /// The persistent gateway connection
    Gateway,
    /// User interface
    Ui,
}

/// Which edge of the message window a page load targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LoadDirection {
    Older,
    Newer,
    Around,
}

/// Presence state relayed from the live stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PresenceStatus {
    Online,
    Idle,
    Dnd,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum EventPayload {
    // ── System events ──────────────────────────────────────────────
    SessionReady,
    SessionEnded {
        reason: String,
    },
    ErrorOccurred {
        component: String,
        message: String,
        recoverable: bool,
    },

    // ── Gateway connection events ─────────────────────────────────
    ConnectionEstablished,
    ConnectionLost {
        reason: String,
        will_retry: bool,
    },
    /// The transport reconnected and holds no memory of prior
    /// subscriptions; the whole active set must be resubscribed.
    ResubscribeRequired,

    // ── Sync engine output ────────────────────────────────────────
    MessageAdded {
        channel_id: ChannelId,
        message: Message,
    },
    MessageEdited {
        channel_id: ChannelId,
        message: Message,
    },
    MessageRemoved {
        channel_id: ChannelId,
        message_id: MessageId,
    },
    PageLoaded {
        channel_id: ChannelId,
        direction: LoadDirection,
        count: usize,
    },
    StoreReset {
        channel_id: ChannelId,
    },
    MentionAdded {
        guild_id: Option<GuildId>,
        channel_id: ChannelId,
        message_id: MessageId,
    },
    ReadStateChanged {
        channel_id: ChannelId,
        last_read: Option<MessageId>,
        mention_count: u32,
    },
    FetchFailed {
        channel_id: ChannelId,
        direction: LoadDirection,
        reason: String,
        retryable: bool,
    },
    PresenceUpdated {
        user_id: UserId,
        status: PresenceStatus,
    },
    TypingStarted {
        channel_id: ChannelId,
        user_id: UserId,
        started_at: DateTime<Utc>,
    },

    // ── UI events ────────────────────────────────────────────────
    ChannelOpened {
        channel_id: ChannelId,
        guild_id: Option<GuildId>,
    },
    ChannelClosed {
        channel_id: ChannelId,
    },
    DmOpened {
        channel_id: ChannelId,
    },
    DmClosed {
        channel_id: ChannelId,
    },
    JumpRequested {
        channel_id: ChannelId,
        message_id: MessageId,
    },
}

pub trait EventBus: Send + Sync + 'static {
    fn publish(&self, event: Event) -> std::result::Result<(), crate::error::EventBusError>;
    fn subscribe(
        &self,
        pattern: &str,
    ) -> std::result::Result<EventSubscription, crate::error::EventBusError>;
}

#[derive(Clone)]
pub struct BroadcastEventBus {
    system_sender: broadcast::Sender<Event>,
    gateway_sender: broadcast::Sender<Event>,
    ui_sender: broadcast::Sender<Event>,
    sync_sender: broadcast::Sender<Event>,
}

impl BroadcastEventBus {
    pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

    pub fn new(channel_capacity: usize) -> Self {
        let capacity = channel_capacity.max(1);
        let (system_sender, _) = broadcast::channel(capacity);
        let (gateway_sender, _) = broadcast::channel(capacity);
        let (ui_sender, _) = broadcast::channel(capacity);
        let (sync_sender, _) = broadcast::channel(capacity);

        Self {
            system_sender,
            gateway_sender,
            ui_sender,
            sync_sender,
        }
    }

    fn sender_for_domain(&self, domain: &str) -> Option<&broadcast::Sender<Event>> {
        match domain {
            "system" => Some(&self.system_sender),
            "gateway" => Some(&self.gateway_sender),
            "ui" => Some(&self.ui_sender),
            "sync" => Some(&self.sync_sender),
            _ => None,
        }
    }

    fn receivers_for_pattern(
        &self,
        pattern: &str,
    ) -> std::result::Result<DomainReceivers, crate::error::EventBusError> {
        let first_segment = pattern.split('.').next().unwrap_or_default();

        if first_segment.is_empty() {
            return Err(crate::error::EventBusError::InvalidPattern(
                pattern.to_string(),
            ));
        }

        // Patterns like "{ui,gateway}.**" start with a glob group and fan
        // out to every domain shard; the matcher filters after delivery.
        if has_glob_meta(first_segment) {
            return Ok(DomainReceivers {
                system: Some(self.system_sender.subscribe()),
                gateway: Some(self.gateway_sender.subscribe()),
                ui: Some(self.ui_sender.subscribe()),
                sync: Some(self.sync_sender.subscribe()),
            });
        }

        match first_segment {
            "system" => Ok(DomainReceivers {
                system: Some(self.system_sender.subscribe()),
                ..DomainReceivers::default()
            }),
            "gateway" => Ok(DomainReceivers {
                gateway: Some(self.gateway_sender.subscribe()),
                ..DomainReceivers::default()
            }),
            "ui" => Ok(DomainReceivers {
                ui: Some(self.ui_sender.subscribe()),
                ..DomainReceivers::default()
            }),
            "sync" => Ok(DomainReceivers {
                sync: Some(self.sync_sender.subscribe()),
                ..DomainReceivers::default()
            }),
            _ => Err(crate::error::EventBusError::InvalidPattern(
                pattern.to_string(),
            )),
        }
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CHANNEL_CAPACITY)
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, event: Event) -> std::result::Result<(), crate::error::EventBusError> {
        let sender = self
            .sender_for_domain(event.channel.domain())
            .ok_or_else(|| {
                crate::error::EventBusError::InvalidChannel(event.channel.to_string())
            })?;

        let _ = sender.send(event);
        Ok(())
    }

    fn subscribe(
        &self,
        pattern: &str,
    ) -> std::result::Result<EventSubscription, crate::error::EventBusError> {
        let matcher = Glob::new(pattern)
            .map_err(|_| crate::error::EventBusError::InvalidPattern(pattern.to_string()))?
            .compile_matcher();
        let receivers = self.receivers_for_pattern(pattern)?;

        Ok(EventSubscription { matcher, receivers })
    }
}

#[derive(Default)]
struct DomainReceivers {
    system: Option<broadcast::Receiver<Event>>,
    gateway: Option<broadcast::Receiver<Event>>,
    ui: Option<broadcast::Receiver<Event>>,
    sync: Option<broadcast::Receiver<Event>>,
}

pub struct EventSubscription {
    matcher: GlobMatcher,
    receivers: DomainReceivers,
}

impl EventSubscription {
    pub async fn recv(&mut self) -> std::result::Result<Event, crate::error::EventBusError> {
        loop {
            let system_receiver = self.receivers.system.as_mut();
            let gateway_receiver = self.receivers.gateway.as_mut();
            let ui_receiver = self.receivers.ui.as_mut();
            let sync_receiver = self.receivers.sync.as_mut();

            let received = tokio::select! {
                result = recv_from_domain(system_receiver) => result,
                result = recv_from_domain(gateway_receiver) => result,
                result = recv_from_domain(ui_receiver) => result,
                result = recv_from_domain(sync_receiver) => result,
            };

            match received {
                Ok(event) if self.matcher.is_match(event.channel.as_str()) => return Ok(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(crate::error::EventBusError::ChannelClosed);
                }
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    return Err(crate::error::EventBusError::Lagged(count));
                }
            }
        }
    }
}

async fn recv_from_domain(
    receiver: Option<&mut broadcast::Receiver<Event>>,
) -> std::result::Result<Event, broadcast::error::RecvError> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

fn has_glob_meta(segment: &str) -> bool {
    segment.contains('*')
        || segment.contains('?')
        || segment.contains('[')
        || segment.contains(']')
        || segment.contains('{')
        || segment.contains('}')
        || segment.contains('!')
}
