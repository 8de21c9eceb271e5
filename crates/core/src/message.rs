use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AttachmentId, ChannelId, MessageId, UserId};

/// A single chat message as delivered by the fetch endpoint or the live
/// stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Snowflake id; ordering and creation time derive from it
    pub id: MessageId,

    /// Channel this message belongs to
    pub channel_id: ChannelId,

    /// Author's user id
    pub author_id: UserId,

    /// Plain-text content (rendering is someone else's problem)
    pub content: String,

    /// Set when the message has been edited
    pub edited_at: Option<DateTime<Utc>>,

    /// Reactions keyed by emoji
    #[serde(default)]
    pub reactions: BTreeMap<String, Reaction>,

    /// Message this one replies to, if any
    pub reply_to: Option<MessageId>,

    /// Uploaded attachments
    #[serde(default)]
    pub attachments: Vec<Attachment>,

    /// Pinned in its channel
    #[serde(default)]
    pub pinned: bool,

    /// Regular message or a system notice
    #[serde(default)]
    pub kind: MessageKind,

    /// Users explicitly mentioned
    #[serde(default)]
    pub mentions: Vec<UserId>,

    /// @everyone / @here style broadcast mention
    #[serde(default)]
    pub mention_everyone: bool,
}

impl Message {
    /// Whether this message is addressed to `user`, either explicitly or via
    /// a broadcast mention.
    pub fn mentions(&self, user: UserId) -> bool {
        self.mention_everyone || self.mentions.contains(&user)
    }
}

/// Aggregated reaction state for one emoji on one message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    /// Total number of users who reacted
    pub count: u32,

    /// Whether the current user is among them
    pub me: bool,
}

/// File attached to a message. Only metadata; bytes are fetched lazily by
/// the rendering layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: AttachmentId,
    pub filename: String,
    pub url: String,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    #[default]
    Default,
    Reply,
    /// Join notices, pin notices, boosts — anything the server narrates
    System,
}
