//! In-memory message windows. One [`MessageStore`] holds the loaded slice of
//! one channel's history: unique by id, ordered newest-first, addressable by
//! id without a scan. The [`ChannelRegistry`] owns one store per active
//! channel behind its own lock, so channels never contend with each other.

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use concord_core::ids::MessageId;
use concord_core::message::{Message, Reaction};

mod registry;

pub use registry::{ChannelDirectory, ChannelMeta, ChannelRegistry};

/// Default retention cap; roughly three 50-message pages either side of a
/// jumped-to window.
pub const DEFAULT_RETENTION_LIMIT: usize = 300;

/// Where a fetched page sits relative to the already-loaded window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagePosition {
    Older,
    Newer,
    /// A fresh window centered on an arbitrary id; discards the existing
    /// window since contiguity with it cannot be assumed.
    Around(MessageId),
}

/// A single-message mutation from the live stream.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    Insert(Message),
    Update(Message),
    Delete(MessageId),
}

/// The loaded message window of one channel.
///
/// Every operation is total: unknown ids and duplicate deliveries are benign
/// no-ops, because the live stream is at-least-once and unordered relative
/// to fetches.
#[derive(Debug)]
pub struct MessageStore {
    by_id: HashMap<MessageId, Message>,
    order: BTreeSet<MessageId>,
    has_older: bool,
    has_newer: bool,
    retention_limit: usize,
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION_LIMIT)
    }
}

impl MessageStore {
    pub fn new(retention_limit: usize) -> Self {
        Self {
            by_id: HashMap::new(),
            order: BTreeSet::new(),
            has_older: true,
            has_newer: true,
            retention_limit: retention_limit.max(1),
        }
    }

    /// Merge a fetched page. `requested` is the page size that was asked
    /// for; a shorter page means the queried edge is exhausted.
    pub fn insert_page(&mut self, messages: Vec<Message>, position: PagePosition, requested: u32) {
        let fetched = messages.len();

        match position {
            PagePosition::Older => {
                if fetched < requested as usize {
                    self.has_older = false;
                }
                self.insert_all(messages);
                self.trim_newest();
            }
            PagePosition::Newer => {
                if fetched < requested as usize {
                    self.has_newer = false;
                }
                self.insert_all(messages);
                self.trim_oldest();
            }
            PagePosition::Around(target) => {
                // Reseed: whatever was loaded before is not known to be
                // contiguous with the new window.
                self.by_id.clear();
                self.order.clear();
                self.has_older = true;
                self.has_newer = true;
                self.insert_all(messages);
                self.trim_around(target);
            }
        }
    }

    /// Apply a single live mutation. Returns the message now reflecting the
    /// mutation when it changed anything, `None` when it was a no-op.
    pub fn apply(&mut self, event: StoreEvent) -> Option<Message> {
        match event {
            StoreEvent::Insert(message) => {
                // Idempotent under at-least-once delivery. A prior delete is
                // not remembered: a late redelivery re-inserts at its sorted
                // position.
                if self.by_id.contains_key(&message.id) {
                    return None;
                }
                self.order.insert(message.id);
                self.by_id.insert(message.id, message.clone());
                self.trim_oldest();
                Some(message)
            }
            StoreEvent::Update(message) => {
                // No partial materialization: updates for ids we never
                // loaded are dropped.
                if !self.by_id.contains_key(&message.id) {
                    return None;
                }
                self.by_id.insert(message.id, message.clone());
                Some(message)
            }
            StoreEvent::Delete(id) => {
                self.order.remove(&id);
                self.by_id.remove(&id).map(|removed| {
                    debug!(message_id = %id, "removed message");
                    removed
                })
            }
        }
    }

    /// Apply a reaction delta in place. Unknown message id is a no-op.
    pub fn apply_reaction(
        &mut self,
        message_id: MessageId,
        emoji: &str,
        added: bool,
        me: bool,
    ) -> Option<Message> {
        let message = self.by_id.get_mut(&message_id)?;
        let entry = message.reactions.entry(emoji.to_string()).or_default();
        if added {
            entry.count = entry.count.saturating_add(1);
            entry.me = entry.me || me;
        } else {
            entry.count = entry.count.saturating_sub(1);
            if me {
                entry.me = false;
            }
        }
        if entry.count == 0 {
            message.reactions.remove(emoji);
        }
        Some(message.clone())
    }

    /// Snapshot of the loaded window, newest first.
    pub fn messages(&self) -> Vec<Message> {
        self.order
            .iter()
            .rev()
            .filter_map(|id| self.by_id.get(id))
            .cloned()
            .collect()
    }

    /// Snapshot for a jump to `target`. The target may not be loaded yet;
    /// the caller renders what is present and requests an around-fetch for
    /// the rest.
    pub fn messages_around(&self, _target: MessageId) -> Vec<Message> {
        self.messages()
    }

    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.by_id.get(&id)
    }

    pub fn reaction(&self, id: MessageId, emoji: &str) -> Option<Reaction> {
        self.by_id.get(&id)?.reactions.get(emoji).cloned()
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.by_id.contains_key(&id)
    }

    pub fn newest_id(&self) -> Option<MessageId> {
        self.order.last().copied()
    }

    pub fn oldest_id(&self) -> Option<MessageId> {
        self.order.first().copied()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn has_older(&self) -> bool {
        self.has_older
    }

    pub fn has_newer(&self) -> bool {
        self.has_newer
    }

    fn insert_all(&mut self, messages: Vec<Message>) {
        for message in messages {
            if self.by_id.contains_key(&message.id) {
                continue;
            }
            self.order.insert(message.id);
            self.by_id.insert(message.id, message);
        }
    }

    /// Evict overflow from the old edge. Evicted history can be refetched,
    /// so `has_older` re-arms.
    fn trim_oldest(&mut self) {
        while self.order.len() > self.retention_limit {
            if let Some(oldest) = self.order.pop_first() {
                self.by_id.remove(&oldest);
                self.has_older = true;
            }
        }
    }

    /// Evict overflow from the new edge; the evicted messages are newer
    /// than the window, so `has_newer` re-arms.
    fn trim_newest(&mut self) {
        while self.order.len() > self.retention_limit {
            if let Some(newest) = self.order.pop_last() {
                self.by_id.remove(&newest);
                self.has_newer = true;
            }
        }
    }

    /// Keep the window centered on `target`, evicting the farther edge
    /// first.
    fn trim_around(&mut self, target: MessageId) {
        while self.order.len() > self.retention_limit {
            let (Some(oldest), Some(newest)) =
                (self.order.first().copied(), self.order.last().copied())
            else {
                break;
            };
            let old_distance = target.get().saturating_sub(oldest.get());
            let new_distance = newest.get().saturating_sub(target.get());
            if new_distance >= old_distance {
                self.order.remove(&newest);
                self.by_id.remove(&newest);
                self.has_newer = true;
            } else {
                self.order.remove(&oldest);
                self.by_id.remove(&oldest);
                self.has_older = true;
            }
        }
    }
}
