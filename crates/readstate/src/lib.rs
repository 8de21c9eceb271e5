//! Read markers and mention counters, per channel and aggregated per
//! guild. Local acknowledgment is optimistic: state advances immediately
//! and the server mark is fired best-effort afterwards. External sync from
//! another device always overwrites.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use concord_core::event::{Channel, Event, EventBus, EventPayload, EventSource};
use concord_core::ids::{ChannelId, GuildId, MessageId};
use concord_gateway::AckClient;
use concord_store::{ChannelDirectory, ChannelRegistry};

/// Read position and unread counters for one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadState {
    /// Newest message the user has acknowledged.
    pub last_read: Option<MessageId>,
    /// Mentions since the last acknowledgment.
    pub mention_count: u32,
    /// Newest id the server has told us about, whether or not it is still
    /// in the store. Acknowledge falls back to this when the window was
    /// evicted.
    pub latest_known: Option<MessageId>,
}

impl ReadState {
    pub fn is_unread(&self) -> bool {
        match (self.latest_known, self.last_read) {
            (Some(latest), Some(read)) => latest > read,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

pub struct ReadStateTracker<A: AckClient> {
    ack: Arc<A>,
    registry: Arc<ChannelRegistry>,
    directory: Arc<ChannelDirectory>,
    bus: Arc<dyn EventBus>,
    states: RwLock<HashMap<ChannelId, ReadState>>,
}

impl<A: AckClient> ReadStateTracker<A> {
    pub fn new(
        ack: Arc<A>,
        registry: Arc<ChannelRegistry>,
        directory: Arc<ChannelDirectory>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            ack,
            registry,
            directory,
            bus,
            states: RwLock::new(HashMap::new()),
        }
    }

    /// Note a newly arrived message. Does not touch the read marker; the
    /// channel simply becomes unread if the id is past it. Ids are monotone,
    /// so a redelivery does not advance `latest_known` and returns `false`.
    pub fn record_message(&self, channel_id: ChannelId, message_id: MessageId) -> bool {
        let mut states = self
            .states
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let state = states.entry(channel_id).or_default();
        if state.latest_known.is_none_or(|known| message_id > known) {
            state.latest_known = Some(message_id);
            true
        } else {
            false
        }
    }

    /// Count a mention of the current user. Counters only ever go up
    /// between acknowledgments.
    pub fn increment_mention(&self, channel_id: ChannelId) {
        let updated = {
            let mut states = self
                .states
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let state = states.entry(channel_id).or_default();
            state.mention_count = state.mention_count.saturating_add(1);
            *state
        };
        self.publish_changed(channel_id, updated);
    }

    /// Mark the channel read up to the newest known message and push the
    /// mark to the server. Local state advances even when the server call
    /// fails; the next sync reconciles.
    pub async fn acknowledge(&self, channel_id: ChannelId) {
        let newest_in_store = self.registry.store(channel_id).and_then(|store| {
            store
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .newest_id()
        });

        let (target, updated) = {
            let mut states = self
                .states
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let state = states.entry(channel_id).or_default();
            let target = newest_in_store.or(state.latest_known);
            if let Some(target) = target {
                state.last_read = Some(target);
                if state.latest_known.is_none_or(|known| target > known) {
                    state.latest_known = Some(target);
                }
            }
            state.mention_count = 0;
            (target, *state)
        };

        self.publish_changed(channel_id, updated);

        if let Some(target) = target {
            if let Err(error) = self.ack.mark_read(channel_id, target).await {
                warn!(channel_id = %channel_id, %error, "read acknowledgment failed");
            }
        }
    }

    /// Authoritative read state from another device or the session sync.
    pub fn apply_external_sync(
        &self,
        channel_id: ChannelId,
        last_read: Option<MessageId>,
        mention_count: u32,
    ) {
        let updated = {
            let mut states = self
                .states
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let state = states.entry(channel_id).or_default();
            state.last_read = last_read;
            state.mention_count = mention_count;
            if let Some(read) = last_read {
                if state.latest_known.is_none_or(|known| read > known) {
                    state.latest_known = Some(read);
                }
            }
            *state
        };
        debug!(channel_id = %channel_id, ?last_read, mention_count, "read state synced externally");
        self.publish_changed(channel_id, updated);
    }

    pub fn read_state(&self, channel_id: ChannelId) -> ReadState {
        self.states
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&channel_id)
            .copied()
            .unwrap_or_default()
    }

    pub fn mention_count(&self, channel_id: ChannelId) -> u32 {
        self.read_state(channel_id).mention_count
    }

    /// Sum of mention counters across the guild's channels, recomputed on
    /// demand from the directory.
    pub fn aggregate_mention_count(&self, guild_id: GuildId) -> u32 {
        let channels = self.directory.channels_in(guild_id);
        let states = self
            .states
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        channels
            .iter()
            .filter_map(|channel_id| states.get(channel_id))
            .map(|state| state.mention_count)
            .sum()
    }

    /// Channels in the guild with messages past their read marker.
    pub fn unread_channels(&self, guild_id: GuildId) -> Vec<ChannelId> {
        let channels = self.directory.channels_in(guild_id);
        let states = self
            .states
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        channels
            .into_iter()
            .filter(|channel_id| {
                states
                    .get(channel_id)
                    .is_some_and(|state| state.is_unread())
            })
            .collect()
    }

    /// Drop all read state, for logout or session teardown.
    pub fn reset(&self) {
        self.states
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    fn publish_changed(&self, channel_id: ChannelId, state: ReadState) {
        let Ok(channel) = Channel::new("sync.readstate.changed") else {
            return;
        };
        let event = Event::new(
            channel,
            EventSource::System("readstate".into()),
            EventPayload::ReadStateChanged {
                channel_id,
                last_read: state.last_read,
                mention_count: state.mention_count,
            },
        );
        if let Err(error) = self.bus.publish(event) {
            warn!(%error, "failed to publish read-state change");
        }
    }
}
