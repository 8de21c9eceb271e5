//! Per-channel store registry and the channel metadata directory.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use tracing::debug;

use concord_core::ids::{ChannelId, GuildId};

use crate::MessageStore;

/// Owns one [`MessageStore`] per active channel. Each store sits behind its
/// own lock so work on one channel never blocks another; the registry lock
/// is only held to look the store up.
///
/// Generation counters live outside the store map and survive eviction:
/// a fetch started before `deactivate` must not land in a freshly
/// re-activated store.
pub struct ChannelRegistry {
    channels: RwLock<HashMap<ChannelId, Arc<Mutex<MessageStore>>>>,
    generations: Mutex<HashMap<ChannelId, u64>>,
    retention_limit: usize,
}

impl ChannelRegistry {
    pub fn new(retention_limit: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            generations: Mutex::new(HashMap::new()),
            retention_limit,
        }
    }

    /// The store for `channel_id`, created empty on first use.
    pub fn activate(&self, channel_id: ChannelId) -> Arc<Mutex<MessageStore>> {
        if let Some(store) = self
            .channels
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&channel_id)
        {
            return Arc::clone(store);
        }
        let mut channels = self
            .channels
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(
            channels
                .entry(channel_id)
                .or_insert_with(|| Arc::new(Mutex::new(MessageStore::new(self.retention_limit)))),
        )
    }

    /// The store for `channel_id`, if one is active.
    pub fn store(&self, channel_id: ChannelId) -> Option<Arc<Mutex<MessageStore>>> {
        self.channels
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&channel_id)
            .map(Arc::clone)
    }

    /// Drop the channel's store and invalidate any fetch still in flight
    /// against it.
    pub fn deactivate(&self, channel_id: ChannelId) {
        let removed = self
            .channels
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&channel_id)
            .is_some();
        if removed {
            debug!(channel_id = %channel_id, "evicted channel store");
            self.bump_generation(channel_id);
        }
    }

    /// The channel's current generation. Capture before starting a fetch,
    /// compare before applying its result.
    pub fn generation(&self, channel_id: ChannelId) -> u64 {
        *self
            .generations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&channel_id)
            .unwrap_or(&0)
    }

    /// Invalidate all in-flight fetches for the channel.
    pub fn bump_generation(&self, channel_id: ChannelId) -> u64 {
        let mut generations = self
            .generations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let generation = generations.entry(channel_id).or_insert(0);
        *generation += 1;
        *generation
    }

    pub fn active_channels(&self) -> Vec<ChannelId> {
        self.channels
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .copied()
            .collect()
    }
}

/// Static facts about a channel the engine needs for routing decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelMeta {
    /// `None` for direct-message channels.
    pub guild_id: Option<GuildId>,
}

/// Channel-to-guild mapping, populated from the session's channel list and
/// updated as channels come and go.
#[derive(Default)]
pub struct ChannelDirectory {
    inner: RwLock<HashMap<ChannelId, ChannelMeta>>,
}

impl ChannelDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole directory, e.g. after a fresh session snapshot.
    pub fn replace(&self, entries: HashMap<ChannelId, ChannelMeta>) {
        *self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = entries;
    }

    pub fn record(&self, channel_id: ChannelId, meta: ChannelMeta) {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(channel_id, meta);
    }

    pub fn guild_of(&self, channel_id: ChannelId) -> Option<GuildId> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&channel_id)
            .and_then(|meta| meta.guild_id)
    }

    /// A channel is a DM when it is known and carries no guild. Unknown
    /// channels are not DMs; mention handling must not over-count.
    pub fn is_dm(&self, channel_id: ChannelId) -> bool {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&channel_id)
            .is_some_and(|meta| meta.guild_id.is_none())
    }

    pub fn channels_in(&self, guild_id: GuildId) -> HashSet<ChannelId> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|(_, meta)| meta.guild_id == Some(guild_id))
            .map(|(id, _)| *id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activate_is_idempotent() {
        let registry = ChannelRegistry::new(300);
        let first = registry.activate(ChannelId(1));
        let second = registry.activate(ChannelId(1));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.active_channels(), vec![ChannelId(1)]);
    }

    #[test]
    fn store_returns_none_for_inactive_channel() {
        let registry = ChannelRegistry::new(300);
        assert!(registry.store(ChannelId(1)).is_none());
        registry.activate(ChannelId(1));
        assert!(registry.store(ChannelId(1)).is_some());
    }

    #[test]
    fn deactivate_drops_store_and_bumps_generation() {
        let registry = ChannelRegistry::new(300);
        registry.activate(ChannelId(1));
        let before = registry.generation(ChannelId(1));

        registry.deactivate(ChannelId(1));
        assert!(registry.store(ChannelId(1)).is_none());
        assert_eq!(registry.generation(ChannelId(1)), before + 1);
    }

    #[test]
    fn generation_survives_reactivation() {
        // A fetch captured under the old generation must still mismatch
        // after the channel is evicted and re-opened.
        let registry = ChannelRegistry::new(300);
        registry.activate(ChannelId(1));
        let stale = registry.generation(ChannelId(1));

        registry.deactivate(ChannelId(1));
        registry.activate(ChannelId(1));
        assert_ne!(registry.generation(ChannelId(1)), stale);
    }

    #[test]
    fn deactivating_unknown_channel_is_noop() {
        let registry = ChannelRegistry::new(300);
        registry.deactivate(ChannelId(1));
        assert_eq!(registry.generation(ChannelId(1)), 0);
    }

    #[test]
    fn directory_classifies_dms() {
        let directory = ChannelDirectory::new();
        directory.record(ChannelId(1), ChannelMeta { guild_id: Some(GuildId(9)) });
        directory.record(ChannelId(2), ChannelMeta { guild_id: None });

        assert!(!directory.is_dm(ChannelId(1)));
        assert!(directory.is_dm(ChannelId(2)));
        // Unknown channels are not DMs.
        assert!(!directory.is_dm(ChannelId(3)));
        assert_eq!(directory.guild_of(ChannelId(1)), Some(GuildId(9)));
        assert_eq!(directory.guild_of(ChannelId(2)), None);
    }

    #[test]
    fn directory_replace_is_wholesale() {
        let directory = ChannelDirectory::new();
        directory.record(ChannelId(1), ChannelMeta { guild_id: None });

        let mut entries = HashMap::new();
        entries.insert(ChannelId(2), ChannelMeta { guild_id: Some(GuildId(9)) });
        directory.replace(entries);

        assert!(!directory.is_dm(ChannelId(1)));
        assert_eq!(directory.guild_of(ChannelId(2)), Some(GuildId(9)));
    }

    #[test]
    fn channels_in_guild() {
        let directory = ChannelDirectory::new();
        directory.record(ChannelId(1), ChannelMeta { guild_id: Some(GuildId(9)) });
        directory.record(ChannelId(2), ChannelMeta { guild_id: Some(GuildId(9)) });
        directory.record(ChannelId(3), ChannelMeta { guild_id: None });

        let channels = directory.channels_in(GuildId(9));
        assert_eq!(channels.len(), 2);
        assert!(channels.contains(&ChannelId(1)));
        assert!(channels.contains(&ChannelId(2)));
    }
}
