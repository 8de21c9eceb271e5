//! Keeps the transport's live-update subscriptions matching what the user
//! is looking at. Desired-set changes are applied as a diff only after a
//! quiescence window, so arrow-keying through a channel list does not spam
//! the transport; a reconnect resubscribes everything immediately.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, warn};

use concord_core::config::SubscriptionsConfig;
use concord_core::event::{Event, EventBus, EventPayload};
use concord_core::ids::{ChannelId, GuildId};
use concord_core::EventBusError;
use concord_gateway::{SubscribeTarget, SubscriptionFilter, Transport};

/// What should happen after an event touched the desired set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Apply {
    /// Nothing changed.
    None,
    /// Apply after the quiescence window.
    Debounced,
    /// Apply right now (reconnect).
    Immediate,
}

#[derive(Debug, Default)]
struct DesiredSet {
    /// The viewed guild or, for a DM, the viewed channel.
    active: Option<SubscribeTarget>,
    /// Open DM channels beyond the active one.
    dms: HashSet<ChannelId>,
}

impl DesiredSet {
    fn targets(&self) -> HashSet<SubscribeTarget> {
        let mut targets: HashSet<SubscribeTarget> = self
            .dms
            .iter()
            .map(|channel_id| SubscribeTarget::Channel(*channel_id))
            .collect();
        if let Some(active) = self.active {
            targets.insert(active);
        }
        targets
    }
}

pub struct SubscriptionCoordinator<T: Transport> {
    transport: Arc<T>,
    bus: Arc<dyn EventBus>,
    desired: Mutex<DesiredSet>,
    applied: Mutex<HashSet<SubscribeTarget>>,
    debounce: Duration,
}

impl<T: Transport> SubscriptionCoordinator<T> {
    pub fn new(transport: Arc<T>, bus: Arc<dyn EventBus>, config: &SubscriptionsConfig) -> Self {
        Self {
            transport,
            bus,
            desired: Mutex::new(DesiredSet::default()),
            applied: Mutex::new(HashSet::new()),
            debounce: Duration::from_millis(config.debounce_ms),
        }
    }

    /// The user is now viewing `channel_id`. Guild channels subscribe the
    /// whole guild; guildless channels subscribe the channel itself.
    pub fn set_active_channel(&self, channel_id: ChannelId, guild_id: Option<GuildId>) {
        let target = match guild_id {
            Some(guild_id) => SubscribeTarget::Guild(guild_id),
            None => SubscribeTarget::Channel(channel_id),
        };
        self.desired
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .active = Some(target);
    }

    pub fn clear_active_channel(&self) {
        self.desired
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .active = None;
    }

    pub fn open_dm(&self, channel_id: ChannelId) {
        self.desired
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .dms
            .insert(channel_id);
    }

    pub fn close_dm(&self, channel_id: ChannelId) {
        self.desired
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .dms
            .remove(&channel_id);
    }

    /// Push the desired/applied diff to the transport. Failed subscribes
    /// stay out of the applied set and are retried on the next apply.
    pub async fn apply_now(&self) {
        let desired = self
            .desired
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .targets();
        let applied = self
            .applied
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        for target in desired.difference(&applied) {
            match self.transport.subscribe(*target).await {
                Ok(()) => {
                    self.applied
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .insert(*target);
                    debug!(?target, "subscribed");
                }
                Err(error) => warn!(?target, %error, "subscribe failed"),
            }
        }

        for target in applied.difference(&desired) {
            if let Err(error) = self.transport.unsubscribe(*target).await {
                warn!(?target, %error, "unsubscribe failed");
            }
            self.applied
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(target);
        }
    }

    /// The transport lost its subscription state; resubscribe the whole
    /// desired set from scratch.
    pub async fn resubscribe_all(&self) {
        self.applied
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
        self.apply_now().await;
    }

    /// Event loop: watches UI navigation and gateway reconnects, applying
    /// subscription diffs after the quiescence window.
    pub async fn run(self: Arc<Self>) {
        let mut subscription = match self.bus.subscribe("{ui,gateway}.**") {
            Ok(subscription) => subscription,
            Err(err) => {
                error!(%err, "subscription coordinator failed to subscribe to event bus");
                return;
            }
        };

        let mut deadline: Option<Instant> = None;
        loop {
            let quiesced = async move {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                received = subscription.recv() => match received {
                    Ok(event) => match self.handle_event(&event) {
                        Apply::None => {}
                        Apply::Debounced => {
                            deadline = Some(Instant::now() + self.debounce);
                        }
                        Apply::Immediate => {
                            deadline = None;
                            self.resubscribe_all().await;
                        }
                    },
                    Err(EventBusError::Lagged(count)) => {
                        warn!(count, "subscription coordinator lagged behind event bus");
                    }
                    Err(_) => break,
                },
                _ = quiesced => {
                    deadline = None;
                    self.apply_now().await;
                }
            }
        }
    }

    fn handle_event(&self, event: &Event) -> Apply {
        match &event.payload {
            EventPayload::ChannelOpened {
                channel_id,
                guild_id,
            } => {
                self.set_active_channel(*channel_id, *guild_id);
                Apply::Debounced
            }
            EventPayload::ChannelClosed { .. } => {
                self.clear_active_channel();
                Apply::Debounced
            }
            EventPayload::DmOpened { channel_id } => {
                self.open_dm(*channel_id);
                Apply::Debounced
            }
            EventPayload::DmClosed { channel_id } => {
                self.close_dm(*channel_id);
                Apply::Debounced
            }
            EventPayload::ResubscribeRequired => Apply::Immediate,
            _ => Apply::None,
        }
    }
}

impl<T: Transport> SubscriptionFilter for SubscriptionCoordinator<T> {
    fn is_subscribed(&self, target: SubscribeTarget) -> bool {
        self.desired
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .targets()
            .contains(&target)
    }
}
