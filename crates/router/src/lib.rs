//! Routes the gateway's ordered event stream into the per-channel stores
//! and read-state tracker, publishing typed bus events for whatever
//! actually changed. One consumer task per connection; ordering comes from
//! the stream and is never traded away for parallelism.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use concord_core::event::{Channel, Event, EventBus, EventPayload, EventSource};
use concord_core::ids::{ChannelId, MessageId, UserId};
use concord_core::message::Message;
use concord_gateway::{AckClient, GatewayEvent, ReactionChange, SubscribeTarget, SubscriptionFilter};
use concord_readstate::ReadStateTracker;
use concord_store::{ChannelDirectory, ChannelRegistry, StoreEvent};

pub struct LiveUpdateRouter<A: AckClient, S: SubscriptionFilter> {
    registry: Arc<ChannelRegistry>,
    directory: Arc<ChannelDirectory>,
    tracker: Arc<ReadStateTracker<A>>,
    filter: Arc<S>,
    bus: Arc<dyn EventBus>,
    current_user: UserId,
}

impl<A: AckClient, S: SubscriptionFilter> LiveUpdateRouter<A, S> {
    pub fn new(
        registry: Arc<ChannelRegistry>,
        directory: Arc<ChannelDirectory>,
        tracker: Arc<ReadStateTracker<A>>,
        filter: Arc<S>,
        bus: Arc<dyn EventBus>,
        current_user: UserId,
    ) -> Self {
        Self {
            registry,
            directory,
            tracker,
            filter,
            bus,
            current_user,
        }
    }

    /// Consume the connection's event stream until it closes.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<GatewayEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event);
        }
        info!("gateway event stream closed");
    }

    pub fn handle_event(&self, event: GatewayEvent) {
        if let Some(channel_id) = event.channel_id() {
            if !self.is_watched(channel_id) {
                debug!(channel_id = %channel_id, "dropping event for unsubscribed channel");
                return;
            }
        }

        match event {
            GatewayEvent::MessageCreate(message) => self.on_message_create(message),
            GatewayEvent::MessageUpdate(message) => self.on_message_update(message),
            GatewayEvent::MessageDelete { channel_id, id } => {
                self.on_message_delete(channel_id, id)
            }
            GatewayEvent::MessageReactionAdd(change) => self.on_reaction(change, true),
            GatewayEvent::MessageReactionRemove(change) => self.on_reaction(change, false),
            GatewayEvent::ReadStateSync {
                channel_id,
                last_read,
                mention_count,
            } => {
                self.tracker
                    .apply_external_sync(channel_id, last_read, mention_count);
            }
            GatewayEvent::PresenceUpdate { user_id, status } => {
                self.publish(
                    "sync.presence.updated",
                    EventSource::Gateway,
                    EventPayload::PresenceUpdated { user_id, status },
                );
            }
            GatewayEvent::TypingStart {
                channel_id,
                user_id,
                timestamp,
            } => {
                self.publish(
                    "sync.typing.started",
                    EventSource::Gateway,
                    EventPayload::TypingStarted {
                        channel_id,
                        user_id,
                        started_at: timestamp,
                    },
                );
            }
            GatewayEvent::Reconnected => {
                info!("gateway reconnected, requesting full resubscribe");
                self.publish(
                    "gateway.connection.resubscribe",
                    EventSource::Gateway,
                    EventPayload::ResubscribeRequired,
                );
            }
        }
    }

    /// Whether anything is watching the channel's subscription target.
    fn is_watched(&self, channel_id: ChannelId) -> bool {
        let target = match self.directory.guild_of(channel_id) {
            Some(guild_id) => SubscribeTarget::Guild(guild_id),
            None => SubscribeTarget::Channel(channel_id),
        };
        self.filter.is_subscribed(target)
    }

    fn on_message_create(&self, message: Message) {
        let channel_id = message.channel_id;
        let message_id = message.id;

        // A redelivered create must not double-count. The store drops the
        // duplicate for channels with an open window; the monotone
        // latest_known id covers channels without one.
        if let Some(store) = self.registry.store(channel_id) {
            let applied = store
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .apply(StoreEvent::Insert(message.clone()));
            match applied {
                Some(applied) => self.publish(
                    "sync.message.added",
                    EventSource::System("router".into()),
                    EventPayload::MessageAdded {
                        channel_id,
                        message: applied,
                    },
                ),
                None => {
                    debug!(channel_id = %channel_id, message_id = %message_id, "duplicate create dropped");
                    return;
                }
            }
        }

        if !self.tracker.record_message(channel_id, message_id) {
            debug!(channel_id = %channel_id, message_id = %message_id, "redelivered create ignored");
            return;
        }

        if self.is_mention_for_current_user(&message) {
            self.tracker.increment_mention(channel_id);
            self.publish(
                "sync.mention.added",
                EventSource::System("router".into()),
                EventPayload::MentionAdded {
                    guild_id: self.directory.guild_of(channel_id),
                    channel_id,
                    message_id,
                },
            );
        }
    }

    /// Own messages never count; everything else counts when it names the
    /// user, pings everyone, or lands in a DM.
    fn is_mention_for_current_user(&self, message: &Message) -> bool {
        message.author_id != self.current_user
            && (message.mentions(self.current_user) || self.directory.is_dm(message.channel_id))
    }

    fn on_message_update(&self, message: Message) {
        let channel_id = message.channel_id;
        let Some(store) = self.registry.store(channel_id) else {
            return;
        };
        let applied = store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .apply(StoreEvent::Update(message));
        if let Some(applied) = applied {
            self.publish(
                "sync.message.edited",
                EventSource::System("router".into()),
                EventPayload::MessageEdited {
                    channel_id,
                    message: applied,
                },
            );
        }
    }

    fn on_message_delete(&self, channel_id: ChannelId, id: MessageId) {
        let Some(store) = self.registry.store(channel_id) else {
            return;
        };
        let removed = store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .apply(StoreEvent::Delete(id));
        if removed.is_some() {
            self.publish(
                "sync.message.removed",
                EventSource::System("router".into()),
                EventPayload::MessageRemoved {
                    channel_id,
                    message_id: id,
                },
            );
        }
    }

    fn on_reaction(&self, change: ReactionChange, added: bool) {
        let Some(store) = self.registry.store(change.channel_id) else {
            return;
        };
        let me = change.user_id == self.current_user;
        let updated = store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .apply_reaction(change.message_id, &change.emoji, added, me);
        if let Some(updated) = updated {
            self.publish(
                "sync.message.edited",
                EventSource::System("router".into()),
                EventPayload::MessageEdited {
                    channel_id: change.channel_id,
                    message: updated,
                },
            );
        }
    }

    fn publish(&self, channel: &str, source: EventSource, payload: EventPayload) {
        let Ok(channel) = Channel::new(channel) else {
            return;
        };
        if let Err(error) = self.bus.publish(Event::new(channel, source, payload)) {
            warn!(%error, "failed to publish routed event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::timeout;

    use concord_core::event::{BroadcastEventBus, EventSubscription, PresenceStatus};
    use concord_core::ids::GuildId;
    use concord_store::ChannelMeta;
    use concord_test_support::{MessageBuilder, MockAckClient};

    const ME: UserId = UserId(1000);
    const GUILD: GuildId = GuildId(9);
    const CHANNEL: ChannelId = ChannelId(1);
    const DM: ChannelId = ChannelId(2);

    /// Filter backed by a plain set, standing in for the coordinator.
    struct AllowList(Mutex<HashSet<SubscribeTarget>>);

    impl AllowList {
        fn allowing(targets: impl IntoIterator<Item = SubscribeTarget>) -> Arc<Self> {
            Arc::new(Self(Mutex::new(targets.into_iter().collect())))
        }
    }

    impl SubscriptionFilter for AllowList {
        fn is_subscribed(&self, target: SubscribeTarget) -> bool {
            self.0.lock().unwrap().contains(&target)
        }
    }

    struct Fixture {
        router: Arc<LiveUpdateRouter<MockAckClient, AllowList>>,
        registry: Arc<ChannelRegistry>,
        tracker: Arc<ReadStateTracker<MockAckClient>>,
        bus: Arc<BroadcastEventBus>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(ChannelRegistry::new(300));
        let directory = Arc::new(ChannelDirectory::new());
        directory.record(CHANNEL, ChannelMeta { guild_id: Some(GUILD) });
        directory.record(DM, ChannelMeta { guild_id: None });

        let bus = Arc::new(BroadcastEventBus::default());
        let bus_dyn: Arc<dyn EventBus> = bus.clone();
        let tracker = Arc::new(ReadStateTracker::new(
            Arc::new(MockAckClient::new()),
            Arc::clone(&registry),
            Arc::clone(&directory),
            Arc::clone(&bus_dyn),
        ));
        let filter = AllowList::allowing([
            SubscribeTarget::Guild(GUILD),
            SubscribeTarget::Channel(DM),
        ]);
        let router = Arc::new(LiveUpdateRouter::new(
            Arc::clone(&registry),
            directory,
            Arc::clone(&tracker),
            filter,
            bus_dyn,
            ME,
        ));
        Fixture {
            router,
            registry,
            tracker,
            bus,
        }
    }

    fn create(id: u64, channel: ChannelId, author: u64) -> GatewayEvent {
        GatewayEvent::MessageCreate(
            MessageBuilder::new(id)
                .channel(channel.get())
                .author(author)
                .build(),
        )
    }

    async fn next_event(sub: &mut EventSubscription) -> Event {
        timeout(Duration::from_millis(100), sub.recv())
            .await
            .expect("timed out waiting for bus event")
            .unwrap()
    }

    #[tokio::test]
    async fn create_lands_in_store_and_publishes() {
        let fx = fixture();
        fx.registry.activate(CHANNEL);
        let mut sub = fx.bus.subscribe("sync.message.added").unwrap();

        fx.router.handle_event(create(10, CHANNEL, 2));

        let store = fx.registry.store(CHANNEL).unwrap();
        assert!(store.lock().unwrap().contains(MessageId(10)));
        let event = next_event(&mut sub).await;
        assert_matches!(event.payload, EventPayload::MessageAdded { .. });
    }

    #[tokio::test]
    async fn duplicate_create_is_dropped_and_counted_once() {
        let fx = fixture();
        fx.registry.activate(DM);

        fx.router.handle_event(create(10, DM, 2));
        fx.router.handle_event(create(10, DM, 2));

        let store = fx.registry.store(DM).unwrap();
        assert_eq!(store.lock().unwrap().len(), 1);
        assert_eq!(fx.tracker.mention_count(DM), 1);
    }

    #[tokio::test]
    async fn redelivered_create_without_store_counts_one_mention() {
        let fx = fixture();

        // CHANNEL has no open window; the tracker alone must dedup.
        let mention = |id: u64| {
            GatewayEvent::MessageCreate(
                MessageBuilder::new(id)
                    .channel(CHANNEL.get())
                    .author(2)
                    .mentioning(ME.get())
                    .build(),
            )
        };
        fx.router.handle_event(mention(10));
        fx.router.handle_event(mention(10));
        assert_eq!(fx.tracker.mention_count(CHANNEL), 1);

        // A genuinely new mention still counts.
        fx.router.handle_event(mention(11));
        assert_eq!(fx.tracker.mention_count(CHANNEL), 2);
    }

    #[tokio::test]
    async fn unsubscribed_channel_events_are_discarded() {
        let fx = fixture();
        let stray = ChannelId(99);
        fx.registry.activate(stray);

        fx.router.handle_event(create(10, stray, 2));

        let store = fx.registry.store(stray).unwrap();
        assert!(store.lock().unwrap().is_empty());
        assert_eq!(fx.tracker.mention_count(stray), 0);
    }

    #[tokio::test]
    async fn explicit_mention_increments_and_publishes() {
        let fx = fixture();
        fx.registry.activate(CHANNEL);
        let mut sub = fx.bus.subscribe("sync.mention.added").unwrap();

        fx.router.handle_event(GatewayEvent::MessageCreate(
            MessageBuilder::new(10)
                .channel(CHANNEL.get())
                .author(2)
                .mentioning(ME.get())
                .build(),
        ));

        assert_eq!(fx.tracker.mention_count(CHANNEL), 1);
        let event = next_event(&mut sub).await;
        assert_matches!(
            event.payload,
            EventPayload::MentionAdded { guild_id: Some(GUILD), channel_id: CHANNEL, .. }
        );
    }

    #[tokio::test]
    async fn mention_everyone_counts_for_current_user() {
        let fx = fixture();
        fx.registry.activate(CHANNEL);

        fx.router.handle_event(GatewayEvent::MessageCreate(
            MessageBuilder::new(10)
                .channel(CHANNEL.get())
                .author(2)
                .mention_everyone()
                .build(),
        ));

        assert_eq!(fx.tracker.mention_count(CHANNEL), 1);
    }

    #[tokio::test]
    async fn dm_message_counts_as_mention_without_explicit_ping() {
        let fx = fixture();
        fx.registry.activate(DM);

        fx.router.handle_event(create(10, DM, 2));
        assert_eq!(fx.tracker.mention_count(DM), 1);
    }

    #[tokio::test]
    async fn own_messages_never_count_as_mentions() {
        let fx = fixture();
        fx.registry.activate(DM);

        fx.router.handle_event(GatewayEvent::MessageCreate(
            MessageBuilder::new(10)
                .channel(DM.get())
                .author(ME.get())
                .mention_everyone()
                .build(),
        ));

        assert_eq!(fx.tracker.mention_count(DM), 0);
    }

    #[tokio::test]
    async fn plain_guild_message_is_not_a_mention() {
        let fx = fixture();
        fx.registry.activate(CHANNEL);

        fx.router.handle_event(create(10, CHANNEL, 2));
        assert_eq!(fx.tracker.mention_count(CHANNEL), 0);
    }

    #[tokio::test]
    async fn update_and_delete_flow_through_store() {
        let fx = fixture();
        fx.registry.activate(CHANNEL);
        let mut sub = fx.bus.subscribe("sync.message.*").unwrap();

        fx.router.handle_event(create(10, CHANNEL, 2));
        next_event(&mut sub).await;

        fx.router.handle_event(GatewayEvent::MessageUpdate(
            MessageBuilder::new(10)
                .channel(CHANNEL.get())
                .author(2)
                .content("edited")
                .edited()
                .build(),
        ));
        let event = next_event(&mut sub).await;
        assert_matches!(
            &event.payload,
            EventPayload::MessageEdited { message, .. } if message.content == "edited"
        );

        fx.router.handle_event(GatewayEvent::MessageDelete {
            channel_id: CHANNEL,
            id: MessageId(10),
        });
        let event = next_event(&mut sub).await;
        assert_matches!(event.payload, EventPayload::MessageRemoved { .. });

        let store = fx.registry.store(CHANNEL).unwrap();
        assert!(store.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_of_unknown_id_publishes_nothing() {
        let fx = fixture();
        fx.registry.activate(CHANNEL);
        let mut sub = fx.bus.subscribe("sync.message.removed").unwrap();

        fx.router.handle_event(GatewayEvent::MessageDelete {
            channel_id: CHANNEL,
            id: MessageId(404),
        });

        let result = timeout(Duration::from_millis(50), sub.recv()).await;
        assert!(result.is_err(), "no event expected for unknown delete");
    }

    #[tokio::test]
    async fn reactions_update_the_stored_message() {
        let fx = fixture();
        fx.registry.activate(CHANNEL);
        fx.router.handle_event(create(10, CHANNEL, 2));

        let change = ReactionChange {
            channel_id: CHANNEL,
            message_id: MessageId(10),
            user_id: ME,
            emoji: "🦀".into(),
        };
        fx.router
            .handle_event(GatewayEvent::MessageReactionAdd(change.clone()));

        let store = fx.registry.store(CHANNEL).unwrap();
        {
            let guard = store.lock().unwrap();
            let reaction = guard.reaction(MessageId(10), "🦀").unwrap();
            assert_eq!(reaction.count, 1);
            assert!(reaction.me);
        }

        fx.router
            .handle_event(GatewayEvent::MessageReactionRemove(change));
        let guard = store.lock().unwrap();
        assert!(guard.reaction(MessageId(10), "🦀").is_none());
    }

    #[tokio::test]
    async fn readstate_sync_overwrites_tracker() {
        let fx = fixture();
        fx.tracker.increment_mention(CHANNEL);

        fx.router.handle_event(GatewayEvent::ReadStateSync {
            channel_id: CHANNEL,
            last_read: Some(MessageId(42)),
            mention_count: 0,
        });

        let state = fx.tracker.read_state(CHANNEL);
        assert_eq!(state.last_read, Some(MessageId(42)));
        assert_eq!(state.mention_count, 0);
    }

    #[tokio::test]
    async fn presence_and_typing_are_relayed() {
        let fx = fixture();
        let mut sub = fx.bus.subscribe("sync.{presence,typing}.*").unwrap();

        fx.router.handle_event(GatewayEvent::PresenceUpdate {
            user_id: UserId(5),
            status: PresenceStatus::Idle,
        });
        fx.router.handle_event(GatewayEvent::TypingStart {
            channel_id: CHANNEL,
            user_id: UserId(5),
            timestamp: chrono::Utc::now(),
        });

        let event = next_event(&mut sub).await;
        assert_matches!(
            event.payload,
            EventPayload::PresenceUpdated { status: PresenceStatus::Idle, .. }
        );
        let event = next_event(&mut sub).await;
        assert_matches!(event.payload, EventPayload::TypingStarted { .. });
    }

    #[tokio::test]
    async fn reconnect_requests_resubscribe() {
        let fx = fixture();
        let mut sub = fx.bus.subscribe("gateway.connection.resubscribe").unwrap();

        fx.router.handle_event(GatewayEvent::Reconnected);

        let event = next_event(&mut sub).await;
        assert_matches!(event.payload, EventPayload::ResubscribeRequired);
    }

    #[tokio::test]
    async fn run_consumes_the_stream_in_order() {
        let fx = fixture();
        fx.registry.activate(CHANNEL);
        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(Arc::clone(&fx.router).run(rx));

        tx.send(create(10, CHANNEL, 2)).await.unwrap();
        tx.send(create(11, CHANNEL, 2)).await.unwrap();
        tx.send(GatewayEvent::MessageDelete {
            channel_id: CHANNEL,
            id: MessageId(10),
        })
        .await
        .unwrap();
        drop(tx);
        task.await.unwrap();

        let store = fx.registry.store(CHANNEL).unwrap();
        let guard = store.lock().unwrap();
        assert!(guard.contains(MessageId(11)));
        assert!(!guard.contains(MessageId(10)));
    }
}
