//! The engine facade: wires the channel registry, read-state tracker,
//! pagination controller, subscription coordinator, and live-update router
//! together behind one object, and exposes the surface the UI talks to.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use concord_core::config::{Config, LoggingConfig};
use concord_core::event::{
    BroadcastEventBus, Channel, Event, EventBus, EventPayload, EventSource, EventSubscription,
};
use concord_core::ids::{ChannelId, GuildId, MessageId, UserId};
use concord_core::message::Message;
use concord_core::EventBusError;
use concord_gateway::{AckClient, FetchClient, GatewayEvent, Transport};
use concord_pagination::PaginationController;
use concord_readstate::{ReadState, ReadStateTracker};
use concord_router::LiveUpdateRouter;
use concord_store::{ChannelDirectory, ChannelMeta, ChannelRegistry};
use concord_subscriptions::SubscriptionCoordinator;

pub use concord_pagination::{FetchTrigger, LoadOutcome};

/// Install the process-wide tracing subscriber. `RUST_LOG` wins over the
/// configured level. Safe to call more than once; later calls are no-ops.
pub fn init_tracing(config: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

pub struct SyncEngine<T, F, A>
where
    T: Transport,
    F: FetchClient,
    A: AckClient,
{
    bus: Arc<dyn EventBus>,
    registry: Arc<ChannelRegistry>,
    directory: Arc<ChannelDirectory>,
    tracker: Arc<ReadStateTracker<A>>,
    controller: Arc<PaginationController<F>>,
    coordinator: Arc<SubscriptionCoordinator<T>>,
    router: Arc<LiveUpdateRouter<A, SubscriptionCoordinator<T>>>,
    active: Mutex<Option<ChannelId>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T, F, A> SyncEngine<T, F, A>
where
    T: Transport,
    F: FetchClient,
    A: AckClient,
{
    pub fn new(
        transport: Arc<T>,
        fetch: Arc<F>,
        ack: Arc<A>,
        config: &Config,
        current_user: UserId,
    ) -> Self {
        let bus: Arc<dyn EventBus> =
            Arc::new(BroadcastEventBus::new(config.event_bus.channel_capacity));
        let registry = Arc::new(ChannelRegistry::new(config.store.retention_limit));
        let directory = Arc::new(ChannelDirectory::new());
        let tracker = Arc::new(ReadStateTracker::new(
            ack,
            Arc::clone(&registry),
            Arc::clone(&directory),
            Arc::clone(&bus),
        ));
        let controller = Arc::new(PaginationController::new(
            fetch,
            Arc::clone(&registry),
            Arc::clone(&bus),
            &config.pagination,
        ));
        let coordinator = Arc::new(SubscriptionCoordinator::new(
            transport,
            Arc::clone(&bus),
            &config.subscriptions,
        ));
        let router = Arc::new(LiveUpdateRouter::new(
            Arc::clone(&registry),
            Arc::clone(&directory),
            Arc::clone(&tracker),
            Arc::clone(&coordinator),
            Arc::clone(&bus),
            current_user,
        ));

        Self {
            bus,
            registry,
            directory,
            tracker,
            controller,
            coordinator,
            router,
            active: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the router and coordinator loops. `events` is the connection's
    /// ordered event stream.
    pub fn start(&self, events: mpsc::Receiver<GatewayEvent>) {
        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tasks.push(tokio::spawn(Arc::clone(&self.router).run(events)));
        tasks.push(tokio::spawn(Arc::clone(&self.coordinator).run()));
    }

    /// Replace the channel directory from a session snapshot.
    pub fn set_directory(&self, entries: HashMap<ChannelId, ChannelMeta>) {
        self.directory.replace(entries);
    }

    /// Switch the viewed channel. The previous channel's window is evicted,
    /// the subscription follows after the quiescence window, and an initial
    /// page is fetched when the new window is empty.
    pub async fn set_active_channel(&self, channel_id: ChannelId) -> LoadOutcome {
        let previous = {
            let mut active = self
                .active
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            active.replace(channel_id)
        };
        if let Some(previous) = previous {
            if previous != channel_id {
                self.registry.deactivate(previous);
                self.publish_ui(EventPayload::ChannelClosed {
                    channel_id: previous,
                });
            }
        }

        self.registry.activate(channel_id);
        let guild_id = self.directory.guild_of(channel_id);
        self.publish_ui(EventPayload::ChannelOpened {
            channel_id,
            guild_id,
        });
        debug!(channel_id = %channel_id, ?guild_id, "active channel switched");

        self.controller
            .load_older(channel_id, FetchTrigger::Automatic)
            .await
    }

    pub fn open_dm(&self, channel_id: ChannelId) {
        self.directory
            .record(channel_id, ChannelMeta { guild_id: None });
        self.publish_ui(EventPayload::DmOpened { channel_id });
    }

    pub fn close_dm(&self, channel_id: ChannelId) {
        self.publish_ui(EventPayload::DmClosed { channel_id });
    }

    /// Extend the viewed window backwards (scrolling up).
    pub async fn request_older(&self, channel_id: ChannelId, trigger: FetchTrigger) -> LoadOutcome {
        self.controller.load_older(channel_id, trigger).await
    }

    /// Fast-forward towards the live edge (scrolled out of a jumped-to
    /// window).
    pub async fn request_newer(&self, channel_id: ChannelId, trigger: FetchTrigger) -> LoadOutcome {
        self.controller.load_newer(channel_id, trigger).await
    }

    /// Jump to an arbitrary message, e.g. following a reply reference.
    pub async fn request_around(
        &self,
        channel_id: ChannelId,
        target: MessageId,
        trigger: FetchTrigger,
    ) -> LoadOutcome {
        self.publish_ui(EventPayload::JumpRequested {
            channel_id,
            message_id: target,
        });
        self.controller
            .load_around(channel_id, target, trigger)
            .await
    }

    /// Mark the channel read up to its newest known message.
    pub async fn acknowledge(&self, channel_id: ChannelId) {
        self.tracker.acknowledge(channel_id).await;
    }

    /// The loaded window of a channel, newest first. Empty when the channel
    /// is not active.
    pub fn snapshot(&self, channel_id: ChannelId) -> Vec<Message> {
        self.registry
            .store(channel_id)
            .map(|store| {
                store
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .messages()
            })
            .unwrap_or_default()
    }

    /// Subscribe to engine output on the event bus, e.g. `"sync.**"`.
    pub fn observe(&self, pattern: &str) -> Result<EventSubscription, EventBusError> {
        self.bus.subscribe(pattern)
    }

    pub fn read_state(&self, channel_id: ChannelId) -> ReadState {
        self.tracker.read_state(channel_id)
    }

    pub fn mention_count(&self, channel_id: ChannelId) -> u32 {
        self.tracker.mention_count(channel_id)
    }

    pub fn aggregate_mention_count(&self, guild_id: GuildId) -> u32 {
        self.tracker.aggregate_mention_count(guild_id)
    }

    pub fn unread_channels(&self, guild_id: GuildId) -> Vec<ChannelId> {
        self.tracker.unread_channels(guild_id)
    }

    /// Tear down the engine: stop the loops and drop all session state.
    pub fn shutdown(&self) {
        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
        self.tracker.reset();
        for channel_id in self.registry.active_channels() {
            self.registry.deactivate(channel_id);
        }
    }

    fn publish_ui(&self, payload: EventPayload) {
        let name = match &payload {
            EventPayload::ChannelOpened { .. } => "ui.channel.opened",
            EventPayload::ChannelClosed { .. } => "ui.channel.closed",
            EventPayload::DmOpened { .. } => "ui.dm.opened",
            EventPayload::DmClosed { .. } => "ui.dm.closed",
            EventPayload::JumpRequested { .. } => "ui.jump.requested",
            _ => return,
        };
        let Ok(channel) = Channel::new(name) else {
            return;
        };
        if let Err(error) = self
            .bus
            .publish(Event::new(channel, EventSource::Ui, payload))
        {
            warn!(%error, "failed to publish ui event");
        }
    }
}

impl<T, F, A> Drop for SyncEngine<T, F, A>
where
    T: Transport,
    F: FetchClient,
    A: AckClient,
{
    fn drop(&mut self) {
        let tasks = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for task in tasks.iter() {
            task.abort();
        }
    }
}
