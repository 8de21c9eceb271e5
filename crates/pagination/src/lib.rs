//! History pagination. One in-flight fetch per channel, exhaustion
//! short-circuits, fetch timeouts, and rate-limit backoff with a single
//! user-initiated bypass per window. Results landing after the channel was
//! reset or evicted are discarded by generation check.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use concord_core::config::PaginationConfig;
use concord_core::event::{Channel, Event, EventBus, EventPayload, EventSource, LoadDirection};
use concord_core::ids::{ChannelId, MessageId};
use concord_gateway::{FetchAnchor, FetchClient, FetchError};
use concord_store::{ChannelRegistry, PagePosition};

/// Who asked for the load. User-initiated requests may bypass an open
/// backoff gate once per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchTrigger {
    Automatic,
    UserInitiated,
}

/// What became of a load request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// A page was fetched and merged; carries the page length.
    Loaded(usize),
    /// Another fetch for this channel is already in flight.
    Coalesced,
    /// The queried edge is exhausted; no network call was made.
    Exhausted,
    /// A rate-limit backoff window is open; no network call was made.
    Gated,
    /// The result arrived after the channel was reset and was discarded.
    Stale,
    /// The fetch failed; the failure was published for the UI.
    Failed { retryable: bool },
}

#[derive(Debug, Clone, Copy)]
enum LoadKind {
    Older,
    Newer,
    Around(MessageId),
}

impl LoadKind {
    fn direction(self) -> LoadDirection {
        match self {
            LoadKind::Older => LoadDirection::Older,
            LoadKind::Newer => LoadDirection::Newer,
            LoadKind::Around(_) => LoadDirection::Around,
        }
    }
}

#[derive(Debug)]
struct BackoffGate {
    attempt: u32,
    until: Instant,
    bypass_available: bool,
}

/// Drives history fetches for all channels through one [`FetchClient`].
pub struct PaginationController<F: FetchClient> {
    fetch: Arc<F>,
    registry: Arc<ChannelRegistry>,
    bus: Arc<dyn EventBus>,
    in_flight: Mutex<HashMap<ChannelId, LoadDirection>>,
    gates: Mutex<HashMap<ChannelId, BackoffGate>>,
    page_size: u32,
    fetch_timeout: Duration,
    backoff_base: Duration,
    backoff_cap: Duration,
}

impl<F: FetchClient> PaginationController<F> {
    pub fn new(
        fetch: Arc<F>,
        registry: Arc<ChannelRegistry>,
        bus: Arc<dyn EventBus>,
        config: &PaginationConfig,
    ) -> Self {
        Self {
            fetch,
            registry,
            bus,
            in_flight: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            page_size: config.page_size,
            fetch_timeout: Duration::from_secs(config.fetch_timeout_secs),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_cap: Duration::from_secs(config.backoff_cap_secs),
        }
    }

    /// Extend the window backwards from its oldest message, or fetch the
    /// newest page when nothing is loaded yet.
    pub async fn load_older(&self, channel_id: ChannelId, trigger: FetchTrigger) -> LoadOutcome {
        self.run_load(channel_id, LoadKind::Older, trigger).await
    }

    /// Fast-forward the window towards the live edge.
    pub async fn load_newer(&self, channel_id: ChannelId, trigger: FetchTrigger) -> LoadOutcome {
        self.run_load(channel_id, LoadKind::Newer, trigger).await
    }

    /// Reseed the window around an arbitrary message, e.g. a reply jump.
    pub async fn load_around(
        &self,
        channel_id: ChannelId,
        target: MessageId,
        trigger: FetchTrigger,
    ) -> LoadOutcome {
        self.run_load(channel_id, LoadKind::Around(target), trigger)
            .await
    }

    /// Direction of the fetch currently in flight for the channel, if any.
    pub fn in_flight_direction(&self, channel_id: ChannelId) -> Option<LoadDirection> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&channel_id)
            .copied()
    }

    async fn run_load(
        &self,
        channel_id: ChannelId,
        kind: LoadKind,
        trigger: FetchTrigger,
    ) -> LoadOutcome {
        let store = self.registry.activate(channel_id);

        {
            let guard = store.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let exhausted = match kind {
                LoadKind::Older => !guard.has_older(),
                LoadKind::Newer => !guard.has_newer(),
                LoadKind::Around(_) => false,
            };
            if exhausted {
                return LoadOutcome::Exhausted;
            }
        }

        if !self.pass_gate(channel_id, trigger) {
            debug!(channel_id = %channel_id, "load gated by rate-limit backoff");
            return LoadOutcome::Gated;
        }

        {
            let mut in_flight = self
                .in_flight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if in_flight.contains_key(&channel_id) {
                return LoadOutcome::Coalesced;
            }
            in_flight.insert(channel_id, kind.direction());
        }

        let generation = self.registry.generation(channel_id);
        let anchor = {
            let guard = store.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            match kind {
                LoadKind::Older => guard
                    .oldest_id()
                    .map(FetchAnchor::Before)
                    .unwrap_or(FetchAnchor::Latest),
                LoadKind::Newer => guard
                    .newest_id()
                    .map(FetchAnchor::After)
                    .unwrap_or(FetchAnchor::Latest),
                LoadKind::Around(target) => FetchAnchor::Around(target),
            }
        };

        let result = tokio::time::timeout(
            self.fetch_timeout,
            self.fetch.fetch_messages(channel_id, anchor, self.page_size),
        )
        .await;

        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&channel_id);

        let messages = match result {
            Err(_) => {
                warn!(channel_id = %channel_id, timeout = ?self.fetch_timeout, "history fetch timed out");
                self.publish_failure(channel_id, kind.direction(), "fetch timed out", true);
                return LoadOutcome::Failed { retryable: true };
            }
            Ok(Err(error)) => {
                if let FetchError::RateLimited { retry_after } = &error {
                    self.arm_gate(channel_id, *retry_after);
                }
                let retryable = error.is_retryable();
                warn!(channel_id = %channel_id, %error, retryable, "history fetch failed");
                self.publish_failure(channel_id, kind.direction(), &error.to_string(), retryable);
                return LoadOutcome::Failed { retryable };
            }
            Ok(Ok(messages)) => messages,
        };

        if self.registry.generation(channel_id) != generation {
            debug!(channel_id = %channel_id, "discarding fetch result for superseded generation");
            return LoadOutcome::Stale;
        }

        self.gates
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&channel_id);

        let count = messages.len();
        let position = match kind {
            LoadKind::Older => PagePosition::Older,
            LoadKind::Newer => PagePosition::Newer,
            LoadKind::Around(target) => PagePosition::Around(target),
        };
        {
            let mut guard = store.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.insert_page(messages, position, self.page_size);
        }

        if matches!(kind, LoadKind::Around(_)) {
            self.publish("sync.store.reset", EventPayload::StoreReset { channel_id });
        }
        self.publish(
            "sync.page.loaded",
            EventPayload::PageLoaded {
                channel_id,
                direction: kind.direction(),
                count,
            },
        );
        debug!(channel_id = %channel_id, direction = ?kind.direction(), count, "page merged");
        LoadOutcome::Loaded(count)
    }

    /// True when no backoff window is open, or the caller may bypass it.
    fn pass_gate(&self, channel_id: ChannelId, trigger: FetchTrigger) -> bool {
        let mut gates = self
            .gates
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(gate) = gates.get_mut(&channel_id) else {
            return true;
        };
        if Instant::now() >= gate.until {
            return true;
        }
        if trigger == FetchTrigger::UserInitiated && gate.bypass_available {
            gate.bypass_available = false;
            return true;
        }
        false
    }

    fn arm_gate(&self, channel_id: ChannelId, retry_after: Option<Duration>) {
        let mut gates = self
            .gates
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let gate = gates.entry(channel_id).or_insert(BackoffGate {
            attempt: 0,
            until: Instant::now(),
            bypass_available: true,
        });
        gate.attempt += 1;
        let shift = (gate.attempt - 1).min(10);
        let mut delay = self
            .backoff_base
            .saturating_mul(1u32 << shift)
            .min(self.backoff_cap);
        if let Some(hint) = retry_after {
            delay = delay.max(hint);
        }
        gate.until = Instant::now() + delay;
        // Each new window grants one fresh user-initiated bypass.
        gate.bypass_available = true;
        debug!(channel_id = %channel_id, attempt = gate.attempt, ?delay, "rate-limit backoff armed");
    }

    fn publish_failure(
        &self,
        channel_id: ChannelId,
        direction: LoadDirection,
        reason: &str,
        retryable: bool,
    ) {
        self.publish(
            "sync.fetch.failed",
            EventPayload::FetchFailed {
                channel_id,
                direction,
                reason: reason.to_string(),
                retryable,
            },
        );
    }

    fn publish(&self, channel: &str, payload: EventPayload) {
        let Ok(channel) = Channel::new(channel) else {
            return;
        };
        let event = Event::new(channel, EventSource::System("pagination".into()), payload);
        if let Err(error) = self.bus.publish(event) {
            warn!(%error, "failed to publish pagination event");
        }
    }
}
