//! End-to-end engine tests over mock collaborators: the UI surface on one
//! side, scripted transport/fetch/ack endpoints on the other.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use tokio::sync::mpsc;
use tokio::time::timeout;

use concord_core::config::Config;
use concord_core::event::EventPayload;
use concord_core::ids::{ChannelId, GuildId, MessageId, UserId};
use concord_gateway::{GatewayEvent, SubscribeTarget};
use concord_store::ChannelMeta;
use concord_sync::{FetchTrigger, LoadOutcome, SyncEngine};
use concord_test_support::{
    page, MessageBuilder, MockAckClient, MockFetchClient, MockTransport, TransportCall,
};

const ME: UserId = UserId(1000);
const GUILD: GuildId = GuildId(9);
const CHANNEL: ChannelId = ChannelId(1);
const OTHER_CHANNEL: ChannelId = ChannelId(2);
const DM: ChannelId = ChannelId(5);

type TestEngine = SyncEngine<MockTransport, MockFetchClient, MockAckClient>;

struct Harness {
    engine: Arc<TestEngine>,
    transport: Arc<MockTransport>,
    fetch: Arc<MockFetchClient>,
    ack: Arc<MockAckClient>,
    tx: mpsc::Sender<GatewayEvent>,
}

fn harness() -> Harness {
    let transport = Arc::new(MockTransport::new());
    let fetch = Arc::new(MockFetchClient::new());
    let ack = Arc::new(MockAckClient::new());
    let engine = Arc::new(SyncEngine::new(
        Arc::clone(&transport),
        Arc::clone(&fetch),
        Arc::clone(&ack),
        &Config::default(),
        ME,
    ));

    let mut directory = HashMap::new();
    directory.insert(CHANNEL, ChannelMeta { guild_id: Some(GUILD) });
    directory.insert(OTHER_CHANNEL, ChannelMeta { guild_id: Some(GUILD) });
    directory.insert(DM, ChannelMeta { guild_id: None });
    engine.set_directory(directory);

    let (tx, rx) = mpsc::channel(64);
    engine.start(rx);

    Harness {
        engine,
        transport,
        fetch,
        ack,
        tx,
    }
}

/// One tick of virtual time, letting spawned loops catch up.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

#[tokio::test(start_paused = true)]
async fn opening_a_channel_loads_a_page_and_subscribes_its_guild() {
    let h = harness();
    h.fetch.enqueue_page(page(CHANNEL.get(), 100, 50));
    settle().await;

    let outcome = h.engine.set_active_channel(CHANNEL).await;
    assert_eq!(outcome, LoadOutcome::Loaded(50));

    let snapshot = h.engine.snapshot(CHANNEL);
    assert_eq!(snapshot.len(), 50);
    assert_eq!(snapshot[0].id, MessageId(100));

    // The subscription follows after the quiescence window.
    assert_eq!(h.transport.subscribe_count(), 0);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        h.transport.calls(),
        vec![TransportCall::Subscribe(SubscribeTarget::Guild(GUILD))]
    );

    h.engine.shutdown();
}

#[tokio::test(start_paused = true)]
async fn live_messages_reach_the_snapshot_and_observers() {
    let h = harness();
    h.fetch.enqueue_page(page(CHANNEL.get(), 100, 50));
    settle().await;

    h.engine.set_active_channel(CHANNEL).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut observed = h.engine.observe("sync.message.added").unwrap();
    h.tx.send(GatewayEvent::MessageCreate(
        MessageBuilder::new(101)
            .channel(CHANNEL.get())
            .author(2)
            .content("fresh")
            .build(),
    ))
    .await
    .unwrap();

    let event = timeout(Duration::from_millis(100), observed.recv())
        .await
        .expect("no bus event")
        .unwrap();
    assert_matches!(
        &event.payload,
        EventPayload::MessageAdded { message, .. } if message.id == MessageId(101)
    );

    let snapshot = h.engine.snapshot(CHANNEL);
    assert_eq!(snapshot[0].id, MessageId(101));

    h.engine.shutdown();
}

#[tokio::test(start_paused = true)]
async fn jump_result_is_discarded_after_switching_channels() {
    let h = harness();
    h.fetch.enqueue_page(page(CHANNEL.get(), 100, 50));
    settle().await;
    h.engine.set_active_channel(CHANNEL).await;

    // A slow around-fetch gets in flight, then the user switches away.
    h.fetch.set_delay(Duration::from_millis(100));
    h.fetch.enqueue_page(page(CHANNEL.get(), 60, 50));
    let jump = tokio::spawn({
        let engine = Arc::clone(&h.engine);
        async move {
            engine
                .request_around(CHANNEL, MessageId(40), FetchTrigger::UserInitiated)
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    h.fetch.enqueue_page(page(OTHER_CHANNEL.get(), 500, 50));
    h.engine.set_active_channel(OTHER_CHANNEL).await;

    assert_eq!(jump.await.unwrap(), LoadOutcome::Stale);
    assert!(h.engine.snapshot(CHANNEL).is_empty());
    assert_eq!(h.engine.snapshot(OTHER_CHANNEL).len(), 50);

    h.engine.shutdown();
}

#[tokio::test(start_paused = true)]
async fn dm_messages_mention_and_acknowledge_round_trip() {
    let h = harness();
    h.engine.open_dm(DM);
    h.fetch.enqueue_page(Vec::new());
    settle().await;
    h.engine.set_active_channel(DM).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    h.tx.send(GatewayEvent::MessageCreate(
        MessageBuilder::new(10).channel(DM.get()).author(2).build(),
    ))
    .await
    .unwrap();
    settle().await;

    assert_eq!(h.engine.mention_count(DM), 1);
    assert!(h.engine.read_state(DM).is_unread());

    h.engine.acknowledge(DM).await;
    assert_eq!(h.engine.mention_count(DM), 0);
    assert!(!h.engine.read_state(DM).is_unread());
    assert_eq!(h.ack.marks(), vec![(DM, MessageId(10))]);

    h.engine.shutdown();
}

#[tokio::test(start_paused = true)]
async fn guild_mentions_aggregate_across_channels() {
    let h = harness();
    h.fetch.enqueue_page(page(CHANNEL.get(), 100, 50));
    settle().await;
    h.engine.set_active_channel(CHANNEL).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    for id in [101u64, 102] {
        h.tx.send(GatewayEvent::MessageCreate(
            MessageBuilder::new(id)
                .channel(CHANNEL.get())
                .author(2)
                .mentioning(ME.get())
                .build(),
        ))
        .await
        .unwrap();
    }
    // A mention in a sibling channel of the same guild, no store loaded.
    h.tx.send(GatewayEvent::MessageCreate(
        MessageBuilder::new(103)
            .channel(OTHER_CHANNEL.get())
            .author(2)
            .mentioning(ME.get())
            .build(),
    ))
    .await
    .unwrap();
    settle().await;

    assert_eq!(h.engine.mention_count(CHANNEL), 2);
    assert_eq!(h.engine.mention_count(OTHER_CHANNEL), 1);
    assert_eq!(h.engine.aggregate_mention_count(GUILD), 3);
    assert_eq!(h.engine.unread_channels(GUILD).len(), 2);

    h.engine.shutdown();
}

#[tokio::test(start_paused = true)]
async fn reconnect_resubscribes_the_active_set() {
    let h = harness();
    h.fetch.enqueue_page(page(CHANNEL.get(), 100, 50));
    settle().await;
    h.engine.set_active_channel(CHANNEL).await;
    h.engine.open_dm(DM);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.transport.subscribe_count(), 2);
    h.transport.clear_calls();

    h.tx.send(GatewayEvent::Reconnected).await.unwrap();
    settle().await;

    let calls = h.transport.calls();
    assert!(calls.contains(&TransportCall::Subscribe(SubscribeTarget::Guild(GUILD))));
    assert!(calls.contains(&TransportCall::Subscribe(SubscribeTarget::Channel(DM))));

    h.engine.shutdown();
}

#[tokio::test(start_paused = true)]
async fn external_read_state_sync_wins_over_local_counters() {
    let h = harness();
    h.fetch.enqueue_page(page(CHANNEL.get(), 100, 50));
    settle().await;
    h.engine.set_active_channel(CHANNEL).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    h.tx.send(GatewayEvent::MessageCreate(
        MessageBuilder::new(101)
            .channel(CHANNEL.get())
            .author(2)
            .mentioning(ME.get())
            .build(),
    ))
    .await
    .unwrap();
    settle().await;
    assert_eq!(h.engine.mention_count(CHANNEL), 1);

    // Read on another device.
    h.tx.send(GatewayEvent::ReadStateSync {
        channel_id: CHANNEL,
        last_read: Some(MessageId(101)),
        mention_count: 0,
    })
    .await
    .unwrap();
    settle().await;

    let state = h.engine.read_state(CHANNEL);
    assert_eq!(state.last_read, Some(MessageId(101)));
    assert_eq!(state.mention_count, 0);
    assert!(!state.is_unread());

    h.engine.shutdown();
}

#[tokio::test(start_paused = true)]
async fn scrolling_past_the_top_stops_fetching() {
    let h = harness();
    // The whole channel fits in one short page.
    h.fetch.enqueue_page(page(CHANNEL.get(), 20, 20));
    settle().await;

    assert_eq!(
        h.engine.set_active_channel(CHANNEL).await,
        LoadOutcome::Loaded(20)
    );
    assert_eq!(
        h.engine
            .request_older(CHANNEL, FetchTrigger::Automatic)
            .await,
        LoadOutcome::Exhausted
    );
    assert_eq!(h.fetch.call_count(), 1);

    h.engine.shutdown();
}
