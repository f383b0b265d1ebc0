//! Snapshot Provider Integration Tests
//!
//! Drives a snapshot provider through a real in-memory feed and its event
//! handler: subscription lifecycle, snapshot isolation, reference counting
//! and reconnection.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::float_cmp,
    clippy::cast_precision_loss
)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use livedata_fabric::application::ports::MarketDataFeed;
use livedata_fabric::domain::market_data::fields;
use livedata_fabric::{
    ConnectionStatus, ExternalId, FeedEvent, FieldMap, InMemoryFeed, LiveDataProvider,
    ProviderEvent, Requirement, SnapshotProvider, Specification, SubscriptionState,
    SubscriptionTicket, UserPrincipal, run_feed_handler,
};

const WAIT: Duration = Duration::from_secs(2);

struct Harness {
    feed: Arc<InMemoryFeed>,
    provider: SnapshotProvider,
    cancel: CancellationToken,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn start(name: &str) -> Harness {
    let (feed, rx) = InMemoryFeed::new(name, 64);
    let feed = Arc::new(feed);
    let provider = SnapshotProvider::builder(name, Arc::clone(&feed) as Arc<dyn MarketDataFeed>)
        .build()
        .unwrap();
    let cancel = CancellationToken::new();
    tokio::spawn(run_feed_handler(provider.clone(), rx, cancel.clone()));
    Harness {
        feed,
        provider,
        cancel,
    }
}

async fn start_connected(name: &str) -> Harness {
    let harness = start(name);
    connect(&harness).await;
    harness
}

async fn connect(harness: &Harness) {
    harness.feed.publish(FeedEvent::Connected).await.unwrap();
    let provider = harness.provider.clone();
    wait_until(move || provider.connection_status() == ConnectionStatus::Connected).await;
}

fn ticker(symbol: &str) -> ExternalId {
    ExternalId::of("TICKER", symbol)
}

fn spec(symbol: &str) -> Specification {
    Specification::new("OpenGamma", ticker(symbol))
}

fn tick(entries: &[(&str, f64)]) -> FieldMap {
    entries
        .iter()
        .map(|(name, value)| ((*name).to_string(), *value))
        .collect()
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !check() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn next_value_change(rx: &mut broadcast::Receiver<ProviderEvent>) -> Requirement {
    timeout(WAIT, async {
        loop {
            if let ProviderEvent::ValueChanged { requirement, .. } = rx.recv().await.unwrap() {
                return requirement;
            }
        }
    })
    .await
    .expect("no value change in time")
}

#[tokio::test]
async fn snapshot_is_isolated_from_later_ticks() {
    let harness = start_connected("primary").await;
    let user = UserPrincipal::local("alice");
    let requirement = Requirement::market_value(ticker("AAPL"));

    let ticket = harness
        .provider
        .add_subscription(&user, &requirement)
        .unwrap();
    assert_eq!(timeout(WAIT, ticket.outcome()).await.unwrap(), Ok(()));
    assert!(harness.feed.is_subscribed(&spec("AAPL")));

    let mut events = harness.provider.events();
    harness
        .feed
        .publish_tick(spec("AAPL"), tick(&[(fields::BID, 99.0), (fields::ASK, 101.0)]))
        .await
        .unwrap();
    assert_eq!(next_value_change(&mut events).await, requirement);

    let before = harness.provider.snapshot();

    harness
        .feed
        .publish_tick(spec("AAPL"), tick(&[(fields::LAST_PRICE, 105.0)]))
        .await
        .unwrap();
    next_value_change(&mut events).await;

    let after = harness.provider.snapshot();

    assert_eq!(harness.provider.query_snapshot(before, &requirement), Some(100.0));
    assert_eq!(harness.provider.query_snapshot(after, &requirement), Some(105.0));
    assert_eq!(harness.provider.stats().retained_snapshots, 2);

    harness.provider.release_snapshot(before);
    assert_eq!(harness.provider.query_snapshot(before, &requirement), None);
    assert_eq!(harness.provider.query_snapshot(after, &requirement), Some(105.0));

    harness.provider.release_snapshot(before);
    assert_eq!(harness.provider.stats().retained_snapshots, 1);
}

#[tokio::test]
async fn raw_field_requirements_share_one_upstream_subscription() {
    let harness = start_connected("primary").await;
    let user = UserPrincipal::local("alice");
    let bid = Requirement::new(fields::BID, ticker("MSFT"));
    let value = Requirement::market_value(ticker("MSFT"));

    for requirement in [&bid, &value] {
        let ticket = harness.provider.add_subscription(&user, requirement).unwrap();
        assert_eq!(timeout(WAIT, ticket.outcome()).await.unwrap(), Ok(()));
    }
    assert_eq!(harness.feed.subscribe_calls(), 1);

    let mut events = harness.provider.events();
    harness
        .feed
        .publish_tick(spec("MSFT"), tick(&[(fields::BID, 410.0), (fields::ASK, 412.0)]))
        .await
        .unwrap();
    next_value_change(&mut events).await;

    let provider = harness.provider.clone();
    let value_probe = value.clone();
    wait_until(move || provider.current_value(&value_probe).is_some()).await;

    let snapshot = harness.provider.snapshot();
    assert_eq!(harness.provider.query_snapshot(snapshot, &bid), Some(410.0));
    assert_eq!(harness.provider.query_snapshot(snapshot, &value), Some(411.0));
}

#[tokio::test]
async fn upstream_subscription_is_reference_counted() {
    let harness = start_connected("primary").await;
    let alice = UserPrincipal::local("alice");
    let bob = UserPrincipal::local("bob");
    let requirement = Requirement::market_value(ticker("IBM"));

    for user in [&alice, &bob] {
        let ticket = harness.provider.add_subscription(user, &requirement).unwrap();
        assert_eq!(timeout(WAIT, ticket.outcome()).await.unwrap(), Ok(()));
    }
    assert_eq!(harness.feed.subscribe_calls(), 1);

    harness.provider.remove_subscription(&alice, &requirement);
    assert!(harness.provider.is_subscribed(&requirement));
    assert_eq!(
        harness.provider.subscription_state(&requirement),
        SubscriptionState::Subscribed
    );

    harness.provider.remove_subscription(&bob, &requirement);
    assert!(!harness.provider.is_subscribed(&requirement));

    let feed = Arc::clone(&harness.feed);
    wait_until(move || !feed.is_subscribed(&spec("IBM"))).await;
    assert_eq!(harness.feed.unsubscribe_calls(), 1);
}

#[tokio::test]
async fn ticks_for_unsubscribed_specifications_are_dropped() {
    let harness = start_connected("primary").await;

    harness
        .feed
        .publish_tick(spec("NOPE"), tick(&[(fields::LAST_PRICE, 1.0)]))
        .await
        .unwrap();

    let provider = harness.provider.clone();
    wait_until(move || provider.stats().ticks_dropped == 1).await;
    assert_eq!(harness.provider.stats().ticks_received, 1);
}

#[tokio::test]
async fn subscribing_while_disconnected_fails() {
    let harness = start("primary");
    let requirement = Requirement::market_value(ticker("AAPL"));

    let ticket = harness
        .provider
        .add_subscription(&UserPrincipal::local("alice"), &requirement)
        .unwrap();
    let failure = timeout(WAIT, ticket.outcome()).await.unwrap().unwrap_err();

    assert_eq!(failure.provider, "primary");
    assert_eq!(failure.reason, "connection to market data feed down");
    assert_eq!(
        harness.provider.subscription_state(&requirement),
        SubscriptionState::Failed
    );
    assert_eq!(harness.feed.subscribe_calls(), 0);
}

#[tokio::test]
async fn unknown_instrument_fails_and_leaves_nothing_behind() {
    let harness = start_connected("primary").await;
    harness.feed.reject_instrument(spec("BAD"));
    let requirement = Requirement::market_value(ticker("BAD"));

    let ticket = harness
        .provider
        .add_subscription(&UserPrincipal::local("alice"), &requirement)
        .unwrap();
    let failure = timeout(WAIT, ticket.outcome()).await.unwrap().unwrap_err();

    assert_eq!(failure.provider, "primary");
    assert!(!harness.provider.is_subscribed(&requirement));
    assert_eq!(harness.provider.stats().active_specifications, 0);
}

#[tokio::test]
async fn reconnect_reestablishes_upstream_subscriptions() {
    let harness = start_connected("primary").await;
    let requirement = Requirement::market_value(ticker("AAPL"));

    let ticket = harness
        .provider
        .add_subscription(&UserPrincipal::local("alice"), &requirement)
        .unwrap();
    assert_eq!(timeout(WAIT, ticket.outcome()).await.unwrap(), Ok(()));

    let mut events = harness.provider.events();
    harness
        .feed
        .publish_tick(spec("AAPL"), tick(&[(fields::LAST_PRICE, 10.0)]))
        .await
        .unwrap();
    next_value_change(&mut events).await;

    harness.feed.publish(FeedEvent::Disconnected).await.unwrap();
    let provider = harness.provider.clone();
    wait_until(move || provider.connection_status() == ConnectionStatus::NotConnected).await;

    // Field stores survive a disconnect.
    assert_eq!(harness.provider.current_value(&requirement), Some(10.0));

    connect(&harness).await;
    let feed = Arc::clone(&harness.feed);
    wait_until(move || feed.subscribe_calls() == 2).await;
    assert!(harness.feed.is_subscribed(&spec("AAPL")));
}

#[tokio::test]
async fn removing_a_user_drops_all_of_their_requirements() {
    let harness = start_connected("primary").await;
    let alice = UserPrincipal::local("alice");
    let requirements = [
        Requirement::market_value(ticker("AAPL")),
        Requirement::market_value(ticker("MSFT")),
    ];

    for requirement in &requirements {
        let ticket = harness.provider.add_subscription(&alice, requirement).unwrap();
        assert_eq!(timeout(WAIT, ticket.outcome()).await.unwrap(), Ok(()));
    }
    assert_eq!(harness.provider.active_specifications().len(), 2);

    harness.provider.remove_user(&alice);

    assert!(requirements.iter().all(|r| !harness.provider.is_subscribed(r)));
    let feed = Arc::clone(&harness.feed);
    wait_until(move || feed.subscribed().is_empty()).await;
}

#[tokio::test]
async fn closed_feed_channel_stops_the_handler() {
    let (tx, rx) = mpsc::channel(1);
    let (feed, _unused) = InMemoryFeed::new("primary", 1);
    let provider = SnapshotProvider::builder("primary", Arc::new(feed) as Arc<dyn MarketDataFeed>)
        .build()
        .unwrap();

    let handle = tokio::spawn(run_feed_handler(provider, rx, CancellationToken::new()));
    drop(tx);

    timeout(WAIT, handle).await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_subscribers_share_one_upstream_subscription() {
    let harness = start_connected("primary").await;
    let requirement = Requirement::market_value(ticker("NVDA"));

    let tickets: Vec<_> = (0..8)
        .map(|i| {
            harness
                .provider
                .add_subscription(&UserPrincipal::local(format!("user-{i}")), &requirement)
                .unwrap()
        })
        .collect();
    let outcomes = timeout(WAIT, join_all(tickets.into_iter().map(SubscriptionTicket::outcome)))
        .await
        .unwrap();

    assert!(outcomes.iter().all(Result::is_ok));
    assert_eq!(harness.feed.subscribe_calls(), 1);
    assert_eq!(harness.provider.stats().active_requirements, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn snapshots_stay_consistent_under_concurrent_ticks() {
    const TICKS: u64 = 20_000;

    let harness = start_connected("primary").await;
    let requirement = Requirement::market_value(ticker("AAPL"));
    let ticket = harness
        .provider
        .add_subscription(&UserPrincipal::local("alice"), &requirement)
        .unwrap();
    assert_eq!(timeout(WAIT, ticket.outcome()).await.unwrap(), Ok(()));

    // `started` moves before a tick is merged, `applied` after it returns.
    let started = Arc::new(AtomicU64::new(0));
    let applied = Arc::new(AtomicU64::new(0));

    let ticker_thread = {
        let provider = harness.provider.clone();
        let started = Arc::clone(&started);
        let applied = Arc::clone(&applied);
        thread::spawn(move || {
            for price in 1..=TICKS {
                started.store(price, Ordering::SeqCst);
                provider.on_field_update(&spec("AAPL"), fields::LAST_PRICE, price as f64);
                applied.store(price, Ordering::SeqCst);
            }
        })
    };

    let reader_thread = {
        let provider = harness.provider.clone();
        let requirement = requirement.clone();
        let started = Arc::clone(&started);
        let applied = Arc::clone(&applied);
        thread::spawn(move || {
            loop {
                let floor = applied.load(Ordering::SeqCst);
                let snapshot = provider.snapshot();
                let ceiling = started.load(Ordering::SeqCst);

                let value = provider.query_snapshot(snapshot, &requirement);
                provider.release_snapshot(snapshot);

                match value {
                    Some(value) => assert!(
                        value >= floor as f64 && value <= ceiling as f64,
                        "captured {value} outside [{floor}, {ceiling}]"
                    ),
                    None => assert_eq!(floor, 0, "value missing after a tick was applied"),
                }
                if floor == TICKS {
                    break;
                }
            }
        })
    };

    ticker_thread.join().unwrap();
    reader_thread.join().unwrap();

    assert_eq!(harness.provider.stats().retained_snapshots, 0);
    assert_eq!(harness.provider.current_value(&requirement), Some(20_000.0));
}
