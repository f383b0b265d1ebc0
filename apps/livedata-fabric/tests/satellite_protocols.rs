//! Satellite Protocol Integration Tests
//!
//! Entitlement and resolution served over in-memory conduits, and the
//! heartbeat lease cycle driven by a live provider.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use livedata_fabric::application::ports::{
    EntitlementChecker, IdentityResolver, MarketDataFeed, PermissiveEntitlementChecker,
    SpecificationResolver,
};
use livedata_fabric::domain::market_data::fields;
use livedata_fabric::infrastructure::entitlement::{
    DenyListEntitlementChecker, EntitlementServer, RemoteEntitlementChecker,
};
use livedata_fabric::infrastructure::heartbeat::HeartbeatSource;
use livedata_fabric::infrastructure::resolution::{
    MappingResolver, RemoteSpecificationResolver, ResolutionServer,
};
use livedata_fabric::{
    ExternalId, FieldMap, HeartbeatConfig, HeartbeatEvent, HeartbeatReceiver, HeartbeatSender,
    InMemoryConduit, InMemoryFeed, LiveDataProvider, Requirement, SnapshotProvider,
    Specification, UserPrincipal,
};

const WAIT: Duration = Duration::from_secs(2);

fn ticker(symbol: &str) -> ExternalId {
    ExternalId::of("TICKER", symbol)
}

fn spec(symbol: &str) -> Specification {
    Specification::new("OpenGamma", ticker(symbol))
}

fn remote_entitlements(
    checker: impl EntitlementChecker + 'static,
    cancel: &CancellationToken,
) -> Arc<dyn EntitlementChecker> {
    let (conduit, _) = InMemoryConduit::serve(EntitlementServer::new(checker), 8, cancel.clone());
    Arc::new(RemoteEntitlementChecker::new(Arc::new(conduit)))
}

fn remote_resolver(
    resolver: impl SpecificationResolver + 'static,
    cancel: &CancellationToken,
) -> Arc<dyn SpecificationResolver> {
    let (conduit, _) = InMemoryConduit::serve(ResolutionServer::new(resolver), 8, cancel.clone());
    Arc::new(RemoteSpecificationResolver::new(Arc::new(conduit)))
}

async fn provider(
    feed: Arc<InMemoryFeed>,
    entitlements: Arc<dyn EntitlementChecker>,
    resolver: Arc<dyn SpecificationResolver>,
) -> SnapshotProvider {
    let provider = SnapshotProvider::builder("primary", feed as Arc<dyn MarketDataFeed>)
        .entitlements(entitlements)
        .resolver(resolver)
        .build()
        .unwrap();
    provider.connect().await;
    provider
}

#[tokio::test]
async fn remote_denial_fails_only_the_denied_user() {
    let cancel = CancellationToken::new();
    let (feed, _rx) = InMemoryFeed::new("primary", 8);
    let feed = Arc::new(feed);
    let provider = provider(
        Arc::clone(&feed),
        remote_entitlements(DenyListEntitlementChecker::new().deny_user("mallory"), &cancel),
        remote_resolver(IdentityResolver, &cancel),
    )
    .await;
    let requirement = Requirement::market_value(ticker("AAPL"));

    let denied = provider
        .add_subscription(&UserPrincipal::local("mallory"), &requirement)
        .unwrap();
    let failure = timeout(WAIT, denied.outcome()).await.unwrap().unwrap_err();
    assert_eq!(failure.provider, "primary");
    assert!(failure.reason.contains("not entitled"));
    assert!(!feed.is_subscribed(&spec("AAPL")));

    let allowed = provider
        .add_subscription(&UserPrincipal::local("alice"), &requirement)
        .unwrap();
    assert_eq!(timeout(WAIT, allowed.outcome()).await.unwrap(), Ok(()));
    assert!(feed.is_subscribed(&spec("AAPL")));

    cancel.cancel();
}

#[tokio::test]
async fn remote_resolution_routes_ticks_by_resolved_specification() {
    let cancel = CancellationToken::new();
    let resolved = Specification::new("OpenGamma", ExternalId::of("BBG", "AAPL US Equity"));
    let (feed, _rx) = InMemoryFeed::new("primary", 8);
    let feed = Arc::new(feed);
    let provider = provider(
        Arc::clone(&feed),
        remote_entitlements(PermissiveEntitlementChecker, &cancel),
        remote_resolver(
            MappingResolver::new().with_mapping(spec("AAPL"), resolved.clone()),
            &cancel,
        ),
    )
    .await;
    let requirement = Requirement::market_value(ticker("AAPL"));

    let ticket = provider
        .add_subscription(&UserPrincipal::local("alice"), &requirement)
        .unwrap();
    assert_eq!(timeout(WAIT, ticket.outcome()).await.unwrap(), Ok(()));
    assert!(feed.is_subscribed(&resolved));
    assert!(!feed.is_subscribed(&spec("AAPL")));

    provider.on_field_update(&resolved, fields::LAST_PRICE, 190.5);
    let snapshot = provider.snapshot();
    assert_eq!(provider.query_snapshot(snapshot, &requirement), Some(190.5));

    let unknown = provider
        .add_subscription(
            &UserPrincipal::local("alice"),
            &Requirement::market_value(ticker("ZZZZ")),
        )
        .unwrap();
    assert!(timeout(WAIT, unknown.outcome()).await.unwrap().is_err());

    cancel.cancel();
}

#[tokio::test]
async fn stopped_satellite_fails_subscriptions_instead_of_hanging() {
    let cancel = CancellationToken::new();
    let (feed, _rx) = InMemoryFeed::new("primary", 8);
    let provider = provider(
        Arc::new(feed),
        remote_entitlements(PermissiveEntitlementChecker, &cancel),
        Arc::new(IdentityResolver),
    )
    .await;

    cancel.cancel();
    sleep(Duration::from_millis(20)).await;

    let ticket = provider
        .add_subscription(
            &UserPrincipal::local("alice"),
            &Requirement::market_value(ticker("AAPL")),
        )
        .unwrap();
    let outcome = timeout(WAIT, ticket.outcome()).await.unwrap();
    assert!(outcome.is_err());
}

#[tokio::test]
async fn heartbeats_keep_leases_alive_until_interest_stops() {
    let cancel = CancellationToken::new();
    let (feed, _rx) = InMemoryFeed::new("primary", 8);
    let provider = provider(
        Arc::new(feed),
        Arc::new(PermissiveEntitlementChecker),
        Arc::new(IdentityResolver),
    )
    .await;
    let user = UserPrincipal::local("alice");
    let requirement = Requirement::market_value(ticker("AAPL"));
    let ticket = provider.add_subscription(&user, &requirement).unwrap();
    assert_eq!(timeout(WAIT, ticket.outcome()).await.unwrap(), Ok(()));

    let config = HeartbeatConfig::new(Duration::from_millis(10), Duration::from_millis(250));
    let (heartbeat_tx, heartbeat_rx) = mpsc::channel(16);
    let (event_tx, mut event_rx) = mpsc::channel(16);

    let sender = HeartbeatSender::new(
        config,
        Arc::new(provider.clone()) as Arc<dyn HeartbeatSource>,
        heartbeat_tx,
        cancel.clone(),
    );
    let receiver = HeartbeatReceiver::new(config, heartbeat_rx, event_tx, cancel.clone());
    let leases = receiver.leases();
    tokio::spawn(sender.run());
    tokio::spawn(receiver.run());

    timeout(WAIT, async {
        while !leases.contains(&spec("AAPL")) {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    // Still announced, so no expiry over several lease periods.
    sleep(Duration::from_millis(400)).await;
    assert!(event_rx.try_recv().is_err());

    provider.remove_subscription(&user, &requirement);

    let event = timeout(WAIT, event_rx.recv()).await.unwrap().unwrap();
    assert_eq!(event, HeartbeatEvent::LeaseExpired(spec("AAPL")));
    assert!(!leases.contains(&spec("AAPL")));

    cancel.cancel();
}

#[tokio::test]
async fn heartbeat_source_reports_what_the_provider_holds() {
    let (feed, _rx) = InMemoryFeed::new("primary", 8);
    let provider = provider(
        Arc::new(feed),
        Arc::new(PermissiveEntitlementChecker),
        Arc::new(IdentityResolver),
    )
    .await;
    let requirement = Requirement::new(fields::ASK, ticker("MSFT"));
    let ticket = provider
        .add_subscription(&UserPrincipal::local("alice"), &requirement)
        .unwrap();
    assert_eq!(timeout(WAIT, ticket.outcome()).await.unwrap(), Ok(()));

    provider.on_tick(
        &spec("MSFT"),
        &FieldMap::from([(fields::ASK.to_string(), 412.25)]),
    );

    assert_eq!(provider.specifications(), vec![spec("MSFT")]);
    let snapshot = provider.snapshot();
    assert_eq!(provider.query_snapshot(snapshot, &requirement), Some(412.25));
}
