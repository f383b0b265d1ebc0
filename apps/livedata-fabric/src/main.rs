//! Live Data Fabric Binary
//!
//! Starts one snapshot provider per configured upstream feed, combines them
//! behind a single provider and serves health and metrics.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin livedata-fabric
//! ```
//!
//! # Environment Variables
//!
//! - `LIVEDATA_PROVIDERS`: Comma separated provider names, in priority order (default: primary)
//! - `LIVEDATA_NORMALIZATION_RULE_SET`: Default normalization rule set (default: `OpenGamma`)
//! - `LIVEDATA_HEALTH_PORT`: Health check HTTP port (default: 8083)
//! - `LIVEDATA_HEARTBEAT_INTERVAL_SECS`: Heartbeat period (default: 30)
//! - `LIVEDATA_LEASE_TIMEOUT_SECS`: Heartbeat lease timeout (default: 90)
//! - `LIVEDATA_EVENT_CAPACITY`: Provider event channel capacity (default: 10000)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4318>)
//! - `OTEL_SERVICE_NAME`: Service name (default: livedata-fabric)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use livedata_fabric::application::ports::{
    EntitlementChecker, IdentityResolver, LiveDataProvider, MarketDataFeed,
    PermissiveEntitlementChecker, SpecificationResolver,
};
use livedata_fabric::infrastructure::entitlement::{EntitlementServer, RemoteEntitlementChecker};
use livedata_fabric::infrastructure::heartbeat::HeartbeatSource;
use livedata_fabric::infrastructure::resolution::{
    RemoteSpecificationResolver, ResolutionServer,
};
use livedata_fabric::infrastructure::telemetry;
use livedata_fabric::{
    BroadcastConfig, CombiningProvider, FabricConfig, FeedEvent, HealthServer, HealthServerState,
    HeartbeatConfig, HeartbeatEvent, HeartbeatReceiver, HeartbeatSender, InMemoryConduit,
    InMemoryFeed, SnapshotProvider, init_metrics, run_feed_handler,
};
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Queue depth for feed events and satellite requests.
const CHANNEL_CAPACITY: usize = 1024;

/// One running upstream source.
struct Source {
    feed: Arc<InMemoryFeed>,
    provider: SnapshotProvider,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Live Data Fabric");

    // Initialize Prometheus metrics
    let _metrics_handle = init_metrics();

    let config = FabricConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();
    let mut tasks = JoinSet::new();
    let broadcast_config = BroadcastConfig::from(&config.broadcast);

    // Satellite services, reached through request conduits
    let (entitlement_conduit, _) = InMemoryConduit::serve(
        EntitlementServer::new(PermissiveEntitlementChecker),
        CHANNEL_CAPACITY,
        shutdown_token.clone(),
    );
    let (resolution_conduit, _) = InMemoryConduit::serve(
        ResolutionServer::new(IdentityResolver),
        CHANNEL_CAPACITY,
        shutdown_token.clone(),
    );
    let entitlements: Arc<dyn EntitlementChecker> =
        Arc::new(RemoteEntitlementChecker::new(Arc::new(entitlement_conduit)));
    let resolver: Arc<dyn SpecificationResolver> =
        Arc::new(RemoteSpecificationResolver::new(Arc::new(resolution_conduit)));

    // One snapshot provider per upstream feed
    let mut sources = Vec::with_capacity(config.providers.len());
    for name in &config.providers {
        let (feed, feed_rx) = InMemoryFeed::new(name.clone(), CHANNEL_CAPACITY);
        let feed = Arc::new(feed);

        let provider = SnapshotProvider::builder(
            name.clone(),
            Arc::clone(&feed) as Arc<dyn MarketDataFeed>,
        )
        .entitlements(Arc::clone(&entitlements))
        .resolver(Arc::clone(&resolver))
        .normalization_rule_set(config.normalization_rule_set.clone())
        .broadcast(broadcast_config)
        .build()?;

        tasks.spawn(run_feed_handler(
            provider.clone(),
            feed_rx,
            shutdown_token.clone(),
        ));
        feed.publish(FeedEvent::Connected).await?;

        sources.push(Source { feed, provider });
    }

    let combined = Arc::new(CombiningProvider::new(
        "combined",
        sources
            .iter()
            .map(|source| Arc::new(source.provider.clone()) as Arc<dyn LiveDataProvider>)
            .collect(),
        broadcast_config,
    )?);

    // Heartbeats from the combined provider keep upstream leases alive
    let heartbeat_config = HeartbeatConfig::from(&config.heartbeat);
    let (heartbeat_tx, heartbeat_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (lease_tx, lease_rx) = mpsc::channel(CHANNEL_CAPACITY);

    let sender = HeartbeatSender::new(
        heartbeat_config,
        Arc::clone(&combined) as Arc<dyn HeartbeatSource>,
        heartbeat_tx,
        shutdown_token.clone(),
    );
    let receiver = HeartbeatReceiver::new(
        heartbeat_config,
        heartbeat_rx,
        lease_tx,
        shutdown_token.clone(),
    );
    tasks.spawn(sender.run());
    tasks.spawn(receiver.run());

    let health_providers = sources.iter().map(|source| source.provider.clone()).collect();
    tasks.spawn(handle_lease_events(lease_rx, sources));

    // Initialize health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        health_providers,
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        Arc::clone(&health_state),
        shutdown_token.clone(),
    );

    tasks.spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    tracing::info!(
        constituents = combined.constituents().len(),
        "Live data fabric ready"
    );

    await_shutdown(shutdown_token).await;
    drain_tasks(tasks, SHUTDOWN_TIMEOUT).await;

    tracing::info!("Live data fabric stopped");
    Ok(())
}

/// Expire subscriptions whose heartbeat lease ran out.
async fn handle_lease_events(mut rx: mpsc::Receiver<HeartbeatEvent>, sources: Vec<Source>) {
    while let Some(event) = rx.recv().await {
        match event {
            HeartbeatEvent::LeaseExpired(specification) => {
                let holders = sources
                    .iter()
                    .filter(|source| source.feed.is_subscribed(&specification));
                for source in holders {
                    let dropped = source.provider.expire_specification(&specification).await;
                    tracing::info!(
                        provider = %source.provider.name(),
                        specification = %specification,
                        requirements = dropped.len(),
                        "Lease expired"
                    );
                }
            }
        }
    }
}

/// Wait for spawned tasks to finish, aborting whatever is left after `limit`.
///
/// Returns whether every task finished in time.
async fn drain_tasks(mut tasks: JoinSet<()>, limit: Duration) -> bool {
    let drained = tokio::time::timeout(limit, async {
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::warn!(error = %e, "Task ended abnormally during shutdown");
            }
        }
    })
    .await
    .is_ok();

    if !drained {
        tracing::warn!(
            remaining = tasks.len(),
            timeout_secs = limit.as_secs(),
            "Shutdown timed out, aborting remaining tasks"
        );
        tasks.abort_all();
    }
    drained
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &FabricConfig) {
    tracing::info!(
        providers = ?config.providers,
        normalization_rule_set = %config.normalization_rule_set,
        health_port = config.server.health_port,
        "Configuration loaded"
    );
    tracing::debug!(
        heartbeat_interval_secs = config.heartbeat.interval.as_secs(),
        lease_timeout_secs = config.heartbeat.lease_timeout.as_secs(),
        event_capacity = config.broadcast.event_capacity,
        "Channel settings"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
