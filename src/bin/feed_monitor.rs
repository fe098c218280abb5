//! Feed Monitor Binary
//!
//! Connects to the market feed, holds subscriptions for the given items and
//! routes, and logs a periodic summary of the cached state.
//!
//! Usage:
//!   feed-monitor --items 4151,11832 --routes flipping,high_volume --alerts
//!
//! Environment:
//!   FEED_WS_URL - Feed endpoint (default: ws://127.0.0.1:8000/ws/market)
//!   FEED_ITEMS / FEED_ROUTES - Same as the flags
//!   FEED_* - Client tunables, see StreamConfig::from_env

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use feed_stream::stream::{StateTransition, SubscriptionKey};
use feed_stream::{
    ConnectionState, ResubscribePolicy, StreamClient, StreamConfig, TopicLease, WsConnector,
};

#[derive(Parser, Debug)]
#[command(name = "feed-monitor")]
#[command(about = "Market feed monitor - hold subscriptions and log cached state")]
struct Args {
    /// Feed WebSocket URL (overrides FEED_WS_URL)
    #[arg(long)]
    endpoint: Option<String>,

    /// Item ids to subscribe to (comma-separated)
    #[arg(long, env = "FEED_ITEMS", default_value = "")]
    items: String,

    /// Recommendation routes to subscribe to (comma-separated)
    #[arg(long, env = "FEED_ROUTES", default_value = "")]
    routes: String,

    /// Request market alerts on every connect
    #[arg(long)]
    alerts: bool,

    /// Let the client replay subscriptions after a reconnect
    #[arg(long)]
    replay: bool,

    /// Seconds between summary lines
    #[arg(long, env = "FEED_SUMMARY_SECS", default_value = "30")]
    summary_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let args = Args::parse();

    let mut config = StreamConfig::from_env();
    if let Some(endpoint) = args.endpoint.clone() {
        config.endpoint = endpoint;
    }
    if args.replay {
        config.resubscribe = ResubscribePolicy::Replay;
    }

    let topics = parse_topics(&args.items, &args.routes)?;
    let routes: Vec<String> = topics
        .iter()
        .filter_map(|k| match k {
            SubscriptionKey::Route(r) => Some(r.clone()),
            SubscriptionKey::Item(_) => None,
        })
        .collect();

    info!("Starting Feed Monitor");
    info!("  Endpoint: {}", config.endpoint);
    info!(
        "  Topics: {}",
        topics.iter().map(|k| k.to_string()).collect::<Vec<_>>().join(",")
    );
    info!("  Resubscribe: {:?}", config.resubscribe);

    let policy = config.resubscribe;
    let client = StreamClient::new(config, Arc::new(WsConnector::new()));
    let mut transitions = client.transitions();
    client.connect();

    let mut summary = interval(Duration::from_secs(args.summary_secs.max(1)));
    summary.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut leases: Vec<TopicLease> = Vec::new();

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
            transition = transitions.recv() => {
                let transition: StateTransition = match transition {
                    Ok(t) => t,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "missed connection transitions");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };

                match transition.to {
                    ConnectionState::Connected => {
                        if leases.is_empty() {
                            leases = topics
                                .iter()
                                .filter_map(|key| client.lease(key.clone()))
                                .collect();
                            info!(
                                held = leases.len(),
                                wanted = topics.len(),
                                "subscriptions requested"
                            );
                        }
                        for route in &routes {
                            client.get_current_recommendations(route);
                        }
                        if args.alerts {
                            client.get_market_alerts();
                        }
                    }
                    ConnectionState::Reconnecting => {
                        // Without replay the server forgot our topics; release and
                        // take them again on the next connect.
                        if policy == ResubscribePolicy::Manual {
                            leases.clear();
                        }
                    }
                    ConnectionState::Disconnected => {
                        info!(reason = %transition.reason, "feed connection closed");
                        break;
                    }
                    ConnectionState::Failed => {
                        let reason = client.snapshot().connection.last_error.unwrap_or_default();
                        error!(reason = %reason, "feed connection failed permanently");
                        break;
                    }
                    ConnectionState::Connecting => {}
                }
            }
            _ = summary.tick() => log_summary(&client),
        }
    }

    drop(leases);
    client.shutdown();
    Ok(())
}

fn log_summary(client: &StreamClient) {
    let snapshot = client.snapshot();
    let freshest = snapshot
        .latest_price_by_item
        .values()
        .max_by_key(|p| p.timestamp)
        .map(|p| format!("item {} {:?}/{:?}", p.item_id, p.high_price, p.low_price))
        .unwrap_or_else(|| "-".to_string());

    info!(
        state = %snapshot.connection.state,
        subscriptions = client.active_subscriptions().len(),
        routes = snapshot.recommendations_by_route.len(),
        prices = snapshot.latest_price_by_item.len(),
        events = snapshot.recent_events.len(),
        patterns = snapshot.recent_patterns.len(),
        surges = snapshot.recent_surges.len(),
        alerts = snapshot.active_alerts.len(),
        freshest = %freshest,
        "feed summary"
    );
    info!(metrics = %client.metrics().summary(), "feed client metrics");
}

fn parse_topics(items: &str, routes: &str) -> Result<Vec<SubscriptionKey>> {
    let mut topics = Vec::new();
    for raw in items.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let item_id: i64 = raw
            .parse()
            .with_context(|| format!("invalid item id '{}'", raw))?;
        topics.push(SubscriptionKey::item(item_id));
    }
    for route in routes.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        topics.push(SubscriptionKey::route(route));
    }
    topics.dedup();
    Ok(topics)
}

fn load_env() {
    // Standard dotenv search (cwd + parents), then the crate directory
    let _ = dotenv::dotenv();
    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "feed_stream=debug,feed_monitor=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
