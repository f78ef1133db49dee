/// Depth Monitor - headless consumer of a depth feed session
///
/// Logs a one-line book summary on every published update. Type a pair
/// (e.g. `ETH/USDT` or `ethusdt`) followed by enter to switch.
///
/// Environment:
/// - DEPTH_FEED_PAIR: initial pair (default BTC/USDT)
/// - DEPTH_FEED_URL_TEMPLATE: endpoint with a `{symbol}` placeholder
/// - DEPTH_FEED_RECONNECT_MS: reconnect delay (default 3000)
/// - DEPTH_FEED_READ_TIMEOUT_SECS: idle time before reconnecting (default 30)
/// - RUST_LOG: log filter (default info)

use std::time::Duration;

use depth_feed::{
    FeedConfig, PublishedState, SessionConfig, SessionController, SessionHandle, TradingPair,
};
use rustls::crypto::ring::default_provider;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[tokio::main]
async fn main() {
    let _ = default_provider().install_default();
    init_logging();

    let config = session_config();
    info!(
        endpoint = %config.feed.endpoint_template,
        reconnect_ms = config.feed.reconnect_delay.as_millis() as u64,
        "starting depth monitor"
    );

    let initial = std::env::var("DEPTH_FEED_PAIR")
        .ok()
        .and_then(|symbol| TradingPair::find(&symbol))
        .unwrap_or_else(TradingPair::default_pair)
        .clone();

    let handle = SessionController::websocket(config).spawn();
    if handle.change_pair(initial).await.is_err() {
        warn!("session stopped before start-up");
        return;
    }

    let mut state_rx = handle.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                log_state(&state_rx.borrow_and_update());
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => switch_pair(&handle, &line).await,
                Ok(None) => {
                    info!("stdin closed, pair switching disabled");
                    break;
                }
                Err(error) => {
                    warn!(%error, "failed to read stdin");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                handle.shutdown().await;
                return;
            }
        }
    }

    // Keep reporting until interrupted
    loop {
        tokio::select! {
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                log_state(&state_rx.borrow_and_update());
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    handle.shutdown().await;
}

async fn switch_pair(handle: &SessionHandle, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    match TradingPair::find(line) {
        Some(pair) if handle.state().loading => {
            // Selection is gated until the current switch completes
            warn!(%pair, "switch in progress, ignoring request");
        }
        Some(pair) => {
            if handle.change_pair(pair.clone()).await.is_err() {
                warn!("session stopped");
            }
        }
        None => {
            let supported = TradingPair::catalog()
                .iter()
                .map(|pair| pair.display_symbol.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            warn!(requested = line, %supported, "unknown pair");
        }
    }
}

fn log_state(state: &PublishedState) {
    let Some(pair) = &state.pair else {
        return;
    };

    let connection = state
        .connection
        .map(|connection| connection.as_str())
        .unwrap_or("pending");

    match (state.snapshot.best_bid(), state.snapshot.best_ask()) {
        (Some(bid), Some(ask)) => {
            let spread_pct = state
                .spreads
                .last()
                .map(|sample| format!("{:.4}%", sample.spread_percent))
                .unwrap_or_else(|| "-".to_string());
            let imbalance = state
                .imbalances
                .last()
                .map(|sample| format!("{:+.2}%", sample.imbalance_ratio * 100.0))
                .unwrap_or_else(|| "-".to_string());
            let spread = state
                .snapshot
                .spread()
                .map(|spread| format!("{spread:.2}"))
                .unwrap_or_else(|| "-".to_string());

            info!(
                "{} [{}] bid {:.2} ({:.4}) | ask {:.2} ({:.4}) | spread {} ({}) | imbalance {} | depth {:.4} | samples {}/{}",
                pair,
                connection,
                bid.price,
                bid.quantity,
                ask.price,
                ask.quantity,
                spread,
                spread_pct,
                imbalance,
                state.snapshot.max_total(),
                state.spreads.len(),
                state.imbalances.len(),
            );
        }
        _ => info!(
            "{} [{}] {}",
            pair,
            connection,
            if state.loading { "loading..." } else { "waiting for book" }
        ),
    }
}

fn session_config() -> SessionConfig {
    let mut feed = FeedConfig::default();

    if let Ok(template) = std::env::var("DEPTH_FEED_URL_TEMPLATE") {
        feed = FeedConfig {
            endpoint_template: template,
            ..feed
        };
    }

    if let Some(delay) = env_u64("DEPTH_FEED_RECONNECT_MS") {
        feed = feed.with_reconnect_delay(Duration::from_millis(delay));
    }

    if let Some(timeout) = env_u64("DEPTH_FEED_READ_TIMEOUT_SECS") {
        feed = feed.with_read_timeout(Duration::from_secs(timeout));
    }

    SessionConfig::new(feed)
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|value| value.parse().ok())
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
