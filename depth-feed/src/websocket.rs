/// WebSocket feed connection for the partial depth stream
///
/// Provides automatic reconnection with a fixed delay, read-timeout detection
/// and generation tagging of every emitted event.

use crate::{
    error::FeedError,
    types::{ConnectionState, DEFAULT_DEPTH, Generation},
};
use async_trait::async_trait;
use futures::{StreamExt, future, stream::BoxStream};
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

/// Binance partial book depth stream, top 20 levels every 1000ms.
pub const DEFAULT_ENDPOINT_TEMPLATE: &str =
    "wss://stream.binance.com:9443/ws/{symbol}@depth20@1000ms";

/// Placeholder replaced by the lower-cased feed symbol.
pub const SYMBOL_PLACEHOLDER: &str = "{symbol}";

/// Feed connection configuration
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Endpoint template containing a `{symbol}` placeholder
    pub endpoint_template: String,
    /// Maximum levels kept per side
    pub depth: usize,
    /// Delay between an unexpected disconnect and the next attempt
    pub reconnect_delay: Duration,
    /// Treat the connection as dead when nothing arrives for this long
    pub read_timeout: Duration,
    /// Maximum channel buffer size for feed events
    pub channel_buffer_size: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            endpoint_template: DEFAULT_ENDPOINT_TEMPLATE.to_string(),
            depth: DEFAULT_DEPTH,
            reconnect_delay: Duration::from_millis(3000),
            read_timeout: Duration::from_secs(30),
            channel_buffer_size: 1000,
        }
    }
}

impl FeedConfig {
    /// Create a new configuration with a custom endpoint template
    pub fn new(endpoint_template: impl Into<String>) -> Self {
        Self {
            endpoint_template: endpoint_template.into(),
            ..Default::default()
        }
    }

    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_channel_buffer_size(mut self, size: usize) -> Self {
        self.channel_buffer_size = size;
        self
    }

    /// Stream endpoint for a symbol, lower-cased into the template
    pub fn endpoint(&self, symbol: &str) -> Result<Url, FeedError> {
        let endpoint = self
            .endpoint_template
            .replace(SYMBOL_PLACEHOLDER, &symbol.to_lowercase());

        Url::parse(&endpoint).map_err(|error| FeedError::InvalidEndpoint {
            endpoint,
            reason: error.to_string(),
        })
    }
}

/// Raw text frames from one connection; the stream ending means the venue hung up.
pub type FrameStream = BoxStream<'static, Result<String, FeedError>>;

/// Opens transport sessions to a feed endpoint
#[async_trait]
pub trait FeedTransport: Send + Sync + 'static {
    async fn connect(&self, endpoint: &Url) -> Result<FrameStream, FeedError>;
}

#[async_trait]
impl<T: FeedTransport> FeedTransport for Arc<T> {
    async fn connect(&self, endpoint: &Url) -> Result<FrameStream, FeedError> {
        (**self).connect(endpoint).await
    }
}

/// `tokio-tungstenite` transport
#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransport;

#[async_trait]
impl FeedTransport for WsTransport {
    async fn connect(&self, endpoint: &Url) -> Result<FrameStream, FeedError> {
        let (ws_stream, _) =
            connect_async(endpoint.as_str())
                .await
                .map_err(|error| FeedError::Connect {
                    endpoint: endpoint.to_string(),
                    reason: error.to_string(),
                })?;

        let frames = ws_stream.filter_map(|message| {
            future::ready(match message {
                Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "venue sent close frame");
                    Some(Err(FeedError::Closed))
                }
                // Heartbeats are answered by tungstenite
                Ok(_) => None,
                Err(error) => Some(Err(FeedError::Socket(error.to_string()))),
            })
        });

        Ok(frames.boxed())
    }
}

/// Events emitted by running connections, tagged with the generation they belong to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    State {
        generation: Generation,
        state: ConnectionState,
    },
    Frame {
        generation: Generation,
        raw: String,
    },
    /// A reconnect attempt replaced `retired` with a fresh generation
    Regenerated {
        retired: Generation,
        generation: Generation,
    },
}

impl FeedEvent {
    pub fn generation(&self) -> Generation {
        match self {
            FeedEvent::State { generation, .. }
            | FeedEvent::Frame { generation, .. }
            | FeedEvent::Regenerated { generation, .. } => *generation,
        }
    }
}

/// Shared source of generation ids
#[derive(Debug, Clone, Default)]
pub struct GenerationCounter(Arc<AtomicU64>);

impl GenerationCounter {
    pub fn next(&self) -> Generation {
        Generation(self.0.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

struct FeedLink {
    opened: Generation,
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Owns the connection tasks for a session
///
/// Every `open` spawns one task running the
/// Connecting → Open → Reconnecting → Connecting ... state machine until
/// `close` is called with the generation `open` returned.
pub struct FeedConnection<T = WsTransport> {
    config: FeedConfig,
    transport: Arc<T>,
    generations: GenerationCounter,
    event_tx: mpsc::Sender<FeedEvent>,
    links: Vec<FeedLink>,
}

impl<T: FeedTransport> FeedConnection<T> {
    pub fn new(config: FeedConfig, transport: T, event_tx: mpsc::Sender<FeedEvent>) -> Self {
        Self {
            config,
            transport: Arc::new(transport),
            generations: GenerationCounter::default(),
            event_tx,
            links: Vec::new(),
        }
    }

    /// Start streaming `symbol`, returning the generation of the first attempt
    pub fn open(&mut self, symbol: &str) -> Generation {
        self.links.retain(|link| !link.handle.is_finished());

        let generation = self.generations.next();
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let task = FeedTask {
            config: self.config.clone(),
            transport: Arc::clone(&self.transport),
            generations: self.generations.clone(),
            event_tx: self.event_tx.clone(),
            symbol: symbol.to_lowercase(),
        };
        let handle = tokio::spawn(task.run(generation, shutdown_rx));

        self.links.push(FeedLink {
            opened: generation,
            shutdown_tx,
            handle,
        });

        generation
    }

    /// Tear down the connection opened as `generation` without reconnecting
    ///
    /// Cancels a pending retry timer. Returns false if no such connection is running.
    pub fn close(&mut self, generation: Generation) -> bool {
        let Some(index) = self
            .links
            .iter()
            .position(|link| link.opened == generation)
        else {
            return false;
        };

        let link = self.links.swap_remove(index);
        let _ = link.shutdown_tx.try_send(());
        true
    }

    pub fn close_all(&mut self) {
        for link in self.links.drain(..) {
            let _ = link.shutdown_tx.try_send(());
        }
    }

    /// Connection tasks opened and not yet closed or finished
    pub fn active_connections(&self) -> usize {
        self.links
            .iter()
            .filter(|link| !link.handle.is_finished())
            .count()
    }
}

/// Why a single connection attempt ended
enum AttemptEnd {
    Disconnected(FeedError),
    ConsumerGone,
}

struct FeedTask<T> {
    config: FeedConfig,
    transport: Arc<T>,
    generations: GenerationCounter,
    event_tx: mpsc::Sender<FeedEvent>,
    symbol: String,
}

impl<T: FeedTransport> FeedTask<T> {
    /// Main connection loop with fixed-delay reconnect
    async fn run(self, mut generation: Generation, mut shutdown_rx: mpsc::Receiver<()>) {
        let endpoint = match self.config.endpoint(&self.symbol) {
            Ok(endpoint) => endpoint,
            Err(error) => {
                error!(%generation, %error, "cannot start depth feed");
                self.emit_closed(generation);
                return;
            }
        };

        info!(%generation, symbol = %self.symbol, %endpoint, "starting depth feed");

        loop {
            if !self
                .emit(FeedEvent::State {
                    generation,
                    state: ConnectionState::Connecting,
                })
                .await
            {
                return;
            }

            let end = tokio::select! {
                end = self.attempt(&endpoint, generation) => end,
                _ = shutdown_rx.recv() => {
                    info!(%generation, symbol = %self.symbol, "depth feed closed");
                    self.emit_closed(generation);
                    return;
                }
            };

            let error = match end {
                AttemptEnd::Disconnected(error) => error,
                AttemptEnd::ConsumerGone => {
                    debug!(%generation, "feed event receiver dropped, stopping");
                    return;
                }
            };

            if !error.is_recoverable() {
                error!(%generation, %error, "depth feed failed permanently");
                self.emit_closed(generation);
                return;
            }

            warn!(
                %generation,
                %error,
                delay_ms = self.config.reconnect_delay.as_millis() as u64,
                "depth feed disconnected, will reconnect..."
            );

            if !self
                .emit(FeedEvent::State {
                    generation,
                    state: ConnectionState::Reconnecting,
                })
                .await
            {
                return;
            }

            // Wait before reconnecting, unless closed in the meantime
            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                _ = shutdown_rx.recv() => {
                    info!(%generation, symbol = %self.symbol, "depth feed closed while reconnecting");
                    self.emit_closed(generation);
                    return;
                }
            }

            let retired = generation;
            generation = self.generations.next();
            debug!(%retired, %generation, "reconnecting depth feed");

            if !self
                .emit(FeedEvent::Regenerated {
                    retired,
                    generation,
                })
                .await
            {
                return;
            }
        }
    }

    /// One connect-and-read cycle, returns when the connection is gone
    async fn attempt(&self, endpoint: &Url, generation: Generation) -> AttemptEnd {
        let mut frames = match self.transport.connect(endpoint).await {
            Ok(frames) => frames,
            Err(error) => return AttemptEnd::Disconnected(error),
        };

        info!(%generation, %endpoint, "connected to depth feed");
        if !self
            .emit(FeedEvent::State {
                generation,
                state: ConnectionState::Open,
            })
            .await
        {
            return AttemptEnd::ConsumerGone;
        }

        loop {
            match tokio::time::timeout(self.config.read_timeout, frames.next()).await {
                Ok(Some(Ok(raw))) => {
                    if !self.emit(FeedEvent::Frame { generation, raw }).await {
                        return AttemptEnd::ConsumerGone;
                    }
                }
                Ok(Some(Err(error))) => return AttemptEnd::Disconnected(error),
                Ok(None) => return AttemptEnd::Disconnected(FeedError::Closed),
                Err(_) => {
                    return AttemptEnd::Disconnected(FeedError::ReadTimeout(
                        self.config.read_timeout,
                    ));
                }
            }
        }
    }

    async fn emit(&self, event: FeedEvent) -> bool {
        self.event_tx.send(event).await.is_ok()
    }

    fn emit_closed(&self, generation: Generation) {
        let _ = self.event_tx.try_send(FeedEvent::State {
            generation,
            state: ConnectionState::Closed,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{ScriptedTransport, drain};

    fn test_config() -> FeedConfig {
        FeedConfig::default().with_read_timeout(Duration::from_secs(3600))
    }

    fn connection(
        transport: &Arc<ScriptedTransport>,
        config: FeedConfig,
    ) -> (
        FeedConnection<Arc<ScriptedTransport>>,
        mpsc::Receiver<FeedEvent>,
    ) {
        let (event_tx, event_rx) = mpsc::channel(64);
        (
            FeedConnection::new(config, Arc::clone(transport), event_tx),
            event_rx,
        )
    }

    #[test]
    fn test_config_builder() {
        let config = FeedConfig::new("ws://localhost:8080/{symbol}")
            .with_depth(10)
            .with_reconnect_delay(Duration::from_secs(5))
            .with_read_timeout(Duration::from_secs(15))
            .with_channel_buffer_size(500);

        assert_eq!(config.endpoint_template, "ws://localhost:8080/{symbol}");
        assert_eq!(config.depth, 10);
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.read_timeout, Duration::from_secs(15));
        assert_eq!(config.channel_buffer_size, 500);
    }

    #[test]
    fn test_default_config() {
        let config = FeedConfig::default();
        assert_eq!(config.endpoint_template, DEFAULT_ENDPOINT_TEMPLATE);
        assert_eq!(config.depth, 20);
        assert_eq!(config.reconnect_delay, Duration::from_millis(3000));
        assert_eq!(config.read_timeout, Duration::from_secs(30));
        assert_eq!(config.channel_buffer_size, 1000);
    }

    #[test]
    fn test_endpoint_lowercases_symbol() {
        let endpoint = FeedConfig::default().endpoint("BTCUSDT").unwrap();
        assert_eq!(
            endpoint.as_str(),
            "wss://stream.binance.com:9443/ws/btcusdt@depth20@1000ms"
        );

        let error = FeedConfig::new("not a url/{symbol}")
            .endpoint("btcusdt")
            .unwrap_err();
        assert!(matches!(error, FeedError::InvalidEndpoint { .. }));
        assert!(!error.is_recoverable());
    }

    #[test]
    fn test_generation_counter_is_monotonic() {
        let counter = GenerationCounter::default();
        let shared = counter.clone();

        assert_eq!(counter.next(), Generation(1));
        assert_eq!(shared.next(), Generation(2));
        assert_eq!(counter.next(), Generation(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_emitted_in_arrival_order() {
        let transport = Arc::new(ScriptedTransport::default());
        let frames = transport.accept();
        let (mut connection, mut event_rx) = connection(&transport, test_config());

        let generation = connection.open("BTCUSDT");
        frames.send(Ok("first".to_string())).unwrap();
        frames.send(Ok("second".to_string())).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(
            drain(&mut event_rx),
            vec![
                FeedEvent::State {
                    generation,
                    state: ConnectionState::Connecting
                },
                FeedEvent::State {
                    generation,
                    state: ConnectionState::Open
                },
                FeedEvent::Frame {
                    generation,
                    raw: "first".to_string()
                },
                FeedEvent::Frame {
                    generation,
                    raw: "second".to_string()
                },
            ]
        );
        assert_eq!(
            transport.attempts()[0].endpoint,
            "wss://stream.binance.com:9443/ws/btcusdt@depth20@1000ms"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_schedules_single_retry_after_delay() {
        let transport = Arc::new(ScriptedTransport::default());
        let (mut connection, mut event_rx) = connection(&transport, test_config());

        let first = connection.open("btcusdt");

        // Before the delay elapses no second attempt exists
        tokio::time::sleep(Duration::from_millis(2999)).await;
        assert_eq!(transport.attempts().len(), 1);

        tokio::time::sleep(Duration::from_millis(501)).await;
        let attempts = transport.attempts();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[1].at - attempts[0].at, Duration::from_millis(3000));

        let second = Generation(first.0 + 1);
        assert_eq!(
            drain(&mut event_rx),
            vec![
                FeedEvent::State {
                    generation: first,
                    state: ConnectionState::Connecting
                },
                FeedEvent::State {
                    generation: first,
                    state: ConnectionState::Reconnecting
                },
                FeedEvent::Regenerated {
                    retired: first,
                    generation: second
                },
                FeedEvent::State {
                    generation: second,
                    state: ConnectionState::Connecting
                },
                FeedEvent::State {
                    generation: second,
                    state: ConnectionState::Reconnecting
                },
            ]
        );
        assert_eq!(connection.active_connections(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_end_reconnects_with_new_generation() {
        let transport = Arc::new(ScriptedTransport::default());
        let first_frames = transport.accept();
        let second_frames = transport.accept();
        let (mut connection, mut event_rx) = connection(&transport, test_config());

        let first = connection.open("ethusdt");
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Venue hangs up
        drop(first_frames);
        tokio::time::sleep(Duration::from_millis(3100)).await;
        second_frames.send(Ok("after".to_string())).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let events = drain(&mut event_rx);
        let regenerated = events
            .iter()
            .filter_map(|event| match event {
                FeedEvent::Regenerated {
                    retired,
                    generation,
                } => Some((*retired, *generation)),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(regenerated.len(), 1);

        let (retired, second) = regenerated[0];
        assert_eq!(retired, first);
        assert!(second > first);
        assert_eq!(
            events.last(),
            Some(&FeedEvent::Frame {
                generation: second,
                raw: "after".to_string()
            })
        );

        // Attempts of one connection never overlap
        assert_eq!(transport.attempts().len(), 2);
        assert_eq!(connection.active_connections(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_error_triggers_reconnect() {
        let transport = Arc::new(ScriptedTransport::default());
        let frames = transport.accept();
        let (mut connection, mut event_rx) = connection(&transport, test_config());

        let generation = connection.open("solusdt");
        frames
            .send(Err(FeedError::Socket("Io(Kind(UnexpectedEof))".to_string())))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(
            drain(&mut event_rx).last(),
            Some(&FeedEvent::State {
                generation,
                state: ConnectionState::Reconnecting
            })
        );
        assert_eq!(transport.attempts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_timeout_triggers_reconnect() {
        let transport = Arc::new(ScriptedTransport::default());
        let _frames = transport.accept();
        let config = FeedConfig::default().with_read_timeout(Duration::from_secs(5));
        let (mut connection, mut event_rx) = connection(&transport, config);

        let generation = connection.open("dogeusdt");
        tokio::time::sleep(Duration::from_millis(4900)).await;
        assert_eq!(
            drain(&mut event_rx).last(),
            Some(&FeedEvent::State {
                generation,
                state: ConnectionState::Open
            })
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            drain(&mut event_rx),
            vec![FeedEvent::State {
                generation,
                state: ConnectionState::Reconnecting
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_pending_retry() {
        let transport = Arc::new(ScriptedTransport::default());
        let (mut connection, mut event_rx) = connection(&transport, test_config());

        let generation = connection.open("btcusdt");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(connection.close(generation));
        assert!(!connection.close(generation));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.attempts().len(), 1);
        assert_eq!(
            drain(&mut event_rx).last(),
            Some(&FeedEvent::State {
                generation,
                state: ConnectionState::Closed
            })
        );
        assert_eq!(connection.active_connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_open_connection_does_not_reconnect() {
        let transport = Arc::new(ScriptedTransport::default());
        let _frames = transport.accept();
        let (mut connection, mut event_rx) = connection(&transport, test_config());

        let generation = connection.open("btcusdt");
        tokio::time::sleep(Duration::from_millis(10)).await;
        connection.close(generation);
        tokio::time::sleep(Duration::from_secs(10)).await;

        let events = drain(&mut event_rx);
        assert!(!events.iter().any(|event| matches!(
            event,
            FeedEvent::State {
                state: ConnectionState::Reconnecting,
                ..
            }
        )));
        assert_eq!(transport.attempts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_endpoint_closes_without_retry() {
        let transport = Arc::new(ScriptedTransport::default());
        let (mut connection, mut event_rx) =
            connection(&transport, FeedConfig::new("not a url/{symbol}"));

        let generation = connection.open("btcusdt");
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(transport.attempts().is_empty());
        assert_eq!(
            drain(&mut event_rx),
            vec![FeedEvent::State {
                generation,
                state: ConnectionState::Closed
            }]
        );
    }
}
