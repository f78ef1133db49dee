/// Session orchestration: pair switching, generation filtering and state publication.
///
/// The `SessionController` is the only writer of the book snapshot and the
/// metric histories. It owns the `FeedConnection` together with the
/// generation it currently considers active, and applies a feed event only
/// when the event carries that generation. Presentation code gets a read-only
/// `watch::Receiver` of `PublishedState` and may only request pair changes
/// through a `SessionHandle`.

use crate::{
    aggregation::{IMBALANCE_HISTORY_CAPACITY, MetricsAggregator, SPREAD_HISTORY_CAPACITY},
    error::SessionError,
    normalize::{DepthNormalizer, NormalizedFrame},
    types::{
        ConnectionState, DepthSnapshot, Generation, ImbalanceSample, SpreadSample, TradingPair,
    },
    websocket::{FeedConfig, FeedConnection, FeedEvent, FeedTransport, WsTransport},
};
use chrono::Utc;
use serde::Serialize;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub feed: FeedConfig,
    pub spread_capacity: usize,
    pub imbalance_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            feed: FeedConfig::default(),
            spread_capacity: SPREAD_HISTORY_CAPACITY,
            imbalance_capacity: IMBALANCE_HISTORY_CAPACITY,
        }
    }
}

impl SessionConfig {
    pub fn new(feed: FeedConfig) -> Self {
        Self {
            feed,
            ..Default::default()
        }
    }

    pub fn with_spread_capacity(mut self, capacity: usize) -> Self {
        self.spread_capacity = capacity;
        self
    }

    pub fn with_imbalance_capacity(mut self, capacity: usize) -> Self {
        self.imbalance_capacity = capacity;
        self
    }
}

/// Where the session is in its pair-switch lifecycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum SessionPhase {
    /// No pair selected yet
    #[default]
    Idle,
    /// Waiting for the requested pair's connection to open
    Switching,
    /// Current pair's connection has opened
    Active,
}

/// Read-only view of the session handed to presentation code
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PublishedState {
    pub pair: Option<TradingPair>,
    pub phase: SessionPhase,
    /// True while switching; pair selection should be disabled
    pub loading: bool,
    /// Last state reported by the current generation
    pub connection: Option<ConnectionState>,
    pub generation: Option<Generation>,
    pub snapshot: DepthSnapshot,
    /// Oldest first
    pub spreads: Vec<SpreadSample>,
    /// Oldest first
    pub imbalances: Vec<ImbalanceSample>,
    pub stale_frames_dropped: u64,
    pub malformed_frames: u64,
}

/// Requests accepted from outside the controller task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    ChangePair(TradingPair),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ActiveFeed {
    /// Generation returned by `open`, used to close the connection
    opened: Generation,
    /// Latest generation of that connection, follows reconnects
    current: Generation,
}

pub struct SessionController<T = WsTransport> {
    feed: FeedConnection<T>,
    normalizer: DepthNormalizer,
    metrics: MetricsAggregator,
    active: Option<ActiveFeed>,
    pair: Option<TradingPair>,
    phase: SessionPhase,
    connection: Option<ConnectionState>,
    snapshot: DepthSnapshot,
    stale_frames_dropped: u64,
    malformed_frames: u64,
    event_rx: mpsc::Receiver<FeedEvent>,
    state_tx: watch::Sender<PublishedState>,
}

impl SessionController<WsTransport> {
    /// Controller streaming from the venue over websockets
    pub fn websocket(config: SessionConfig) -> Self {
        Self::new(config, WsTransport)
    }
}

impl<T: FeedTransport> SessionController<T> {
    pub fn new(config: SessionConfig, transport: T) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.feed.channel_buffer_size);
        let (state_tx, _) = watch::channel(PublishedState::default());

        Self {
            normalizer: DepthNormalizer::new(config.feed.depth),
            metrics: MetricsAggregator::new(config.spread_capacity, config.imbalance_capacity),
            feed: FeedConnection::new(config.feed, transport, event_tx),
            active: None,
            pair: None,
            phase: SessionPhase::Idle,
            connection: None,
            snapshot: DepthSnapshot::default(),
            stale_frames_dropped: 0,
            malformed_frames: 0,
            event_rx,
            state_tx,
        }
    }

    /// Receiver of every state published from now on
    pub fn subscribe(&self) -> watch::Receiver<PublishedState> {
        self.state_tx.subscribe()
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn pair(&self) -> Option<&TradingPair> {
        self.pair.as_ref()
    }

    /// Generation whose frames are currently applied
    pub fn current_generation(&self) -> Option<Generation> {
        self.active.map(|active| active.current)
    }

    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.connection
    }

    pub fn snapshot(&self) -> &DepthSnapshot {
        &self.snapshot
    }

    pub fn metrics(&self) -> &MetricsAggregator {
        &self.metrics
    }

    /// Retire the current connection, reset derived state and start streaming `pair`
    ///
    /// A request arriving while a previous one is still switching supersedes it.
    pub fn request_pair_change(&mut self, pair: TradingPair) -> Generation {
        if let Some(active) = self.active.take() {
            self.feed.close(active.opened);
            info!(
                retired = %active.current,
                superseded = self.phase == SessionPhase::Switching,
                "retiring depth feed"
            );
        }

        self.snapshot = DepthSnapshot::default();
        self.metrics.clear();
        self.connection = None;
        self.phase = SessionPhase::Switching;

        let generation = self.feed.open(&pair.feed_symbol);
        self.active = Some(ActiveFeed {
            opened: generation,
            current: generation,
        });

        info!(%pair, %generation, "switching depth feed");
        self.pair = Some(pair);
        self.publish();

        generation
    }

    /// Apply one feed event, dropping anything not tagged with the current generation
    pub fn handle_event(&mut self, event: FeedEvent) {
        match event {
            FeedEvent::Regenerated {
                retired,
                generation,
            } => match self.active.as_mut() {
                Some(active) if active.current == retired => {
                    debug!(%retired, %generation, "following reconnect");
                    active.current = generation;
                    self.publish();
                }
                _ => debug!(%retired, %generation, "ignoring reconnect of retired feed"),
            },
            FeedEvent::State { generation, state } => {
                if !self.is_current(generation) {
                    debug!(%generation, %state, "ignoring state of retired feed");
                    return;
                }

                self.connection = Some(state);
                if state == ConnectionState::Open && self.phase == SessionPhase::Switching {
                    self.phase = SessionPhase::Active;
                    if let Some(pair) = &self.pair {
                        info!(%generation, %pair, "depth feed active");
                    }
                }
                self.publish();
            }
            FeedEvent::Frame { generation, raw } => {
                if !self.is_current(generation) {
                    self.stale_frames_dropped += 1;
                    debug!(%generation, "dropping frame from retired feed");
                    return;
                }

                match self.normalizer.normalize(&raw) {
                    NormalizedFrame::Valid(snapshot) => {
                        let update = self.metrics.record(&snapshot, Utc::now());
                        debug!(
                            %generation,
                            spread = ?update.spread.map(|sample| sample.spread_absolute),
                            imbalance = ?update.imbalance.map(|sample| sample.imbalance_ratio),
                            "depth snapshot applied"
                        );
                        self.snapshot = snapshot;
                        self.publish();
                    }
                    NormalizedFrame::Malformed(error) => {
                        self.malformed_frames += 1;
                        warn!(%generation, %error, "discarding malformed depth frame");
                    }
                }
            }
        }
    }

    /// Close every connection and cancel pending retries
    pub fn shutdown(&mut self) {
        self.feed.close_all();
        self.active = None;
        self.phase = SessionPhase::Idle;
        self.connection = Some(ConnectionState::Closed);
        self.publish();
        info!("depth feed session stopped");
    }

    /// Drive the session until shut down or every handle is dropped
    pub async fn run(mut self, mut command_rx: mpsc::Receiver<SessionCommand>) {
        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(SessionCommand::ChangePair(pair)) => {
                        self.request_pair_change(pair);
                    }
                    Some(SessionCommand::Shutdown) | None => {
                        self.shutdown();
                        break;
                    }
                },
                Some(event) = self.event_rx.recv() => self.handle_event(event),
            }
        }
    }

    /// Spawn the controller onto the runtime
    pub fn spawn(self) -> SessionHandle {
        let (command_tx, command_rx) = mpsc::channel(16);
        let state_rx = self.subscribe();
        let task = tokio::spawn(self.run(command_rx));

        SessionHandle {
            command_tx,
            state_rx,
            task,
        }
    }

    fn is_current(&self, generation: Generation) -> bool {
        self.active
            .is_some_and(|active| active.current == generation)
    }

    fn publish(&self) {
        self.state_tx.send_replace(PublishedState {
            pair: self.pair.clone(),
            phase: self.phase,
            loading: self.phase == SessionPhase::Switching,
            connection: self.connection,
            generation: self.current_generation(),
            snapshot: self.snapshot.clone(),
            spreads: self.metrics.spreads().to_vec(),
            imbalances: self.metrics.imbalances().to_vec(),
            stale_frames_dropped: self.stale_frames_dropped,
            malformed_frames: self.malformed_frames,
        });
    }
}

/// Presentation-side handle to a running session
pub struct SessionHandle {
    command_tx: mpsc::Sender<SessionCommand>,
    state_rx: watch::Receiver<PublishedState>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub async fn change_pair(&self, pair: TradingPair) -> Result<(), SessionError> {
        self.command_tx
            .send(SessionCommand::ChangePair(pair))
            .await
            .map_err(|_| SessionError::Stopped)
    }

    /// Latest published state
    pub fn state(&self) -> PublishedState {
        self.state_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PublishedState> {
        self.state_rx.clone()
    }

    /// Stop the controller and wait for it to finish
    pub async fn shutdown(self) {
        let _ = self.command_tx.send(SessionCommand::Shutdown).await;
        let _ = self.task.await;
    }
}
