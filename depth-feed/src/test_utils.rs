/// In-memory transport for driving feed connections without a network.

use crate::{
    error::FeedError,
    websocket::{FeedEvent, FeedTransport, FrameStream},
};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::{sync::mpsc, time::Instant};
use tokio_stream::wrappers::UnboundedReceiverStream;
use url::Url;

/// Test-side handle feeding frames into an accepted connection.
pub type FrameSender = mpsc::UnboundedSender<Result<String, FeedError>>;

#[derive(Debug, Clone)]
pub struct ConnectAttempt {
    pub at: Instant,
    pub endpoint: String,
}

#[derive(Debug)]
enum Scripted {
    Refuse,
    Accept(mpsc::UnboundedReceiver<Result<String, FeedError>>),
}

/// Transport answering connection attempts from a script, in order.
///
/// Attempts past the end of the script are refused.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Scripted>>,
    attempts: Mutex<Vec<ConnectAttempt>>,
}

impl ScriptedTransport {
    /// Accept the next attempt; dropping the returned sender ends the stream
    pub fn accept(&self) -> FrameSender {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        self.script.lock().push_back(Scripted::Accept(frame_rx));
        frame_tx
    }

    /// Refuse the next attempt
    pub fn refuse(&self) {
        self.script.lock().push_back(Scripted::Refuse);
    }

    pub fn attempts(&self) -> Vec<ConnectAttempt> {
        self.attempts.lock().clone()
    }
}

#[async_trait]
impl FeedTransport for ScriptedTransport {
    async fn connect(&self, endpoint: &Url) -> Result<FrameStream, FeedError> {
        self.attempts.lock().push(ConnectAttempt {
            at: Instant::now(),
            endpoint: endpoint.to_string(),
        });

        let next = self.script.lock().pop_front().unwrap_or(Scripted::Refuse);
        match next {
            Scripted::Accept(frame_rx) => Ok(UnboundedReceiverStream::new(frame_rx).boxed()),
            Scripted::Refuse => Err(FeedError::Connect {
                endpoint: endpoint.to_string(),
                reason: "Connection refused".to_string(),
            }),
        }
    }
}

/// Collect every event already queued on the channel
pub fn drain(event_rx: &mut mpsc::Receiver<FeedEvent>) -> Vec<FeedEvent> {
    let mut events = Vec::new();
    while let Ok(event) = event_rx.try_recv() {
        events.push(event);
    }
    events
}
