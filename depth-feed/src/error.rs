use crate::normalize::BookSide;
use std::time::Duration;
use thiserror::Error;

/// Transport errors raised while a feed connection attempt is running.
///
/// None of these are fatal to a session: every variant ends the current
/// attempt and hands control back to the reconnect state machine.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum FeedError {
    #[error("invalid feed endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("failed to connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("SocketError: {0}")]
    Socket(String),

    #[error("feed closed by venue")]
    Closed,

    #[error("read timeout: no data received for {} seconds", .0.as_secs())]
    ReadTimeout(Duration),
}

impl FeedError {
    /// Determine if scheduling another connection attempt can fix this error.
    ///
    /// An invalid endpoint is a configuration fault, retrying it would only
    /// spin on the same failure.
    #[allow(clippy::match_like_matches_macro)]
    pub fn is_recoverable(&self) -> bool {
        match self {
            FeedError::InvalidEndpoint { .. } => false,
            _ => true,
        }
    }
}

/// Reasons a raw depth frame is rejected by the normaliser.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ParseError {
    #[error("malformed depth frame: {0}")]
    Frame(String),

    #[error("invalid {field} '{value}' at {side} level {index}")]
    InvalidNumber {
        side: BookSide,
        index: usize,
        field: &'static str,
        value: String,
    },

    #[error("cumulative {side} total overflows at level {index}")]
    Overflow { side: BookSide, index: usize },
}

/// Errors returned to presentation code holding a session handle.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Error)]
pub enum SessionError {
    #[error("session controller has stopped")]
    Stopped,
}

impl From<serde_json::Error> for ParseError {
    fn from(value: serde_json::Error) -> Self {
        Self::Frame(value.to_string())
    }
}
