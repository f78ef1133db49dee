/// Depth Feed - live order book depth ingestion and analytics
///
/// Streams a venue's top-of-book depth for one trading pair at a time and
/// keeps the state a display needs:
/// - Normalised book snapshot with cumulative depth per level
/// - Rolling spread and visible-depth imbalance histories
/// - Connection lifecycle with fixed-delay reconnection
///
/// A [`SessionController`] owns the connection and all derived state; frames
/// from a retired connection generation are never applied.

pub mod aggregation;
pub mod error;
pub mod normalize;
pub mod session;
pub mod types;
pub mod websocket;

#[cfg(test)]
pub(crate) mod test_utils;

// Re-export commonly used types for convenience
pub use aggregation::{MetricsAggregator, MetricsUpdate, RingBuffer};
pub use error::{FeedError, ParseError, SessionError};
pub use normalize::{DepthNormalizer, NormalizedFrame};
pub use session::{
    PublishedState, SessionCommand, SessionConfig, SessionController, SessionHandle, SessionPhase,
};
pub use types::{
    ConnectionState, DepthSnapshot, Generation, ImbalanceSample, PriceLevel, SpreadSample,
    TradingPair,
};
pub use websocket::{FeedConfig, FeedConnection, FeedEvent, FeedTransport, WsTransport};
