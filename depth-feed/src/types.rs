/// Core data types for the depth feed
///
/// Catalog entries, normalised book levels and snapshots, rolling metric
/// samples and the connection/generation identifiers shared by every stage.

use chrono::{DateTime, Utc};
use derive_more::{Display, From};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Number of price levels delivered per side by the partial depth stream.
pub const DEFAULT_DEPTH: usize = 20;

/// Trading pair supported by the session
///
/// `display_symbol` is what the user picks (e.g. "BTC/USDT"), `feed_symbol` is
/// what gets interpolated into the stream endpoint (e.g. "btcusdt").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct TradingPair {
    pub display_symbol: SmolStr,
    pub feed_symbol: SmolStr,
}

static CATALOG: [TradingPair; 4] = [
    TradingPair::new_static("BTC/USDT", "btcusdt"),
    TradingPair::new_static("ETH/USDT", "ethusdt"),
    TradingPair::new_static("SOL/USDT", "solusdt"),
    TradingPair::new_static("DOGE/USDT", "dogeusdt"),
];

impl TradingPair {
    const fn new_static(display_symbol: &'static str, feed_symbol: &'static str) -> Self {
        Self {
            display_symbol: SmolStr::new_static(display_symbol),
            feed_symbol: SmolStr::new_static(feed_symbol),
        }
    }

    /// Create a pair outside the static catalog
    pub fn new(display_symbol: impl Into<SmolStr>, feed_symbol: impl Into<SmolStr>) -> Self {
        Self {
            display_symbol: display_symbol.into(),
            feed_symbol: feed_symbol.into(),
        }
    }

    /// All pairs the session can switch between
    pub fn catalog() -> &'static [TradingPair] {
        &CATALOG
    }

    /// Pair selected at start-up (first catalog row)
    pub fn default_pair() -> &'static TradingPair {
        &CATALOG[0]
    }

    /// Look up a catalog entry by display symbol ("eth/usdt") or feed symbol ("ethusdt")
    pub fn find(symbol: &str) -> Option<&'static TradingPair> {
        let symbol = symbol.trim();
        CATALOG.iter().find(|pair| {
            pair.display_symbol.eq_ignore_ascii_case(symbol)
                || pair.feed_symbol.eq_ignore_ascii_case(symbol)
        })
    }
}

impl std::fmt::Display for TradingPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_symbol)
    }
}

/// Monotonically increasing tag for one connection instance
///
/// Frames are only applied when they carry the generation the session
/// currently considers active.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Display, From, Serialize,
)]
pub struct Generation(pub u64);

/// Lifecycle state of a feed connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Connecting,
    Open,
    #[default]
    Closed,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closed => "closed",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One normalised book level
///
/// `cumulative_total` is the running quantity from the best price out to and
/// including this level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub quantity: Decimal,
    pub cumulative_total: Decimal,
}

impl std::fmt::Display for PriceLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:.2} {:.4} {:.4}",
            self.price, self.quantity, self.cumulative_total
        )
    }
}

/// Top-N view of the book, replaced wholesale on every valid frame
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DepthSnapshot {
    /// Venue update id when the frame carried one
    pub last_update_id: Option<u64>,
    /// Best (highest) bid first
    pub bids: Vec<PriceLevel>,
    /// Best (lowest) ask first
    pub asks: Vec<PriceLevel>,
}

impl DepthSnapshot {
    pub fn best_bid(&self) -> Option<&PriceLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&PriceLevel> {
        self.asks.first()
    }

    /// Best ask minus best bid, when both sides are populated and it is representable
    pub fn spread(&self) -> Option<Decimal> {
        let (bid, ask) = (self.best_bid()?, self.best_ask()?);
        ask.price.checked_sub(bid.price)
    }

    pub fn mid_price(&self) -> Option<Decimal> {
        let (bid, ask) = (self.best_bid()?, self.best_ask()?);
        bid.price
            .checked_add(ask.price)?
            .checked_div(Decimal::TWO)
    }

    /// Largest cumulative total across both sides, used to scale depth bars
    pub fn max_total(&self) -> Decimal {
        let bid = self.bids.last().map(|level| level.cumulative_total);
        let ask = self.asks.last().map(|level| level.cumulative_total);
        bid.into_iter()
            .chain(ask)
            .max()
            .unwrap_or(Decimal::ZERO)
    }

    /// Sum of visible quantity on the bid side, None on overflow
    pub fn bid_volume(&self) -> Option<Decimal> {
        side_volume(&self.bids)
    }

    /// Sum of visible quantity on the ask side, None on overflow
    pub fn ask_volume(&self) -> Option<Decimal> {
        side_volume(&self.asks)
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}

fn side_volume(levels: &[PriceLevel]) -> Option<Decimal> {
    levels
        .iter()
        .try_fold(Decimal::ZERO, |total, level| total.checked_add(level.quantity))
}

/// Spread observation captured from one snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpreadSample {
    pub time: DateTime<Utc>,
    pub spread_absolute: Decimal,
    pub spread_percent: f64,
}

impl SpreadSample {
    /// Wall-clock label for chart axes ("HH:MM:SS")
    pub fn time_label(&self) -> String {
        self.time.format("%H:%M:%S").to_string()
    }
}

/// Visible-depth imbalance observation, ratio in [-1, 1]
///
/// Positive values mean more resting bid than ask quantity across the top
/// levels delivered by the feed, not across the whole book.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImbalanceSample {
    pub time: DateTime<Utc>,
    pub imbalance_ratio: f64,
}

impl ImbalanceSample {
    /// RFC 3339 timestamp for chart axes
    pub fn time_label(&self) -> String {
        self.time.to_rfc3339()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn level(price: Decimal, quantity: Decimal, cumulative_total: Decimal) -> PriceLevel {
        PriceLevel {
            price,
            quantity,
            cumulative_total,
        }
    }

    #[test]
    fn test_catalog_lookup() {
        assert_eq!(TradingPair::catalog().len(), 4);
        assert_eq!(TradingPair::default_pair().display_symbol, "BTC/USDT");

        let eth = TradingPair::find("eth/usdt").unwrap();
        assert_eq!(eth.feed_symbol, "ethusdt");

        let doge = TradingPair::find(" DOGEUSDT ").unwrap();
        assert_eq!(doge.display_symbol, "DOGE/USDT");

        assert!(TradingPair::find("XRP/USDT").is_none());
    }

    #[test]
    fn test_snapshot_helpers() {
        let snapshot = DepthSnapshot {
            last_update_id: Some(7),
            bids: vec![
                level(dec!(100.00), dec!(2.0000), dec!(2.0000)),
                level(dec!(99.50), dec!(1.0000), dec!(3.0000)),
            ],
            asks: vec![
                level(dec!(100.50), dec!(1.5000), dec!(1.5000)),
                level(dec!(101.00), dec!(0.5000), dec!(2.0000)),
            ],
        };

        assert_eq!(snapshot.spread(), Some(dec!(0.50)));
        assert_eq!(snapshot.mid_price(), Some(dec!(100.25)));
        assert_eq!(snapshot.max_total(), dec!(3.0000));
        assert_eq!(snapshot.bid_volume(), Some(dec!(3.0)));
        assert_eq!(snapshot.ask_volume(), Some(dec!(2.0)));
        assert!(!snapshot.is_empty());
        assert_eq!(snapshot.bids[1].to_string(), "99.50 1.0000 3.0000");
    }

    #[test]
    fn test_one_sided_snapshot_has_no_spread() {
        let snapshot = DepthSnapshot {
            last_update_id: None,
            bids: vec![level(dec!(100), dec!(1), dec!(1))],
            asks: vec![],
        };

        assert_eq!(snapshot.spread(), None);
        assert_eq!(snapshot.mid_price(), None);
        assert_eq!(snapshot.max_total(), dec!(1));
        assert!(DepthSnapshot::default().is_empty());
    }

    #[test]
    fn test_unrepresentable_helpers_return_none() {
        let snapshot = DepthSnapshot {
            last_update_id: None,
            bids: vec![
                level(Decimal::MIN, Decimal::MAX, Decimal::MAX),
                level(dec!(99), Decimal::MAX, Decimal::MAX),
            ],
            asks: vec![level(Decimal::MAX, dec!(1), dec!(1))],
        };

        assert_eq!(snapshot.spread(), None);
        assert_eq!(snapshot.bid_volume(), None);
        assert_eq!(snapshot.ask_volume(), Some(dec!(1)));
        assert_eq!(snapshot.mid_price(), Some(Decimal::ZERO));
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::default(), ConnectionState::Closed);
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
        assert_eq!(Generation(3).to_string(), "3");
    }
}
