/// Raw depth frame validation and normalisation.
///
/// Frames arrive as JSON text from the partial depth stream:
///
/// ```json
/// {
///     "lastUpdateId": 160,
///     "bids": [["0.0024", "10"]],
///     "asks": [["0.0026", "100"]]
/// }
/// ```
///
/// Every frame is validated at the boundary into a `NormalizedFrame`. Only
/// `NormalizedFrame::Valid` flows downstream; a malformed frame never touches
/// the current snapshot.

use crate::{
    error::ParseError,
    types::{DEFAULT_DEPTH, DepthSnapshot, PriceLevel},
};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Deserialize;
use std::str::FromStr;

/// Fractional digits kept for prices.
pub const PRICE_SCALE: u32 = 2;

/// Fractional digits kept for quantities and cumulative totals.
pub const QUANTITY_SCALE: u32 = 4;

/// Side of the book a level belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BookSide {
    Bid,
    Ask,
}

impl std::fmt::Display for BookSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BookSide::Bid => f.write_str("bid"),
            BookSide::Ask => f.write_str("ask"),
        }
    }
}

/// Outcome of validating one raw frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizedFrame {
    Valid(DepthSnapshot),
    Malformed(ParseError),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDepthFrame {
    #[serde(default)]
    last_update_id: Option<u64>,
    bids: Vec<RawLevel>,
    asks: Vec<RawLevel>,
}

/// `["16493.50", "0.006"]`
#[derive(Debug, Deserialize)]
struct RawLevel(String, String);

/// Converts raw frames into cumulative-total annotated snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthNormalizer {
    depth: usize,
}

impl Default for DepthNormalizer {
    fn default() -> Self {
        Self::new(DEFAULT_DEPTH)
    }
}

impl DepthNormalizer {
    /// Create a normaliser keeping at most `depth` levels per side
    pub fn new(depth: usize) -> Self {
        Self { depth }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Validate and normalise a raw frame.
    ///
    /// Levels are assumed to be sorted by the venue (bids descending, asks
    /// ascending) and are kept in arrival order.
    pub fn normalize(&self, raw: &str) -> NormalizedFrame {
        match self.try_normalize(raw) {
            Ok(snapshot) => NormalizedFrame::Valid(snapshot),
            Err(error) => NormalizedFrame::Malformed(error),
        }
    }

    fn try_normalize(&self, raw: &str) -> Result<DepthSnapshot, ParseError> {
        let frame = serde_json::from_str::<RawDepthFrame>(raw)?;

        Ok(DepthSnapshot {
            last_update_id: frame.last_update_id,
            bids: self.normalize_side(BookSide::Bid, &frame.bids)?,
            asks: self.normalize_side(BookSide::Ask, &frame.asks)?,
        })
    }

    fn normalize_side(
        &self,
        side: BookSide,
        levels: &[RawLevel],
    ) -> Result<Vec<PriceLevel>, ParseError> {
        let mut cumulative_total = Decimal::ZERO;

        levels
            .iter()
            .take(self.depth)
            .enumerate()
            .map(|(index, RawLevel(price, quantity))| -> Result<PriceLevel, ParseError> {
                let price = parse_decimal(price)
                    .map(|price| with_scale(price, PRICE_SCALE))
                    .ok_or_else(|| ParseError::InvalidNumber {
                        side,
                        index,
                        field: "price",
                        value: price.clone(),
                    })?;

                let quantity = parse_decimal(quantity)
                    .map(|quantity| with_scale(quantity, QUANTITY_SCALE))
                    .ok_or_else(|| ParseError::InvalidNumber {
                        side,
                        index,
                        field: "quantity",
                        value: quantity.clone(),
                    })?;

                cumulative_total = cumulative_total
                    .checked_add(quantity)
                    .ok_or(ParseError::Overflow { side, index })?;

                Ok(PriceLevel {
                    price,
                    quantity,
                    cumulative_total,
                })
            })
            .collect()
    }
}

fn parse_decimal(text: &str) -> Option<Decimal> {
    let text = text.trim();
    Decimal::from_str(text)
        .or_else(|_| Decimal::from_scientific(text))
        .ok()
}

/// Round half away from zero, then pad so the value always carries `scale` digits
fn with_scale(value: Decimal, scale: u32) -> Decimal {
    let mut value = value.round_dp_with_strategy(scale, RoundingStrategy::MidpointAwayFromZero);
    value.rescale(scale);
    value
}
