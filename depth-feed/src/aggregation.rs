/// Rolling analytics over depth snapshots
///
/// Spread and visible-depth imbalance are derived from every valid snapshot
/// and kept in fixed-capacity FIFO buffers for charting.

use crate::types::{DepthSnapshot, ImbalanceSample, SpreadSample};
use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy, prelude::ToPrimitive};
use serde::Serialize;
use std::collections::VecDeque;
use tracing::debug;

/// Spread samples kept for the spread chart.
pub const SPREAD_HISTORY_CAPACITY: usize = 30;

/// Imbalance samples kept for the imbalance chart.
pub const IMBALANCE_HISTORY_CAPACITY: usize = 100;

/// Fractional digits kept for the imbalance ratio.
const IMBALANCE_SCALE: u32 = 4;

/// Ring buffer storing the N most recent samples
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RingBuffer<T> {
    samples: VecDeque<T>,
    max_size: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(max_size: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_size),
            max_size,
        }
    }

    /// Append a sample, evicting the oldest when at capacity
    pub fn push(&mut self, sample: T) {
        if self.max_size == 0 {
            return;
        }
        if self.samples.len() >= self.max_size {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    /// Oldest first
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.samples.iter()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

impl<T: Clone> RingBuffer<T> {
    /// Copy out the buffer, oldest first
    pub fn to_vec(&self) -> Vec<T> {
        self.samples.iter().cloned().collect()
    }
}

/// Samples appended while recording one snapshot
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsUpdate {
    pub spread: Option<SpreadSample>,
    pub imbalance: Option<ImbalanceSample>,
}

/// Spread and imbalance history for the active pair
#[derive(Debug, Clone)]
pub struct MetricsAggregator {
    spreads: RingBuffer<SpreadSample>,
    imbalances: RingBuffer<ImbalanceSample>,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new(SPREAD_HISTORY_CAPACITY, IMBALANCE_HISTORY_CAPACITY)
    }
}

impl MetricsAggregator {
    pub fn new(spread_capacity: usize, imbalance_capacity: usize) -> Self {
        Self {
            spreads: RingBuffer::new(spread_capacity),
            imbalances: RingBuffer::new(imbalance_capacity),
        }
    }

    /// Derive metrics from a snapshot captured at `time`
    ///
    /// Nothing is recorded unless both sides of the book are populated.
    pub fn record(&mut self, snapshot: &DepthSnapshot, time: DateTime<Utc>) -> MetricsUpdate {
        if snapshot.bids.is_empty() || snapshot.asks.is_empty() {
            debug!(
                bids = snapshot.bids.len(),
                asks = snapshot.asks.len(),
                "one-sided snapshot, skipping metrics"
            );
            return MetricsUpdate::default();
        }

        let spread = calculate_spread(snapshot, time);
        if let Some(sample) = &spread {
            self.spreads.push(sample.clone());
        }

        let imbalance = calculate_imbalance(snapshot, time);
        if let Some(sample) = &imbalance {
            self.imbalances.push(sample.clone());
        }

        MetricsUpdate { spread, imbalance }
    }

    pub fn spreads(&self) -> &RingBuffer<SpreadSample> {
        &self.spreads
    }

    pub fn imbalances(&self) -> &RingBuffer<ImbalanceSample> {
        &self.imbalances
    }

    /// Drop all history (pair switch)
    pub fn clear(&mut self) {
        self.spreads.clear();
        self.imbalances.clear();
    }
}

/// Best ask minus best bid, and that spread as a percentage of the best ask
///
/// Returns None for a zero ask price or when the result is not representable.
pub fn calculate_spread(snapshot: &DepthSnapshot, time: DateTime<Utc>) -> Option<SpreadSample> {
    let bid = snapshot.best_bid()?;
    let ask = snapshot.best_ask()?;

    if ask.price.is_zero() {
        debug!("best ask priced at zero, skipping spread sample");
        return None;
    }

    let spread = ask.price.checked_sub(bid.price).and_then(|spread_absolute| {
        let percent = spread_absolute
            .checked_div(ask.price)?
            .checked_mul(Decimal::ONE_HUNDRED)?;
        Some((spread_absolute, percent.to_f64()?))
    });

    let Some((spread_absolute, spread_percent)) = spread else {
        debug!(bid = %bid.price, ask = %ask.price, "spread overflows, skipping sample");
        return None;
    };

    Some(SpreadSample {
        time,
        spread_absolute,
        spread_percent,
    })
}

/// Visible-depth imbalance: (bid volume - ask volume) / (bid volume + ask volume)
///
/// Returns None when there is no visible volume on either side, or when the
/// volumes overflow.
pub fn calculate_imbalance(
    snapshot: &DepthSnapshot,
    time: DateTime<Utc>,
) -> Option<ImbalanceSample> {
    let (Some(bid_total), Some(ask_total)) = (snapshot.bid_volume(), snapshot.ask_volume())
    else {
        debug!("visible volume overflows, skipping imbalance sample");
        return None;
    };

    let Some(total) = bid_total.checked_add(ask_total) else {
        debug!("visible volume overflows, skipping imbalance sample");
        return None;
    };

    if total.is_zero() {
        debug!("no visible volume, skipping imbalance sample");
        return None;
    }

    let ratio = bid_total.checked_sub(ask_total)?.checked_div(total)?;
    let imbalance_ratio = ratio
        .round_dp_with_strategy(IMBALANCE_SCALE, RoundingStrategy::MidpointAwayFromZero)
        .to_f64()?
        .clamp(-1.0, 1.0);

    Some(ImbalanceSample {
        time,
        imbalance_ratio,
    })
}
