use chrono::{DateTime, FixedOffset};
use serde::Serialize;

use super::duration::CandleDuration;
use super::tick::Tick;

/// One OHLCV bucket of a (product, duration) series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candle {
    pub product_code: String,
    pub duration: CandleDuration,
    pub time: DateTime<FixedOffset>,
    pub open: f64,
    pub close: f64,
    pub high: f64,
    pub low: f64,
    pub volume: f64,
}

impl Candle {
    /// Open a new bucket from its first tick. `time` must already be the
    /// bucket start for `duration`.
    pub fn open_with(tick: &Tick, duration: &CandleDuration, time: DateTime<FixedOffset>) -> Self {
        let price = tick.mid_price();
        Self {
            product_code: tick.product_code.clone(),
            duration: duration.clone(),
            time,
            open: price,
            close: price,
            high: price,
            low: price,
            volume: tick.volume,
        }
    }

    /// Fold one more tick into the bucket.
    ///
    /// The high branch is checked first with `>=`, so a price equal to the
    /// current high never reaches the low branch. Close always takes the
    /// latest price; volume is additive.
    pub fn apply(&mut self, price: f64, volume: f64) {
        if price >= self.high {
            self.high = price;
        } else if price <= self.low {
            self.low = price;
        }
        self.close = price;
        self.volume += volume;
    }
}
