use chrono::{DateTime, FixedOffset};

/// A single ticker observation, timestamp already normalized to the
/// reference zone.
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    pub product_code: String,
    pub timestamp: DateTime<FixedOffset>,
    pub best_bid: f64,
    pub best_ask: f64,
    pub best_bid_size: f64,
    pub best_ask_size: f64,
    pub volume: f64,
}

impl Tick {
    /// Price proxy used for candles; the feed does not guarantee a
    /// populated last-traded price.
    pub fn mid_price(&self) -> f64 {
        (self.best_bid + self.best_ask) / 2.0
    }

    /// Spread between best ask and best bid.
    pub fn spread(&self) -> f64 {
        self.best_ask - self.best_bid
    }
}
