//! Candle persistence.
//!
//! One ordered series exists per (product, duration). Writes are whole-record
//! upserts, so a reader never observes a partially updated candle.

pub mod memory;
pub mod sqlite;

use chrono::{DateTime, FixedOffset};

use crate::error::StoreError;
use crate::model::candle::Candle;
use crate::model::duration::CandleDuration;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

pub trait CandleStore: Send + Sync {
    /// Point lookup by exact bucket start.
    fn get(
        &self,
        product_code: &str,
        duration: &CandleDuration,
        time: DateTime<FixedOffset>,
    ) -> Result<Option<Candle>, StoreError>;

    /// Insert the candle or overwrite the one with the same bucket start.
    /// Safe to retry.
    fn upsert(&self, candle: &Candle) -> Result<(), StoreError>;

    /// The newest `limit` candles of the series, oldest first.
    fn get_range(
        &self,
        product_code: &str,
        duration: &CandleDuration,
        limit: usize,
    ) -> Result<Vec<Candle>, StoreError>;
}

/// Series name for a (product, duration) pair, e.g. `BTC_JPY_1m`.
///
/// Product codes are uppercased: SQLite table names are case-insensitive,
/// so `btc_jpy` and `BTC_JPY` must name the same series in every backend.
pub fn series_name(product_code: &str, duration: &CandleDuration) -> Result<String, StoreError> {
    let name = format!("{}_{}", product_code.to_ascii_uppercase(), duration.label());
    let valid = !product_code.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(StoreError::InvalidSeriesName(name));
    }
    Ok(name)
}
