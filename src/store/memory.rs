use chrono::{DateTime, FixedOffset};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use super::{series_name, CandleStore};
use crate::error::StoreError;
use crate::model::candle::Candle;
use crate::model::duration::CandleDuration;

type Series = BTreeMap<DateTime<FixedOffset>, Candle>;

/// In-process store, mainly for tests and dry runs. Series are keyed by
/// [`series_name`], the same identity the SQLite tables use.
#[derive(Debug, Default)]
pub struct MemoryStore {
    series: RwLock<HashMap<String, Series>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CandleStore for MemoryStore {
    fn get(
        &self,
        product_code: &str,
        duration: &CandleDuration,
        time: DateTime<FixedOffset>,
    ) -> Result<Option<Candle>, StoreError> {
        let key = series_name(product_code, duration)?;
        let series = self.series.read().map_err(|_| StoreError::Poisoned)?;
        Ok(series
            .get(&key)
            .and_then(|s| s.get(&time))
            .cloned())
    }

    fn upsert(&self, candle: &Candle) -> Result<(), StoreError> {
        let key = series_name(&candle.product_code, &candle.duration)?;
        let mut series = self.series.write().map_err(|_| StoreError::Poisoned)?;
        series
            .entry(key)
            .or_default()
            .insert(candle.time, candle.clone());
        Ok(())
    }

    fn get_range(
        &self,
        product_code: &str,
        duration: &CandleDuration,
        limit: usize,
    ) -> Result<Vec<Candle>, StoreError> {
        let key = series_name(product_code, duration)?;
        let series = self.series.read().map_err(|_| StoreError::Poisoned)?;
        let Some(s) = series.get(&key) else {
            return Ok(Vec::new());
        };
        let mut newest: Vec<Candle> = s.values().rev().take(limit).cloned().collect();
        newest.reverse();
        Ok(newest)
    }
}
