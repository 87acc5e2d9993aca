//! Candle aggregation: folds ticks into per-duration OHLCV buckets.
//!
//! A single ingestion task drains the tick queue and, for each tick, walks
//! the configured durations one after another. Each duration does a
//! read-then-write on its own (product, duration) series; because only this
//! task writes, no bucket sees concurrent read-modify-write.

use chrono::FixedOffset;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::backoff::ExponentialBackoff;
use crate::error::{AppError, IngestError};
use crate::event::AppEvent;
use crate::model::bucket::bucket_start;
use crate::model::candle::Candle;
use crate::model::duration::{CandleDuration, DurationSet};
use crate::model::tick::Tick;
use crate::queue::TickReceiver;
use crate::store::CandleStore;

/// Result of folding one tick into one duration's series.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub candle: Candle,
    /// True when this tick opened the bucket.
    pub created: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRetryPolicy {
    /// Total upsert attempts per candle, including the first.
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for WriteRetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        }
    }
}

/// Fold `tick` into the bucket it maps to.
///
/// `existing` must be the stored candle for that bucket, if any.
pub fn fold_tick(
    existing: Option<Candle>,
    tick: &Tick,
    duration: &CandleDuration,
    zone: FixedOffset,
) -> Applied {
    match existing {
        Some(mut candle) => {
            candle.apply(tick.mid_price(), tick.volume);
            Applied {
                candle,
                created: false,
            }
        }
        None => {
            let start = bucket_start(&tick.timestamp, duration, zone);
            Applied {
                candle: Candle::open_with(tick, duration, start),
                created: true,
            }
        }
    }
}

pub struct CandleAggregator {
    store: Arc<dyn CandleStore>,
    durations: DurationSet,
    zone: FixedOffset,
    retry: WriteRetryPolicy,
}

impl CandleAggregator {
    pub fn new(
        store: Arc<dyn CandleStore>,
        durations: DurationSet,
        zone: FixedOffset,
        retry: WriteRetryPolicy,
    ) -> Self {
        Self {
            store,
            durations,
            zone,
            retry,
        }
    }

    /// Read, fold and persist one tick for one duration.
    ///
    /// A failed read aborts the update instead of guessing the bucket is
    /// absent, which could overwrite real data with a fresh candle.
    pub async fn apply(
        &self,
        tick: &Tick,
        duration: &CandleDuration,
    ) -> Result<Applied, IngestError> {
        let start = bucket_start(&tick.timestamp, duration, self.zone);
        let existing = self
            .store
            .get(&tick.product_code, duration, start)
            .map_err(IngestError::Read)?;
        let applied = fold_tick(existing, tick, duration, self.zone);
        self.upsert_with_retry(&applied.candle).await?;
        Ok(applied)
    }

    /// Apply `tick` to every configured duration, in configuration order.
    pub async fn ingest(
        &self,
        tick: &Tick,
    ) -> Vec<(CandleDuration, Result<Applied, IngestError>)> {
        let mut results = Vec::with_capacity(self.durations.len());
        for duration in &self.durations {
            let res = self.apply(tick, duration).await;
            results.push((duration.clone(), res));
        }
        results
    }

    async fn upsert_with_retry(&self, candle: &Candle) -> Result<(), IngestError> {
        let max_attempts = self.retry.attempts.max(1);
        let mut backoff = ExponentialBackoff::new(self.retry.initial_delay, self.retry.max_delay);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.store.upsert(candle) {
                Ok(()) => return Ok(()),
                Err(source) if attempt >= max_attempts => {
                    return Err(IngestError::Write {
                        attempts: attempt,
                        source,
                    });
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        product_code = %candle.product_code,
                        duration = %candle.duration,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Candle write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub ticks: u64,
    pub created: u64,
    pub updated: u64,
    pub read_failures: u64,
    pub write_failures: u64,
}

pub struct IngestLoop {
    aggregator: CandleAggregator,
    trade_duration: Option<CandleDuration>,
    max_consecutive_failures: u32,
    event_tx: mpsc::Sender<AppEvent>,
}

impl IngestLoop {
    pub fn new(
        aggregator: CandleAggregator,
        trade_duration: Option<CandleDuration>,
        max_consecutive_failures: u32,
        event_tx: mpsc::Sender<AppEvent>,
    ) -> Self {
        Self {
            aggregator,
            trade_duration,
            max_consecutive_failures,
            event_tx,
        }
    }

    /// Drain `ticks` until the queue closes or `shutdown` flips.
    ///
    /// Shutdown is only observed while waiting for the next tick, so a tick
    /// already being written finishes first. Returns
    /// [`AppError::StorageUnavailable`] once writes have failed
    /// `max_consecutive_failures` times in a row.
    pub async fn run(
        self,
        mut ticks: TickReceiver,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<IngestStats, AppError> {
        let mut stats = IngestStats::default();
        let mut consecutive_failures: u32 = 0;

        loop {
            let tick = tokio::select! {
                next = ticks.recv() => match next {
                    Some(tick) => tick,
                    None => {
                        tracing::info!("Tick queue closed, ingestion exiting");
                        break;
                    }
                },
                _ = shutdown.changed() => {
                    tracing::info!("Ingestion shutting down");
                    break;
                }
            };
            stats.ticks += 1;

            for (duration, res) in self.aggregator.ingest(&tick).await {
                match res {
                    Ok(applied) => {
                        consecutive_failures = 0;
                        if applied.created {
                            stats.created += 1;
                            self.on_created(applied.candle);
                        } else {
                            stats.updated += 1;
                        }
                    }
                    Err(IngestError::Read(e)) => {
                        stats.read_failures += 1;
                        tracing::warn!(
                            product_code = %tick.product_code,
                            duration = %duration,
                            error = %e,
                            "Candle lookup failed, tick skipped for this duration"
                        );
                        self.publish(AppEvent::ReadFailed {
                            product_code: tick.product_code.clone(),
                            duration: duration.to_string(),
                            error: e.to_string(),
                        });
                    }
                    Err(IngestError::Write { attempts, source }) => {
                        stats.write_failures += 1;
                        consecutive_failures += 1;
                        tracing::error!(
                            product_code = %tick.product_code,
                            duration = %duration,
                            attempts,
                            consecutive_failures,
                            error = %source,
                            "Candle write failed"
                        );
                        self.publish(AppEvent::WriteFailed {
                            product_code: tick.product_code.clone(),
                            duration: duration.to_string(),
                            attempts,
                            error: source.to_string(),
                        });
                        if consecutive_failures >= self.max_consecutive_failures {
                            return Err(AppError::StorageUnavailable {
                                failures: consecutive_failures,
                                source,
                            });
                        }
                    }
                }
            }
        }

        tracing::info!(
            ticks = stats.ticks,
            created = stats.created,
            updated = stats.updated,
            read_failures = stats.read_failures,
            write_failures = stats.write_failures,
            dropped = ticks.dropped(),
            "Ingestion stopped"
        );
        Ok(stats)
    }

    fn on_created(&self, candle: Candle) {
        let is_trade_duration = self.trade_duration.as_ref() == Some(&candle.duration);
        tracing::debug!(
            product_code = %candle.product_code,
            duration = %candle.duration,
            time = %candle.time.to_rfc3339(),
            "Bucket opened"
        );
        self.publish(AppEvent::CandleCreated {
            candle,
            is_trade_duration,
        });
    }

    /// Notifications never stall ingestion; a full event channel loses them.
    fn publish(&self, event: AppEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            tracing::debug!(error = %e, "Event channel unavailable, notification dropped");
        }
    }
}
