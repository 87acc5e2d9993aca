//! Tick queue between the feed task and the ingestion task.
//!
//! Capacity is always bounded. What happens when the consumer falls behind is
//! an explicit [`OverflowPolicy`]:
//!
//! - `Block`: the producer awaits free capacity (no tick is lost, the socket
//!   read loop stalls instead).
//! - `DropNewest`: the incoming tick is discarded.
//! - `DropOldest`: the queue behaves as a ring; the consumer skips the ticks
//!   that were overwritten.

use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

use crate::model::tick::Tick;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    #[default]
    Block,
    DropNewest,
    DropOldest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    Dropped,
}

/// Returned by [`TickSender::push`] once the consumer side is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueClosed;

#[derive(Debug, Clone)]
enum SenderInner {
    Mpsc {
        tx: mpsc::Sender<Tick>,
        block: bool,
    },
    Ring(broadcast::Sender<Tick>),
}

#[derive(Debug)]
enum ReceiverInner {
    Mpsc(mpsc::Receiver<Tick>),
    Ring(broadcast::Receiver<Tick>),
}

#[derive(Debug, Clone)]
pub struct TickSender {
    inner: SenderInner,
    dropped: Arc<AtomicU64>,
}

#[derive(Debug)]
pub struct TickReceiver {
    inner: ReceiverInner,
    dropped: Arc<AtomicU64>,
}

/// Create a bounded tick queue. `capacity` must be > 0; with `DropOldest`
/// the effective capacity is rounded up to a power of two.
pub fn tick_queue(capacity: usize, policy: OverflowPolicy) -> (TickSender, TickReceiver) {
    let dropped = Arc::new(AtomicU64::new(0));
    let (tx, rx) = match policy {
        OverflowPolicy::Block | OverflowPolicy::DropNewest => {
            let (tx, rx) = mpsc::channel(capacity);
            (
                SenderInner::Mpsc {
                    tx,
                    block: policy == OverflowPolicy::Block,
                },
                ReceiverInner::Mpsc(rx),
            )
        }
        OverflowPolicy::DropOldest => {
            let (tx, rx) = broadcast::channel(capacity);
            (SenderInner::Ring(tx), ReceiverInner::Ring(rx))
        }
    };
    (
        TickSender {
            inner: tx,
            dropped: dropped.clone(),
        },
        TickReceiver { inner: rx, dropped },
    )
}

impl TickSender {
    pub async fn push(&self, tick: Tick) -> Result<PushOutcome, QueueClosed> {
        match &self.inner {
            SenderInner::Mpsc { tx, block: true } => {
                tx.send(tick).await.map_err(|_| QueueClosed)?;
                Ok(PushOutcome::Queued)
            }
            SenderInner::Mpsc { tx, block: false } => match tx.try_send(tick) {
                Ok(()) => Ok(PushOutcome::Queued),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    Ok(PushOutcome::Dropped)
                }
                Err(mpsc::error::TrySendError::Closed(_)) => Err(QueueClosed),
            },
            SenderInner::Ring(tx) => {
                tx.send(tick).map_err(|_| QueueClosed)?;
                Ok(PushOutcome::Queued)
            }
        }
    }

    /// Ticks lost to overflow so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl TickReceiver {
    /// Next tick, or `None` once every sender is gone and the queue is drained.
    pub async fn recv(&mut self) -> Option<Tick> {
        match &mut self.inner {
            ReceiverInner::Mpsc(rx) => rx.recv().await,
            ReceiverInner::Ring(rx) => loop {
                match rx.recv().await {
                    Ok(tick) => return Some(tick),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        self.dropped.fetch_add(skipped, Ordering::Relaxed);
                        tracing::warn!(skipped, "Tick consumer lagged, oldest ticks dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use tokio_test::{assert_pending, assert_ready, task};

    fn tick(volume: f64) -> Tick {
        Tick {
            product_code: "BTC_JPY".to_string(),
            timestamp: DateTime::parse_from_rfc3339("2024-01-01T10:00:00+09:00").unwrap(),
            best_bid: 100.0,
            best_ask: 102.0,
            best_bid_size: 0.0,
            best_ask_size: 0.0,
            volume,
        }
    }

    #[tokio::test]
    async fn block_policy_stalls_producer_until_consumed() {
        let (tx, mut rx) = tick_queue(1, OverflowPolicy::Block);
        assert_eq!(tx.push(tick(1.0)).await, Ok(PushOutcome::Queued));

        let mut pending = task::spawn(tx.push(tick(2.0)));
        assert_pending!(pending.poll());

        assert_eq!(rx.recv().await.map(|t| t.volume), Some(1.0));
        assert!(pending.is_woken());
        assert_eq!(assert_ready!(pending.poll()), Ok(PushOutcome::Queued));
        assert_eq!(rx.recv().await.map(|t| t.volume), Some(2.0));
        assert_eq!(rx.dropped(), 0);
    }

    #[tokio::test]
    async fn drop_newest_discards_incoming_tick() {
        let (tx, mut rx) = tick_queue(2, OverflowPolicy::DropNewest);
        tx.push(tick(1.0)).await.unwrap();
        tx.push(tick(2.0)).await.unwrap();
        assert_eq!(tx.push(tick(3.0)).await, Ok(PushOutcome::Dropped));
        assert_eq!(tx.dropped(), 1);
        drop(tx);

        let mut seen = Vec::new();
        while let Some(t) = rx.recv().await {
            seen.push(t.volume);
        }
        assert_eq!(seen, vec![1.0, 2.0]);
    }

    #[tokio::test]
    async fn drop_oldest_keeps_most_recent_window() {
        let (tx, mut rx) = tick_queue(2, OverflowPolicy::DropOldest);
        for v in 1..=5 {
            assert_eq!(tx.push(tick(f64::from(v))).await, Ok(PushOutcome::Queued));
        }
        drop(tx);

        let mut seen = Vec::new();
        while let Some(t) = rx.recv().await {
            seen.push(t.volume);
        }
        assert_eq!(seen, vec![4.0, 5.0]);
        assert_eq!(rx.dropped(), 3);
    }

    #[tokio::test]
    async fn receiver_waits_for_next_tick() {
        let (tx, mut rx) = tick_queue(4, OverflowPolicy::Block);
        {
            let mut next = task::spawn(rx.recv());
            assert_pending!(next.poll());
            tx.push(tick(7.0)).await.unwrap();
            assert!(next.is_woken());
            let got = assert_ready!(next.poll());
            assert_eq!(got.map(|t| t.volume), Some(7.0));
        }
        drop(tx);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn push_fails_once_receiver_is_gone() {
        let (tx, rx) = tick_queue(4, OverflowPolicy::DropNewest);
        drop(rx);
        assert_eq!(tx.push(tick(1.0)).await, Err(QueueClosed));
    }
}
