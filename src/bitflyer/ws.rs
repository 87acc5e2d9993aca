use anyhow::Result;
use chrono::FixedOffset;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::types::{JsonRpc2, TickerMessage};
use crate::backoff::ExponentialBackoff;
use crate::error::FeedError;
use crate::event::{AppEvent, FeedStatus};
use crate::model::tick::Tick;
use crate::queue::{PushOutcome, QueueClosed, TickSender};

const CHANNEL_MESSAGE: &str = "channelMessage";

/// Client for the Lightstream JSON-RPC realtime API.
#[derive(Debug, Clone)]
pub struct LightstreamClient {
    url: String,
    channel_prefix: String,
    zone: FixedOffset,
}

impl LightstreamClient {
    pub fn new(ws_url: &str, channel_prefix: &str, zone: FixedOffset) -> Self {
        Self {
            url: ws_url.to_string(),
            channel_prefix: channel_prefix.to_string(),
            zone,
        }
    }

    pub fn channel_for(&self, product_code: &str) -> String {
        format!("{}_{}", self.channel_prefix, product_code)
    }

    /// Open a connection and subscribe to the ticker channel of
    /// `product_code`. The returned subscription is single-use: once
    /// [`TickSubscription::next_tick`] errors, subscribe again.
    pub async fn subscribe(&self, product_code: &str) -> Result<TickSubscription, FeedError> {
        tracing::info!(url = %self.url, product_code, "Connecting to feed");
        let (mut stream, _resp) = tokio_tungstenite::connect_async(self.url.as_str()).await?;

        let channel = self.channel_for(product_code);
        let request = serde_json::to_string(&JsonRpc2::subscribe(&channel, 1))?;
        stream.send(Message::Text(request)).await?;
        tracing::info!(channel = %channel, "Subscribed");

        Ok(TickSubscription {
            stream,
            channel,
            zone: self.zone,
        })
    }
}

pub struct TickSubscription {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    channel: String,
    zone: FixedOffset,
}

impl TickSubscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Wait for the next decodable tick. Frames that fail to decode are
    /// skipped; any error returned here ends the subscription.
    pub async fn next_tick(&mut self) -> Result<Tick, FeedError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    match decode_frame(&text, &self.channel, self.zone) {
                        Ok(Some(tick)) => return Ok(tick),
                        Ok(None) => {}
                        Err(e) => {
                            tracing::debug!(error = %e, "Failed to parse feed frame");
                        }
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!(?frame, "Feed closed by server");
                    return Err(FeedError::Closed);
                }
                // tungstenite answers pings on the next read
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => return Err(FeedError::Closed),
            }
        }
    }
}

/// Decode one text frame.
///
/// Returns `Ok(None)` for well-formed frames that carry no tick for
/// `channel` (subscription replies, other channels). The envelope is read
/// as a loosely typed value first; only `params.message` is decoded into a
/// ticker.
pub fn decode_frame(
    text: &str,
    channel: &str,
    zone: FixedOffset,
) -> Result<Option<Tick>, FeedError> {
    let envelope: JsonRpc2 = serde_json::from_str(text)?;
    if envelope.method != CHANNEL_MESSAGE {
        return Ok(None);
    }
    let params = envelope
        .params
        .as_object()
        .ok_or_else(|| FeedError::Malformed("params is not an object".to_string()))?;
    if let Some(frame_channel) = params.get("channel").and_then(|c| c.as_str()) {
        if frame_channel != channel {
            return Ok(None);
        }
    }
    let message = params
        .get("message")
        .cloned()
        .ok_or_else(|| FeedError::Malformed("params.message missing".to_string()))?;
    let ticker: TickerMessage = serde_json::from_value(message)?;
    ticker.into_tick(zone).map(Some)
}

/// Keep a ticker subscription alive and forward its ticks into `tick_tx`.
///
/// Each subscription failure is followed by a resubscribe after an
/// exponential backoff delay. Returns when `shutdown` flips or the tick
/// consumer goes away.
pub async fn run_feed(
    client: LightstreamClient,
    product_code: String,
    tick_tx: TickSender,
    event_tx: mpsc::Sender<AppEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60));

    while !*shutdown.borrow() {
        let subscribed = tokio::select! {
            res = client.subscribe(&product_code) => res,
            _ = shutdown.changed() => break,
        };

        let failure = match subscribed {
            Ok(mut sub) => {
                backoff.reset();
                publish(
                    &event_tx,
                    FeedStatus::Connected {
                        channel: sub.channel().to_string(),
                    },
                );
                match pump(&mut sub, &tick_tx, &event_tx, &mut shutdown).await {
                    PumpExit::Shutdown => break,
                    PumpExit::ConsumerGone => {
                        tracing::info!("Tick consumer gone, feed task exiting");
                        break;
                    }
                    PumpExit::Failed(e) => e,
                }
            }
            Err(e) => e,
        };

        let delay = backoff.next_delay();
        let attempt = backoff.attempts();
        tracing::warn!(
            error = %failure,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Feed subscription ended, resubscribing"
        );
        publish(&event_tx, FeedStatus::Disconnected);
        publish(
            &event_tx,
            FeedStatus::Reconnecting {
                attempt,
                delay_ms: delay.as_millis() as u64,
            },
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {
                tracing::info!("Shutdown during reconnect");
                break;
            }
        }
    }

    publish(&event_tx, FeedStatus::Disconnected);
    Ok(())
}

/// Status updates must not stall the socket read loop; a full event channel
/// loses them.
fn publish(event_tx: &mpsc::Sender<AppEvent>, status: FeedStatus) {
    if let Err(e) = event_tx.try_send(AppEvent::FeedStatus(status)) {
        tracing::debug!(error = %e, "Event channel unavailable, feed status dropped");
    }
}

enum PumpExit {
    Shutdown,
    ConsumerGone,
    Failed(FeedError),
}

async fn pump(
    sub: &mut TickSubscription,
    tick_tx: &TickSender,
    event_tx: &mpsc::Sender<AppEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> PumpExit {
    loop {
        let tick = tokio::select! {
            res = sub.next_tick() => match res {
                Ok(tick) => tick,
                Err(e) => return PumpExit::Failed(e),
            },
            _ = shutdown.changed() => return PumpExit::Shutdown,
        };

        tracing::trace!(
            product_code = %tick.product_code,
            mid = tick.mid_price(),
            spread = tick.spread(),
            volume = tick.volume,
            "Tick"
        );
        match tick_tx.push(tick).await {
            Ok(PushOutcome::Queued) => {}
            Ok(PushOutcome::Dropped) => {
                tracing::warn!("Tick queue full, dropping tick");
                let _ = event_tx.try_send(AppEvent::TickDropped {
                    total_dropped: tick_tx.dropped(),
                });
            }
            Err(QueueClosed) => return PumpExit::ConsumerGone,
        }
    }
}
