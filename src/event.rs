use crate::model::candle::Candle;

#[derive(Debug, Clone, PartialEq)]
pub enum FeedStatus {
    Connected { channel: String },
    Disconnected,
    Reconnecting { attempt: u32, delay_ms: u64 },
}

/// Notifications published by the feed and ingestion tasks.
#[derive(Debug, Clone)]
pub enum AppEvent {
    FeedStatus(FeedStatus),
    /// First tick of a new bucket was persisted. For that (product, duration)
    /// series the previous bucket is now closed.
    CandleCreated {
        candle: Candle,
        is_trade_duration: bool,
    },
    TickDropped {
        total_dropped: u64,
    },
    ReadFailed {
        product_code: String,
        duration: String,
        error: String,
    },
    WriteFailed {
        product_code: String,
        duration: String,
        attempts: u32,
        error: String,
    },
}
