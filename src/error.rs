use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("bitFlyer API error (status {status}): {msg}")]
    BitflyerApi { status: u16, msg: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("storage unavailable after {failures} consecutive write failures: {source}")]
    StorageUnavailable {
        failures: u32,
        #[source]
        source: StoreError,
    },
}

/// Failures of the candle store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("invalid series name '{0}': only ASCII letters, digits and '_' are allowed")]
    InvalidSeriesName(String),

    #[error("corrupt row in {table}: {reason}")]
    CorruptRow { table: String, reason: String },

    #[error("store lock poisoned")]
    Poisoned,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of a single feed subscription.
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("feed stream ended")]
    Closed,

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure to fold one tick into one duration's candle.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("candle lookup failed: {0}")]
    Read(#[source] StoreError),

    #[error("candle write failed after {attempts} attempts: {source}")]
    Write {
        attempts: u32,
        #[source]
        source: StoreError,
    },
}
