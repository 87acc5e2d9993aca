use anyhow::{bail, Context, Result};
use chrono::FixedOffset;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ingest::WriteRetryPolicy;
use crate::model::duration::{CandleDuration, DurationSet};
use crate::queue::OverflowPolicy;

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";
pub const CONFIG_PATH_ENV: &str = "CANDLE_INGEST_CONFIG";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub bitflyer: BitflyerConfig,
    pub candles: CandleConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BitflyerConfig {
    pub rest_base_url: String,
    pub ws_url: String,
    pub product_code: String,
    #[serde(default = "default_channel_prefix")]
    pub channel_prefix: String,
    #[serde(skip)]
    pub api_key: String,
    #[serde(skip)]
    pub api_secret: String,
}

fn default_channel_prefix() -> String {
    "lightning_ticker".to_string()
}

impl BitflyerConfig {
    pub fn has_credentials(&self) -> bool {
        !self.api_key.is_empty() && !self.api_secret.is_empty()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CandleConfig {
    pub durations: Vec<String>,
    /// Duration whose new buckets are flagged for downstream consumers; also
    /// the query API default.
    pub trade_duration: String,
    #[serde(default = "default_utc_offset_hours")]
    pub utc_offset_hours: i32,
}

fn default_utc_offset_hours() -> i32 {
    9
}

impl CandleConfig {
    pub fn duration_set(&self) -> Result<DurationSet> {
        DurationSet::parse(&self.durations)
    }

    pub fn trade_duration(&self) -> Result<CandleDuration> {
        let set = self.duration_set()?;
        set.find(&self.trade_duration)
            .cloned()
            .with_context(|| {
                format!(
                    "candles.trade_duration '{}' is not one of candles.durations",
                    self.trade_duration
                )
            })
    }

    /// The single zone every bucket time is expressed in.
    pub fn reference_zone(&self) -> Result<FixedOffset> {
        self.utc_offset_hours
            .checked_mul(3600)
            .and_then(FixedOffset::east_opt)
            .with_context(|| {
                format!(
                    "candles.utc_offset_hours {} is out of range",
                    self.utc_offset_hours
                )
            })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub overflow: OverflowPolicy,
    #[serde(default = "default_write_retry_attempts")]
    pub write_retry_attempts: u32,
    #[serde(default = "default_write_retry_initial_ms")]
    pub write_retry_initial_ms: u64,
    #[serde(default = "default_write_retry_max_ms")]
    pub write_retry_max_ms: u64,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_write_retry_attempts() -> u32 {
    3
}

fn default_write_retry_initial_ms() -> u64 {
    50
}

fn default_write_retry_max_ms() -> u64 {
    2_000
}

fn default_max_consecutive_failures() -> u32 {
    20
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            overflow: OverflowPolicy::default(),
            write_retry_attempts: default_write_retry_attempts(),
            write_retry_initial_ms: default_write_retry_initial_ms(),
            write_retry_max_ms: default_write_retry_max_ms(),
            max_consecutive_failures: default_max_consecutive_failures(),
        }
    }
}

impl IngestConfig {
    pub fn retry_policy(&self) -> WriteRetryPolicy {
        WriteRetryPolicy {
            attempts: self.write_retry_attempts,
            initial_delay: Duration::from_millis(self.write_retry_initial_ms),
            max_delay: Duration::from_millis(self.write_retry_max_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("data/candles.sqlite")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: default_storage_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_limit")]
    pub max_limit: usize,
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_limit() -> usize {
    1000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            max_limit: default_max_limit(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// JSON log file; stdout when unset.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl Config {
    /// Load `.env`, then the TOML file named by `CANDLE_INGEST_CONFIG`
    /// (default `config/default.toml`), then credentials from the environment.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config_path = std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        let mut config = Self::from_file(&config_path)?;

        config.bitflyer.api_key = std::env::var("BITFLYER_API_KEY").unwrap_or_default();
        config.bitflyer.api_secret = std::env::var("BITFLYER_API_SECRET").unwrap_or_default();

        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml_str(&config_str)
            .with_context(|| format!("failed to load {}", path.display()))
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s).context("failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.bitflyer.product_code.trim().is_empty() {
            bail!("bitflyer.product_code must not be empty");
        }
        self.candles
            .duration_set()
            .context("candles.durations is invalid")?;
        self.candles.trade_duration()?;
        self.candles.reference_zone()?;
        if self.ingest.queue_capacity == 0 {
            bail!("ingest.queue_capacity must be > 0");
        }
        if self.ingest.write_retry_attempts == 0 {
            bail!("ingest.write_retry_attempts must be > 0");
        }
        if self.ingest.max_consecutive_failures == 0 {
            bail!("ingest.max_consecutive_failures must be > 0");
        }
        if self.server.max_limit == 0 {
            bail!("server.max_limit must be > 0");
        }
        Ok(())
    }
}
