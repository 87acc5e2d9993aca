use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};

use candle_ingest::bitflyer::rest::BitflyerRestClient;
use candle_ingest::bitflyer::ws::{run_feed, LightstreamClient};
use candle_ingest::config::{Config, LoggingConfig, StorageBackend};
use candle_ingest::event::{AppEvent, FeedStatus};
use candle_ingest::ingest::{CandleAggregator, IngestLoop};
use candle_ingest::queue::tick_queue;
use candle_ingest::server::{self, ApiState};
use candle_ingest::store::{CandleStore, MemoryStore, SqliteStore};

fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        logging
            .level
            .parse()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    });
    match &logging.file {
        Some(path) => {
            let log_file = std::fs::File::create(path)
                .with_context(|| format!("failed to create log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(log_file)
                .with_ansi(false)
                .json()
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}

fn log_event(event: &AppEvent) {
    match event {
        AppEvent::FeedStatus(FeedStatus::Connected { channel }) => {
            tracing::info!(%channel, "Feed connected");
        }
        AppEvent::FeedStatus(FeedStatus::Disconnected) => {
            tracing::info!("Feed disconnected");
        }
        AppEvent::FeedStatus(FeedStatus::Reconnecting { attempt, delay_ms }) => {
            tracing::info!(attempt, delay_ms, "Feed reconnecting");
        }
        AppEvent::CandleCreated {
            candle,
            is_trade_duration,
        } => {
            tracing::info!(
                product_code = %candle.product_code,
                duration = %candle.duration,
                time = %candle.time.to_rfc3339(),
                open = candle.open,
                trade_duration = is_trade_duration,
                "New candle"
            );
        }
        AppEvent::TickDropped { total_dropped } => {
            tracing::warn!(total_dropped, "Ticks dropped by queue overflow");
        }
        AppEvent::ReadFailed {
            product_code,
            duration,
            error,
        } => {
            tracing::warn!(%product_code, %duration, %error, "Candle read failed");
        }
        AppEvent::WriteFailed {
            product_code,
            duration,
            attempts,
            error,
        } => {
            tracing::error!(%product_code, %duration, attempts, %error, "Candle write failed");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider (required by rustls 0.23+)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {:#}", e);
            std::process::exit(1);
        }
    };
    init_tracing(&config.logging)?;

    let durations = config.candles.duration_set()?;
    let trade_duration = config.candles.trade_duration()?;
    let zone = config.candles.reference_zone()?;
    let product_code = config.bitflyer.product_code.trim().to_string();

    tracing::info!(
        product_code = %product_code,
        durations = ?durations.iter().map(|d| d.label()).collect::<Vec<_>>(),
        zone = %zone,
        ws_url = %config.bitflyer.ws_url,
        "Starting candle-ingest"
    );

    let store: Arc<dyn CandleStore> = match config.storage.backend {
        StorageBackend::Sqlite => Arc::new(
            SqliteStore::open(
                &config.storage.path,
                std::slice::from_ref(&product_code),
                &durations,
                zone,
            )
            .with_context(|| format!("failed to open {}", config.storage.path.display()))?,
        ),
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory candle store, nothing is persisted");
            Arc::new(MemoryStore::new())
        }
    };

    let rest = BitflyerRestClient::new(
        &config.bitflyer.rest_base_url,
        &config.bitflyer.api_key,
        &config.bitflyer.api_secret,
    )?;
    match rest.get_ticker(&product_code).await {
        Ok(t) => tracing::info!(state = %t.state, ltp = t.ltp, "bitFlyer REST reachable"),
        Err(e) => tracing::warn!(error = %e, "bitFlyer REST ticker probe failed"),
    }
    if config.bitflyer.has_credentials() {
        match rest.get_balance().await {
            Ok(balances) => {
                for b in balances.iter().filter(|b| b.amount > 0.0) {
                    tracing::info!(
                        currency = %b.currency_code,
                        amount = b.amount,
                        available = b.available,
                        "Balance"
                    );
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to fetch balances"),
        }
    }

    // Channels
    let (event_tx, mut event_rx) = mpsc::channel::<AppEvent>(256);
    let (tick_tx, tick_rx) = tick_queue(config.ingest.queue_capacity, config.ingest.overflow);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            log_event(&event);
        }
    });

    let feed_client =
        LightstreamClient::new(&config.bitflyer.ws_url, &config.bitflyer.channel_prefix, zone);
    let feed_handle = tokio::spawn(run_feed(
        feed_client,
        product_code.clone(),
        tick_tx,
        event_tx.clone(),
        shutdown_rx.clone(),
    ));

    let aggregator = CandleAggregator::new(
        store.clone(),
        durations.clone(),
        zone,
        config.ingest.retry_policy(),
    );
    let ingest = IngestLoop::new(
        aggregator,
        Some(trade_duration.clone()),
        config.ingest.max_consecutive_failures,
        event_tx,
    );
    let ingest_handle = tokio::spawn(ingest.run(tick_rx, shutdown_rx.clone()));

    let api_state = ApiState {
        store: store.clone(),
        durations,
        default_duration: trade_duration,
        max_limit: config.server.max_limit,
    };
    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!(%addr, "Query API listening");
    let mut server_shutdown = shutdown_rx.clone();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, server::router(api_state))
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.changed().await;
            })
            .await
    });

    // Ctrl+C handler
    let ctrl_c_shutdown = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Ctrl+C received");
        let _ = ctrl_c_shutdown.send(true);
    });

    // Ingestion is the supervised task: when it ends, for any reason, the
    // rest of the pipeline follows.
    let outcome = match ingest_handle.await {
        Ok(Ok(stats)) => {
            tracing::info!(?stats, "Ingestion finished");
            Ok(())
        }
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Ingestion aborted");
            Err(anyhow::Error::new(e))
        }
        Err(e) => Err(anyhow::anyhow!("ingestion task panicked: {}", e)),
    };
    let _ = shutdown_tx.send(true);

    match feed_handle.await {
        Ok(Err(e)) => tracing::warn!(error = %e, "Feed task stopped with error"),
        Err(e) => tracing::warn!(error = %e, "Feed task join failed"),
        Ok(Ok(())) => {}
    }
    match server_handle.await {
        Ok(Err(e)) => tracing::warn!(error = %e, "Query API stopped with error"),
        Err(e) => tracing::warn!(error = %e, "Query API task join failed"),
        Ok(Ok(())) => {}
    }

    // Last handle; in-flight writes are done once ingestion has joined.
    drop(store);
    tracing::info!("Shutdown complete");
    outcome
}
