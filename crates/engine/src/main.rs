//! Kimchi premium engine
//!
//! Main entry point: loads settings, runs the feeds and logs status until shutdown

use std::time::Duration;

use tokio::signal;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use kimp_engine::{settings, EngineStatus, PriceEngine};
use kimp_price_feed::StoreEvent;

const STATUS_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    info!("Starting kimchi premium engine v{}", env!("CARGO_PKG_VERSION"));

    let config = settings::load()?;
    let engine = PriceEngine::from_config(config)?;

    let _quotes = engine.subscribe_to_prices(|event| {
        if let StoreEvent::Quote { exchange, instrument_id, source, price } = event {
            debug!(%exchange, instrument = %instrument_id, %source, price, "Quote");
        }
    });

    engine.start()?;
    info!("Press Ctrl+C to shutdown");

    let mut status = tokio::time::interval(STATUS_INTERVAL);
    status.tick().await;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = status.tick() => log_status(&engine.status()),
        }
    }

    engine.stop().await;
    info!("Shutdown complete");
    Ok(())
}

fn log_status(status: &EngineStatus) {
    info!(
        uptime_secs = status.uptime_secs,
        global = %status.global.status,
        global_degraded = status.global.degraded,
        local = %status.local.status,
        local_degraded = status.local.degraded,
        global_quotes = status.global_quotes,
        local_quotes = status.local_quotes,
        exchange_rate = status.exchange_rate.rate,
        premiums_available = status.premiums.available_count,
        mean_premium = ?status.premiums.mean_percent,
        "Engine status"
    );

    match serde_json::to_string(status) {
        Ok(json) => debug!(status = %json, "Engine status detail"),
        Err(e) => error!("Failed to serialize status: {}", e),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C");
        }
        _ = terminate => {
            info!("Received termination signal");
        }
    }
}
