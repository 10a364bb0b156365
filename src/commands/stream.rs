//! Live streaming command
//!
//! Loads missing history for every pair, then keeps one push connection per
//! symbol until Ctrl-C. Each update is logged as a single structured line.

use crate::cli::CommonArgs;
use crate::constants::DEFAULT_BATCH_MINUTES;
use crate::error::Result;
use crate::models::{Settings, SyncConfig};
use crate::services::{MarketSnapshot, StreamManager};
use crate::utils::{build_runtime, cancel_on_ctrl_c};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub fn run(common: CommonArgs) {
    let config = super::sync_config(&common, None, DEFAULT_BATCH_MINUTES);
    let runtime = build_runtime();

    match runtime.block_on(stream(config, common.settings)) {
        Ok(()) => {
            println!("\n✅ Stream stopped cleanly");
        }
        Err(e) => {
            eprintln!("\n❌ Stream failed: {}", e);
            std::process::exit(1);
        }
    }
}

async fn stream(config: SyncConfig, settings: Settings) -> Result<()> {
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let store = super::open_store(&settings).await?;
    let reconciler = Arc::new(super::build_reconciler(store.clone(), &settings, cancel.clone())?);
    let mut manager = StreamManager::new(settings.ws_url.clone(), store, reconciler, cancel.clone());

    println!(
        "🚀 Streaming {} on [{}] from {}",
        config.symbols.join(", "),
        config
            .timeframes
            .iter()
            .map(|tf| tf.label())
            .collect::<Vec<_>>()
            .join(", "),
        settings.ws_url
    );

    if let Err(e) = manager.initial_load(&config).await {
        manager.shutdown().await;
        return Err(e);
    }

    let logger = tokio::spawn(log_snapshots(manager.subscribe(), cancel.clone()));
    manager.start_all(&config);

    let states = manager.run_until_cancelled().await;
    let _ = logger.await;

    for state in states {
        info!(
            symbol = %state.symbol,
            reconnect_attempts = state.reconnect_attempts,
            phase = %state.phase,
            "Symbol stopped"
        );
    }
    Ok(())
}

async fn log_snapshots(mut rx: broadcast::Receiver<MarketSnapshot>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = rx.recv() => match received {
                Ok(s) => info!(
                    symbol = %s.symbol,
                    timeframe = %s.timeframe,
                    start = %s.candle.start,
                    close = s.candle.close,
                    volume = s.candle.volume,
                    confirmed = s.confirmed,
                    healthy = s.healthy,
                    rsi = s.indicators.rsi,
                    macd = s.indicators.macd.macd,
                    "Kline update"
                ),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped = skipped, "Snapshot logger fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
}
