pub mod backfill;
pub mod gaps;
pub mod status;
pub mod stream;

use crate::cli::CommonArgs;
use crate::error::Result;
use crate::models::{Settings, SyncConfig};
use crate::services::{
    BybitRestClient, GapReconciler, HistoricalFetcher, SQLiteCandleStore, SharedCandleStore,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Validate CLI input, exiting with a message on the first bad value
pub(crate) fn sync_config(common: &CommonArgs, end_date: Option<&str>, batch_minutes: i64) -> SyncConfig {
    let config = SyncConfig::new(
        &common.symbols,
        &common.timeframes,
        &common.start_date,
        end_date,
        batch_minutes,
    )
    .and_then(|config| {
        for tf in &config.timeframes {
            tf.exchange_interval()?;
        }
        Ok(config)
    });

    match config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ Invalid configuration: {}", e);
            std::process::exit(1);
        }
    }
}

pub(crate) async fn open_store(settings: &Settings) -> Result<SharedCandleStore> {
    Ok(Arc::new(SQLiteCandleStore::new(&settings.database_path).await?))
}

/// Reconciler backed by the exchange REST client
pub(crate) fn build_reconciler(
    store: SharedCandleStore,
    settings: &Settings,
    cancel: CancellationToken,
) -> Result<GapReconciler> {
    let client = BybitRestClient::from_settings(settings)?;
    let fetcher = HistoricalFetcher::new(Arc::new(client));
    Ok(GapReconciler::new(store, fetcher).with_cancellation(cancel))
}

/// NaN prints as n/a
pub(crate) fn format_value(v: f64) -> String {
    if v.is_nan() {
        "n/a".to_string()
    } else {
        format!("{:.2}", v)
    }
}
