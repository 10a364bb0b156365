//! One-shot history load
//!
//! Per pair, resumes after the newest stored candle (or `--start-date` for an
//! empty pair) and fills every closed slot up to now in `--batch-size` minute
//! chunks.

use crate::cli::CommonArgs;
use crate::error::Result;
use crate::models::{Settings, SyncConfig};
use crate::services::PassReport;
use crate::utils::{batch_progress, build_runtime, cancel_on_ctrl_c};
use chrono::Utc;
use tokio_util::sync::CancellationToken;

pub fn run(common: CommonArgs, batch_size: i64) {
    let config = super::sync_config(&common, None, batch_size);
    let runtime = build_runtime();

    match runtime.block_on(backfill(config, common.settings)) {
        Ok(report) if report.is_closed() => {
            println!("\n✅ Backfill complete: {} candles written", report.upserted);
        }
        Ok(report) => {
            println!(
                "\n⚠️  Backfill finished with {} open gap(s); run again or use 'gaps' to retry",
                report.open_gaps
            );
        }
        Err(e) => {
            eprintln!("\n❌ Backfill failed: {}", e);
            std::process::exit(1);
        }
    }
}

async fn backfill(config: SyncConfig, settings: Settings) -> Result<PassReport> {
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let store = super::open_store(&settings).await?;
    let reconciler = super::build_reconciler(store.clone(), &settings, cancel.clone())?;
    let until = Utc::now();

    let mut total = PassReport::default();
    for (symbol, timeframe) in config.pairs() {
        if cancel.is_cancelled() {
            println!("⏹️  Cancelled");
            break;
        }

        println!("📥 {} {}", symbol, timeframe);
        let pb = batch_progress(0);
        let result = reconciler
            .initial_load(&symbol, timeframe, config.start, until, config.batch_span(), Some(&pb))
            .await;
        pb.finish_and_clear();

        let report = match result {
            Ok(report) => report,
            Err(e) => {
                store.close().await;
                return Err(e);
            }
        };
        println!(
            "   {} slots checked, {} filled, {} open gap(s)",
            report.expected, report.filled, report.open_gaps
        );
        total.merge(&report);
    }

    store.close().await;
    Ok(total)
}
