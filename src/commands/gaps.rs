use crate::cli::CommonArgs;
use crate::error::Result;
use crate::models::{Settings, SyncConfig};
use crate::utils::{batch_progress, build_runtime, cancel_on_ctrl_c};
use chrono::Utc;
use tokio_util::sync::CancellationToken;

/// Gap test: scan and fill `[--start-date, --end-date)` for every pair, then
/// fail if any slot is still missing
pub fn run(common: CommonArgs, end_date: Option<String>) {
    let config = super::sync_config(
        &common,
        end_date.as_deref(),
        crate::constants::DEFAULT_BATCH_MINUTES,
    );
    let runtime = build_runtime();

    match runtime.block_on(check_gaps(config, common.settings)) {
        Ok(failures) if failures.is_empty() => {
            println!("\n✅ No gaps left");
        }
        Ok(failures) => {
            eprintln!("\n❌ {} pair(s) still have gaps:", failures.len());
            for failure in failures {
                eprintln!("   {}", failure);
            }
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("\n❌ Gap check failed: {}", e);
            std::process::exit(1);
        }
    }
}

async fn check_gaps(config: SyncConfig, settings: Settings) -> Result<Vec<String>> {
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let store = super::open_store(&settings).await?;
    let reconciler = super::build_reconciler(store.clone(), &settings, cancel.clone())?;
    let end = config.end.unwrap_or_else(Utc::now);

    let mut failures = Vec::new();
    for (symbol, timeframe) in config.pairs() {
        if cancel.is_cancelled() {
            failures.push(format!("{}/{}: cancelled", symbol, timeframe));
            break;
        }

        let from = timeframe.boundary_of(config.start);
        let to = timeframe.boundary_of(end);
        println!("🔍 {} {} [{} .. {})", symbol, timeframe, from, to);

        let pb = batch_progress(0);
        let result = reconciler
            .reconcile_batched(&symbol, timeframe, from, to, config.batch_span(), Some(&pb))
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
            "   expected {}, missing {} in {} gap(s), filled {}, still open {}",
            report.expected, report.missing, report.gaps, report.filled, report.open_gaps
        );

        if let Err(e) = report.ensure_closed(&symbol, timeframe) {
            failures.push(e.to_string());
        }
    }

    store.close().await;
    Ok(failures)
}
