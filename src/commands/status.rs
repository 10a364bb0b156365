use super::format_value;
use crate::cli::CommonArgs;
use crate::services::{HealthMonitor, SharedCandleStore};
use crate::utils::build_runtime;
use chrono::Utc;

pub fn run(common: CommonArgs) {
    println!("📊 Kline Store Status\n");

    let runtime = build_runtime();
    match runtime.block_on(show_status(&common)) {
        Ok(()) => {}
        Err(e) => {
            eprintln!("❌ Error: {}", e);
            std::process::exit(1);
        }
    }
}

async fn show_status(common: &CommonArgs) -> crate::error::Result<()> {
    let store = super::open_store(&common.settings).await?;
    let pairs = store.pairs().await?;

    if pairs.is_empty() {
        println!("⚠️  No candles stored in {:?}. Run 'backfill' or 'stream' first.", common.settings.database_path);
        store.close().await;
        return Ok(());
    }

    let monitor = HealthMonitor::new(store.clone());
    for (symbol, timeframe) in pairs {
        println!("═══════════════════════════════════════════════════════════\n");
        show_pair(&store, &monitor, &symbol, timeframe).await?;
        println!();
    }

    store.close().await;
    Ok(())
}

async fn show_pair(
    store: &SharedCandleStore,
    monitor: &HealthMonitor,
    symbol: &str,
    timeframe: crate::models::Timeframe,
) -> crate::error::Result<()> {
    let count = store.count(symbol, timeframe).await?;
    let health = monitor.check(symbol, timeframe, Utc::now()).await;
    let flag = if health.healthy { "✅ healthy" } else { "⚠️  stale" };

    println!("🔹 {} {}  ({} candles, {})", symbol, timeframe, count, flag);

    let Some(candle) = store.latest(symbol, timeframe).await? else {
        return Ok(());
    };
    let i = &candle.indicators;

    println!("   Latest: {}  (age {}s)", candle.start, health.age_secs.unwrap_or_default());
    println!(
        "   O {}  H {}  L {}  C {}  V {}",
        format_value(candle.open),
        format_value(candle.high),
        format_value(candle.low),
        format_value(candle.close),
        format_value(candle.volume)
    );
    println!("   RSI {}  SMA {}", format_value(i.rsi), format_value(i.sma));
    println!(
        "   MACD {}  signal {}  hist {}",
        format_value(i.macd.macd),
        format_value(i.macd.signal),
        format_value(i.macd.histogram)
    );
    println!(
        "   BB upper {}  middle {}  lower {}",
        format_value(i.bollinger.upper),
        format_value(i.bollinger.middle),
        format_value(i.bollinger.lower)
    );
    let fib: Vec<String> = i.fibonacci.levels().iter().map(|v| format_value(*v)).collect();
    println!("   Fib {}", fib.join(" / "));
    Ok(())
}
