//! Engine Constants
//!
//! Exchange limits, pacing and indicator lookbacks shared across services.
//!
//! ## Bybit v5 endpoints
//!
//! | Surface | Default                                   | Override env      |
//! |---------|-------------------------------------------|-------------------|
//! | REST    | `https://api.bybit.com`                   | `BYBIT_REST_URL`  |
//! | Stream  | `wss://stream.bybit.com/v5/public/linear` | `BYBIT_WS_URL`    |

/// Default REST base URL
pub const DEFAULT_REST_URL: &str = "https://api.bybit.com";

/// Default public linear stream URL
pub const DEFAULT_WS_URL: &str = "wss://stream.bybit.com/v5/public/linear";

/// Default product category for kline requests
pub const DEFAULT_CATEGORY: &str = "linear";

/// Default SQLite database file
pub const DEFAULT_DATABASE_PATH: &str = "klines.db";

/// Maximum rows the kline endpoint returns per call
pub const KLINE_PAGE_LIMIT: usize = 1000;

/// Delay between consecutive historical pages
pub const PAGE_DELAY_MS: u64 = 200;

/// Delay between initial-load batches (matches the exchange's public pacing)
pub const BATCH_DELAY_MS: u64 = 500;

/// Retries per historical page before the range is reported incomplete
pub const MAX_PAGE_RETRIES: u32 = 5;

/// HTTP client timeout for REST calls
pub const HTTP_TIMEOUT_SECS: u64 = 30;

/// Default initial-load batch size in minutes (one day)
pub const DEFAULT_BATCH_MINUTES: i64 = 1440;

/// Largest accepted initial-load batch, ten years of minutes
pub const MAX_BATCH_MINUTES: i64 = 10 * 366 * 1440;

/// Grace period added to the candle spacing before a pair counts as stale
pub const HEALTH_BUFFER_SECS: i64 = 120;

/// Read timeout on the live connection
pub const WS_READ_TIMEOUT_SECS: u64 = 30;

/// Application-level ping interval on the live connection
pub const WS_PING_INTERVAL_SECS: u64 = 20;

/// Fixed delay before reconnecting a dropped connection
pub const WS_RECONNECT_DELAY_SECS: u64 = 5;

/// Upper bound for the reconnect backoff
pub const WS_MAX_RECONNECT_DELAY_SECS: u64 = 60;

/// Closed slots re-checked by the reactive reconciliation pass
pub const RECONCILE_LOOKBACK_SLOTS: i64 = 100;

/// Cooldown bounds before a reactive pass re-requests a gap the exchange
/// left open. The cooldown starts at one slot and doubles per failure.
pub const GAP_RETRY_MIN_SECS: i64 = 60;
pub const GAP_RETRY_MAX_SECS: i64 = 6 * 3600;

/// Capacity of the snapshot broadcast channel
pub const SNAPSHOT_CHANNEL_CAPACITY: usize = 1024;

/// Indicator lookbacks
pub const RSI_PERIOD: usize = 14;
pub const MACD_FAST: usize = 12;
pub const MACD_SLOW: usize = 26;
pub const MACD_SIGNAL: usize = 9;
pub const BOLLINGER_PERIOD: usize = 20;
pub const BOLLINGER_STD_DEV: f64 = 2.0;
pub const SMA_PERIOD: usize = 20;

/// Candles loaded for the indicator window. MACD's signal line needs
/// `MACD_SLOW + MACD_SIGNAL - 1` closes; the rest is warmup for the EMAs.
pub const INDICATOR_WINDOW: usize = 100;

/// Fibonacci retracement ratios
pub const FIB_RATIOS: [f64; 6] = [0.0, 0.236, 0.382, 0.5, 0.618, 1.0];
