use crate::error::{AppError, Result};
use crate::models::indicators::{Bollinger, Fibonacci, Macd};
use crate::models::{Candle, CandleKey, IndicatorSnapshot, Timeframe};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteConnectOptions, sqlite::SqliteRow, Row, SqlitePool};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Persistence contract for candles.
///
/// Writes are keyed on `(symbol, timeframe, start)`; a second write for the
/// same key overwrites the first. Implementations must be safe to share
/// between tasks.
#[async_trait]
pub trait CandleStore: Send + Sync {
    /// Insert or overwrite a batch of candles (OHLCV only). Returns rows written.
    async fn upsert(&self, candles: &[Candle]) -> Result<usize>;

    /// Newest candle for a pair
    async fn latest(&self, symbol: &str, timeframe: Timeframe) -> Result<Option<Candle>>;

    /// Candles with `from <= start < to`, oldest first
    async fn range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candle>>;

    /// Write indicator columns for an existing candle
    async fn save_indicators(&self, key: &CandleKey, snapshot: &IndicatorSnapshot) -> Result<()>;

    /// Number of stored candles for a pair
    async fn count(&self, symbol: &str, timeframe: Timeframe) -> Result<i64>;

    /// Every stored (symbol, timeframe) pair
    async fn pairs(&self) -> Result<Vec<(String, Timeframe)>>;

    /// Release the underlying handle
    async fn close(&self);
}

pub type SharedCandleStore = Arc<dyn CandleStore>;

/// Database schema version for migrations
const DB_SCHEMA_VERSION: &str = "1";

const SELECT_COLUMNS: &str = r#"
    symbol, timeframe, datetime, open, high, low, close, volume,
    rsi, macd, macd_signal, macd_histogram,
    bb_upper, bb_middle, bb_lower, sma,
    fib_0, fib_236, fib_382, fib_500, fib_618, fib_1000
"#;

/// SQLite candle store
#[derive(Debug)]
pub struct SQLiteCandleStore {
    pool: SqlitePool,
    database_path: PathBuf,
}

impl SQLiteCandleStore {
    /// Open (or create) the database with WAL enabled
    pub async fn new(database_path: impl AsRef<Path>) -> Result<Self> {
        let database_path = database_path.as_ref().to_path_buf();
        info!("Initializing SQLite database at: {:?}", database_path);

        if let Some(parent) = database_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let connect_options = SqliteConnectOptions::new()
            .filename(&database_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePool::connect_with(connect_options).await?;

        let store = Self { pool, database_path };
        store.initialize_database().await?;

        info!("SQLite database initialized successfully");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.database_path
    }

    async fn initialize_database(&self) -> Result<()> {
        let create_table_query = r#"
            CREATE TABLE IF NOT EXISTS candles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                datetime INTEGER NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume REAL NOT NULL,
                rsi REAL,
                macd REAL,
                macd_signal REAL,
                macd_histogram REAL,
                bb_upper REAL,
                bb_middle REAL,
                bb_lower REAL,
                sma REAL,
                fib_0 REAL,
                fib_236 REAL,
                fib_382 REAL,
                fib_500 REAL,
                fib_618 REAL,
                fib_1000 REAL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
        "#;

        sqlx::query(create_table_query).execute(&self.pool).await?;

        let indexes = vec![
            // Natural key
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_candles_unique ON candles(symbol, timeframe, datetime)",
            // Latest-candle lookups
            "CREATE INDEX IF NOT EXISTS idx_candles_recent ON candles(symbol, timeframe, datetime DESC)",
        ];

        for index in indexes {
            sqlx::query(index).execute(&self.pool).await?;
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("INSERT OR REPLACE INTO metadata (key, value) VALUES ('schema_version', ?1)")
            .bind(DB_SCHEMA_VERSION)
            .execute(&self.pool)
            .await?;

        debug!("Database schema initialized");
        Ok(())
    }

    fn row_to_candle(row: &SqliteRow) -> Result<Candle> {
        let label: String = row.try_get("timeframe")?;
        let timeframe = Timeframe::parse(&label)
            .map_err(|e| AppError::Database(format!("stored timeframe '{}': {}", label, e)))?;
        let ms: i64 = row.try_get("datetime")?;
        let start = DateTime::<Utc>::from_timestamp_millis(ms)
            .ok_or_else(|| AppError::Database(format!("stored datetime out of range: {}", ms)))?;

        let real = |col: &str| -> Result<f64> {
            Ok(row.try_get::<Option<f64>, _>(col)?.unwrap_or(f64::NAN))
        };

        let indicators = IndicatorSnapshot {
            rsi: real("rsi")?,
            macd: Macd {
                macd: real("macd")?,
                signal: real("macd_signal")?,
                histogram: real("macd_histogram")?,
            },
            bollinger: Bollinger {
                upper: real("bb_upper")?,
                middle: real("bb_middle")?,
                lower: real("bb_lower")?,
            },
            sma: real("sma")?,
            fibonacci: Fibonacci::from_levels([
                real("fib_0")?,
                real("fib_236")?,
                real("fib_382")?,
                real("fib_500")?,
                real("fib_618")?,
                real("fib_1000")?,
            ]),
        };

        Ok(Candle {
            symbol: row.try_get("symbol")?,
            timeframe,
            start,
            open: row.try_get("open")?,
            high: row.try_get("high")?,
            low: row.try_get("low")?,
            close: row.try_get("close")?,
            volume: row.try_get("volume")?,
            indicators,
        })
    }
}

/// NaN is stored as NULL
fn nullable(v: f64) -> Option<f64> {
    if v.is_nan() {
        None
    } else {
        Some(v)
    }
}

#[async_trait]
impl CandleStore for SQLiteCandleStore {
    async fn upsert(&self, candles: &[Candle]) -> Result<usize> {
        if candles.is_empty() {
            return Ok(0);
        }

        let mut transaction = self.pool.begin().await?;
        let mut affected_rows = 0;

        for candle in candles {
            let result = sqlx::query(
                r#"
                INSERT INTO candles (symbol, timeframe, datetime, open, high, low, close, volume)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(symbol, timeframe, datetime) DO UPDATE SET
                    open = excluded.open,
                    high = excluded.high,
                    low = excluded.low,
                    close = excluded.close,
                    volume = excluded.volume
                "#,
            )
            .bind(&candle.symbol)
            .bind(candle.timeframe.label())
            .bind(candle.start_ms())
            .bind(candle.open)
            .bind(candle.high)
            .bind(candle.low)
            .bind(candle.close)
            .bind(candle.volume)
            .execute(&mut *transaction)
            .await?;

            affected_rows += result.rows_affected() as usize;
        }

        transaction.commit().await?;
        Ok(affected_rows)
    }

    async fn latest(&self, symbol: &str, timeframe: Timeframe) -> Result<Option<Candle>> {
        let query = format!(
            "SELECT {} FROM candles WHERE symbol = ?1 AND timeframe = ?2 ORDER BY datetime DESC LIMIT 1",
            SELECT_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(symbol)
            .bind(timeframe.label())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_candle).transpose()
    }

    async fn range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let query = format!(
            "SELECT {} FROM candles WHERE symbol = ?1 AND timeframe = ?2 AND datetime >= ?3 AND datetime < ?4 ORDER BY datetime ASC",
            SELECT_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(symbol)
            .bind(timeframe.label())
            .bind(from.timestamp_millis())
            .bind(to.timestamp_millis())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_candle).collect()
    }

    async fn save_indicators(&self, key: &CandleKey, snapshot: &IndicatorSnapshot) -> Result<()> {
        let fib = snapshot.fibonacci.levels();
        let result = sqlx::query(
            r#"
            UPDATE candles SET
                rsi = ?4, macd = ?5, macd_signal = ?6, macd_histogram = ?7,
                bb_upper = ?8, bb_middle = ?9, bb_lower = ?10, sma = ?11,
                fib_0 = ?12, fib_236 = ?13, fib_382 = ?14, fib_500 = ?15, fib_618 = ?16, fib_1000 = ?17
            WHERE symbol = ?1 AND timeframe = ?2 AND datetime = ?3
            "#,
        )
        .bind(&key.symbol)
        .bind(key.timeframe.label())
        .bind(key.start.timestamp_millis())
        .bind(nullable(snapshot.rsi))
        .bind(nullable(snapshot.macd.macd))
        .bind(nullable(snapshot.macd.signal))
        .bind(nullable(snapshot.macd.histogram))
        .bind(nullable(snapshot.bollinger.upper))
        .bind(nullable(snapshot.bollinger.middle))
        .bind(nullable(snapshot.bollinger.lower))
        .bind(nullable(snapshot.sma))
        .bind(nullable(fib[0]))
        .bind(nullable(fib[1]))
        .bind(nullable(fib[2]))
        .bind(nullable(fib[3]))
        .bind(nullable(fib[4]))
        .bind(nullable(fib[5]))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(key = %key, "No candle row to attach indicators to");
        }
        Ok(())
    }

    async fn count(&self, symbol: &str, timeframe: Timeframe) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM candles WHERE symbol = ?1 AND timeframe = ?2")
                .bind(symbol)
                .bind(timeframe.label())
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn pairs(&self) -> Result<Vec<(String, Timeframe)>> {
        let rows = sqlx::query(
            "SELECT DISTINCT symbol, timeframe FROM candles ORDER BY symbol, timeframe",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut pairs = Vec::with_capacity(rows.len());
        for row in rows {
            let symbol: String = row.try_get("symbol")?;
            let label: String = row.try_get("timeframe")?;
            match Timeframe::parse(&label) {
                Ok(tf) => pairs.push((symbol, tf)),
                Err(e) => warn!(symbol = %symbol, timeframe = %label, "Skipping stored pair: {}", e),
            }
        }
        Ok(pairs)
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("SQLite database connection pool closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use tempfile::tempdir;

    fn day(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap() + ChronoDuration::days(n)
    }

    fn candle(symbol: &str, start: DateTime<Utc>, close: f64) -> Candle {
        Candle::new(symbol, Timeframe::Days(1), start, close - 1.0, close + 2.0, close - 2.0, close, 10.0)
    }

    async fn raw_rows(store: &SQLiteCandleStore) -> Vec<(String, String, i64, f64, f64, f64, f64, f64)> {
        sqlx::query_as(
            "SELECT symbol, timeframe, datetime, open, high, low, close, volume FROM candles ORDER BY id",
        )
        .fetch_all(&store.pool)
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_database_creation() {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("nested").join("test.db");

        let store = SQLiteCandleStore::new(&db_path).await.unwrap();
        assert!(store.path().is_file());
        assert_eq!(store.count("BTCUSDT", Timeframe::Days(1)).await.unwrap(), 0);
        assert!(store.latest("BTCUSDT", Timeframe::Days(1)).await.unwrap().is_none());
        store.close().await;
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let temp_dir = tempdir().unwrap();
        let store = SQLiteCandleStore::new(temp_dir.path().join("test.db")).await.unwrap();

        let c = candle("BTCUSDT", day(0), 100.0);
        store.upsert(&[c.clone()]).await.unwrap();
        let once = raw_rows(&store).await;

        store.upsert(&[c.clone()]).await.unwrap();
        let twice = raw_rows(&store).await;

        assert_eq!(once.len(), 1);
        assert_eq!(once, twice);
        store.close().await;
    }

    #[tokio::test]
    async fn test_upsert_overwrites_same_key() {
        let temp_dir = tempdir().unwrap();
        let store = SQLiteCandleStore::new(temp_dir.path().join("test.db")).await.unwrap();

        store.upsert(&[candle("BTCUSDT", day(0), 100.0)]).await.unwrap();
        store.upsert(&[candle("BTCUSDT", day(0), 105.0)]).await.unwrap();

        assert_eq!(store.count("BTCUSDT", Timeframe::Days(1)).await.unwrap(), 1);
        let latest = store.latest("BTCUSDT", Timeframe::Days(1)).await.unwrap().unwrap();
        assert_eq!(latest.close, 105.0);
        assert_eq!(latest.start, day(0));
        store.close().await;
    }

    #[tokio::test]
    async fn test_latest_and_range() {
        let temp_dir = tempdir().unwrap();
        let store = SQLiteCandleStore::new(temp_dir.path().join("test.db")).await.unwrap();

        let batch: Vec<Candle> = (0..5).rev().map(|i| candle("BTCUSDT", day(i), 100.0 + i as f64)).collect();
        assert_eq!(store.upsert(&batch).await.unwrap(), 5);

        let latest = store.latest("BTCUSDT", Timeframe::Days(1)).await.unwrap().unwrap();
        assert_eq!(latest.start, day(4));

        // Half-open and ascending
        let range = store.range("BTCUSDT", Timeframe::Days(1), day(1), day(3)).await.unwrap();
        let starts: Vec<_> = range.iter().map(|c| c.start).collect();
        assert_eq!(starts, vec![day(1), day(2)]);

        // Other timeframes and symbols are separate keys
        assert!(store.latest("BTCUSDT", Timeframe::Minutes(1)).await.unwrap().is_none());
        assert!(store.range("ETHUSDT", Timeframe::Days(1), day(0), day(5)).await.unwrap().is_empty());
        store.close().await;
    }

    #[tokio::test]
    async fn test_indicators_round_trip_missing_as_nan() {
        let temp_dir = tempdir().unwrap();
        let store = SQLiteCandleStore::new(temp_dir.path().join("test.db")).await.unwrap();

        let c = candle("BTCUSDT", day(0), 100.0);
        store.upsert(&[c.clone()]).await.unwrap();

        let fresh = store.latest("BTCUSDT", Timeframe::Days(1)).await.unwrap().unwrap();
        assert!(fresh.indicators.is_missing());

        let mut snapshot = IndicatorSnapshot::missing();
        snapshot.rsi = 61.5;
        snapshot.sma = 99.0;
        store.save_indicators(&c.key(), &snapshot).await.unwrap();

        let stored = store.latest("BTCUSDT", Timeframe::Days(1)).await.unwrap().unwrap();
        assert_eq!(stored.indicators.rsi, 61.5);
        assert_eq!(stored.indicators.sma, 99.0);
        assert!(stored.indicators.macd.macd.is_nan());
        assert!(stored.indicators.fibonacci.level_618.is_nan());

        // A later OHLCV overwrite keeps the indicator columns
        store.upsert(&[candle("BTCUSDT", day(0), 101.0)]).await.unwrap();
        let stored = store.latest("BTCUSDT", Timeframe::Days(1)).await.unwrap().unwrap();
        assert_eq!(stored.close, 101.0);
        assert_eq!(stored.indicators.rsi, 61.5);
        store.close().await;
    }

    #[tokio::test]
    async fn test_pairs() {
        let temp_dir = tempdir().unwrap();
        let store = SQLiteCandleStore::new(temp_dir.path().join("test.db")).await.unwrap();

        let minute = Candle::new("ETHUSDT", Timeframe::Minutes(5), day(0), 1.0, 1.0, 1.0, 1.0, 1.0);
        store.upsert(&[candle("BTCUSDT", day(0), 100.0), minute]).await.unwrap();

        let pairs = store.pairs().await.unwrap();
        assert_eq!(
            pairs,
            vec![
                ("BTCUSDT".to_string(), Timeframe::Days(1)),
                ("ETHUSDT".to_string(), Timeframe::Minutes(5)),
            ]
        );
        store.close().await;
    }

    #[tokio::test]
    async fn test_concurrent_writers_different_symbols() {
        let temp_dir = tempdir().unwrap();
        let store: SharedCandleStore =
            Arc::new(SQLiteCandleStore::new(temp_dir.path().join("test.db")).await.unwrap());

        let mut handles = Vec::new();
        for symbol in ["BTCUSDT", "ETHUSDT", "SOLUSDT"] {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..20 {
                    store.upsert(&[candle(symbol, day(i), 100.0)]).await.unwrap();
                    // Re-deliver the previous candle like a live feed does
                    store.upsert(&[candle(symbol, day(i), 101.0)]).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        for symbol in ["BTCUSDT", "ETHUSDT", "SOLUSDT"] {
            assert_eq!(store.count(symbol, Timeframe::Days(1)).await.unwrap(), 20);
        }
        store.close().await;
    }
}
