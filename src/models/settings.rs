use crate::constants::{
    DEFAULT_BATCH_MINUTES, DEFAULT_CATEGORY, DEFAULT_DATABASE_PATH, DEFAULT_REST_URL,
    DEFAULT_WS_URL, MAX_BATCH_MINUTES,
};
use crate::error::{AppError, Result};
use crate::models::Timeframe;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use std::path::PathBuf;

/// Process-level settings read from the environment (after `.env` is loaded)
#[derive(Debug, Clone)]
pub struct Settings {
    /// SQLite file (`KLINESYNC_DB`)
    pub database_path: PathBuf,
    /// REST base URL (`BYBIT_REST_URL`)
    pub rest_url: String,
    /// Public stream URL (`BYBIT_WS_URL`)
    pub ws_url: String,
    /// Product category (`BYBIT_CATEGORY`)
    pub category: String,
    /// Carried through unused; public market data needs no credentials
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl Settings {
    /// Read settings from process environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key lookup, falling back to defaults
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            database_path: get("KLINESYNC_DB")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE_PATH)),
            rest_url: get("BYBIT_REST_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_REST_URL.to_string()),
            ws_url: get("BYBIT_WS_URL").unwrap_or_else(|| DEFAULT_WS_URL.to_string()),
            category: get("BYBIT_CATEGORY").unwrap_or_else(|| DEFAULT_CATEGORY.to_string()),
            api_key: get("BYBIT_API_KEY"),
            api_secret: get("BYBIT_API_SECRET"),
        }
    }
}

/// What to ingest and over which window
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Exchange symbols, e.g. BTCUSDT
    pub symbols: Vec<String>,

    /// Timeframes per symbol
    pub timeframes: Vec<Timeframe>,

    /// Initial-load start when the store has nothing for a pair
    pub start: DateTime<Utc>,

    /// Upper bound for one-shot runs; `None` means the current candle boundary
    pub end: Option<DateTime<Utc>>,

    /// Initial-load chunk size in minutes
    pub batch_minutes: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            symbols: vec!["BTCUSDT".to_string()],
            timeframes: vec![Timeframe::Minutes(1)],
            start: DateTime::<Utc>::UNIX_EPOCH,
            end: None,
            batch_minutes: DEFAULT_BATCH_MINUTES,
        }
    }
}

impl SyncConfig {
    /// Validate raw CLI values. Any failure here is a startup error.
    pub fn new(
        symbols: &str,
        timeframes: &str,
        start_date: &str,
        end_date: Option<&str>,
        batch_minutes: i64,
    ) -> Result<Self> {
        if batch_minutes <= 0 {
            return Err(AppError::Config(format!(
                "batch size must be positive, got {}",
                batch_minutes
            )));
        }
        if batch_minutes > MAX_BATCH_MINUTES {
            return Err(AppError::Config(format!(
                "batch size {} exceeds the {} minute limit",
                batch_minutes, MAX_BATCH_MINUTES
            )));
        }

        Ok(Self {
            symbols: parse_symbols(symbols)?,
            timeframes: Timeframe::parse_list(timeframes)?,
            start: parse_date(start_date)?,
            end: end_date.map(parse_date).transpose()?,
            batch_minutes,
        })
    }

    /// Initial-load chunk as a duration
    pub fn batch_span(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.batch_minutes)
    }

    /// Every (symbol, timeframe) pair in configuration order
    pub fn pairs(&self) -> Vec<(String, Timeframe)> {
        self.symbols
            .iter()
            .flat_map(|s| self.timeframes.iter().map(move |tf| (s.clone(), *tf)))
            .collect()
    }
}

/// Split a comma-separated symbol list, uppercased and deduplicated
pub fn parse_symbols(s: &str) -> Result<Vec<String>> {
    let mut symbols: Vec<String> = Vec::new();
    for sym in s.split(',').map(|p| p.trim().to_uppercase()).filter(|p| !p.is_empty()) {
        if !symbols.contains(&sym) {
            symbols.push(sym);
        }
    }
    if symbols.is_empty() {
        return Err(AppError::Config("no symbols given".to_string()));
    }
    Ok(symbols)
}

/// Parse `YYYY-MM-DD` (midnight UTC) or a full RFC 3339 timestamp
pub fn parse_date(s: &str) -> Result<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(date.and_time(NaiveTime::MIN).and_utc());
    }
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::Config(format!("invalid date '{}': {}", s, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap;

    #[test]
    fn test_settings_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.database_path, PathBuf::from("klines.db"));
        assert_eq!(settings.rest_url, "https://api.bybit.com");
        assert_eq!(settings.ws_url, "wss://stream.bybit.com/v5/public/linear");
        assert_eq!(settings.category, "linear");
        assert!(settings.api_key.is_none());
    }

    #[test]
    fn test_settings_from_lookup() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("KLINESYNC_DB", "/tmp/k.db"),
            ("BYBIT_REST_URL", "http://localhost:9000/"),
            ("BYBIT_API_KEY", "  "),
        ]);
        let settings = Settings::from_lookup(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(settings.database_path, PathBuf::from("/tmp/k.db"));
        assert_eq!(settings.rest_url, "http://localhost:9000");
        assert!(settings.api_key.is_none());
    }

    #[test]
    fn test_sync_config_new() {
        let config = SyncConfig::new("btcusdt, ETHUSDT,BTCUSDT", "1,5", "2024-07-01", None, 1440)
            .unwrap();
        assert_eq!(config.symbols, vec!["BTCUSDT", "ETHUSDT"]);
        assert_eq!(config.timeframes, vec![Timeframe::Minutes(1), Timeframe::Minutes(5)]);
        assert_eq!(config.start, Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap());
        assert_eq!(config.batch_span(), chrono::Duration::days(1));
        assert_eq!(config.pairs().len(), 4);
    }

    #[test]
    fn test_sync_config_rejects_bad_input() {
        assert!(SyncConfig::new("", "1", "2024-07-01", None, 1440).is_err());
        assert!(SyncConfig::new("BTCUSDT", "bogus", "2024-07-01", None, 1440).is_err());
        assert!(SyncConfig::new("BTCUSDT", "1", "07/01/2024", None, 1440).is_err());
        assert!(SyncConfig::new("BTCUSDT", "1", "2024-07-01", None, 0).is_err());
    }

    #[test]
    fn test_sync_config_bounds_batch_size() {
        let err = SyncConfig::new("BTCUSDT", "1", "2024-07-01", None, 999_999_999_999_999_999)
            .unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
        assert!(SyncConfig::new("BTCUSDT", "1", "2024-07-01", None, i64::MAX).is_err());

        let widest = SyncConfig::new("BTCUSDT", "1", "2024-07-01", None, MAX_BATCH_MINUTES).unwrap();
        assert_eq!(widest.batch_span(), chrono::Duration::days(10 * 366));
    }

    #[test]
    fn test_parse_date_rfc3339() {
        let dt = parse_date("2024-07-01T12:30:00+02:00").unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(2024, 7, 1, 10, 30, 0).unwrap());
    }
}
