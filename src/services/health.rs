use crate::constants::HEALTH_BUFFER_SECS;
use crate::models::Timeframe;
use crate::services::database::SharedCandleStore;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::warn;

/// Freshness of one pair at a point in time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStatus {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub latest_start: Option<DateTime<Utc>>,
    pub age_secs: Option<i64>,
    pub healthy: bool,
}

/// Read-only "is the data current" check
#[derive(Clone)]
pub struct HealthMonitor {
    store: SharedCandleStore,
    buffer: Duration,
}

impl HealthMonitor {
    pub fn new(store: SharedCandleStore) -> Self {
        Self {
            store,
            buffer: Duration::seconds(HEALTH_BUFFER_SECS),
        }
    }

    pub fn with_buffer(mut self, buffer: Duration) -> Self {
        self.buffer = buffer;
        self
    }

    pub async fn is_healthy(&self, symbol: &str, timeframe: Timeframe) -> bool {
        self.check(symbol, timeframe, Utc::now()).await.healthy
    }

    /// Store errors count as unhealthy
    pub async fn check(&self, symbol: &str, timeframe: Timeframe, now: DateTime<Utc>) -> HealthStatus {
        let latest = match self.store.latest(symbol, timeframe).await {
            Ok(latest) => latest,
            Err(e) => {
                warn!(symbol = %symbol, timeframe = %timeframe, "Health check could not read store: {}", e);
                None
            }
        };

        let latest_start = latest.map(|c| c.start);
        HealthStatus {
            symbol: symbol.to_string(),
            timeframe,
            latest_start,
            age_secs: latest_start.map(|s| (now - s).num_seconds()),
            healthy: latest_start
                .map(|s| is_fresh(timeframe, s, now, self.buffer))
                .unwrap_or(false),
        }
    }
}

/// `now - latest_start <= duration + buffer`
pub fn is_fresh(timeframe: Timeframe, latest_start: DateTime<Utc>, now: DateTime<Utc>, buffer: Duration) -> bool {
    now - latest_start <= timeframe.duration_at(latest_start) + buffer
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Candle;
    use crate::services::database::SQLiteCandleStore;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 1, h, m, s).unwrap()
    }

    #[test]
    fn test_is_fresh_boundaries() {
        let buffer = Duration::minutes(2);
        let tf = Timeframe::Minutes(5);
        let start = at(10, 0, 0);

        assert!(is_fresh(tf, start, at(10, 3, 0), buffer));
        assert!(is_fresh(tf, start, at(10, 7, 0), buffer));
        assert!(!is_fresh(tf, start, at(10, 7, 1), buffer));
    }

    #[test]
    fn test_month_freshness_uses_calendar_length() {
        let start = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let buffer = Duration::minutes(2);
        // February 2024 has 29 days
        assert!(is_fresh(Timeframe::Month, start, start + Duration::days(29), buffer));
        assert!(!is_fresh(Timeframe::Month, start, start + Duration::days(30), buffer));
    }

    #[tokio::test]
    async fn test_check_against_store() {
        let dir = tempfile::tempdir().unwrap();
        let store: SharedCandleStore =
            Arc::new(SQLiteCandleStore::new(dir.path().join("test.db")).await.unwrap());
        let monitor = HealthMonitor::new(store.clone());
        let tf = Timeframe::Minutes(1);

        // No data at all
        let empty = monitor.check("BTCUSDT", tf, at(10, 0, 0)).await;
        assert!(!empty.healthy);
        assert_eq!(empty.latest_start, None);

        store
            .upsert(&[Candle::new("BTCUSDT", tf, at(10, 0, 0), 1.0, 1.0, 1.0, 1.0, 1.0)])
            .await
            .unwrap();

        let fresh = monitor.check("BTCUSDT", tf, at(10, 2, 30)).await;
        assert!(fresh.healthy);
        assert_eq!(fresh.age_secs, Some(150));

        let stale = monitor.check("BTCUSDT", tf, at(10, 5, 0)).await;
        assert!(!stale.healthy);

        // Checking never writes
        assert_eq!(store.count("BTCUSDT", tf).await.unwrap(), 1);
    }
}
