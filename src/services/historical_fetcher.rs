use crate::constants::{KLINE_PAGE_LIMIT, MAX_PAGE_RETRIES, PAGE_DELAY_MS};
use crate::error::{AppError, Result};
use crate::models::{Candle, Timeframe};
use crate::services::bybit_rest::KlineSource;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Result of a ranged fetch.
///
/// `complete == false` means at least one page was abandoned; `candles` then
/// covers only `[from, resume_from)` and callers must not treat the range as
/// fully covered.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub candles: Vec<Candle>,
    pub complete: bool,
    pub pages: usize,
    /// First open time not covered when incomplete
    pub resume_from: Option<DateTime<Utc>>,
}

/// Pages a kline source over an arbitrary range.
///
/// Pages are requested one after another, each spanning `page_limit` candles,
/// with a pause between them. A failing page is retried with backoff; after
/// the last attempt the fetch stops and reports what it has.
#[derive(Clone)]
pub struct HistoricalFetcher {
    source: Arc<dyn KlineSource>,
    page_limit: usize,
    page_delay: Duration,
    max_attempts: u32,
    backoff_unit: Duration,
    cancel: CancellationToken,
}

impl HistoricalFetcher {
    pub fn new(source: Arc<dyn KlineSource>) -> Self {
        Self {
            source,
            page_limit: KLINE_PAGE_LIMIT,
            page_delay: Duration::from_millis(PAGE_DELAY_MS),
            max_attempts: MAX_PAGE_RETRIES,
            backoff_unit: Duration::from_secs(1),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_page_limit(mut self, limit: usize) -> Self {
        self.page_limit = limit.max(1);
        self
    }

    pub fn with_page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = delay;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Scale of the retry backoff; zero disables sleeping between attempts
    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    /// Stop between pages once `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Fetch candles with `from <= start < to`, oldest first.
    ///
    /// Candles are not deduplicated against any store. Only an unsupported
    /// timeframe is returned as an error; every other failure yields an
    /// incomplete outcome.
    #[instrument(skip_all, fields(symbol = %symbol, timeframe = %timeframe))]
    pub async fn fetch(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<FetchOutcome> {
        let mut outcome = FetchOutcome {
            complete: true,
            ..FetchOutcome::default()
        };
        let mut cursor = from;

        while cursor < to {
            if self.cancel.is_cancelled() {
                info!(from = %cursor, "Fetch cancelled before next page");
                outcome.complete = false;
                outcome.resume_from = Some(cursor);
                break;
            }

            if outcome.pages > 0 && !self.page_delay.is_zero() {
                sleep(self.page_delay).await;
            }

            let page_end = timeframe
                .slots_after(cursor, self.page_limit as i64)
                .min(to);

            match self.fetch_page_with_retry(symbol, timeframe, cursor, page_end).await {
                Ok(mut page) => {
                    outcome.pages += 1;
                    debug!(
                        from = %cursor,
                        to = %page_end,
                        rows = page.len(),
                        "Fetched page"
                    );
                    outcome.candles.append(&mut page);
                }
                Err(AppError::UnsupportedTimeframe(label)) => {
                    return Err(AppError::UnsupportedTimeframe(label));
                }
                Err(e) => {
                    error!(
                        from = %cursor,
                        to = %to,
                        "Giving up on range, {} candles kept: {}",
                        outcome.candles.len(),
                        e
                    );
                    outcome.complete = false;
                    outcome.resume_from = Some(cursor);
                    break;
                }
            }

            cursor = page_end;
        }

        outcome.candles.sort_by_key(|c| c.start);
        Ok(outcome)
    }

    async fn fetch_page_with_retry(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .source
                .fetch_page(symbol, timeframe, from, to, self.page_limit)
                .await
            {
                Ok(candles) => return Ok(candles),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.backoff(&e, attempt);
                    warn!(
                        from = %from,
                        to = %to,
                        attempt = attempt,
                        max_attempts = self.max_attempts,
                        "Page failed, retrying in {:.1}s: {}",
                        delay.as_secs_f64(),
                        e
                    );
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = self.cancel.cancelled() => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Exponential backoff with jitter, capped at 60s
    fn backoff(&self, err: &AppError, attempt: u32) -> Duration {
        let unit = self.backoff_unit.as_secs_f64();
        let secs = (err.retry_delay(attempt).as_secs_f64() + rand::random::<f64>()) * unit;
        Duration::from_secs_f64(secs.min(60.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::RecordingSource;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap()
    }

    fn fetcher(source: Arc<RecordingSource>) -> HistoricalFetcher {
        HistoricalFetcher::new(source)
            .with_page_delay(Duration::ZERO)
            .with_backoff_unit(Duration::ZERO)
    }

    #[tokio::test]
    async fn test_pages_at_limit_times_duration() {
        let source = Arc::new(RecordingSource::new());
        let f = fetcher(source.clone());
        let to = t0() + ChronoDuration::minutes(2500);

        let outcome = f.fetch("BTCUSDT", Timeframe::Minutes(1), t0(), to).await.unwrap();

        assert!(outcome.complete);
        assert_eq!(outcome.pages, 3);
        assert_eq!(outcome.candles.len(), 2500);
        assert!(outcome.candles.windows(2).all(|w| w[0].start < w[1].start));

        let windows: Vec<_> = source.calls().iter().map(|c| (c.from, c.to)).collect();
        assert_eq!(
            windows,
            vec![
                (t0(), t0() + ChronoDuration::minutes(1000)),
                (t0() + ChronoDuration::minutes(1000), t0() + ChronoDuration::minutes(2000)),
                (t0() + ChronoDuration::minutes(2000), to),
            ]
        );
    }

    #[tokio::test]
    async fn test_transient_error_retries_same_page() {
        let source = Arc::new(RecordingSource::new());
        source.fail_next(AppError::Network("timeout".into()));
        source.fail_next(AppError::RateLimit("10006".into()));
        let f = fetcher(source.clone());

        let outcome = f
            .fetch("BTCUSDT", Timeframe::Days(1), t0(), t0() + ChronoDuration::days(3))
            .await
            .unwrap();

        assert!(outcome.complete);
        assert_eq!(outcome.candles.len(), 3);
        let calls = source.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|c| c.from == t0()));
    }

    #[tokio::test]
    async fn test_exhausted_retries_report_incomplete() {
        let source = Arc::new(RecordingSource::new());
        for _ in 0..3 {
            source.fail_next(AppError::Network("reset".into()));
        }
        let f = fetcher(source.clone()).with_page_limit(2).with_max_attempts(3);

        let outcome = f
            .fetch("BTCUSDT", Timeframe::Days(1), t0(), t0() + ChronoDuration::days(6))
            .await
            .unwrap();
        assert!(!outcome.complete);
        assert!(outcome.candles.is_empty());
        assert_eq!(outcome.resume_from, Some(t0()));
        assert_eq!(source.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_failure_mid_range_keeps_earlier_pages() {
        let source = Arc::new(RecordingSource::new());
        source.fail_after_calls(1);
        let f = fetcher(source.clone()).with_page_limit(2).with_max_attempts(2);

        let outcome = f
            .fetch("BTCUSDT", Timeframe::Days(1), t0(), t0() + ChronoDuration::days(6))
            .await
            .unwrap();

        assert!(!outcome.complete);
        assert_eq!(outcome.pages, 1);
        assert_eq!(outcome.candles.len(), 2);
        assert_eq!(outcome.resume_from, Some(t0() + ChronoDuration::days(2)));
        // One good page, then two attempts at the second
        assert_eq!(source.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_non_transient_error_is_not_retried() {
        let source = Arc::new(RecordingSource::new());
        source.fail_next(AppError::Other("retCode 10001".into()));
        let f = fetcher(source.clone());

        let outcome = f
            .fetch("BTCUSDT", Timeframe::Days(1), t0(), t0() + ChronoDuration::days(3))
            .await
            .unwrap();
        assert!(!outcome.complete);
        assert_eq!(source.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_unsupported_timeframe_is_an_error() {
        let source = Arc::new(RecordingSource::new());
        source.fail_next(AppError::UnsupportedTimeframe("7".into()));
        let f = fetcher(source);

        let result = f
            .fetch("BTCUSDT", Timeframe::Minutes(7), t0(), t0() + ChronoDuration::hours(1))
            .await;
        assert!(matches!(result, Err(AppError::UnsupportedTimeframe(_))));
    }

    #[tokio::test]
    async fn test_cancelled_fetch_stops_before_next_page() {
        let source = Arc::new(RecordingSource::new());
        let token = CancellationToken::new();
        token.cancel();
        let f = fetcher(source.clone()).with_cancellation(token);

        let outcome = f
            .fetch("BTCUSDT", Timeframe::Days(1), t0(), t0() + ChronoDuration::days(3))
            .await
            .unwrap();
        assert!(!outcome.complete);
        assert!(source.calls().is_empty());
    }

    #[tokio::test]
    async fn test_empty_window_makes_no_calls() {
        let source = Arc::new(RecordingSource::new());
        let f = fetcher(source.clone());
        let outcome = f.fetch("BTCUSDT", Timeframe::Days(1), t0(), t0()).await.unwrap();
        assert!(outcome.complete);
        assert!(source.calls().is_empty());
    }
}
