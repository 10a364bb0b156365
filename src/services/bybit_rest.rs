//! Bybit v5 market-data REST client
//!
//! Only the public kline endpoint is used:
//!
//! ```text
//! GET /v5/market/kline?category=linear&symbol=BTCUSDT&interval=5&start=..&end=..&limit=1000
//! ```
//!
//! Rows come back newest first as string arrays
//! `[start, open, high, low, close, volume, turnover]`; the client returns
//! them oldest first.

use crate::constants::HTTP_TIMEOUT_SECS;
use crate::error::{AppError, Result};
use crate::models::{Candle, Settings, Timeframe};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Bybit's "too many visits" return code
const RET_CODE_RATE_LIMIT: i64 = 10006;

/// Pull API for historical candles
#[async_trait]
pub trait KlineSource: Send + Sync {
    /// One page of candles with `from <= start < to`, at most `limit` rows, oldest first
    async fn fetch_page(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Candle>>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KlineResponse {
    ret_code: i64,
    #[serde(default)]
    ret_msg: String,
    #[serde(default)]
    result: Option<KlineResult>,
}

#[derive(Debug, Deserialize)]
struct KlineResult {
    #[serde(default)]
    list: Vec<Vec<String>>,
}

/// REST client for the kline endpoint
#[derive(Clone)]
pub struct BybitRestClient {
    client: Client,
    base_url: String,
    category: String,
}

impl BybitRestClient {
    pub fn new(base_url: impl Into<String>, category: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            category: category.into(),
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Self::new(settings.rest_url.clone(), settings.category.clone())
    }
}

#[async_trait]
impl KlineSource for BybitRestClient {
    async fn fetch_page(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let interval = timeframe.exchange_interval()?;
        let url = format!("{}/v5/market/kline", self.base_url);
        let start_ms = from.timestamp_millis().to_string();
        // The endpoint's `end` is inclusive
        let end_ms = (to.timestamp_millis() - 1).to_string();
        let limit = limit.to_string();

        debug!(
            symbol = %symbol,
            timeframe = %timeframe,
            from = %from,
            to = %to,
            "Requesting kline page"
        );

        let response = self
            .client
            .get(&url)
            .query(&[
                ("category", self.category.as_str()),
                ("symbol", symbol),
                ("interval", interval),
                ("start", start_ms.as_str()),
                ("end", end_ms.as_str()),
                ("limit", limit.as_str()),
            ])
            .send()
            .await
            .map_err(|e| AppError::Network(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AppError::RateLimit(format!("HTTP {}", status)));
        }
        if status.is_server_error() {
            return Err(AppError::Network(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            return Err(AppError::Other(format!("HTTP {}", status)));
        }

        let body = response
            .text()
            .await
            .map_err(|e| AppError::Network(e.to_string()))?;

        parse_kline_body(&body, symbol, timeframe, from, to)
    }
}

/// Decode a kline response body into ascending candles within `[from, to)`
pub fn parse_kline_body(
    body: &str,
    symbol: &str,
    timeframe: Timeframe,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<Candle>> {
    let response: KlineResponse = serde_json::from_str(body)?;

    match response.ret_code {
        0 => {}
        RET_CODE_RATE_LIMIT => return Err(AppError::RateLimit(response.ret_msg)),
        code => {
            return Err(AppError::Other(format!(
                "retCode {}: {}",
                code, response.ret_msg
            )))
        }
    }

    let rows = response.result.map(|r| r.list).unwrap_or_default();
    let mut candles = Vec::with_capacity(rows.len());
    for row in &rows {
        match parse_row(row, symbol, timeframe) {
            Ok(c) if c.start >= from && c.start < to => candles.push(c),
            Ok(_) => {}
            Err(e) => warn!(symbol = %symbol, timeframe = %timeframe, "Dropping kline row: {}", e),
        }
    }

    candles.sort_by_key(|c| c.start);
    candles.dedup_by_key(|c| c.start);
    Ok(candles)
}

fn parse_row(row: &[String], symbol: &str, timeframe: Timeframe) -> Result<Candle> {
    if row.len() < 6 {
        return Err(AppError::Decode(format!("expected 6+ cells, got {}", row.len())));
    }

    let num = |i: usize| -> Result<f64> {
        row[i]
            .parse::<f64>()
            .map_err(|e| AppError::Decode(format!("cell {} '{}': {}", i, row[i], e)))
    };

    let start_ms: i64 = row[0]
        .parse()
        .map_err(|e| AppError::Decode(format!("start '{}': {}", row[0], e)))?;
    let start = DateTime::<Utc>::from_timestamp_millis(start_ms)
        .ok_or_else(|| AppError::Decode(format!("start out of range: {}", start_ms)))?;

    Ok(Candle::new(
        symbol,
        timeframe,
        start,
        num(1)?,
        num(2)?,
        num(3)?,
        num(4)?,
        num(5)?,
    ))
}
