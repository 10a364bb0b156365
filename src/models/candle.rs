use crate::models::indicators::IndicatorSnapshot;
use crate::models::Timeframe;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Natural key of a candle. The store holds at most one row per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CandleKey {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub start: DateTime<Utc>,
}

impl fmt::Display for CandleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.symbol, self.timeframe, self.start.to_rfc3339())
    }
}

/// One OHLCV bucket. `start` is the UTC open time on the timeframe boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub start: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// All NaN until computed
    #[serde(default)]
    pub indicators: IndicatorSnapshot,
}

impl Candle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: impl Into<String>,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
            start: timeframe.boundary_of(start),
            open,
            high,
            low,
            close,
            volume,
            indicators: IndicatorSnapshot::missing(),
        }
    }

    pub fn key(&self) -> CandleKey {
        CandleKey {
            symbol: self.symbol.clone(),
            timeframe: self.timeframe,
            start: self.start,
        }
    }

    /// Open time in epoch milliseconds, the stored `datetime` column
    pub fn start_ms(&self) -> i64 {
        self.start.timestamp_millis()
    }

    /// True when every OHLC value is finite and high/low bound open and close
    pub fn is_well_formed(&self) -> bool {
        let prices = [self.open, self.high, self.low, self.close, self.volume];
        prices.iter().all(|v| v.is_finite())
            && self.high >= self.low
            && self.high >= self.open.max(self.close)
            && self.low <= self.open.min(self.close)
    }
}
