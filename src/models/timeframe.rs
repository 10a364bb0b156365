use crate::error::{AppError, Result};
use chrono::{DateTime, Datelike, Duration, Months, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Candle width.
///
/// Minute and day widths are aligned to the Unix epoch in UTC. Weeks open on
/// Monday 00:00 UTC and months on the first calendar day, so a month candle is
/// exactly as long as that month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Timeframe {
    /// N-minute candles (hour labels are folded in, "4h" is 240 minutes)
    Minutes(u32),
    /// N-day candles
    Days(u32),
    /// Weekly candles
    Week,
    /// Calendar-month candles
    Month,
}

impl Timeframe {
    /// Parse a timeframe label.
    ///
    /// Accepts integer minutes ("1", "15"), suffixed minutes/hours/days
    /// ("1m", "4h", "1d"), and the calendar forms "1W"/"W" and "1M"/"M".
    /// Lowercase `m` is minutes, uppercase `M` is months.
    pub fn parse(label: &str) -> Result<Self> {
        let s = label.trim();
        let unsupported = || AppError::UnsupportedTimeframe(label.to_string());

        match s {
            "D" => return Ok(Timeframe::Days(1)),
            "W" => return Ok(Timeframe::Week),
            "M" => return Ok(Timeframe::Month),
            _ => {}
        }

        let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
        let (digits, unit) = s.split_at(split);
        let n: u32 = digits.parse().map_err(|_| unsupported())?;
        if n == 0 {
            return Err(unsupported());
        }

        match unit {
            "" | "m" | "min" => Ok(Timeframe::Minutes(n)),
            "h" | "H" => n.checked_mul(60).map(Timeframe::Minutes).ok_or_else(unsupported),
            "d" | "D" => Ok(Timeframe::Days(n)),
            "w" | "W" if n == 1 => Ok(Timeframe::Week),
            "M" if n == 1 => Ok(Timeframe::Month),
            _ => Err(unsupported()),
        }
    }

    /// Parse a comma-separated list, rejecting the whole list on the first bad label
    pub fn parse_list(s: &str) -> Result<Vec<Self>> {
        let mut out: Vec<Timeframe> = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let tf = Timeframe::parse(part)?;
            if !out.contains(&tf) {
                out.push(tf);
            }
        }
        if out.is_empty() {
            return Err(AppError::Config("no timeframes given".to_string()));
        }
        Ok(out)
    }

    /// Canonical label used as the store key
    pub fn label(&self) -> String {
        match self {
            Timeframe::Minutes(n) => n.to_string(),
            Timeframe::Days(n) => format!("{}d", n),
            Timeframe::Week => "1W".to_string(),
            Timeframe::Month => "1M".to_string(),
        }
    }

    /// Interval code for the exchange's kline endpoints
    pub fn exchange_interval(&self) -> Result<&'static str> {
        let code = match self {
            Timeframe::Minutes(1) => "1",
            Timeframe::Minutes(3) => "3",
            Timeframe::Minutes(5) => "5",
            Timeframe::Minutes(15) => "15",
            Timeframe::Minutes(30) => "30",
            Timeframe::Minutes(60) => "60",
            Timeframe::Minutes(120) => "120",
            Timeframe::Minutes(240) => "240",
            Timeframe::Minutes(360) => "360",
            Timeframe::Minutes(720) => "720",
            Timeframe::Days(1) => "D",
            Timeframe::Week => "W",
            Timeframe::Month => "M",
            other => return Err(AppError::UnsupportedTimeframe(other.label())),
        };
        Ok(code)
    }

    /// Fixed spacing between candles, `None` for calendar months
    pub fn fixed_duration(&self) -> Option<Duration> {
        match self {
            Timeframe::Minutes(n) => Some(Duration::minutes(i64::from(*n))),
            Timeframe::Days(n) => Some(Duration::days(i64::from(*n))),
            Timeframe::Week => Some(Duration::weeks(1)),
            Timeframe::Month => None,
        }
    }

    /// Length of the candle containing `at`
    pub fn duration_at(&self, at: DateTime<Utc>) -> Duration {
        let start = self.boundary_of(at);
        self.next_start(start) - start
    }

    /// Truncate `at` down to the open time of its candle
    pub fn boundary_of(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Timeframe::Minutes(_) | Timeframe::Days(_) => {
                let step = self.fixed_duration().map(|d| d.num_milliseconds()).unwrap_or(1);
                let ms = at.timestamp_millis();
                let floored = ms - ms.rem_euclid(step);
                Utc.timestamp_millis_opt(floored).single().unwrap_or(at)
            }
            Timeframe::Week => {
                let date = at.date_naive();
                let monday = date - Duration::days(i64::from(date.weekday().num_days_from_monday()));
                Utc.from_utc_datetime(&monday.and_time(NaiveTime::MIN))
            }
            Timeframe::Month => {
                let date = at.date_naive();
                let first = date.with_day(1).unwrap_or(date);
                Utc.from_utc_datetime(&first.and_time(NaiveTime::MIN))
            }
        }
    }

    /// Open time of the candle after the one opening at `start`
    pub fn next_start(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        match self.fixed_duration() {
            Some(step) => start + step,
            None => start
                .checked_add_months(Months::new(1))
                .unwrap_or(start + Duration::days(31)),
        }
    }

    /// Open time `n` candles before `start`
    pub fn slots_before(&self, start: DateTime<Utc>, n: i64) -> DateTime<Utc> {
        match self.fixed_duration() {
            Some(step) => start - step * (n as i32),
            None => start
                .checked_sub_months(Months::new(n.clamp(0, u32::MAX as i64) as u32))
                .unwrap_or(start),
        }
    }

    /// Open time `n` candles after `start`
    pub fn slots_after(&self, start: DateTime<Utc>, n: i64) -> DateTime<Utc> {
        match self.fixed_duration() {
            Some(step) => start + step * (n as i32),
            None => start
                .checked_add_months(Months::new(n.clamp(0, u32::MAX as i64) as u32))
                .unwrap_or(start),
        }
    }

    /// Expected open times in `[from, to)`
    pub fn grid(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Grid {
        let mut next = self.boundary_of(from);
        if next < from {
            next = self.next_start(next);
        }
        Grid { timeframe: *self, next, end: to }
    }
}

/// Iterator over candle open times in a half-open window
#[derive(Debug, Clone)]
pub struct Grid {
    timeframe: Timeframe,
    next: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl Iterator for Grid {
    type Item = DateTime<Utc>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }
        let current = self.next;
        self.next = self.timeframe.next_start(current);
        Some(current)
    }
}

/// Duration of the candle containing `at` for a raw label
pub fn duration(label: &str, at: DateTime<Utc>) -> Result<Duration> {
    Ok(Timeframe::parse(label)?.duration_at(at))
}

/// Candle open time containing `at` for a raw label
pub fn boundary_of(at: DateTime<Utc>, label: &str) -> Result<DateTime<Utc>> {
    Ok(Timeframe::parse(label)?.boundary_of(at))
}

impl FromStr for Timeframe {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        Timeframe::parse(s)
    }
}

impl TryFrom<String> for Timeframe {
    type Error = AppError;

    fn try_from(s: String) -> Result<Self> {
        Timeframe::parse(&s)
    }
}

impl From<Timeframe> for String {
    fn from(tf: Timeframe) -> Self {
        tf.label()
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl Default for Timeframe {
    fn default() -> Self {
        Timeframe::Minutes(1)
    }
}
