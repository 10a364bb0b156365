//! Technical indicators over an ordered window of candles
//!
//! # Missing values
//! Every indicator reports `f64::NAN` when the window is shorter than its
//! lookback. NaN is the only "missing" marker: the store writes it as SQL
//! NULL and reads NULL back as NaN, and JSON output renders it as `null`.
//! Never substitute zero for a missing value.
//!
//! # Window order
//! Inputs are oldest first. Functions returning a single value report the
//! indicator at the newest element.

use crate::constants::{
    BOLLINGER_PERIOD, BOLLINGER_STD_DEV, FIB_RATIOS, MACD_FAST, MACD_SIGNAL, MACD_SLOW,
    RSI_PERIOD, SMA_PERIOD,
};
use serde::{Deserialize, Serialize};

/// MACD line, signal line and histogram at the newest candle
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Macd {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Bollinger bands at the newest candle
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bollinger {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

/// Retracement levels between the window's lowest low and highest high
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fibonacci {
    pub level_0: f64,
    pub level_236: f64,
    pub level_382: f64,
    pub level_500: f64,
    pub level_618: f64,
    pub level_1000: f64,
}

impl Fibonacci {
    pub fn levels(&self) -> [f64; 6] {
        [
            self.level_0,
            self.level_236,
            self.level_382,
            self.level_500,
            self.level_618,
            self.level_1000,
        ]
    }

    pub fn from_levels(levels: [f64; 6]) -> Self {
        Self {
            level_0: levels[0],
            level_236: levels[1],
            level_382: levels[2],
            level_500: levels[3],
            level_618: levels[4],
            level_1000: levels[5],
        }
    }
}

/// All indicators for one candle
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub rsi: f64,
    pub macd: Macd,
    pub bollinger: Bollinger,
    pub sma: f64,
    pub fibonacci: Fibonacci,
}

impl IndicatorSnapshot {
    /// Snapshot with every value missing
    pub fn missing() -> Self {
        Self {
            rsi: f64::NAN,
            macd: Macd {
                macd: f64::NAN,
                signal: f64::NAN,
                histogram: f64::NAN,
            },
            bollinger: Bollinger {
                upper: f64::NAN,
                middle: f64::NAN,
                lower: f64::NAN,
            },
            sma: f64::NAN,
            fibonacci: Fibonacci::from_levels([f64::NAN; 6]),
        }
    }

    /// Compute every indicator from parallel close/high/low series
    pub fn compute(closes: &[f64], highs: &[f64], lows: &[f64]) -> Self {
        let sma = calculate_sma(closes, SMA_PERIOD)
            .last()
            .copied()
            .unwrap_or(f64::NAN);

        Self {
            rsi: calculate_rsi(closes, RSI_PERIOD),
            macd: calculate_macd(closes, MACD_FAST, MACD_SLOW, MACD_SIGNAL),
            bollinger: calculate_bollinger(closes, BOLLINGER_PERIOD, BOLLINGER_STD_DEV),
            sma,
            fibonacci: calculate_fibonacci(highs, lows),
        }
    }

    /// True when no indicator could be computed
    pub fn is_missing(&self) -> bool {
        self.rsi.is_nan()
            && self.macd.macd.is_nan()
            && self.bollinger.middle.is_nan()
            && self.sma.is_nan()
            && self.fibonacci.levels().iter().all(|v| v.is_nan())
    }
}

impl Default for IndicatorSnapshot {
    fn default() -> Self {
        Self::missing()
    }
}

/// Calculate Simple Moving Average for a given period
///
/// # Arguments
/// * `closes` - Closing prices, oldest first
/// * `period` - Period for the moving average (e.g., 20)
///
/// # Returns
/// * Vector aligned with `closes`; entries before the first full window are NaN
pub fn calculate_sma(closes: &[f64], period: usize) -> Vec<f64> {
    let mut ma_values = vec![f64::NAN; closes.len()];

    if period == 0 || closes.len() < period {
        return ma_values;
    }

    for i in (period - 1)..closes.len() {
        let start_idx = i + 1 - period;
        let sum: f64 = closes[start_idx..=i].iter().sum();
        ma_values[i] = sum / period as f64;
    }

    ma_values
}

/// Calculate Exponential Moving Average
///
/// Leading NaNs in `values` are skipped, so the EMA of a series that is itself
/// still warming up (such as the MACD line) starts once `period` real values
/// exist. The first EMA value is seeded with their simple mean.
pub fn calculate_ema(values: &[f64], period: usize) -> Vec<f64> {
    let mut ema = vec![f64::NAN; values.len()];
    if period == 0 {
        return ema;
    }

    let offset = match values.iter().position(|v| !v.is_nan()) {
        Some(i) => i,
        None => return ema,
    };
    if values.len() - offset < period {
        return ema;
    }

    let seed_end = offset + period - 1;
    let seed: f64 = values[offset..=seed_end].iter().sum::<f64>() / period as f64;
    ema[seed_end] = seed;

    let k = 2.0 / (period as f64 + 1.0);
    let mut prev = seed;
    for i in (seed_end + 1)..values.len() {
        prev = values[i] * k + prev * (1.0 - k);
        ema[i] = prev;
    }

    ema
}

/// Wilder's Relative Strength Index at the newest close
///
/// Returns NaN when fewer than `period` closes are given. The averages are
/// seeded over the first `period` price changes (or all of them when the
/// window holds exactly `period` closes) and smoothed with `1/period` after.
pub fn calculate_rsi(closes: &[f64], period: usize) -> f64 {
    if period == 0 || closes.len() < period {
        return f64::NAN;
    }

    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
    let seed = period.min(deltas.len());
    if seed == 0 {
        return f64::NAN;
    }

    let mut avg_gain = deltas[..seed].iter().map(|d| d.max(0.0)).sum::<f64>() / seed as f64;
    let mut avg_loss = deltas[..seed].iter().map(|d| (-d).max(0.0)).sum::<f64>() / seed as f64;

    let p = period as f64;
    for d in &deltas[seed..] {
        avg_gain = (avg_gain * (p - 1.0) + d.max(0.0)) / p;
        avg_loss = (avg_loss * (p - 1.0) + (-d).max(0.0)) / p;
    }

    if avg_loss == 0.0 {
        return if avg_gain == 0.0 { 50.0 } else { 100.0 };
    }

    let rs = avg_gain / avg_loss;
    100.0 - 100.0 / (1.0 + rs)
}

/// MACD(fast, slow, signal) at the newest close
pub fn calculate_macd(closes: &[f64], fast: usize, slow: usize, signal: usize) -> Macd {
    let fast_ema = calculate_ema(closes, fast);
    let slow_ema = calculate_ema(closes, slow);

    let line: Vec<f64> = fast_ema
        .iter()
        .zip(&slow_ema)
        .map(|(f, s)| f - s)
        .collect();
    let signal_line = calculate_ema(&line, signal);

    let macd = line.last().copied().unwrap_or(f64::NAN);
    let signal = signal_line.last().copied().unwrap_or(f64::NAN);

    Macd {
        macd,
        signal,
        histogram: macd - signal,
    }
}

/// Bollinger bands: SMA(period) ± k population standard deviations
pub fn calculate_bollinger(closes: &[f64], period: usize, k: f64) -> Bollinger {
    if period == 0 || closes.len() < period {
        return Bollinger {
            upper: f64::NAN,
            middle: f64::NAN,
            lower: f64::NAN,
        };
    }

    let window = &closes[closes.len() - period..];
    let mean = window.iter().sum::<f64>() / period as f64;
    let variance = window.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / period as f64;
    let std_dev = variance.sqrt();

    Bollinger {
        upper: mean + k * std_dev,
        middle: mean,
        lower: mean - k * std_dev,
    }
}

/// Fibonacci retracement levels from the window's max high and min low
///
/// Level 0% sits at the high and 100% at the low.
pub fn calculate_fibonacci(highs: &[f64], lows: &[f64]) -> Fibonacci {
    let high = highs.iter().copied().filter(|v| !v.is_nan()).fold(f64::NAN, f64::max);
    let low = lows.iter().copied().filter(|v| !v.is_nan()).fold(f64::NAN, f64::min);

    let range = high - low;
    let mut levels = [f64::NAN; 6];
    for (level, ratio) in levels.iter_mut().zip(FIB_RATIOS) {
        *level = high - range * ratio;
    }
    Fibonacci::from_levels(levels)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_calculate_sma() {
        let closes = vec![10.0, 11.0, 12.0, 13.0, 14.0, 15.0];
        let ma3 = calculate_sma(&closes, 3);

        assert!(ma3[0].is_nan()); // Not enough data
        assert!(ma3[1].is_nan()); // Not enough data
        assert_eq!(ma3[2], 11.0); // (10+11+12)/3
        assert_eq!(ma3[3], 12.0); // (11+12+13)/3
        assert_eq!(ma3[4], 13.0); // (12+13+14)/3
        assert_eq!(ma3[5], 14.0); // (13+14+15)/3
    }

    #[test]
    fn test_rsi_warmup() {
        let short: Vec<f64> = (1..=13).map(f64::from).collect();
        assert!(calculate_rsi(&short, 14).is_nan());
        assert!(calculate_rsi(&[], 14).is_nan());

        let rising: Vec<f64> = (1..=14).map(f64::from).collect();
        let rsi = calculate_rsi(&rising, 14);
        assert!(rsi > 50.0, "rsi = {}", rsi);
    }

    #[test]
    fn test_rsi_bounds() {
        let falling: Vec<f64> = (1..=30).rev().map(f64::from).collect();
        assert_eq!(calculate_rsi(&falling, 14), 0.0);

        let flat = vec![100.0; 20];
        assert_eq!(calculate_rsi(&flat, 14), 50.0);

        let zigzag: Vec<f64> = (0..40)
            .map(|i| if i % 2 == 0 { 100.0 } else { 101.0 })
            .collect();
        let rsi = calculate_rsi(&zigzag, 14);
        assert!(rsi > 40.0 && rsi < 60.0, "rsi = {}", rsi);
    }

    #[test]
    fn test_ema_seeds_with_mean() {
        let values = vec![1.0, 2.0, 3.0, 4.0];
        let ema = calculate_ema(&values, 3);
        assert!(ema[0].is_nan() && ema[1].is_nan());
        assert!(approx(ema[2], 2.0));
        // k = 0.5: 4 * 0.5 + 2 * 0.5
        assert!(approx(ema[3], 3.0));
    }

    #[test]
    fn test_ema_skips_leading_nan() {
        let values = vec![f64::NAN, f64::NAN, 2.0, 4.0];
        let ema = calculate_ema(&values, 2);
        assert!(ema[2].is_nan());
        assert!(approx(ema[3], 3.0));
    }

    #[test]
    fn test_macd_warmup_and_sign() {
        let short: Vec<f64> = (1..=25).map(f64::from).collect();
        let m = calculate_macd(&short, 12, 26, 9);
        assert!(m.macd.is_nan() && m.signal.is_nan() && m.histogram.is_nan());

        // Line exists at 26 closes, signal needs 8 more
        let line_only: Vec<f64> = (1..=26).map(f64::from).collect();
        let m = calculate_macd(&line_only, 12, 26, 9);
        assert!(m.macd > 0.0);
        assert!(m.signal.is_nan());

        let rising: Vec<f64> = (1..=60).map(|i| f64::from(i) * 1.5).collect();
        let m = calculate_macd(&rising, 12, 26, 9);
        assert!(m.macd > 0.0);
        assert!(!m.signal.is_nan());
        assert!(approx(m.histogram, m.macd - m.signal));
    }

    #[test]
    fn test_bollinger() {
        let flat = vec![10.0; 20];
        let b = calculate_bollinger(&flat, 20, 2.0);
        assert_eq!((b.upper, b.middle, b.lower), (10.0, 10.0, 10.0));

        // mean 5, population std 2
        let closes = vec![2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let b = calculate_bollinger(&closes, 8, 2.0);
        assert!(approx(b.middle, 5.0));
        assert!(approx(b.upper, 9.0));
        assert!(approx(b.lower, 1.0));

        assert!(calculate_bollinger(&closes, 20, 2.0).middle.is_nan());
    }

    #[test]
    fn test_fibonacci_levels() {
        let highs = vec![110.0, 120.0, 115.0];
        let lows = vec![100.0, 105.0, 102.0];
        let fib = calculate_fibonacci(&highs, &lows);

        assert!(approx(fib.level_0, 120.0));
        assert!(approx(fib.level_500, 110.0));
        assert!(approx(fib.level_618, 120.0 - 20.0 * 0.618));
        assert!(approx(fib.level_1000, 100.0));

        let empty = calculate_fibonacci(&[], &[]);
        assert!(empty.levels().iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_snapshot_short_window_is_missing_not_zero() {
        let closes = vec![100.0, 101.0, 102.0];
        let snap = IndicatorSnapshot::compute(&closes, &closes, &closes);
        assert!(snap.rsi.is_nan());
        assert!(snap.sma.is_nan());
        assert!(snap.macd.macd.is_nan());
        assert!(snap.bollinger.middle.is_nan());
        // Fibonacci needs only one candle
        assert!(approx(snap.fibonacci.level_0, 102.0));
        assert!(!snap.is_missing());
        assert!(IndicatorSnapshot::missing().is_missing());
    }
}
