use crate::constants::INDICATOR_WINDOW;
use crate::error::Result;
use crate::models::{Candle, IndicatorSnapshot};
use crate::services::database::SharedCandleStore;
use tracing::debug;

/// Computes indicators for a candle from its stored trailing window
#[derive(Clone)]
pub struct IndicatorPipeline {
    store: SharedCandleStore,
    window: usize,
}

impl IndicatorPipeline {
    pub fn new(store: SharedCandleStore) -> Self {
        Self {
            store,
            window: INDICATOR_WINDOW,
        }
    }

    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window.max(1);
        self
    }

    /// Load up to `window` candles ending at `candle` (inclusive), oldest first.
    ///
    /// The given candle replaces any stored row for the same open time, so a
    /// provisional update is measured with its latest prices.
    pub async fn trailing_window(&self, candle: &Candle) -> Result<Vec<Candle>> {
        let tf = candle.timeframe;
        let from = tf.slots_before(candle.start, self.window as i64 - 1);
        let to = tf.next_start(candle.start);

        let mut window = self.store.range(&candle.symbol, tf, from, to).await?;
        match window.last() {
            Some(last) if last.start == candle.start => {
                let idx = window.len() - 1;
                window[idx] = candle.clone();
            }
            _ => window.push(candle.clone()),
        }
        Ok(window)
    }

    /// Compute indicators for `candle` without writing them
    pub async fn compute_for(&self, candle: &Candle) -> Result<IndicatorSnapshot> {
        let window = self.trailing_window(candle).await?;
        Ok(compute_window(&window))
    }

    /// Compute and persist indicators for `candle`
    pub async fn update(&self, candle: &Candle) -> Result<IndicatorSnapshot> {
        let snapshot = self.compute_for(candle).await?;
        self.store.save_indicators(&candle.key(), &snapshot).await?;
        debug!(
            symbol = %candle.symbol,
            timeframe = %candle.timeframe,
            start = %candle.start,
            rsi = snapshot.rsi,
            "Indicators updated"
        );
        Ok(snapshot)
    }
}

/// Indicators at the newest candle of an ordered window
pub fn compute_window(candles: &[Candle]) -> IndicatorSnapshot {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let highs: Vec<f64> = candles.iter().map(|c| c.high).collect();
    let lows: Vec<f64> = candles.iter().map(|c| c.low).collect();
    IndicatorSnapshot::compute(&closes, &highs, &lows)
}
