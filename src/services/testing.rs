//! Test doubles shared by the service tests

use crate::error::{AppError, Result};
use crate::models::{Candle, Timeframe};
use crate::services::bybit_rest::KlineSource;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// One recorded `fetch_page` call
#[derive(Debug, Clone, PartialEq)]
pub struct PageCall {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

/// Kline source that records calls and serves a synthetic candle for every
/// grid slot in the requested window.
#[derive(Default)]
pub struct RecordingSource {
    calls: Mutex<Vec<PageCall>>,
    scripted_errors: Mutex<VecDeque<AppError>>,
    fail_all: AtomicBool,
    fail_after: Mutex<Option<usize>>,
    empty: AtomicBool,
}

impl RecordingSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an error for the next call
    pub fn fail_next(&self, err: AppError) {
        self.scripted_errors.lock().unwrap().push_back(err);
    }

    /// Every call fails with a network error
    pub fn fail_always(&self) {
        self.fail_all.store(true, Ordering::SeqCst);
    }

    /// Calls after the first `n` fail with a network error
    pub fn fail_after_calls(&self, n: usize) {
        *self.fail_after.lock().unwrap() = Some(n);
    }

    /// Every call succeeds with no rows
    pub fn return_empty(&self) {
        self.empty.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<PageCall> {
        self.calls.lock().unwrap().clone()
    }
}

/// Deterministic candle for a slot: close rises one unit per slot
pub fn synthetic_candle(symbol: &str, timeframe: Timeframe, start: DateTime<Utc>) -> Candle {
    let base = 100.0 + (start.timestamp() / 60 % 1000) as f64;
    Candle::new(symbol, timeframe, start, base, base + 2.0, base - 2.0, base + 1.0, 10.0)
}

#[async_trait]
impl KlineSource for RecordingSource {
    async fn fetch_page(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let call_index = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(PageCall {
                symbol: symbol.to_string(),
                timeframe,
                from,
                to,
            });
            calls.len() - 1
        };

        if let Some(err) = self.scripted_errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        let over_budget = self
            .fail_after
            .lock()
            .unwrap()
            .is_some_and(|n| call_index >= n);
        if self.fail_all.load(Ordering::SeqCst) || over_budget {
            return Err(AppError::Network("connection reset".to_string()));
        }
        if self.empty.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }

        Ok(timeframe
            .grid(from, to)
            .take(limit)
            .map(|start| synthetic_candle(symbol, timeframe, start))
            .collect())
    }
}
