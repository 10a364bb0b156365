//! Gap detection and backfill
//!
//! A pass over `(symbol, timeframe, [from, to))`:
//!
//! 1. **Scan** the stored open times in the window.
//! 2. **Diff** them against the timeframe grid; contiguous missing slots
//!    collapse into one interval.
//! 3. **Fill** each interval with one ranged fetch and upsert the result.
//!    An interval that comes back empty or incomplete stays open until the
//!    next pass.
//!
//! Reactive passes skip intervals that recently came back open until their
//! cooldown expires; full passes always retry them.
//!
//! Passes for the same pair never overlap. Running a pass twice over the same
//! window is harmless because the store overwrites on the natural key.

use crate::constants::{
    BATCH_DELAY_MS, GAP_RETRY_MAX_SECS, GAP_RETRY_MIN_SECS, RECONCILE_LOOKBACK_SLOTS,
};
use crate::error::{AppError, Result};
use crate::models::Timeframe;
use crate::services::database::SharedCandleStore;
use crate::services::historical_fetcher::HistoricalFetcher;
use chrono::{DateTime, Utc};
use indicatif::ProgressBar;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Contiguous run of missing slots, `[from, to)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GapInterval {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub slots: usize,
}

/// Scan result for one window; lives only for the duration of a pass
#[derive(Debug, Clone)]
pub struct ReconciliationWindow {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub expected: usize,
    pub missing: Vec<DateTime<Utc>>,
}

impl ReconciliationWindow {
    /// Coalesce missing slots into intervals
    pub fn gaps(&self) -> Vec<GapInterval> {
        let mut gaps: Vec<GapInterval> = Vec::new();
        for &slot in &self.missing {
            let slot_end = self.timeframe.next_start(slot);
            match gaps.last_mut() {
                Some(last) if last.to == slot => {
                    last.to = slot_end;
                    last.slots += 1;
                }
                _ => gaps.push(GapInterval {
                    from: slot,
                    to: slot_end,
                    slots: 1,
                }),
            }
        }
        gaps
    }
}

/// Counters for one or more passes
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PassReport {
    pub expected: usize,
    pub missing: usize,
    pub gaps: usize,
    pub filled: usize,
    pub open_gaps: usize,
    /// Open gaps not requested because they are cooling down
    pub deferred: usize,
    pub upserted: usize,
}

impl PassReport {
    pub fn is_closed(&self) -> bool {
        self.open_gaps == 0
    }

    pub fn merge(&mut self, other: &PassReport) {
        self.expected += other.expected;
        self.missing += other.missing;
        self.gaps += other.gaps;
        self.filled += other.filled;
        self.open_gaps += other.open_gaps;
        self.deferred += other.deferred;
        self.upserted += other.upserted;
    }

    /// Turn open gaps into a `PartialRange` error
    pub fn ensure_closed(&self, symbol: &str, timeframe: Timeframe) -> Result<()> {
        if self.is_closed() {
            Ok(())
        } else {
            Err(AppError::PartialRange(format!(
                "{}/{}: {} of {} gaps still open",
                symbol, timeframe, self.open_gaps, self.gaps
            )))
        }
    }
}

type PairLock = Arc<tokio::sync::Mutex<()>>;

/// Interval the exchange could not fill, with its next reactive retry time
#[derive(Debug, Clone, PartialEq, Eq)]
struct OpenGap {
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    failures: u32,
    retry_at: DateTime<Utc>,
}

impl OpenGap {
    fn overlaps(&self, gap: &GapInterval) -> bool {
        self.from < gap.to && gap.from < self.to
    }

    fn covers(&self, gap: &GapInterval) -> bool {
        self.from <= gap.from && gap.to <= self.to
    }
}

/// Wait before retrying an open gap: one slot, doubling per failure, clamped
fn retry_cooldown(timeframe: Timeframe, at: DateTime<Utc>, failures: u32) -> chrono::Duration {
    let slot = timeframe.duration_at(at).num_seconds();
    let base = slot.clamp(GAP_RETRY_MIN_SECS, GAP_RETRY_MAX_SECS);
    let factor = 1i64 << failures.saturating_sub(1).min(16);
    chrono::Duration::seconds(base.saturating_mul(factor).min(GAP_RETRY_MAX_SECS))
}

pub struct GapReconciler {
    store: SharedCandleStore,
    fetcher: HistoricalFetcher,
    locks: Mutex<HashMap<(String, Timeframe), PairLock>>,
    open_gaps: Mutex<HashMap<(String, Timeframe), Vec<OpenGap>>>,
    batch_delay: Duration,
    lookback_slots: i64,
    cancel: CancellationToken,
}

impl GapReconciler {
    pub fn new(store: SharedCandleStore, fetcher: HistoricalFetcher) -> Self {
        Self {
            store,
            fetcher,
            locks: Mutex::new(HashMap::new()),
            open_gaps: Mutex::new(HashMap::new()),
            batch_delay: Duration::from_millis(BATCH_DELAY_MS),
            lookback_slots: RECONCILE_LOOKBACK_SLOTS,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop batched runs and page fetches once `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.fetcher = self.fetcher.with_cancellation(token.clone());
        self.cancel = token;
        self
    }

    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = delay;
        self
    }

    pub fn with_lookback_slots(mut self, slots: i64) -> Self {
        self.lookback_slots = slots.max(1);
        self
    }

    fn lock_for(&self, symbol: &str, timeframe: Timeframe) -> PairLock {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry((symbol.to_string(), timeframe))
            .or_default()
            .clone()
    }

    /// Read the window and list missing grid slots
    pub async fn scan(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<ReconciliationWindow> {
        let present: HashSet<DateTime<Utc>> = self
            .store
            .range(symbol, timeframe, from, to)
            .await?
            .into_iter()
            .map(|c| c.start)
            .collect();

        let mut expected = 0;
        let mut missing = Vec::new();
        for slot in timeframe.grid(from, to) {
            expected += 1;
            if !present.contains(&slot) {
                missing.push(slot);
            }
        }

        Ok(ReconciliationWindow {
            symbol: symbol.to_string(),
            timeframe,
            from,
            to,
            expected,
            missing,
        })
    }

    /// Run a pass, waiting if another pass on the pair is in flight
    pub async fn reconcile(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<PassReport> {
        let lock = self.lock_for(symbol, timeframe);
        let _guard = lock.lock().await;
        self.run_pass(symbol, timeframe, from, to, None).await
    }

    /// Run a pass unless one is already in flight for the pair
    pub async fn try_reconcile(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<PassReport>> {
        self.try_pass(symbol, timeframe, from, to, None).await
    }

    /// Reactive pass over the most recent closed slots before `now`.
    ///
    /// Gaps that came back open on an earlier pass are skipped until their
    /// cooldown runs out at `now`.
    pub async fn reconcile_recent(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        now: DateTime<Utc>,
    ) -> Result<Option<PassReport>> {
        let (from, to) = self.recent_window(timeframe, now);
        self.try_pass(symbol, timeframe, from, to, Some(now)).await
    }

    async fn try_pass(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        cooldown_at: Option<DateTime<Utc>>,
    ) -> Result<Option<PassReport>> {
        let lock = self.lock_for(symbol, timeframe);
        let Ok(_guard) = lock.try_lock() else {
            debug!(symbol = %symbol, timeframe = %timeframe, "Reconciliation already running, skipping");
            return Ok(None);
        };
        self.run_pass(symbol, timeframe, from, to, cooldown_at).await.map(Some)
    }

    /// True while a recorded open interval covering `gap` is not yet due
    fn is_cooling(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        gap: &GapInterval,
        now: DateTime<Utc>,
    ) -> bool {
        let open = self.open_gaps.lock().unwrap_or_else(|e| e.into_inner());
        open.get(&(symbol.to_string(), timeframe))
            .map(|records| records.iter().any(|r| r.covers(gap) && r.retry_at > now))
            .unwrap_or(false)
    }

    /// Forget records inside `[from, to)` whose slots have since been filled
    fn forget_stale(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        current: &[GapInterval],
    ) {
        let mut open = self.open_gaps.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(records) = open.get_mut(&(symbol.to_string(), timeframe)) {
            records.retain(|r| {
                let in_window = r.from < to && from < r.to;
                !in_window || current.iter().any(|g| r.overlaps(g))
            });
        }
    }

    fn mark_open(&self, symbol: &str, timeframe: Timeframe, gap: &GapInterval, now: DateTime<Utc>) {
        let mut open = self.open_gaps.lock().unwrap_or_else(|e| e.into_inner());
        let records = open.entry((symbol.to_string(), timeframe)).or_default();
        let failures = records
            .iter()
            .filter(|r| r.overlaps(gap))
            .map(|r| r.failures)
            .max()
            .unwrap_or(0)
            + 1;
        records.retain(|r| !r.overlaps(gap));
        let retry_at = now + retry_cooldown(timeframe, gap.from, failures);
        debug!(
            symbol = %symbol,
            timeframe = %timeframe,
            from = %gap.from,
            to = %gap.to,
            failures = failures,
            retry_at = %retry_at,
            "Gap cooling down"
        );
        records.push(OpenGap {
            from: gap.from,
            to: gap.to,
            failures,
            retry_at,
        });
    }

    fn mark_closed(&self, symbol: &str, timeframe: Timeframe, gap: &GapInterval) {
        let mut open = self.open_gaps.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(records) = open.get_mut(&(symbol.to_string(), timeframe)) {
            records.retain(|r| !r.overlaps(gap));
        }
    }

    /// Closed-slot window used after startup and on every live update
    pub fn recent_window(&self, timeframe: Timeframe, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let to = timeframe.boundary_of(now);
        (timeframe.slots_before(to, self.lookback_slots), to)
    }

    /// Reconcile a large window in sequential sub-ranges of `batch` width.
    ///
    /// Each sub-range is its own locked pass. Cancellation is honoured between
    /// sub-ranges; the current one always finishes its writes.
    pub async fn reconcile_batched(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        batch: chrono::Duration,
        progress: Option<&ProgressBar>,
    ) -> Result<PassReport> {
        let ranges = batch_ranges(timeframe, from, to, batch);
        if let Some(pb) = progress {
            pb.set_length(ranges.len() as u64);
            pb.set_position(0);
        }

        let mut total = PassReport::default();
        for (i, (sub_from, sub_to)) in ranges.iter().enumerate() {
            if self.cancel.is_cancelled() {
                info!(
                    symbol = %symbol,
                    timeframe = %timeframe,
                    from = %sub_from,
                    "Batched reconciliation cancelled"
                );
                total.open_gaps += 1;
                break;
            }

            let report = self.reconcile(symbol, timeframe, *sub_from, *sub_to).await?;
            total.merge(&report);

            if let Some(pb) = progress {
                pb.set_message(format!("{} {}", symbol, sub_from.format("%Y-%m-%d %H:%M")));
                pb.inc(1);
            }

            let more = i + 1 < ranges.len();
            if more && report.gaps > 0 && !self.batch_delay.is_zero() {
                sleep(self.batch_delay).await;
            }
        }

        Ok(total)
    }

    /// Bring a pair up to `until`, resuming after the newest stored candle or
    /// starting at `default_start` when the pair is empty
    pub async fn initial_load(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        default_start: DateTime<Utc>,
        until: DateTime<Utc>,
        batch: chrono::Duration,
        progress: Option<&ProgressBar>,
    ) -> Result<PassReport> {
        let from = match self.store.latest(symbol, timeframe).await? {
            Some(latest) => timeframe.next_start(latest.start),
            None => timeframe.boundary_of(default_start),
        };
        let until = timeframe.boundary_of(until);

        if from >= until {
            debug!(symbol = %symbol, timeframe = %timeframe, "Already up to date");
            return Ok(PassReport::default());
        }

        info!(
            symbol = %symbol,
            timeframe = %timeframe,
            from = %from,
            to = %until,
            "Loading history"
        );
        self.reconcile_batched(symbol, timeframe, from, until, batch, progress)
            .await
    }

    async fn run_pass(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        cooldown_at: Option<DateTime<Utc>>,
    ) -> Result<PassReport> {
        let window = self.scan(symbol, timeframe, from, to).await?;
        let gaps = window.gaps();
        self.forget_stale(symbol, timeframe, from, to, &gaps);

        let mut report = PassReport {
            expected: window.expected,
            missing: window.missing.len(),
            gaps: gaps.len(),
            ..PassReport::default()
        };

        if gaps.is_empty() {
            debug!(
                symbol = %symbol,
                timeframe = %timeframe,
                from = %from,
                to = %to,
                expected = window.expected,
                "Window complete"
            );
            return Ok(report);
        }

        info!(
            symbol = %symbol,
            timeframe = %timeframe,
            from = %from,
            to = %to,
            missing = window.missing.len(),
            gaps = gaps.len(),
            "Filling gaps"
        );

        for gap in &gaps {
            if let Some(now) = cooldown_at {
                if self.is_cooling(symbol, timeframe, gap, now) {
                    report.open_gaps += 1;
                    report.deferred += 1;
                    continue;
                }
            }

            let outcome = self.fetcher.fetch(symbol, timeframe, gap.from, gap.to).await?;
            let now = cooldown_at.unwrap_or_else(Utc::now);

            if outcome.candles.is_empty() {
                warn!(
                    symbol = %symbol,
                    timeframe = %timeframe,
                    from = %gap.from,
                    to = %gap.to,
                    slots = gap.slots,
                    "Exchange returned no candles, gap left open"
                );
                report.open_gaps += 1;
                self.mark_open(symbol, timeframe, gap, now);
                continue;
            }

            report.upserted += self.store.upsert(&outcome.candles).await?;

            let fetched: HashSet<DateTime<Utc>> = outcome.candles.iter().map(|c| c.start).collect();
            let covered = timeframe
                .grid(gap.from, gap.to)
                .filter(|slot| fetched.contains(slot))
                .count();
            report.filled += covered;

            if !outcome.complete || covered < gap.slots {
                warn!(
                    symbol = %symbol,
                    timeframe = %timeframe,
                    from = %gap.from,
                    to = %gap.to,
                    covered = covered,
                    slots = gap.slots,
                    complete = outcome.complete,
                    "Gap only partly filled, will retry next pass"
                );
                report.open_gaps += 1;
                self.mark_open(symbol, timeframe, gap, now);
            } else {
                self.mark_closed(symbol, timeframe, gap);
            }
        }

        Ok(report)
    }
}

/// Split `[from, to)` into consecutive sub-ranges on candle boundaries, each
/// at least one candle and roughly `batch` wide
pub fn batch_ranges(
    timeframe: Timeframe,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    batch: chrono::Duration,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let mut ranges = Vec::new();
    let mut cursor = from;
    while cursor < to {
        let aligned = timeframe.boundary_of(cursor + batch);
        let end = aligned.max(timeframe.next_start(timeframe.boundary_of(cursor))).min(to);
        ranges.push((cursor, end));
        cursor = end;
    }
    ranges
}
