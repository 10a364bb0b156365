use crate::constants::SNAPSHOT_CHANNEL_CAPACITY;
use crate::models::{Candle, IndicatorSnapshot, Timeframe};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// Latest state of one pair, emitted after every live update
#[derive(Debug, Clone, Serialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub candle: Candle,
    pub confirmed: bool,
    pub healthy: bool,
    pub indicators: IndicatorSnapshot,
    pub received_at: DateTime<Utc>,
}

/// Fan-out of snapshots to any number of consumers.
///
/// Sending never waits; a consumer that falls behind by more than the channel
/// capacity sees `RecvError::Lagged` and skips ahead.
#[derive(Clone)]
pub struct SnapshotPublisher {
    tx: broadcast::Sender<MarketSnapshot>,
}

impl Default for SnapshotPublisher {
    fn default() -> Self {
        Self::new(SNAPSHOT_CHANNEL_CAPACITY)
    }
}

impl SnapshotPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MarketSnapshot> {
        self.tx.subscribe()
    }

    /// Returns the number of receivers reached; zero when nobody listens
    pub fn publish(&self, snapshot: MarketSnapshot) -> usize {
        self.tx.send(snapshot).unwrap_or(0)
    }
}
