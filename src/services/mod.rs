pub mod bybit_rest;
pub mod bybit_ws;
pub mod database;
pub mod gap_reconciler;
pub mod health;
pub mod historical_fetcher;
pub mod indicator_pipeline;
pub mod snapshot;
pub mod stream_manager;

#[cfg(test)]
mod testing;

pub use bybit_rest::{BybitRestClient, KlineSource};
pub use database::{CandleStore, SQLiteCandleStore, SharedCandleStore};
pub use gap_reconciler::{GapInterval, GapReconciler, PassReport, ReconciliationWindow};
pub use health::{HealthMonitor, HealthStatus};
pub use historical_fetcher::{FetchOutcome, HistoricalFetcher};
pub use indicator_pipeline::IndicatorPipeline;
pub use snapshot::{MarketSnapshot, SnapshotPublisher};
pub use stream_manager::StreamManager;
