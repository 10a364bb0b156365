use crate::error::Result;
use crate::models::{SyncConfig, Timeframe};
use crate::services::database::SharedCandleStore;
use crate::services::gap_reconciler::{GapReconciler, PassReport};
use crate::services::health::HealthMonitor;
use crate::services::indicator_pipeline::IndicatorPipeline;
use crate::services::snapshot::{MarketSnapshot, SnapshotPublisher};
use crate::worker::symbol_stream::{self, ConnectionState, StreamContext, StreamOptions};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Owns one live connection task per symbol.
///
/// Tasks share the store, reconciler and snapshot channel through a
/// [`StreamContext`]; the registry here is the only place tasks are tracked.
pub struct StreamManager {
    ctx: StreamContext,
    registry: HashMap<String, JoinHandle<ConnectionState>>,
}

impl StreamManager {
    pub fn new(
        ws_url: impl Into<String>,
        store: SharedCandleStore,
        reconciler: Arc<GapReconciler>,
        cancel: CancellationToken,
    ) -> Self {
        let ctx = StreamContext {
            ws_url: ws_url.into(),
            health: HealthMonitor::new(store.clone()),
            pipeline: IndicatorPipeline::new(store.clone()),
            publisher: SnapshotPublisher::default(),
            options: StreamOptions::default(),
            store,
            reconciler,
            cancel,
        };
        Self {
            ctx,
            registry: HashMap::new(),
        }
    }

    pub fn with_options(mut self, options: StreamOptions) -> Self {
        self.ctx.options = options;
        self
    }

    pub fn with_pipeline(mut self, pipeline: IndicatorPipeline) -> Self {
        self.ctx.pipeline = pipeline;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MarketSnapshot> {
        self.ctx.publisher.subscribe()
    }

    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.registry.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    /// Bring every configured pair up to the current closed slot before
    /// going live
    pub async fn initial_load(&self, config: &SyncConfig) -> Result<PassReport> {
        let until = config.end.unwrap_or_else(Utc::now);
        let mut total = PassReport::default();

        for (symbol, timeframe) in config.pairs() {
            if self.ctx.cancel.is_cancelled() {
                break;
            }
            let report = self
                .ctx
                .reconciler
                .initial_load(&symbol, timeframe, config.start, until, config.batch_span(), None)
                .await?;
            if !report.is_closed() {
                warn!(
                    symbol = %symbol,
                    timeframe = %timeframe,
                    open_gaps = report.open_gaps,
                    "Initial load left gaps, live reconciliation will retry"
                );
            }
            total.merge(&report);
        }

        info!(
            expected = total.expected,
            filled = total.filled,
            open_gaps = total.open_gaps,
            "Initial load finished"
        );
        Ok(total)
    }

    /// Spawn the live task for `symbol`. Returns false if it is already running.
    pub fn start(&mut self, symbol: &str, timeframes: Vec<Timeframe>) -> bool {
        if self.registry.contains_key(symbol) {
            warn!(symbol = %symbol, "Symbol already streaming");
            return false;
        }
        let state = ConnectionState::new(symbol, timeframes);
        let handle = tokio::spawn(symbol_stream::run(self.ctx.clone(), state));
        self.registry.insert(symbol.to_string(), handle);
        true
    }

    /// Spawn one task per configured symbol
    pub fn start_all(&mut self, config: &SyncConfig) {
        for symbol in &config.symbols {
            self.start(symbol, config.timeframes.clone());
        }
        info!(symbols = ?self.symbols(), "Streams started");
    }

    /// Block until the shared token is cancelled, then shut down
    pub async fn run_until_cancelled(self) -> Vec<ConnectionState> {
        self.ctx.cancel.cancelled().await;
        self.shutdown().await
    }

    /// Cancel all tasks, wait for them and their in-flight passes, then
    /// close the store
    pub async fn shutdown(mut self) -> Vec<ConnectionState> {
        info!("Stopping streams");
        self.ctx.cancel.cancel();

        let mut states = Vec::new();
        for (symbol, handle) in self.registry.drain() {
            match handle.await {
                Ok(state) => states.push(state),
                Err(e) => error!(symbol = %symbol, "Symbol task failed: {}", e),
            }
        }

        self.ctx.store.close().await;
        info!(symbols = states.len(), "Stream manager stopped");
        states
    }
}
