//! Live connection task for one symbol
//!
//! ```text
//! Disconnected -> Connecting -> Subscribed -> Receiving
//!                     ^                           |
//!                     +------- Reconnecting <-----+  (timeout, close, processing failure)
//! ```
//!
//! Each (re)connect first reconciles the recent window for every timeframe,
//! then opens a fresh socket and re-subscribes all of them. Only the shared
//! cancellation token ends the loop.

use crate::constants::{
    WS_MAX_RECONNECT_DELAY_SECS, WS_PING_INTERVAL_SECS, WS_READ_TIMEOUT_SECS,
    WS_RECONNECT_DELAY_SECS,
};
use crate::error::{AppError, Result};
use crate::models::{IndicatorSnapshot, Timeframe};
use crate::services::bybit_ws::{self, KlinePush, PushMessage};
use crate::services::database::SharedCandleStore;
use crate::services::gap_reconciler::GapReconciler;
use crate::services::health::HealthMonitor;
use crate::services::indicator_pipeline::IndicatorPipeline;
use crate::services::snapshot::{MarketSnapshot, SnapshotPublisher};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio::time::{sleep, sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Subscribed,
    Receiving,
    Reconnecting,
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionPhase::Disconnected => "disconnected",
            ConnectionPhase::Connecting => "connecting",
            ConnectionPhase::Subscribed => "subscribed",
            ConnectionPhase::Receiving => "receiving",
            ConnectionPhase::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// Per-symbol connection bookkeeping, owned by exactly one task
#[derive(Debug, Clone)]
pub struct ConnectionState {
    pub symbol: String,
    pub timeframes: Vec<Timeframe>,
    pub reconnect_attempts: u32,
    pub phase: ConnectionPhase,
}

impl ConnectionState {
    pub fn new(symbol: impl Into<String>, timeframes: Vec<Timeframe>) -> Self {
        Self {
            symbol: symbol.into(),
            timeframes,
            reconnect_attempts: 0,
            phase: ConnectionPhase::Disconnected,
        }
    }

    fn set_phase(&mut self, phase: ConnectionPhase) {
        debug!(symbol = %self.symbol, from = %self.phase, to = %phase, "Connection phase");
        self.phase = phase;
    }
}

/// Connection tuning
#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub read_timeout: Duration,
    pub ping_interval: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    /// Spawn a recent-window reconciliation after each update
    pub reactive_reconcile: bool,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(WS_READ_TIMEOUT_SECS),
            ping_interval: Duration::from_secs(WS_PING_INTERVAL_SECS),
            reconnect_delay: Duration::from_secs(WS_RECONNECT_DELAY_SECS),
            max_reconnect_delay: Duration::from_secs(WS_MAX_RECONNECT_DELAY_SECS),
            reactive_reconcile: true,
        }
    }
}

impl StreamOptions {
    /// Doubling delay from `reconnect_delay`, capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
        self.reconnect_delay
            .saturating_mul(factor)
            .min(self.max_reconnect_delay)
    }
}

/// Everything a symbol task shares with its siblings
#[derive(Clone)]
pub struct StreamContext {
    pub ws_url: String,
    pub store: SharedCandleStore,
    pub reconciler: Arc<GapReconciler>,
    pub health: HealthMonitor,
    pub pipeline: IndicatorPipeline,
    pub publisher: SnapshotPublisher,
    pub options: StreamOptions,
    pub cancel: CancellationToken,
}

enum Exit {
    Cancelled,
    Fault(String),
}

/// Drive one symbol until cancelled; returns the final state
#[instrument(skip_all, fields(symbol = %state.symbol))]
pub async fn run(ctx: StreamContext, mut state: ConnectionState) -> ConnectionState {
    info!(
        worker = "SymbolStream",
        timeframes = ?state.timeframes.iter().map(|t| t.label()).collect::<Vec<_>>(),
        "Starting symbol stream"
    );

    let mut reactive: JoinSet<()> = JoinSet::new();

    while !ctx.cancel.is_cancelled() {
        state.set_phase(ConnectionPhase::Connecting);
        catch_up(&ctx, &state).await;
        if ctx.cancel.is_cancelled() {
            break;
        }

        match connect(&ctx, &mut state).await {
            Ok((socket, topics)) => {
                state.reconnect_attempts = 0;
                match receive(&ctx, &mut state, socket, &topics, &mut reactive).await {
                    Exit::Cancelled => break,
                    Exit::Fault(reason) => {
                        warn!(symbol = %state.symbol, "Connection lost: {}", reason);
                    }
                }
            }
            Err(e) => {
                warn!(symbol = %state.symbol, attempt = state.reconnect_attempts + 1, "Connect failed: {}", e);
            }
        }

        if state.timeframes.is_empty() {
            error!(symbol = %state.symbol, "No subscribable timeframes left, stopping");
            break;
        }
        if ctx.cancel.is_cancelled() {
            break;
        }

        state.set_phase(ConnectionPhase::Reconnecting);
        state.reconnect_attempts += 1;
        let delay = ctx.options.backoff(state.reconnect_attempts);
        info!(
            symbol = %state.symbol,
            attempt = state.reconnect_attempts,
            "Reconnecting in {:.1}s",
            delay.as_secs_f64()
        );
        tokio::select! {
            _ = sleep(delay) => {}
            _ = ctx.cancel.cancelled() => break,
        }
    }

    // In-flight passes finish their writes before the task reports stopped
    while let Some(joined) = reactive.join_next().await {
        if let Err(e) = joined {
            warn!(symbol = %state.symbol, "Reconciliation task failed: {}", e);
        }
    }

    state.set_phase(ConnectionPhase::Disconnected);
    info!(worker = "SymbolStream", symbol = %state.symbol, "Symbol stream stopped");
    state
}

/// Blocking recent-window reconciliation before live consumption resumes
async fn catch_up(ctx: &StreamContext, state: &ConnectionState) {
    let now = Utc::now();
    for tf in &state.timeframes {
        let (from, to) = ctx.reconciler.recent_window(*tf, now);
        match ctx.reconciler.reconcile(&state.symbol, *tf, from, to).await {
            Ok(report) if !report.is_closed() => warn!(
                symbol = %state.symbol,
                timeframe = %tf,
                open_gaps = report.open_gaps,
                "Recent window still has gaps"
            ),
            Ok(report) => debug!(
                symbol = %state.symbol,
                timeframe = %tf,
                filled = report.filled,
                "Recent window reconciled"
            ),
            Err(e) => warn!(symbol = %state.symbol, timeframe = %tf, "Catch-up failed: {}", e),
        }
    }
}

/// Open a socket and send one subscribe per timeframe
async fn connect(
    ctx: &StreamContext,
    state: &mut ConnectionState,
) -> Result<(Socket, HashMap<String, Timeframe>)> {
    let (mut socket, _) = timeout(ctx.options.read_timeout, connect_async(ctx.ws_url.as_str()))
        .await
        .map_err(|_| AppError::Network("connect timed out".to_string()))??;

    let mut topics = HashMap::new();
    let mut unsupported = Vec::new();
    for tf in &state.timeframes {
        let request = match bybit_ws::subscribe_request(*tf, &state.symbol) {
            Ok(request) => request,
            Err(e) => {
                error!(symbol = %state.symbol, timeframe = %tf, "Cannot subscribe: {}", e);
                unsupported.push(*tf);
                continue;
            }
        };
        socket.send(Message::Text(request.into())).await?;
        topics.insert(bybit_ws::kline_topic(*tf, &state.symbol)?, *tf);
    }
    state.timeframes.retain(|tf| !unsupported.contains(tf));

    state.set_phase(ConnectionPhase::Subscribed);
    Ok((socket, topics))
}

async fn receive(
    ctx: &StreamContext,
    state: &mut ConnectionState,
    socket: Socket,
    topics: &HashMap<String, Timeframe>,
    reactive: &mut JoinSet<()>,
) -> Exit {
    let (mut write, mut read) = socket.split();
    let read_timeout = ctx.options.read_timeout;

    let mut ping = tokio::time::interval(ctx.options.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping.tick().await;

    let mut pending_acks: HashSet<String> = topics
        .values()
        .map(|tf| format!("{}.{}", tf, state.symbol))
        .collect();
    let mut deadline = Instant::now() + read_timeout;
    state.set_phase(ConnectionPhase::Receiving);

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return Exit::Cancelled;
            }
            Some(joined) = reactive.join_next(), if !reactive.is_empty() => {
                if let Err(e) = joined {
                    warn!(symbol = %state.symbol, "Reconciliation task failed: {}", e);
                }
            }
            _ = ping.tick() => {
                // Acks are due well before the first keep-alive
                let unacked = take_unacked(&mut pending_acks);
                if !unacked.is_empty() {
                    error!(symbol = %state.symbol, unacked = ?unacked, "Subscriptions never acknowledged");
                }
                if let Err(e) = write.send(Message::Text(bybit_ws::ping_request().into())).await {
                    return Exit::Fault(format!("ping failed: {}", e));
                }
            }
            _ = sleep_until(deadline) => {
                return Exit::Fault(format!("no message for {:.0}s", read_timeout.as_secs_f64()));
            }
            frame = read.next() => {
                deadline = Instant::now() + read_timeout;
                match frame {
                    None => return Exit::Fault("stream ended".to_string()),
                    Some(Err(e)) => return Exit::Fault(e.to_string()),
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = handle_text(ctx, &state.symbol, topics, &mut pending_acks, text.as_str(), reactive).await {
                            return Exit::Fault(format!("processing failed: {}", e));
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return Exit::Fault(format!("closed by server: {:?}", frame));
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

/// Malformed frames are dropped; store failures end the connection
async fn handle_text(
    ctx: &StreamContext,
    symbol: &str,
    topics: &HashMap<String, Timeframe>,
    pending_acks: &mut HashSet<String>,
    text: &str,
    reactive: &mut JoinSet<()>,
) -> Result<()> {
    let message = match bybit_ws::decode(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(symbol = %symbol, "Dropping malformed frame: {}", e);
            return Ok(());
        }
    };

    match message {
        PushMessage::SubscribeAck { success, ret_msg, req_id } => {
            if let Some(id) = req_id.as_ref() {
                pending_acks.remove(id);
            }
            if success {
                info!(symbol = %symbol, req_id = ?req_id, pending = pending_acks.len(), "Subscribed");
            } else {
                error!(symbol = %symbol, req_id = ?req_id, "Subscription rejected: {}", ret_msg);
            }
        }
        PushMessage::KlineUpdate { topic, klines, .. } => {
            let Some(tf) = topics.get(&topic).copied() else {
                debug!(symbol = %symbol, topic = %topic, "Push for unsubscribed topic");
                return Ok(());
            };
            for push in &klines {
                process_kline(ctx, symbol, tf, push, reactive).await?;
            }
        }
        PushMessage::Pong => {}
        PushMessage::Unknown(preview) => {
            debug!(symbol = %symbol, "Ignoring frame: {}", preview);
        }
    }
    Ok(())
}

/// Drain the req_ids still waiting for an ack, sorted. Each is reported once.
fn take_unacked(pending: &mut HashSet<String>) -> Vec<String> {
    let mut unacked: Vec<String> = pending.drain().collect();
    unacked.sort();
    unacked
}

/// Persist, check health, compute indicators, publish, then reconcile in the background
async fn process_kline(
    ctx: &StreamContext,
    symbol: &str,
    timeframe: Timeframe,
    push: &KlinePush,
    reactive: &mut JoinSet<()>,
) -> Result<()> {
    let mut candle = match push.to_candle(symbol, timeframe) {
        Ok(candle) => candle,
        Err(e) => {
            warn!(symbol = %symbol, timeframe = %timeframe, "Dropping kline: {}", e);
            return Ok(());
        }
    };

    ctx.store.upsert(std::slice::from_ref(&candle)).await?;

    let healthy = ctx.health.is_healthy(symbol, timeframe).await;
    let indicators = match ctx.pipeline.update(&candle).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!(symbol = %symbol, timeframe = %timeframe, "Indicator update failed: {}", e);
            IndicatorSnapshot::missing()
        }
    };
    candle.indicators = indicators;

    ctx.publisher.publish(MarketSnapshot {
        symbol: symbol.to_string(),
        timeframe,
        candle,
        confirmed: push.confirm,
        healthy,
        indicators,
        received_at: Utc::now(),
    });

    if ctx.options.reactive_reconcile {
        let reconciler = ctx.reconciler.clone();
        let symbol = symbol.to_string();
        reactive.spawn(async move {
            match reconciler.reconcile_recent(&symbol, timeframe, Utc::now()).await {
                Ok(Some(report)) if report.gaps > report.deferred => info!(
                    symbol = %symbol,
                    timeframe = %timeframe,
                    filled = report.filled,
                    open_gaps = report.open_gaps,
                    "Reactive reconciliation"
                ),
                Ok(_) => {}
                Err(e) => warn!(symbol = %symbol, timeframe = %timeframe, "Reactive reconciliation failed: {}", e),
            }
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let options = StreamOptions {
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_delay: Duration::from_secs(60),
            ..StreamOptions::default()
        };
        assert_eq!(options.backoff(1), Duration::from_secs(5));
        assert_eq!(options.backoff(2), Duration::from_secs(10));
        assert_eq!(options.backoff(4), Duration::from_secs(40));
        assert_eq!(options.backoff(5), Duration::from_secs(60));
        assert_eq!(options.backoff(1000), Duration::from_secs(60));
    }

    #[test]
    fn test_unacked_subscriptions_are_reported_once() {
        let mut pending: HashSet<String> = ["5.BTCUSDT", "1.BTCUSDT", "60.BTCUSDT"]
            .into_iter()
            .map(String::from)
            .collect();
        // The 1m ack arrived
        pending.remove("1.BTCUSDT");

        assert_eq!(take_unacked(&mut pending), vec!["5.BTCUSDT", "60.BTCUSDT"]);
        assert!(pending.is_empty());
        assert!(take_unacked(&mut pending).is_empty());
    }

    #[test]
    fn test_new_state_is_disconnected() {
        let state = ConnectionState::new("BTCUSDT", vec![Timeframe::Minutes(1)]);
        assert_eq!(state.phase, ConnectionPhase::Disconnected);
        assert_eq!(state.reconnect_attempts, 0);
        assert_eq!(state.phase.to_string(), "disconnected");
    }
}
