//! Bybit v5 public stream wire format
//!
//! Every inbound frame is classified into a [`PushMessage`] before any field
//! is read. Anything that is not a subscribe ack, a kline push or a pong is
//! `Unknown` and gets dropped by the caller.

use crate::error::{AppError, Result};
use crate::models::{Candle, Timeframe};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::json;

/// One kline entry inside a push frame
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct KlinePush {
    pub start: i64,
    #[serde(default)]
    pub end: i64,
    #[serde(default)]
    pub interval: String,
    #[serde(deserialize_with = "de_number")]
    pub open: f64,
    #[serde(deserialize_with = "de_number")]
    pub close: f64,
    #[serde(deserialize_with = "de_number")]
    pub high: f64,
    #[serde(deserialize_with = "de_number")]
    pub low: f64,
    #[serde(deserialize_with = "de_number")]
    pub volume: f64,
    /// True once the exchange has closed the candle
    #[serde(default)]
    pub confirm: bool,
    #[serde(default)]
    pub timestamp: i64,
}

impl KlinePush {
    pub fn to_candle(&self, symbol: &str, timeframe: Timeframe) -> Result<Candle> {
        let start = DateTime::<Utc>::from_timestamp_millis(self.start)
            .ok_or_else(|| AppError::Decode(format!("kline start out of range: {}", self.start)))?;
        Ok(Candle::new(
            symbol,
            timeframe,
            start,
            self.open,
            self.high,
            self.low,
            self.close,
            self.volume,
        ))
    }
}

/// Classified inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum PushMessage {
    SubscribeAck {
        success: bool,
        ret_msg: String,
        req_id: Option<String>,
    },
    KlineUpdate {
        topic: String,
        interval: String,
        symbol: String,
        klines: Vec<KlinePush>,
    },
    Pong,
    Unknown(String),
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    op: Option<String>,
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    ret_msg: Option<String>,
    #[serde(default)]
    req_id: Option<String>,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

/// Classify a text frame. Invalid JSON and malformed kline payloads are
/// `Decode` errors; well-formed frames of no interest are `Unknown`.
pub fn decode(text: &str) -> Result<PushMessage> {
    let envelope: Envelope = serde_json::from_str(text)?;

    if let Some(topic) = envelope.topic.as_deref() {
        if let Some((interval, symbol)) = parse_kline_topic(topic) {
            let data = envelope
                .data
                .ok_or_else(|| AppError::Decode(format!("{}: push without data", topic)))?;
            let klines: Vec<KlinePush> = serde_json::from_value(data)
                .map_err(|e| AppError::Decode(format!("{}: {}", topic, e)))?;
            return Ok(PushMessage::KlineUpdate {
                topic: topic.to_string(),
                interval: interval.to_string(),
                symbol: symbol.to_string(),
                klines,
            });
        }
    }

    match envelope.op.as_deref() {
        Some("subscribe") => Ok(PushMessage::SubscribeAck {
            success: envelope.success.unwrap_or(false),
            ret_msg: envelope.ret_msg.unwrap_or_default(),
            req_id: envelope.req_id.filter(|r| !r.is_empty()),
        }),
        Some("pong") | Some("ping") => Ok(PushMessage::Pong),
        _ => Ok(PushMessage::Unknown(preview(text))),
    }
}

/// `kline.<interval>.<symbol>` into its parts
pub fn parse_kline_topic(topic: &str) -> Option<(&str, &str)> {
    let rest = topic.strip_prefix("kline.")?;
    let (interval, symbol) = rest.split_once('.')?;
    if interval.is_empty() || symbol.is_empty() {
        return None;
    }
    Some((interval, symbol))
}

/// Stream topic for a pair
pub fn kline_topic(timeframe: Timeframe, symbol: &str) -> Result<String> {
    Ok(format!("kline.{}.{}", timeframe.exchange_interval()?, symbol))
}

/// Subscribe request for one pair; `req_id` echoes back in the ack
pub fn subscribe_request(timeframe: Timeframe, symbol: &str) -> Result<String> {
    let topic = kline_topic(timeframe, symbol)?;
    Ok(json!({
        "op": "subscribe",
        "req_id": format!("{}.{}", timeframe, symbol),
        "args": [topic],
    })
    .to_string())
}

pub fn ping_request() -> String {
    json!({ "op": "ping" }).to_string()
}

fn preview(text: &str) -> String {
    text.chars().take(200).collect()
}

/// Accept both `"123.4"` and `123.4`
fn de_number<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Number {
        Text(String),
        Float(f64),
    }

    match Number::deserialize(deserializer)? {
        Number::Float(v) => Ok(v),
        Number::Text(s) => s.parse::<f64>().map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KLINE_FRAME: &str = r#"{
        "topic": "kline.5.BTCUSDT",
        "data": [{
            "start": 1719792000000,
            "end": 1719792299999,
            "interval": "5",
            "open": "62000.5",
            "close": "62100",
            "high": "62150.1",
            "low": "61990",
            "volume": "12.345",
            "turnover": "765432.1",
            "confirm": false,
            "timestamp": 1719792123456
        }],
        "ts": 1719792123456,
        "type": "snapshot"
    }"#;

    #[test]
    fn test_decode_kline_update() {
        match decode(KLINE_FRAME).unwrap() {
            PushMessage::KlineUpdate { interval, symbol, klines, .. } => {
                assert_eq!(interval, "5");
                assert_eq!(symbol, "BTCUSDT");
                assert_eq!(klines.len(), 1);
                let k = &klines[0];
                assert!(!k.confirm);
                assert_eq!(k.open, 62000.5);
                assert_eq!(k.volume, 12.345);

                let candle = k.to_candle("BTCUSDT", Timeframe::Minutes(5)).unwrap();
                assert_eq!(candle.start.timestamp_millis(), 1719792000000);
                assert_eq!(candle.close, 62100.0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_control_frames() {
        let ok = r#"{"success":true,"ret_msg":"","conn_id":"abc","req_id":"5.BTCUSDT","op":"subscribe"}"#;
        assert_eq!(
            decode(ok).unwrap(),
            PushMessage::SubscribeAck {
                success: true,
                ret_msg: String::new(),
                req_id: Some("5.BTCUSDT".to_string()),
            }
        );

        let failed = r#"{"success":false,"ret_msg":"error:handler not found,topic:kline.7.BTCUSDT","conn_id":"abc","op":"subscribe"}"#;
        assert!(matches!(
            decode(failed).unwrap(),
            PushMessage::SubscribeAck { success: false, req_id: None, .. }
        ));

        let pong = r#"{"success":true,"ret_msg":"pong","conn_id":"abc","req_id":"","op":"ping"}"#;
        assert_eq!(decode(pong).unwrap(), PushMessage::Pong);

        let other = r#"{"topic":"tickers.BTCUSDT","data":{}}"#;
        assert!(matches!(decode(other).unwrap(), PushMessage::Unknown(_)));
    }

    #[test]
    fn test_decode_failures_are_decode_errors() {
        let cases = [
            "not json",
            r#"{"topic":"kline.5.BTCUSDT"}"#,
            r#"{"topic":"kline.5.BTCUSDT","data":[{"start":1,"open":"x","close":"1","high":"1","low":"1","volume":"1"}]}"#,
            r#"{"topic":"kline.5.BTCUSDT","data":{"start":1}}"#,
        ];
        for case in cases {
            assert!(matches!(decode(case), Err(AppError::Decode(_))), "{}", case);
        }
    }

    #[test]
    fn test_topic_helpers() {
        assert_eq!(parse_kline_topic("kline.D.ETHUSDT"), Some(("D", "ETHUSDT")));
        assert_eq!(parse_kline_topic("kline.5"), None);
        assert_eq!(parse_kline_topic("orderbook.1.BTCUSDT"), None);
        assert_eq!(kline_topic(Timeframe::Minutes(240), "BTCUSDT").unwrap(), "kline.240.BTCUSDT");
        assert!(kline_topic(Timeframe::Days(2), "BTCUSDT").is_err());
    }

    #[test]
    fn test_subscribe_request_shape() {
        let req = subscribe_request(Timeframe::Minutes(1), "BTCUSDT").unwrap();
        let v: serde_json::Value = serde_json::from_str(&req).unwrap();
        assert_eq!(v["op"], "subscribe");
        assert_eq!(v["args"][0], "kline.1.BTCUSDT");
        assert_eq!(v["req_id"], "1.BTCUSDT");

        let ping: serde_json::Value = serde_json::from_str(&ping_request()).unwrap();
        assert_eq!(ping["op"], "ping");
    }
}
