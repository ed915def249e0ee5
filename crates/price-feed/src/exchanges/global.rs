//! Global USDT venue (Bitget-style v2 spot API)

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use kimp_core::{
    now_ms, Candle, ExchangeKind, InstrumentQuote, PriceFeedError, PriceFeedResult, SourceKind,
};

use super::{change_from_open, de_f64, de_opt_f64};
use crate::candles::CandleSource;
use crate::codec::{Inbound, WireCodec};
use crate::http::get_json;
use crate::poller::TickerSource;

const TICKERS_PATH: &str = "/api/v2/spot/market/tickers";
const CANDLES_PATH: &str = "/api/v2/spot/market/candles";
const SUCCESS_CODE: &str = "00000";
const SUBSCRIBE_CHUNK: usize = 30;

/// Ticker as sent by both the REST endpoint (`symbol`, `open`) and the push
/// channel (`instId`, `open24h`)
#[derive(Debug, Deserialize)]
struct RawGlobalTicker {
    #[serde(alias = "instId")]
    symbol: String,
    #[serde(rename = "lastPrice", alias = "lastPr", deserialize_with = "de_f64")]
    last_price: f64,
    #[serde(default, alias = "open24h", deserialize_with = "de_opt_f64")]
    open: Option<f64>,
    #[serde(default, rename = "high24h", deserialize_with = "de_opt_f64")]
    high_24h: Option<f64>,
    #[serde(default, rename = "low24h", deserialize_with = "de_opt_f64")]
    low_24h: Option<f64>,
    #[serde(default, rename = "baseVolume", deserialize_with = "de_opt_f64")]
    base_volume: Option<f64>,
    #[serde(default, alias = "bidPr", deserialize_with = "de_opt_f64")]
    bid: Option<f64>,
    #[serde(default, alias = "askPr", deserialize_with = "de_opt_f64")]
    ask: Option<f64>,
}

impl RawGlobalTicker {
    fn into_quote(self, received_at_ms: i64, source: SourceKind) -> InstrumentQuote {
        let (change_24h, change_percent_24h) = change_from_open(self.last_price, self.open);

        InstrumentQuote {
            instrument_id: self.symbol,
            price: self.last_price,
            change_24h,
            change_percent_24h,
            high_24h: self.high_24h.unwrap_or(self.last_price),
            low_24h: self.low_24h.unwrap_or(self.last_price),
            volume_24h: self.base_volume.unwrap_or(0.0),
            bid: self.bid.filter(|b| *b > 0.0),
            ask: self.ask.filter(|a| *a > 0.0),
            timestamp_ms: received_at_ms,
            source,
        }
    }
}

/// Tickers from a bare array or a `{code, msg, data}` envelope. Individual
/// malformed entries are skipped.
pub(crate) fn parse_ticker_list(
    value: Value,
    received_at_ms: i64,
    source: SourceKind,
) -> PriceFeedResult<Vec<InstrumentQuote>> {
    let items = unwrap_envelope(value)?;

    Ok(items
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<RawGlobalTicker>(item) {
            Ok(raw) => Some(raw.into_quote(received_at_ms, source)),
            Err(e) => {
                debug!("Skipping malformed global ticker: {}", e);
                None
            }
        })
        .collect())
}

fn unwrap_envelope(value: Value) -> PriceFeedResult<Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Object(mut obj) => {
            if let Some(code) = obj.get("code").and_then(Value::as_str) {
                if code != SUCCESS_CODE {
                    let msg = obj.get("msg").and_then(Value::as_str).unwrap_or_default();
                    return Err(PriceFeedError::InvalidMessage(format!(
                        "upstream code {}: {}",
                        code, msg
                    )));
                }
            }
            match obj.remove("data") {
                Some(Value::Array(items)) => Ok(items),
                _ => Err(PriceFeedError::InvalidMessage("missing data array".to_string())),
            }
        }
        other => Err(PriceFeedError::InvalidMessage(format!(
            "expected ticker array, got {}",
            other
        ))),
    }
}

/// Candle rows are `[ts, open, high, low, close, baseVolume, ...]`, usually as strings
pub(crate) fn parse_candles(value: Value) -> PriceFeedResult<Vec<Candle>> {
    let rows = unwrap_envelope(value)?;

    Ok(rows
        .iter()
        .filter_map(|row| {
            let cols = row.as_array()?;
            let num = |i: usize| -> Option<f64> {
                match cols.get(i)? {
                    Value::String(s) => s.parse().ok(),
                    Value::Number(n) => n.as_f64(),
                    _ => None,
                }
            };
            Some(Candle {
                open_time_ms: num(0)? as i64,
                open: num(1)?,
                high: num(2)?,
                low: num(3)?,
                close: num(4)?,
                volume: num(5).unwrap_or(0.0),
            })
        })
        .collect())
}

/// REST ticker source: one request for the whole batch
pub struct GlobalRestClient {
    http: Client,
    base_url: String,
}

impl GlobalRestClient {
    pub fn new(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl TickerSource for GlobalRestClient {
    fn exchange(&self) -> ExchangeKind {
        ExchangeKind::Global
    }

    fn name(&self) -> &str {
        "global-rest"
    }

    async fn fetch_tickers(&self, instruments: &[String]) -> PriceFeedResult<Vec<InstrumentQuote>> {
        let url = format!("{}{}", self.base_url, TICKERS_PATH);
        // The endpoint returns every pair when no symbol is given
        let query: Vec<(&str, String)> = match instruments {
            [single] => vec![("symbol", single.clone())],
            _ => vec![],
        };

        let body: Value = get_json(&self.http, &url, &query).await?;
        let quotes = parse_ticker_list(body, now_ms(), SourceKind::Poll)?;

        Ok(quotes
            .into_iter()
            .filter(|q| instruments.contains(&q.instrument_id))
            .collect())
    }
}

pub struct GlobalCandleClient {
    http: Client,
    base_url: String,
}

impl GlobalCandleClient {
    pub fn new(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl CandleSource for GlobalCandleClient {
    fn exchange(&self) -> ExchangeKind {
        ExchangeKind::Global
    }

    async fn fetch_candles(&self, instrument_id: &str, limit: usize) -> PriceFeedResult<Vec<Candle>> {
        let url = format!("{}{}", self.base_url, CANDLES_PATH);
        let query = [
            ("symbol", instrument_id.to_string()),
            ("granularity", "1h".to_string()),
            ("limit", limit.to_string()),
        ];
        let body: Value = get_json(&self.http, &url, &query).await?;
        parse_candles(body)
    }
}

#[derive(Debug, Deserialize)]
struct PushArg {
    #[serde(default)]
    channel: String,
}

#[derive(Debug, Deserialize)]
struct PushMessage {
    event: Option<String>,
    code: Option<Value>,
    msg: Option<String>,
    action: Option<String>,
    arg: Option<PushArg>,
    data: Option<Vec<Value>>,
}

/// Push codec: JSON text frames, `{"op":"ping"}` heartbeat
#[derive(Debug, Clone, Default)]
pub struct GlobalCodec;

impl GlobalCodec {
    pub fn new() -> Self {
        Self
    }
}

impl WireCodec for GlobalCodec {
    fn exchange(&self) -> ExchangeKind {
        ExchangeKind::Global
    }

    fn subscribe_frames(&self, instruments: &[String]) -> PriceFeedResult<Vec<String>> {
        if instruments.is_empty() {
            return Err(PriceFeedError::Config("no instruments to subscribe".to_string()));
        }

        Ok(instruments
            .chunks(SUBSCRIBE_CHUNK)
            .map(|chunk| {
                let args: Vec<Value> = chunk
                    .iter()
                    .map(|id| json!({ "instType": "SPOT", "channel": "ticker", "instId": id }))
                    .collect();
                json!({ "op": "subscribe", "args": args }).to_string()
            })
            .collect())
    }

    fn heartbeat_frame(&self) -> Option<String> {
        Some(json!({ "op": "ping" }).to_string())
    }

    fn decode(&self, payload: &[u8], received_at_ms: i64) -> PriceFeedResult<Inbound> {
        let text = std::str::from_utf8(payload)
            .map_err(|e| PriceFeedError::InvalidMessage(format!("non-utf8 frame: {}", e)))?
            .trim();

        if text == "pong" {
            return Ok(Inbound::Heartbeat);
        }

        let msg: PushMessage = serde_json::from_str(text)?;

        match msg.event.as_deref() {
            Some("pong") => return Ok(Inbound::Heartbeat),
            Some("error") => {
                let code = msg.code.map(|c| c.to_string()).unwrap_or_default();
                return Ok(Inbound::Error(format!(
                    "code {}: {}",
                    code,
                    msg.msg.unwrap_or_default()
                )));
            }
            Some(_) => return Ok(Inbound::Control),
            None => {}
        }

        if msg.action.is_none() {
            return Err(PriceFeedError::InvalidMessage("frame has no event or action".to_string()));
        }
        if msg.arg.map(|a| a.channel).as_deref() != Some("ticker") {
            return Ok(Inbound::Control);
        }

        let data = msg
            .data
            .ok_or_else(|| PriceFeedError::InvalidMessage("ticker frame without data".to_string()))?;
        let quotes = parse_ticker_list(Value::Array(data), received_at_ms, SourceKind::Push)?;
        Ok(Inbound::Tickers(quotes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REST_BODY: &str = r#"{
        "code": "00000",
        "msg": "success",
        "requestTime": 1695808949356,
        "data": [
            {"symbol":"BTCUSDT","high24h":"51000","open":"49000","lastPr":"50000","low24h":"48500",
             "quoteVolume":"1000000","baseVolume":"20.5","usdtVolume":"1000000","bidPr":"49999.5",
             "askPr":"50000.5","ts":"1695808949356"},
            {"symbol":"ETHUSDT","lastPr":"oops"},
            {"symbol":"XRPUSDT","lastPrice":0.52}
        ]
    }"#;

    #[test]
    fn test_parse_wrapped_rest_tickers() {
        let value: Value = serde_json::from_str(REST_BODY).unwrap();
        let quotes = parse_ticker_list(value, 7, SourceKind::Poll).unwrap();

        assert_eq!(quotes.len(), 2, "malformed ETH entry is skipped");
        let btc = &quotes[0];
        assert_eq!(btc.instrument_id, "BTCUSDT");
        assert_eq!(btc.price, 50_000.0);
        assert!((btc.change_24h - 1000.0).abs() < 1e-9);
        assert!((btc.change_percent_24h - 2.0408).abs() < 1e-3);
        assert_eq!(btc.high_24h, 51_000.0);
        assert_eq!(btc.volume_24h, 20.5);
        assert_eq!(btc.bid, Some(49_999.5));
        assert_eq!(btc.ask, Some(50_000.5));
        assert_eq!(btc.timestamp_ms, 7);
        assert_eq!(btc.source, SourceKind::Poll);

        let xrp = &quotes[1];
        assert_eq!(xrp.price, 0.52);
        assert_eq!(xrp.change_24h, 0.0);
        assert_eq!(xrp.high_24h, 0.52);
    }

    #[test]
    fn test_parse_bare_array() {
        let value = json!([{ "symbol": "SOLUSDT", "lastPrice": "150.1" }]);
        let quotes = parse_ticker_list(value, 1, SourceKind::Poll).unwrap();
        assert_eq!(quotes[0].price, 150.1);
    }

    #[test]
    fn test_upstream_error_code() {
        let value = json!({ "code": "40034", "msg": "Parameter does not exist", "data": null });
        let err = parse_ticker_list(value, 1, SourceKind::Poll).unwrap_err();
        assert!(err.to_string().contains("40034"));
        assert_eq!(err.kind(), kimp_core::ErrorKind::Upstream);
    }

    #[test]
    fn test_parse_candles() {
        let value = json!({
            "code": "00000",
            "data": [
                ["1695835800000", "26210.5", "26210.5", "26194.5", "26194.5", "26.26", "688122.4", "688122.4"],
                ["bad"],
                [1695839400000u64, 26194.5, 26300.0, 26190.0, 26250.0, 10.0]
            ]
        });
        let candles = parse_candles(value).unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].open_time_ms, 1_695_835_800_000);
        assert_eq!(candles[0].close, 26_194.5);
        assert_eq!(candles[1].close, 26_250.0);
    }

    #[test]
    fn test_subscribe_frames() {
        let codec = GlobalCodec::new();
        let ids: Vec<String> = (0..45).map(|i| format!("C{}USDT", i)).collect();
        let frames = codec.subscribe_frames(&ids).unwrap();
        assert_eq!(frames.len(), 2);

        let first: Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(first["op"], "subscribe");
        assert_eq!(first["args"].as_array().unwrap().len(), SUBSCRIBE_CHUNK);
        assert_eq!(first["args"][0]["channel"], "ticker");
        assert_eq!(first["args"][0]["instId"], "C0USDT");

        assert!(codec.subscribe_frames(&[]).is_err());
    }

    #[test]
    fn test_decode_ticker_update() {
        let codec = GlobalCodec::new();
        let frame = r#"{"action":"snapshot","arg":{"instType":"SPOT","channel":"ticker","instId":"BTCUSDT"},
            "data":[{"instId":"BTCUSDT","lastPr":"50100","open24h":"50000","high24h":"50500","low24h":"49000",
            "bidPr":"50099","askPr":"50101","baseVolume":"12.5","quoteVolume":"626250","ts":"1695716760565"}],
            "ts":1695716760565}"#;

        match codec.decode(frame.as_bytes(), 42).unwrap() {
            Inbound::Tickers(quotes) => {
                assert_eq!(quotes.len(), 1);
                assert_eq!(quotes[0].instrument_id, "BTCUSDT");
                assert_eq!(quotes[0].price, 50_100.0);
                assert_eq!(quotes[0].source, SourceKind::Push);
                assert_eq!(quotes[0].timestamp_ms, 42);
                assert!((quotes[0].change_24h - 100.0).abs() < 1e-9);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_control_frames() {
        let codec = GlobalCodec::new();
        assert_eq!(codec.decode(br#"{"event":"pong"}"#, 0).unwrap(), Inbound::Heartbeat);
        assert_eq!(codec.decode(b"pong", 0).unwrap(), Inbound::Heartbeat);
        assert_eq!(
            codec
                .decode(br#"{"event":"subscribe","arg":{"instType":"SPOT","channel":"ticker","instId":"BTCUSDT"}}"#, 0)
                .unwrap(),
            Inbound::Control
        );
        assert_eq!(
            codec
                .decode(br#"{"action":"update","arg":{"channel":"trade"},"data":[]}"#, 0)
                .unwrap(),
            Inbound::Control
        );
        match codec.decode(br#"{"event":"error","code":30001,"msg":"instId doesn't exist"}"#, 0).unwrap() {
            Inbound::Error(msg) => assert!(msg.contains("30001")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_malformed() {
        let codec = GlobalCodec::new();
        assert!(codec.decode(b"{not json", 0).is_err());
        assert!(codec.decode(br#"{"foo":1}"#, 0).is_err());
        assert!(codec.decode(&[0xff, 0xfe], 0).is_err());
        assert_eq!(
            codec.heartbeat_frame().as_deref(),
            Some(r#"{"op":"ping"}"#)
        );
    }
}
