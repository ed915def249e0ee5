//! Local KRW venue (Upbit-style quotation API)

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use kimp_core::{
    now_ms, Candle, ExchangeKind, InstrumentQuote, PriceFeedError, PriceFeedResult, SourceKind,
};

use super::{de_f64, de_opt_f64};
use crate::candles::CandleSource;
use crate::codec::{Inbound, WireCodec};
use crate::http::get_json;
use crate::poller::TickerSource;

const TICKER_PATH: &str = "/v1/ticker";
const CANDLES_PATH: &str = "/v1/candles/minutes/60";
const PING: &str = "PING";

#[derive(Debug, Deserialize)]
struct RawLocalTicker {
    #[serde(alias = "code")]
    market: String,
    #[serde(deserialize_with = "de_f64")]
    trade_price: f64,
    /// `RISE`, `EVEN` or `FALL`
    #[serde(default)]
    change: Option<String>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    change_price: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    signed_change_price: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    change_rate: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    signed_change_rate: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    high_price: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    low_price: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    acc_trade_volume_24h: Option<f64>,
}

impl RawLocalTicker {
    fn falling(&self) -> bool {
        self.change.as_deref() == Some("FALL")
    }

    /// Prefer the signed field; otherwise sign the absolute one from `change`
    fn signed(&self, signed: Option<f64>, unsigned: Option<f64>) -> f64 {
        signed
            .or_else(|| {
                unsigned.map(|v| if self.falling() { -v.abs() } else { v.abs() })
            })
            .unwrap_or(0.0)
    }

    fn into_quote(self, received_at_ms: i64, source: SourceKind) -> InstrumentQuote {
        let change_24h = self.signed(self.signed_change_price, self.change_price);
        // Rates are fractions upstream
        let change_percent_24h = self.signed(self.signed_change_rate, self.change_rate) * 100.0;

        InstrumentQuote {
            price: self.trade_price,
            change_24h,
            change_percent_24h,
            high_24h: self.high_price.unwrap_or(self.trade_price),
            low_24h: self.low_price.unwrap_or(self.trade_price),
            volume_24h: self.acc_trade_volume_24h.unwrap_or(0.0),
            bid: None,
            ask: None,
            timestamp_ms: received_at_ms,
            source,
            instrument_id: self.market,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    name: Value,
    #[serde(default)]
    message: Option<String>,
}

impl ErrorBody {
    fn describe(&self) -> String {
        let name = match &self.name {
            Value::String(s) => s.clone(),
            Value::Null => "error".to_string(),
            other => other.to_string(),
        };
        format!("{}: {}", name, self.message.as_deref().unwrap_or_default())
    }
}

fn upstream_error(value: &Value) -> Option<String> {
    let body = value.get("error")?;
    let parsed: ErrorBody = serde_json::from_value(body.clone()).ok()?;
    Some(parsed.describe())
}

pub(crate) fn parse_ticker_list(
    value: Value,
    received_at_ms: i64,
    source: SourceKind,
) -> PriceFeedResult<Vec<InstrumentQuote>> {
    if let Some(err) = upstream_error(&value) {
        return Err(PriceFeedError::InvalidMessage(err));
    }
    let Value::Array(items) = value else {
        return Err(PriceFeedError::InvalidMessage("expected ticker array".to_string()));
    };

    Ok(items
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<RawLocalTicker>(item) {
            Ok(raw) => Some(raw.into_quote(received_at_ms, source)),
            Err(e) => {
                debug!("Skipping malformed local ticker: {}", e);
                None
            }
        })
        .collect())
}

#[derive(Debug, Deserialize)]
struct RawCandle {
    #[serde(deserialize_with = "de_f64")]
    opening_price: f64,
    #[serde(deserialize_with = "de_f64")]
    high_price: f64,
    #[serde(deserialize_with = "de_f64")]
    low_price: f64,
    #[serde(deserialize_with = "de_f64")]
    trade_price: f64,
    timestamp: i64,
    #[serde(default, deserialize_with = "de_opt_f64")]
    candle_acc_trade_volume: Option<f64>,
}

pub(crate) fn parse_candles(value: Value) -> PriceFeedResult<Vec<Candle>> {
    if let Some(err) = upstream_error(&value) {
        return Err(PriceFeedError::InvalidMessage(err));
    }
    let rows: Vec<RawCandle> = serde_json::from_value(value)?;

    Ok(rows
        .into_iter()
        .map(|r| Candle {
            open_time_ms: r.timestamp,
            open: r.opening_price,
            high: r.high_price,
            low: r.low_price,
            close: r.trade_price,
            volume: r.candle_acc_trade_volume.unwrap_or(0.0),
        })
        .collect())
}

/// REST ticker source. The venue rejects the whole request if any market
/// code is unknown, so callers pass mapped ids only.
pub struct LocalRestClient {
    http: Client,
    base_url: String,
}

impl LocalRestClient {
    pub fn new(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl TickerSource for LocalRestClient {
    fn exchange(&self) -> ExchangeKind {
        ExchangeKind::Local
    }

    fn name(&self) -> &str {
        "local-rest"
    }

    async fn fetch_tickers(&self, instruments: &[String]) -> PriceFeedResult<Vec<InstrumentQuote>> {
        let url = format!("{}{}", self.base_url, TICKER_PATH);
        let query = [("markets", instruments.join(","))];
        let body: Value = get_json(&self.http, &url, &query).await?;
        parse_ticker_list(body, now_ms(), SourceKind::Poll)
    }
}

pub struct LocalCandleClient {
    http: Client,
    base_url: String,
}

impl LocalCandleClient {
    pub fn new(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl CandleSource for LocalCandleClient {
    fn exchange(&self) -> ExchangeKind {
        ExchangeKind::Local
    }

    async fn fetch_candles(&self, instrument_id: &str, limit: usize) -> PriceFeedResult<Vec<Candle>> {
        let url = format!("{}{}", self.base_url, CANDLES_PATH);
        let query = [("market", instrument_id.to_string()), ("count", limit.to_string())];
        let body: Value = get_json(&self.http, &url, &query).await?;
        parse_candles(body)
    }
}

/// Push codec: one subscribe array per session, binary JSON tickers,
/// text `PING` heartbeat answered with `{"status":"UP"}`
#[derive(Debug, Clone)]
pub struct LocalCodec {
    ticket: String,
}

impl LocalCodec {
    pub fn new() -> Self {
        Self { ticket: Uuid::new_v4().to_string() }
    }

    pub fn ticket(&self) -> &str {
        &self.ticket
    }
}

impl Default for LocalCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl WireCodec for LocalCodec {
    fn exchange(&self) -> ExchangeKind {
        ExchangeKind::Local
    }

    fn subscribe_frames(&self, instruments: &[String]) -> PriceFeedResult<Vec<String>> {
        if instruments.is_empty() {
            return Err(PriceFeedError::Config("no instruments to subscribe".to_string()));
        }

        let frame = json!([
            { "ticket": self.ticket },
            { "type": "ticker", "codes": instruments },
            { "format": "DEFAULT" }
        ]);
        Ok(vec![frame.to_string()])
    }

    fn heartbeat_frame(&self) -> Option<String> {
        Some(PING.to_string())
    }

    fn decode(&self, payload: &[u8], received_at_ms: i64) -> PriceFeedResult<Inbound> {
        let value: Value = serde_json::from_slice(payload)?;

        if value.get("status").is_some() {
            return Ok(Inbound::Heartbeat);
        }
        if let Some(err) = upstream_error(&value) {
            return Ok(Inbound::Error(err));
        }

        match value.get("type").and_then(Value::as_str) {
            Some("ticker") => {
                let raw: RawLocalTicker = serde_json::from_value(value)?;
                Ok(Inbound::Tickers(vec![raw.into_quote(received_at_ms, SourceKind::Push)]))
            }
            Some(_) => Ok(Inbound::Control),
            None => Err(PriceFeedError::InvalidMessage("frame has no type".to_string())),
        }
    }
}
