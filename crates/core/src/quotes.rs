//! Quote, candle and exchange-rate types

use serde::{Deserialize, Serialize};

use crate::SourceKind;

/// 24h ticker snapshot for one instrument on one exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentQuote {
    pub instrument_id: String,
    pub price: f64,
    pub change_24h: f64,
    pub change_percent_24h: f64,
    pub high_24h: f64,
    pub low_24h: f64,
    pub volume_24h: f64,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    /// Ingestion time, UTC milliseconds
    pub timestamp_ms: i64,
    pub source: SourceKind,
}

impl InstrumentQuote {
    /// Bare quote carrying only a price; the remaining stats default to zero
    pub fn new(instrument_id: impl Into<String>, price: f64, timestamp_ms: i64, source: SourceKind) -> Self {
        Self {
            instrument_id: instrument_id.into(),
            price,
            change_24h: 0.0,
            change_percent_24h: 0.0,
            high_24h: price,
            low_24h: price,
            volume_24h: 0.0,
            bid: None,
            ask: None,
            timestamp_ms,
            source,
        }
    }

    /// Only quotes with a finite, strictly positive price may enter the store
    pub fn is_valid(&self) -> bool {
        self.price.is_finite() && self.price > 0.0
    }

    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.timestamp_ms).max(0)
    }

    pub fn is_stale(&self, max_age_ms: i64, now_ms: i64) -> bool {
        self.age_ms(now_ms) > max_age_ms
    }
}

/// OHLCV bar
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Close prices used to draw a small trend line next to an instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sparkline {
    pub instrument_id: String,
    pub closes: Vec<f64>,
    pub updated_at_ms: i64,
}

impl Sparkline {
    /// Build from candles in any order; output is oldest-first
    pub fn from_candles(instrument_id: impl Into<String>, candles: &[Candle], updated_at_ms: i64) -> Self {
        let mut sorted: Vec<&Candle> = candles.iter().filter(|c| c.close > 0.0).collect();
        sorted.sort_by_key(|c| c.open_time_ms);

        Self {
            instrument_id: instrument_id.into(),
            closes: sorted.into_iter().map(|c| c.close).collect(),
            updated_at_ms,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.closes.is_empty()
    }

    /// Percent move from first to last close
    pub fn change_percent(&self) -> Option<f64> {
        let first = *self.closes.first()?;
        let last = *self.closes.last()?;
        if first <= 0.0 {
            return None;
        }
        Some((last - first) / first * 100.0)
    }
}

/// Inclusive sanity band for the USD/local exchange rate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateBand {
    pub min: f64,
    pub max: f64,
}

impl RateBand {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, rate: f64) -> bool {
        rate.is_finite() && rate >= self.min && rate <= self.max
    }
}

impl Default for RateBand {
    fn default() -> Self {
        Self { min: 1000.0, max: 2000.0 }
    }
}

/// Last known exchange rate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRateEntry {
    pub rate: f64,
    pub updated_at_ms: i64,
    /// True until the first successful load replaces the configured default
    pub seeded: bool,
}
