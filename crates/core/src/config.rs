//! Configuration types

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{CoreError, CoreResult, RateBand, SymbolMapper};

/// Push feed endpoints, timeouts and reconnect policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedSettings {
    pub global_ws_url: String,
    pub local_ws_url: String,
    pub connect_timeout_ms: u64,
    /// Connection is force-closed when nothing arrives for this long
    pub message_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub max_reconnect_attempts: u32,
    /// Cadence of the degraded-mode poll loop
    pub degraded_interval_ms: u64,
    /// Allow synthetic quotes in degraded mode. Keep off in production.
    pub synthetic_fallback: bool,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            global_ws_url: "wss://ws.bitget.com/v2/ws/public".to_string(),
            local_ws_url: "wss://api.upbit.com/websocket/v1".to_string(),
            connect_timeout_ms: 10_000,
            message_timeout_ms: 60_000,
            heartbeat_interval_ms: 25_000,
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 30_000,
            max_reconnect_attempts: 5,
            degraded_interval_ms: 10_000,
            synthetic_fallback: false,
        }
    }
}

impl FeedSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    pub fn degraded_interval(&self) -> Duration {
        Duration::from_millis(self.degraded_interval_ms)
    }
}

/// Poll cadences and cache lifetimes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingSettings {
    pub ticker_interval_ms: u64,
    pub candle_interval_ms: u64,
    pub fx_interval_ms: u64,
    /// Upper bound of random delay added to every interval
    pub jitter_ms: u64,
    pub ticker_cache_ttl_ms: u64,
    /// How long a cached ticker batch may stand in for a failed fetch
    pub ticker_stale_grace_ms: u64,
    pub candle_cache_ttl_ms: u64,
    pub fx_cache_ttl_ms: u64,
    pub fetch_timeout_ms: u64,
    /// Cadence of stale-quote and cache cleanup
    pub housekeeping_interval_ms: u64,
    /// Quotes not refreshed for this long are dropped from the store
    pub max_quote_age_ms: u64,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            ticker_interval_ms: 10_000,
            candle_interval_ms: 5 * 60_000,
            fx_interval_ms: 4 * 60 * 60_000,
            jitter_ms: 500,
            ticker_cache_ttl_ms: 5_000,
            ticker_stale_grace_ms: 60_000,
            candle_cache_ttl_ms: 4 * 60_000,
            fx_cache_ttl_ms: 4 * 60 * 60_000,
            fetch_timeout_ms: 10_000,
            housekeeping_interval_ms: 60_000,
            max_quote_age_ms: 60 * 60_000,
        }
    }
}

impl PollingSettings {
    pub fn ticker_interval(&self) -> Duration {
        Duration::from_millis(self.ticker_interval_ms)
    }

    pub fn candle_interval(&self) -> Duration {
        Duration::from_millis(self.candle_interval_ms)
    }

    pub fn fx_interval(&self) -> Duration {
        Duration::from_millis(self.fx_interval_ms)
    }

    pub fn jitter(&self) -> Duration {
        Duration::from_millis(self.jitter_ms)
    }

    pub fn ticker_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.ticker_cache_ttl_ms)
    }

    pub fn ticker_stale_grace(&self) -> Duration {
        Duration::from_millis(self.ticker_stale_grace_ms)
    }

    pub fn candle_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.candle_cache_ttl_ms)
    }

    pub fn fx_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.fx_cache_ttl_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_millis(self.housekeeping_interval_ms)
    }

    pub fn max_quote_age(&self) -> Duration {
        Duration::from_millis(self.max_quote_age_ms)
    }
}

/// REST endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointSettings {
    pub global_rest_url: String,
    pub local_rest_url: String,
    /// Tried in order until one yields an in-band rate
    pub fx_urls: Vec<String>,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            global_rest_url: "https://api.bitget.com".to_string(),
            local_rest_url: "https://api.upbit.com".to_string(),
            fx_urls: vec![
                "https://open.er-api.com/v6/latest/USD".to_string(),
                "https://cdn.jsdelivr.net/npm/@fawazahmed0/currency-api@latest/v1/currencies/usd.json"
                    .to_string(),
            ],
        }
    }
}

/// Premium calculation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PremiumSettings {
    /// Quotes older than this make a premium `StaleQuote`. `None` disables the check.
    pub staleness_threshold_ms: Option<u64>,
}

impl PremiumSettings {
    pub fn staleness_threshold(&self) -> Option<Duration> {
        self.staleness_threshold_ms.map(Duration::from_millis)
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Global instrument ids to track
    pub instruments: Vec<String>,
    pub local_currency: String,
    /// Rate used until the first FX fetch succeeds
    pub default_exchange_rate: f64,
    pub rate_band: RateBand,
    pub feeds: FeedSettings,
    pub polling: PollingSettings,
    pub endpoints: EndpointSettings,
    pub premium: PremiumSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            instruments: SymbolMapper::default().global_ids(),
            local_currency: "KRW".to_string(),
            default_exchange_rate: 1350.0,
            rate_band: RateBand::default(),
            feeds: FeedSettings::default(),
            polling: PollingSettings::default(),
            endpoints: EndpointSettings::default(),
            premium: PremiumSettings::default(),
        }
    }
}

impl EngineConfig {
    /// Static checks run once at startup. Any failure here is fatal.
    pub fn validate(&self) -> CoreResult<()> {
        if self.instruments.is_empty() {
            return Err(CoreError::InvalidConfig("instrument list is empty".to_string()));
        }
        if let Some(blank) = self.instruments.iter().find(|i| i.trim().is_empty()) {
            return Err(CoreError::InvalidConfig(format!("blank instrument id {:?}", blank)));
        }
        if self.local_currency.trim().is_empty() {
            return Err(CoreError::InvalidConfig("local currency is empty".to_string()));
        }
        if !(self.rate_band.min > 0.0 && self.rate_band.min < self.rate_band.max) {
            return Err(CoreError::InvalidConfig(format!(
                "rate band [{}, {}] is not a positive increasing range",
                self.rate_band.min, self.rate_band.max
            )));
        }
        if !self.rate_band.contains(self.default_exchange_rate) {
            return Err(CoreError::InvalidConfig(format!(
                "default exchange rate {} outside band [{}, {}]",
                self.default_exchange_rate, self.rate_band.min, self.rate_band.max
            )));
        }

        let intervals = [
            ("polling.ticker_interval_ms", self.polling.ticker_interval_ms),
            ("polling.candle_interval_ms", self.polling.candle_interval_ms),
            ("polling.fx_interval_ms", self.polling.fx_interval_ms),
            ("polling.fetch_timeout_ms", self.polling.fetch_timeout_ms),
            ("polling.housekeeping_interval_ms", self.polling.housekeeping_interval_ms),
            ("polling.max_quote_age_ms", self.polling.max_quote_age_ms),
            ("feeds.connect_timeout_ms", self.feeds.connect_timeout_ms),
            ("feeds.message_timeout_ms", self.feeds.message_timeout_ms),
            ("feeds.heartbeat_interval_ms", self.feeds.heartbeat_interval_ms),
            ("feeds.reconnect_base_ms", self.feeds.reconnect_base_ms),
            ("feeds.degraded_interval_ms", self.feeds.degraded_interval_ms),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, v)| *v == 0) {
            return Err(CoreError::InvalidConfig(format!("{} must be non-zero", name)));
        }
        if self.feeds.reconnect_max_ms < self.feeds.reconnect_base_ms {
            return Err(CoreError::InvalidConfig(
                "feeds.reconnect_max_ms is below feeds.reconnect_base_ms".to_string(),
            ));
        }
        if self.feeds.max_reconnect_attempts == 0 {
            return Err(CoreError::InvalidConfig(
                "feeds.max_reconnect_attempts must be at least 1".to_string(),
            ));
        }
        if self.polling.ticker_stale_grace_ms < self.polling.ticker_cache_ttl_ms {
            return Err(CoreError::InvalidConfig(
                "polling.ticker_stale_grace_ms is shorter than the cache ttl".to_string(),
            ));
        }

        Ok(())
    }
}
