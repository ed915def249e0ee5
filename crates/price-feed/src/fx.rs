//! USD to local-currency exchange rate provider

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use kimp_core::{PriceFeedError, PriceFeedResult, RateBand};

use crate::cache::TtlCache;
use crate::http::get_json;

/// A "latest USD rates" endpoint
#[async_trait]
pub trait RateSource: Send + Sync {
    fn name(&self) -> &str;

    /// Units of `currency` per 1 USD
    async fn fetch_rate(&self, currency: &str) -> PriceFeedResult<f64>;
}

/// Generic JSON rate endpoint; the response shape is detected by `extract_rate`
pub struct JsonRateSource {
    name: String,
    url: String,
    http: Client,
}

impl JsonRateSource {
    pub fn new(http: Client, url: impl Into<String>) -> Self {
        let url = url.into();
        let name = url
            .split("://")
            .nth(1)
            .and_then(|rest| rest.split('/').next())
            .unwrap_or(&url)
            .to_string();
        Self { name, url, http }
    }
}

#[async_trait]
impl RateSource for JsonRateSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_rate(&self, currency: &str) -> PriceFeedResult<f64> {
        let body: Value = get_json(&self.http, &self.url, &[]).await?;
        extract_rate(&body, currency).ok_or_else(|| {
            PriceFeedError::InvalidMessage(format!("no {} rate in response from {}", currency, self.name))
        })
    }
}

fn as_rate(value: &Value) -> Option<f64> {
    let rate = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    (rate.is_finite() && rate > 0.0).then_some(rate)
}

/// Pull the `currency` rate out of any of the supported response shapes:
/// `{rates: {KRW}}`, `{conversion_rates: {KRW}}`, `{data: {KRW}}`,
/// `{usd: {krw}}`, or `[{currencyCode: "USD", basePrice}]`.
pub fn extract_rate(body: &Value, currency: &str) -> Option<f64> {
    let upper = currency.to_uppercase();
    let lower = currency.to_lowercase();

    if let Value::Array(items) = body {
        let entry = items
            .iter()
            .find(|item| item.get("currencyCode").and_then(Value::as_str) == Some("USD"))
            .or_else(|| items.first())?;
        return entry.get("basePrice").and_then(as_rate);
    }

    ["rates", "conversion_rates", "data"]
        .iter()
        .find_map(|key| body.get(*key)?.get(upper.as_str()).and_then(as_rate))
        .or_else(|| body.get("usd")?.get(lower.as_str()).and_then(as_rate))
}

/// Rate lookup over an ordered list of sources with a long-lived cache
pub struct ExchangeRateProvider {
    sources: Vec<Arc<dyn RateSource>>,
    currency: String,
    band: RateBand,
    cache: TtlCache<String, f64>,
    failures: AtomicU64,
}

impl ExchangeRateProvider {
    pub fn new(
        sources: Vec<Arc<dyn RateSource>>,
        currency: impl Into<String>,
        band: RateBand,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            sources,
            currency: currency.into().to_uppercase(),
            band,
            cache: TtlCache::new(cache_ttl),
            failures: AtomicU64::new(0),
        }
    }

    pub fn from_urls(
        http: &Client,
        urls: &[String],
        currency: impl Into<String>,
        band: RateBand,
        cache_ttl: Duration,
    ) -> Self {
        let sources = urls
            .iter()
            .map(|url| Arc::new(JsonRateSource::new(http.clone(), url.clone())) as Arc<dyn RateSource>)
            .collect();
        Self::new(sources, currency, band, cache_ttl)
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    /// Cached rate, or the first in-band rate any source returns.
    /// `None` when every source failed or was out of band.
    pub async fn current_rate(&self) -> Option<f64> {
        if let Some(rate) = self.cache.get_fresh(&self.currency) {
            debug!(rate, "Exchange rate cache hit");
            return Some(rate);
        }

        for source in &self.sources {
            let fetched = source
                .fetch_rate(&self.currency)
                .await
                .and_then(|rate| self.check_band(rate));

            match fetched {
                Ok(rate) => {
                    info!(source = source.name(), currency = %self.currency, rate, "Loaded exchange rate");
                    self.cache.insert(self.currency.clone(), rate);
                    return Some(rate);
                }
                Err(e) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        source = source.name(),
                        kind = ?e.kind(),
                        "Exchange rate unusable, trying next source: {}", e
                    );
                }
            }
        }

        None
    }

    fn check_band(&self, rate: f64) -> PriceFeedResult<f64> {
        if self.band.contains(rate) {
            Ok(rate)
        } else {
            Err(PriceFeedError::Validation(format!(
                "{} rate {} outside band [{}, {}]",
                self.currency, rate, self.band.min, self.band.max
            )))
        }
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) struct FixedRateSource {
        pub rate: Option<f64>,
        pub calls: AtomicU64,
    }

    impl FixedRateSource {
        pub fn new(rate: Option<f64>) -> Self {
            Self { rate, calls: AtomicU64::new(0) }
        }
    }

    #[async_trait]
    impl RateSource for FixedRateSource {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn fetch_rate(&self, _currency: &str) -> PriceFeedResult<f64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.rate.ok_or_else(|| PriceFeedError::Network("unreachable".into()))
        }
    }

    #[test]
    fn test_extract_known_shapes() {
        assert_eq!(extract_rate(&json!({ "result": "success", "rates": { "KRW": 1385.2 } }), "KRW"), Some(1385.2));
        assert_eq!(extract_rate(&json!({ "conversion_rates": { "KRW": "1390.5" } }), "krw"), Some(1390.5));
        assert_eq!(extract_rate(&json!({ "data": { "KRW": 1401 } }), "KRW"), Some(1401.0));
        assert_eq!(extract_rate(&json!({ "date": "2024-05-01", "usd": { "krw": 1377.7 } }), "KRW"), Some(1377.7));
        assert_eq!(
            extract_rate(
                &json!([{ "code": "FRX.KRWUSD", "currencyCode": "USD", "basePrice": 1366.0 }]),
                "KRW"
            ),
            Some(1366.0)
        );
    }

    #[test]
    fn test_extract_rejects_missing_or_invalid() {
        assert_eq!(extract_rate(&json!({ "rates": { "JPY": 150.0 } }), "KRW"), None);
        assert_eq!(extract_rate(&json!({ "rates": { "KRW": -1 } }), "KRW"), None);
        assert_eq!(extract_rate(&json!({ "rates": { "KRW": "abc" } }), "KRW"), None);
        assert_eq!(extract_rate(&json!([]), "KRW"), None);
        assert_eq!(extract_rate(&json!("nope"), "KRW"), None);
    }

    #[test]
    fn test_source_name_from_url() {
        let source = JsonRateSource::new(Client::new(), "https://open.er-api.com/v6/latest/USD");
        assert_eq!(source.name(), "open.er-api.com");
    }

    fn provider(sources: Vec<Arc<FixedRateSource>>) -> ExchangeRateProvider {
        ExchangeRateProvider::new(
            sources.into_iter().map(|s| s as Arc<dyn RateSource>).collect(),
            "krw",
            RateBand::default(),
            Duration::from_secs(4 * 3600),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_through_failed_and_out_of_band_sources() {
        let down = Arc::new(FixedRateSource::new(None));
        let crazy = Arc::new(FixedRateSource::new(Some(9_999.0)));
        let good = Arc::new(FixedRateSource::new(Some(1_380.0)));
        let provider = provider(vec![down.clone(), crazy.clone(), good.clone()]);

        assert_eq!(provider.currency(), "KRW");
        assert_eq!(provider.current_rate().await, Some(1_380.0));
        assert_eq!(provider.failures(), 2);

        // Served from cache until the ttl runs out
        assert_eq!(provider.current_rate().await, Some(1_380.0));
        assert_eq!(good.calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(4 * 3600 + 1)).await;
        provider.current_rate().await;
        assert_eq!(good.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_all_sources_failing_yields_none() {
        let provider = provider(vec![
            Arc::new(FixedRateSource::new(None)),
            Arc::new(FixedRateSource::new(Some(50.0))),
        ]);
        assert_eq!(provider.current_rate().await, None);
    }
}
