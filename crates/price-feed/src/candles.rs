//! Candle polling for sparklines

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use kimp_core::{now_ms, Candle, ExchangeKind, PriceFeedResult, Sparkline};

use crate::cache::TtlCache;

/// Number of hourly bars behind each sparkline
pub const SPARKLINE_POINTS: usize = 24;

/// Cached candles older than the sparkline window are never served
const CANDLE_RETENTION: Duration = Duration::from_secs(SPARKLINE_POINTS as u64 * 3600);

#[async_trait]
pub trait CandleSource: Send + Sync {
    fn exchange(&self) -> ExchangeKind;

    /// Most recent hourly candles for one instrument, any order
    async fn fetch_candles(&self, instrument_id: &str, limit: usize) -> PriceFeedResult<Vec<Candle>>;
}

pub struct CandlePoller {
    source: Arc<dyn CandleSource>,
    cache: TtlCache<String, Vec<Candle>>,
    failures: AtomicU64,
}

impl CandlePoller {
    pub fn new(source: Arc<dyn CandleSource>, cache_ttl: Duration) -> Self {
        Self {
            source,
            cache: TtlCache::new(cache_ttl),
            failures: AtomicU64::new(0),
        }
    }

    pub fn exchange(&self) -> ExchangeKind {
        self.source.exchange()
    }

    /// Sparkline for one instrument, `None` when nothing could be loaded
    pub async fn sparkline(&self, instrument_id: &str) -> Option<Sparkline> {
        let candles = self.candles(instrument_id).await?;
        let line = Sparkline::from_candles(instrument_id, &candles, now_ms());
        (!line.is_empty()).then_some(line)
    }

    /// Candles from cache or upstream. A failed fetch falls back to whatever is cached.
    pub async fn candles(&self, instrument_id: &str) -> Option<Vec<Candle>> {
        let key = instrument_id.to_string();
        if let Some(hit) = self.cache.get_fresh(&key) {
            debug!(exchange = %self.exchange(), instrument = instrument_id, "Candle cache hit");
            return Some(hit);
        }

        match self.source.fetch_candles(instrument_id, SPARKLINE_POINTS).await {
            Ok(candles) if !candles.is_empty() => {
                self.cache.insert(key, candles.clone());
                Some(candles)
            }
            Ok(_) => self.cache.get_any(&key).map(|(c, _)| c),
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    exchange = %self.exchange(),
                    instrument = instrument_id,
                    "Candle fetch failed: {}", e
                );
                self.cache.get_any(&key).map(|(c, _)| c)
            }
        }
    }

    pub fn evict_expired(&self) {
        self.cache.evict_older_than(CANDLE_RETENTION);
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use kimp_core::PriceFeedError;
    use std::sync::atomic::AtomicBool;

    pub(crate) struct MockCandleSource {
        pub fail: AtomicBool,
        pub calls: AtomicU64,
    }

    impl MockCandleSource {
        pub fn new() -> Self {
            Self { fail: AtomicBool::new(false), calls: AtomicU64::new(0) }
        }
    }

    #[async_trait]
    impl CandleSource for MockCandleSource {
        fn exchange(&self) -> ExchangeKind {
            ExchangeKind::Global
        }

        async fn fetch_candles(&self, _instrument_id: &str, limit: usize) -> PriceFeedResult<Vec<Candle>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(PriceFeedError::Network("reset".into()));
            }
            Ok((0..limit)
                .rev()
                .map(|i| Candle {
                    open_time_ms: i as i64 * 3_600_000,
                    open: 100.0,
                    high: 110.0,
                    low: 90.0,
                    close: 100.0 + i as f64,
                    volume: 1.0,
                })
                .collect())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sparkline_is_oldest_first_and_cached() {
        let source = Arc::new(MockCandleSource::new());
        let poller = CandlePoller::new(source.clone(), Duration::from_secs(240));

        let line = poller.sparkline("BTCUSDT").await.unwrap();
        assert_eq!(line.closes.len(), SPARKLINE_POINTS);
        assert_eq!(line.closes[0], 100.0);
        assert_eq!(*line.closes.last().unwrap(), 123.0);

        poller.sparkline("BTCUSDT").await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_falls_back_to_expired_cache() {
        let source = Arc::new(MockCandleSource::new());
        let poller = CandlePoller::new(source.clone(), Duration::from_secs(1));

        poller.sparkline("ETHUSDT").await.unwrap();
        source.fail.store(true, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(5)).await;

        assert!(poller.sparkline("ETHUSDT").await.is_some());
        assert!(poller.sparkline("SOLUSDT").await.is_none());
        assert_eq!(poller.failures(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_expired_past_sparkline_window() {
        let source = Arc::new(MockCandleSource::new());
        let poller = CandlePoller::new(source.clone(), Duration::from_secs(240));

        poller.sparkline("BTCUSDT").await.unwrap();
        tokio::time::advance(Duration::from_secs(3600)).await;
        poller.evict_expired();
        assert_eq!(poller.cache.len(), 1);

        tokio::time::advance(CANDLE_RETENTION).await;
        poller.evict_expired();
        assert!(poller.cache.is_empty());

        source.fail.store(true, Ordering::SeqCst);
        assert!(poller.sparkline("BTCUSDT").await.is_none());
    }
}
