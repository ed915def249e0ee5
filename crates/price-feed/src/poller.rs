//! REST ticker polling with a per-poller response cache

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use kimp_core::{ErrorKind, ExchangeKind, InstrumentQuote, PriceFeedResult};

use crate::cache::TtlCache;

/// Upstream that returns tickers for a whole batch in one request
#[async_trait]
pub trait TickerSource: Send + Sync {
    fn exchange(&self) -> ExchangeKind;

    fn name(&self) -> &str;

    /// Fails with `Network`/`Timeout` or `UpstreamStatus`/`InvalidMessage`
    async fn fetch_tickers(&self, instruments: &[String]) -> PriceFeedResult<Vec<InstrumentQuote>>;
}

/// Where a batch came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOrigin {
    Network,
    Cache,
    /// Upstream failed; cached batch still inside the grace period
    StaleCache,
    /// Upstream failed and nothing usable was cached
    Empty,
}

#[derive(Debug, Clone)]
pub struct TickerBatch {
    pub quotes: HashMap<String, InstrumentQuote>,
    pub origin: BatchOrigin,
}

type BatchKey = Vec<String>;

pub struct TickerPoller {
    source: Arc<dyn TickerSource>,
    cache: TtlCache<BatchKey, HashMap<String, InstrumentQuote>>,
    stale_grace: Duration,
    consecutive_failures: AtomicU32,
    upstream_calls: AtomicU64,
    last_error: Mutex<Option<ErrorKind>>,
}

impl TickerPoller {
    pub fn new(source: Arc<dyn TickerSource>, cache_ttl: Duration, stale_grace: Duration) -> Self {
        Self {
            source,
            cache: TtlCache::new(cache_ttl),
            stale_grace: stale_grace.max(cache_ttl),
            consecutive_failures: AtomicU32::new(0),
            upstream_calls: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    pub fn exchange(&self) -> ExchangeKind {
        self.source.exchange()
    }

    /// Quotes for `instruments`. Empty means "no update this cycle".
    pub async fn fetch_batch(&self, instruments: &[String]) -> HashMap<String, InstrumentQuote> {
        self.fetch_batch_detailed(instruments).await.quotes
    }

    pub async fn fetch_batch_detailed(&self, instruments: &[String]) -> TickerBatch {
        let key = batch_key(instruments);
        if key.is_empty() {
            return TickerBatch { quotes: HashMap::new(), origin: BatchOrigin::Empty };
        }

        if let Some(quotes) = self.cache.get_fresh(&key) {
            debug!(exchange = %self.exchange(), count = quotes.len(), "Ticker cache hit");
            return TickerBatch { quotes, origin: BatchOrigin::Cache };
        }

        self.upstream_calls.fetch_add(1, Ordering::Relaxed);
        match self.source.fetch_tickers(&key).await {
            Ok(quotes) => {
                let batch: HashMap<String, InstrumentQuote> = quotes
                    .into_iter()
                    .filter(|q| q.is_valid() && key.binary_search(&q.instrument_id).is_ok())
                    .map(|q| (q.instrument_id.clone(), q))
                    .collect();

                self.consecutive_failures.store(0, Ordering::Relaxed);
                *self.last_error.lock() = None;
                self.cache.insert(key, batch.clone());

                TickerBatch { quotes: batch, origin: BatchOrigin::Network }
            }
            Err(e) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                *self.last_error.lock() = Some(e.kind());

                match self.cache.get_within(&key, self.stale_grace) {
                    Some(quotes) => {
                        warn!(
                            exchange = %self.exchange(),
                            source = self.source.name(),
                            failures,
                            "Ticker fetch failed, serving cached batch: {}", e
                        );
                        TickerBatch { quotes, origin: BatchOrigin::StaleCache }
                    }
                    None => {
                        warn!(
                            exchange = %self.exchange(),
                            source = self.source.name(),
                            failures,
                            "Ticker fetch failed: {}", e
                        );
                        TickerBatch { quotes: HashMap::new(), origin: BatchOrigin::Empty }
                    }
                }
            }
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<ErrorKind> {
        *self.last_error.lock()
    }

    /// Drop cached batches too old to serve even as a fallback
    pub fn evict_expired(&self) {
        self.cache.evict_older_than(self.stale_grace);
    }

    /// Number of requests that actually went upstream
    pub fn upstream_calls(&self) -> u64 {
        self.upstream_calls.load(Ordering::Relaxed)
    }
}

/// Sorted, de-duplicated ids so the same set always hits the same cache entry
fn batch_key(instruments: &[String]) -> BatchKey {
    let mut key: Vec<String> = instruments.to_vec();
    key.sort();
    key.dedup();
    key
}
