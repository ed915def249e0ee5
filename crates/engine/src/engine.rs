//! PriceEngine - the consumer-facing facade
//!
//! Wires the store, both push feeds, the REST pollers, the exchange rate
//! provider and the premium calculator together from one `EngineConfig`.
//! Only construction can fail. Every read after that returns a value.

use futures::Stream;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use kimp_core::{
    ConnectionState, EngineConfig, ExchangeKind, ExchangeRateEntry, InstrumentQuote, PremiumResult,
    PremiumSummary, SymbolMapper, SymbolMapping,
};
use kimp_premium::PremiumCalculator;
use kimp_price_feed::{
    build_client, CandlePoller, ExchangeRateProvider, FeedConfig, FeedConnectionManager,
    FeedStats, GlobalCandleClient, GlobalCodec, GlobalRestClient, LocalCandleClient, LocalCodec,
    LocalRestClient, PriceStore, PriceStoreSnapshot, SchedulingSupervisor, StoreEvent,
    SupervisorConfig, SupervisorStats, TickerPoller,
};

use crate::error::EngineResult;

/// Handle for a price callback registered with `subscribe_to_prices`.
/// Dropping it unsubscribes.
pub struct Subscription {
    handle: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn unsubscribe(self) {}

    /// False once the callback task has ended, or if it never started
    pub fn is_active(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}

/// Point-in-time health report
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub uptime_secs: u64,
    pub running: bool,
    pub global: ConnectionState,
    pub local: ConnectionState,
    pub global_quotes: usize,
    pub local_quotes: usize,
    pub exchange_rate: ExchangeRateEntry,
    pub push_messages: u64,
    pub push_quotes: u64,
    pub degraded_polls: u64,
    pub ticker_runs: u64,
    pub ticker_failures: u64,
    pub candle_failures: u64,
    pub fx_failures: u64,
    pub premiums: PremiumSummary,
}

pub struct PriceEngine {
    config: EngineConfig,
    mapper: Arc<SymbolMapper>,
    store: Arc<PriceStore>,
    global_feed: FeedConnectionManager<GlobalCodec>,
    local_feed: FeedConnectionManager<LocalCodec>,
    supervisor: SchedulingSupervisor,
    calculator: PremiumCalculator,
    started_at: Mutex<Option<Instant>>,
    /// Runtime the engine was built on, used when callers have none
    runtime: Option<Handle>,
}

impl PriceEngine {
    /// Validate the configuration and build every component. Nothing is
    /// spawned until `start`.
    pub fn from_config(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;

        let mapper = Arc::new(build_mapper(&config.instruments));
        let store = Arc::new(PriceStore::new(config.default_exchange_rate, config.rate_band));
        let http = build_client(config.polling.fetch_timeout())?;

        let polling = &config.polling;
        let endpoints = &config.endpoints;

        let global_poller = Arc::new(TickerPoller::new(
            Arc::new(GlobalRestClient::new(http.clone(), endpoints.global_rest_url.clone())),
            polling.ticker_cache_ttl(),
            polling.ticker_stale_grace(),
        ));
        let local_poller = Arc::new(TickerPoller::new(
            Arc::new(LocalRestClient::new(http.clone(), endpoints.local_rest_url.clone())),
            polling.ticker_cache_ttl(),
            polling.ticker_stale_grace(),
        ));
        let global_candles = Arc::new(CandlePoller::new(
            Arc::new(GlobalCandleClient::new(http.clone(), endpoints.global_rest_url.clone())),
            polling.candle_cache_ttl(),
        ));
        let local_candles = Arc::new(CandlePoller::new(
            Arc::new(LocalCandleClient::new(http.clone(), endpoints.local_rest_url.clone())),
            polling.candle_cache_ttl(),
        ));
        let fx = Arc::new(ExchangeRateProvider::from_urls(
            &http,
            &endpoints.fx_urls,
            config.local_currency.clone(),
            config.rate_band,
            polling.fx_cache_ttl(),
        ));

        let global_feed = FeedConnectionManager::new(
            GlobalCodec::new(),
            FeedConfig::from_settings(ExchangeKind::Global, &config.feeds),
            Arc::clone(&store),
            Some(Arc::clone(&global_poller)),
        );
        let local_feed = FeedConnectionManager::new(
            LocalCodec::new(),
            FeedConfig::from_settings(ExchangeKind::Local, &config.feeds),
            Arc::clone(&store),
            Some(Arc::clone(&local_poller)),
        );

        let global_ids = mapper.global_ids();
        let local_ids = mapper.local_ids_for(&global_ids);

        let supervisor = SchedulingSupervisor::builder()
            .config(SupervisorConfig::from_settings(polling))
            .ticker(global_poller, global_ids.clone())
            .ticker(local_poller, local_ids.clone())
            .candles(global_candles, global_ids)
            .candles(local_candles, local_ids)
            .exchange_rate(fx)
            .build(Arc::clone(&store));

        let calculator = PremiumCalculator::new(Arc::clone(&store), Arc::clone(&mapper))
            .with_staleness(config.premium.staleness_threshold());

        info!(
            instruments = mapper.len(),
            cross_listed = mapper.cross_listed().count(),
            currency = %config.local_currency,
            synthetic_fallback = config.feeds.synthetic_fallback,
            "Price engine configured"
        );

        Ok(Self {
            config,
            mapper,
            store,
            global_feed,
            local_feed,
            supervisor,
            calculator,
            started_at: Mutex::new(None),
            runtime: Handle::try_current().ok(),
        })
    }

    /// Start both feeds and the scheduled REST work. Calling it again is a no-op.
    /// Must run inside a tokio runtime.
    pub fn start(&self) -> EngineResult<()> {
        let global_ids = self.mapper.global_ids();
        let local_ids = self.mapper.local_ids_for(&global_ids);

        self.global_feed.start(global_ids)?;
        if local_ids.is_empty() {
            warn!("No cross-listed instruments, local feed not started");
        } else {
            self.local_feed.start(local_ids)?;
        }
        self.supervisor.start();

        let mut started_at = self.started_at.lock();
        if started_at.is_none() {
            *started_at = Some(Instant::now());
            info!("Price engine started");
        }
        Ok(())
    }

    /// Stop everything and wait for the tasks. No store write happens after this returns.
    pub async fn stop(&self) {
        if self.started_at.lock().take().is_none() {
            return;
        }

        info!("Stopping price engine");
        tokio::join!(self.global_feed.stop(), self.local_feed.stop(), self.supervisor.stop());
        info!("Price engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.started_at.lock().is_some()
    }

    /// Call `callback` for every accepted store write until the returned
    /// handle is dropped. A slow callback skips events rather than blocking writers.
    ///
    /// The callback runs on the caller's tokio runtime, or else on the one
    /// the engine was built on. With neither, the subscription is inactive.
    pub fn subscribe_to_prices<F>(&self, mut callback: F) -> Subscription
    where
        F: FnMut(StoreEvent) + Send + 'static,
    {
        let Some(runtime) = Handle::try_current().ok().or_else(|| self.runtime.clone()) else {
            warn!("No tokio runtime available, price subscription inactive");
            return Subscription { handle: None };
        };

        let mut rx = self.store.subscribe();
        let handle = runtime.spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => callback(event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Price subscriber lagged, events skipped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        Subscription { handle: Some(handle) }
    }

    /// Store events as a stream. Lagged gaps are logged and skipped.
    pub fn price_stream(&self) -> impl Stream<Item = StoreEvent> + Send + 'static {
        BroadcastStream::new(self.store.subscribe()).filter_map(|item| match item {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                debug!(skipped, "Price stream lagged");
                None
            }
        })
    }

    /// Latest quote for an instrument. Local quotes may be looked up by
    /// either the local id or the global id it maps from.
    pub fn get_quote(&self, exchange: ExchangeKind, instrument_id: &str) -> Option<InstrumentQuote> {
        self.store.get_quote(exchange, instrument_id).or_else(|| match exchange {
            ExchangeKind::Local => self
                .mapper
                .to_local(instrument_id)
                .and_then(|local| self.store.get_quote(ExchangeKind::Local, local)),
            ExchangeKind::Global => None,
        })
    }

    pub fn get_premium(&self, global_id: &str) -> PremiumResult {
        self.calculator.compute(global_id)
    }

    /// Every configured instrument, in configuration order
    pub fn premiums(&self) -> Vec<PremiumResult> {
        self.calculator.compute_all()
    }

    pub fn premium_summary(&self) -> PremiumSummary {
        self.calculator.summary()
    }

    pub fn get_connection_status(&self, exchange: ExchangeKind) -> ConnectionState {
        match exchange {
            ExchangeKind::Global => self.global_feed.state(),
            ExchangeKind::Local => self.local_feed.state(),
        }
    }

    pub fn snapshot(&self) -> PriceStoreSnapshot {
        self.store.snapshot()
    }

    pub fn exchange_rate(&self) -> f64 {
        self.store.exchange_rate()
    }

    /// Shared store, for collaborators that write through its merge contract
    pub fn store(&self) -> &Arc<PriceStore> {
        &self.store
    }

    pub fn mapper(&self) -> &SymbolMapper {
        &self.mapper
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn feed_stats(&self, exchange: ExchangeKind) -> FeedStats {
        match exchange {
            ExchangeKind::Global => self.global_feed.stats(),
            ExchangeKind::Local => self.local_feed.stats(),
        }
    }

    pub fn supervisor_stats(&self) -> SupervisorStats {
        self.supervisor.stats()
    }

    pub fn status(&self) -> EngineStatus {
        let started_at = *self.started_at.lock();
        let uptime = started_at.map(|t| t.elapsed()).unwrap_or(Duration::ZERO);
        let store = self.store.stats();
        let global_feed = self.global_feed.stats();
        let local_feed = self.local_feed.stats();
        let supervisor = self.supervisor.stats();

        EngineStatus {
            uptime_secs: uptime.as_secs(),
            running: self.is_running(),
            global: self.global_feed.state(),
            local: self.local_feed.state(),
            global_quotes: store.global_count,
            local_quotes: store.local_count,
            exchange_rate: self.store.exchange_rate_entry(),
            push_messages: global_feed.messages + local_feed.messages,
            push_quotes: global_feed.quotes_merged + local_feed.quotes_merged,
            degraded_polls: global_feed.degraded_polls + local_feed.degraded_polls,
            ticker_runs: supervisor.ticker.runs,
            ticker_failures: supervisor.ticker.failures,
            candle_failures: supervisor.candle.failures,
            fx_failures: supervisor.fx.failures,
            premiums: self.calculator.summary(),
        }
    }
}

/// Mapping table for the configured instruments, in configuration order.
/// Ids missing from the built-in table are tracked as global-only.
fn build_mapper(instruments: &[String]) -> SymbolMapper {
    let table = SymbolMapper::default();
    let mut seen = HashSet::new();

    let entries = instruments
        .iter()
        .map(|id| id.trim())
        .filter(|id| seen.insert(id.to_string()))
        .map(|id| match table.to_local(id) {
            Some(local) => SymbolMapping::cross_listed(id, local),
            None => {
                if !table.contains(id) {
                    warn!(instrument = id, "Instrument not in symbol table, tracking global side only");
                }
                SymbolMapping::global_only(id)
            }
        })
        .collect();

    SymbolMapper::from_entries(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_mapper_keeps_config_order() {
        let mapper = build_mapper(&ids(&["XRPUSDT", "BTCUSDT", "BNBUSDT"]));
        assert_eq!(mapper.global_ids(), ids(&["XRPUSDT", "BTCUSDT", "BNBUSDT"]));
        assert_eq!(mapper.to_local("XRPUSDT"), Some("KRW-XRP"));
        assert_eq!(mapper.to_local("BNBUSDT"), None);
    }

    #[test]
    fn test_mapper_dedups_and_trims() {
        let mapper = build_mapper(&ids(&["BTCUSDT", " BTCUSDT ", "ETHUSDT"]));
        assert_eq!(mapper.len(), 2);
        assert_eq!(mapper.to_global("KRW-ETH"), Some("ETHUSDT"));
    }

    #[test]
    fn test_unknown_instrument_is_global_only() {
        let mapper = build_mapper(&ids(&["FOOUSDT"]));
        assert!(mapper.contains("FOOUSDT"));
        assert_eq!(mapper.to_local("FOOUSDT"), None);
    }
}
