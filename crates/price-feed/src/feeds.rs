//! WebSocket feed connection manager
//!
//! One manager per exchange, parameterised by its `WireCodec`. The manager
//! owns a single background task that connects, subscribes, keeps the session
//! alive with heartbeats and reconnects with exponential backoff. Once the
//! reconnect budget is spent it falls back to REST polling (and optionally to
//! synthetic quotes) for as long as it runs.

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use kimp_core::{
    now_ms, ConnectionState, ErrorKind, ExchangeKind, FeedSettings, PriceFeedError,
    PriceFeedResult,
};

use crate::codec::{Inbound, WireCodec};
use crate::connection::{ConnectionTracker, FailureAction, ReconnectPolicy};
use crate::poller::TickerPoller;
use crate::store::PriceStore;
use crate::synthetic::SyntheticSource;

/// How long `stop()` waits for the task before aborting it
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Feed configuration
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub ws_url: String,
    pub connect_timeout: Duration,
    pub message_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub degraded_interval: Duration,
    pub reconnect: ReconnectPolicy,
    pub synthetic_fallback: bool,
}

impl FeedConfig {
    pub fn from_settings(exchange: ExchangeKind, settings: &FeedSettings) -> Self {
        let ws_url = match exchange {
            ExchangeKind::Global => settings.global_ws_url.clone(),
            ExchangeKind::Local => settings.local_ws_url.clone(),
        };

        Self {
            ws_url,
            connect_timeout: settings.connect_timeout(),
            message_timeout: settings.message_timeout(),
            heartbeat_interval: settings.heartbeat_interval(),
            degraded_interval: settings.degraded_interval(),
            reconnect: ReconnectPolicy::from_settings(settings),
            synthetic_fallback: settings.synthetic_fallback,
        }
    }
}

/// Counters for one feed
#[derive(Debug, Clone, Default)]
pub struct FeedStats {
    pub sessions: u64,
    pub messages: u64,
    pub quotes_merged: u64,
    pub dropped: u64,
    pub degraded_polls: u64,
    pub synthetic_quotes: u64,
}

#[derive(Default)]
struct FeedCounters {
    sessions: AtomicU64,
    messages: AtomicU64,
    quotes_merged: AtomicU64,
    dropped: AtomicU64,
    degraded_polls: AtomicU64,
    synthetic_quotes: AtomicU64,
}

/// State shared between the manager and its background task
struct FeedShared<C: WireCodec> {
    codec: C,
    config: FeedConfig,
    store: Arc<PriceStore>,
    fallback: Option<Arc<TickerPoller>>,
    synthetic: Option<SyntheticSource>,
    tracker: ConnectionTracker,
    counters: FeedCounters,
}

struct RunningFeed {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct FeedConnectionManager<C: WireCodec> {
    shared: Arc<FeedShared<C>>,
    task: Mutex<Option<RunningFeed>>,
}

impl<C: WireCodec> FeedConnectionManager<C> {
    /// `fallback` is polled in degraded mode. Synthetic quotes are only
    /// produced when `config.synthetic_fallback` is set.
    pub fn new(
        codec: C,
        config: FeedConfig,
        store: Arc<PriceStore>,
        fallback: Option<Arc<TickerPoller>>,
    ) -> Self {
        let exchange = codec.exchange();
        let synthetic = config.synthetic_fallback.then(SyntheticSource::new);
        let tracker = ConnectionTracker::new(exchange, config.reconnect);

        Self {
            shared: Arc::new(FeedShared {
                codec,
                config,
                store,
                fallback,
                synthetic,
                tracker,
                counters: FeedCounters::default(),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn exchange(&self) -> ExchangeKind {
        self.shared.codec.exchange()
    }

    /// Spawn the connection task. Calling it again while running is a no-op.
    pub fn start(&self, instruments: Vec<String>) -> PriceFeedResult<()> {
        if instruments.is_empty() {
            return Err(PriceFeedError::Config(format!(
                "{} feed started with no instruments",
                self.exchange()
            )));
        }

        let mut task = self.task.lock();
        if task.is_some() {
            debug!(exchange = %self.exchange(), "Feed already running");
            return Ok(());
        }

        info!(
            exchange = %self.exchange(),
            url = %self.shared.config.ws_url,
            instruments = instruments.len(),
            "Starting feed"
        );

        let (shutdown, rx) = watch::channel(false);
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            shared.run(instruments, rx).await;
        });

        *task = Some(RunningFeed { shutdown, handle });
        Ok(())
    }

    /// Stop the task and wait for it. No store write happens after this returns.
    pub async fn stop(&self) {
        let running = self.task.lock().take();
        let Some(RunningFeed { shutdown, mut handle }) = running else {
            return;
        };

        let _ = shutdown.send(true);
        if timeout(STOP_GRACE, &mut handle).await.is_err() {
            warn!(exchange = %self.exchange(), "Feed task did not stop in time, aborting");
            handle.abort();
            let _ = handle.await;
        }

        self.shared.tracker.on_stopped();
        info!(exchange = %self.exchange(), "Feed stopped");
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.tracker.current()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.tracker.subscribe()
    }

    pub fn stats(&self) -> FeedStats {
        let c = &self.shared.counters;
        FeedStats {
            sessions: c.sessions.load(Ordering::Relaxed),
            messages: c.messages.load(Ordering::Relaxed),
            quotes_merged: c.quotes_merged.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            degraded_polls: c.degraded_polls.load(Ordering::Relaxed),
            synthetic_quotes: c.synthetic_quotes.load(Ordering::Relaxed),
        }
    }
}

fn ws_error(e: tokio_tungstenite::tungstenite::Error) -> PriceFeedError {
    PriceFeedError::Network(e.to_string())
}

impl<C: WireCodec> FeedShared<C> {
    fn exchange(&self) -> ExchangeKind {
        self.codec.exchange()
    }

    async fn run(&self, instruments: Vec<String>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            self.tracker.on_connecting();
            let result = tokio::select! {
                _ = shutdown.changed() => break,
                result = self.session(&instruments) => result,
            };

            let kind = match result {
                Ok(()) => {
                    info!(exchange = %self.exchange(), "Feed closed by server");
                    ErrorKind::Network
                }
                Err(e) => {
                    debug!(exchange = %self.exchange(), "Feed session ended: {}", e);
                    e.kind()
                }
            };

            match self.tracker.on_failure(kind) {
                FailureAction::Retry(delay) => {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = sleep(delay) => {}
                    }
                }
                FailureAction::Degrade => {
                    self.run_degraded(&instruments, &mut shutdown).await;
                    break;
                }
            }
        }
    }

    /// One connected session. `Ok` means the server closed the stream.
    async fn session(&self, instruments: &[String]) -> PriceFeedResult<()> {
        self.counters.sessions.fetch_add(1, Ordering::Relaxed);
        debug!(exchange = %self.exchange(), url = %self.config.ws_url, "Connecting");

        let (ws_stream, _) = timeout(
            self.config.connect_timeout,
            connect_async(self.config.ws_url.as_str()),
        )
        .await
        .map_err(|_| PriceFeedError::Timeout(self.config.connect_timeout))?
        .map_err(ws_error)?;

        let (mut write, mut read) = ws_stream.split();

        for frame in self.codec.subscribe_frames(instruments)? {
            write.send(Message::Text(frame)).await.map_err(ws_error)?;
        }
        self.tracker.on_connected();

        let subscribed: HashSet<&str> = instruments.iter().map(String::as_str).collect();
        let period = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut deadline = Instant::now() + self.config.message_timeout;

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if let Some(frame) = self.codec.heartbeat_frame() {
                        write.send(Message::Text(frame)).await.map_err(ws_error)?;
                    }
                }
                _ = sleep_until(deadline) => {
                    warn!(
                        exchange = %self.exchange(),
                        timeout = ?self.config.message_timeout,
                        "No message received, closing connection"
                    );
                    let _ = write.send(Message::Close(None)).await;
                    return Err(PriceFeedError::Timeout(self.config.message_timeout));
                }
                msg = read.next() => {
                    let alive = match msg {
                        None => return Ok(()),
                        Some(Err(e)) => return Err(ws_error(e)),
                        Some(Ok(Message::Text(text))) => self.handle_payload(text.as_bytes(), &subscribed),
                        Some(Ok(Message::Binary(data))) => self.handle_payload(&data, &subscribed),
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await.map_err(ws_error)?;
                            false
                        }
                        Some(Ok(Message::Close(frame))) => {
                            debug!(exchange = %self.exchange(), "Close frame: {:?}", frame);
                            return Ok(());
                        }
                        Some(Ok(_)) => false,
                    };
                    if alive {
                        deadline = Instant::now() + self.config.message_timeout;
                    }
                }
            }
        }
    }

    /// Decode one frame and merge its tickers. Returns whether it counts as liveness.
    fn handle_payload(&self, payload: &[u8], subscribed: &HashSet<&str>) -> bool {
        self.counters.messages.fetch_add(1, Ordering::Relaxed);
        let exchange = self.exchange();

        match self.codec.decode(payload, now_ms()) {
            Ok(Inbound::Tickers(quotes)) => {
                for quote in quotes {
                    if !subscribed.contains(quote.instrument_id.as_str()) {
                        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                        debug!(exchange = %exchange, instrument = %quote.instrument_id, "Dropped unsubscribed ticker");
                        continue;
                    }
                    let id = quote.instrument_id.clone();
                    if self.store.merge_quote(exchange, &id, quote).is_applied() {
                        self.counters.quotes_merged.fetch_add(1, Ordering::Relaxed);
                    }
                }
                true
            }
            Ok(Inbound::Error(msg)) => {
                warn!(exchange = %exchange, "Exchange reported error: {}", msg);
                false
            }
            Ok(inbound) => inbound.is_liveness(),
            Err(e) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(exchange = %exchange, "Dropped malformed message: {}", e);
                false
            }
        }
    }

    /// Poll until shutdown; synthetic quotes fill in when polling yields nothing
    async fn run_degraded(&self, instruments: &[String], shutdown: &mut watch::Receiver<bool>) {
        let exchange = self.exchange();
        warn!(
            exchange = %exchange,
            interval = ?self.config.degraded_interval,
            synthetic = self.synthetic.is_some(),
            "Feed running in degraded mode"
        );

        let mut ticker = tokio::time::interval(self.config.degraded_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {}
            }
            self.counters.degraded_polls.fetch_add(1, Ordering::Relaxed);

            let polled = match &self.fallback {
                Some(poller) => tokio::select! {
                    _ = shutdown.changed() => return,
                    batch = poller.fetch_batch(instruments) => batch,
                },
                None => Default::default(),
            };

            if !polled.is_empty() {
                let merged = self.store.merge_quotes(exchange, polled.into_values());
                self.counters.quotes_merged.fetch_add(merged as u64, Ordering::Relaxed);
                debug!(exchange = %exchange, merged, "Degraded poll merged");
            } else if let Some(synthetic) = &self.synthetic {
                let quotes = synthetic.next_quotes(exchange, instruments, &self.store);
                let merged = self.store.merge_quotes(exchange, quotes);
                self.counters.synthetic_quotes.fetch_add(merged as u64, Ordering::Relaxed);
                debug!(exchange = %exchange, merged, "Merged synthetic quotes");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchanges::GlobalCodec;
    use crate::poller::tests::MockTickerSource;
    use crate::poller::TickerSource;
    use kimp_core::{ConnectionStatus, RateBand, SourceKind};

    fn unreachable_config(synthetic_fallback: bool) -> FeedConfig {
        FeedConfig {
            ws_url: "ws://127.0.0.1:1".to_string(),
            connect_timeout: Duration::from_millis(200),
            message_timeout: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(1),
            degraded_interval: Duration::from_millis(20),
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
                max_attempts: 2,
            },
            synthetic_fallback,
        }
    }

    fn store() -> Arc<PriceStore> {
        Arc::new(PriceStore::new(1350.0, RateBand::default()))
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_start_rejects_empty_instruments() {
        let feed = FeedConnectionManager::new(GlobalCodec::new(), unreachable_config(false), store(), None);
        let err = tokio_test::assert_err!(feed.start(vec![]));
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(!feed.is_running());
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let feed = FeedConnectionManager::new(GlobalCodec::new(), unreachable_config(false), store(), None);
        tokio_test::assert_ok!(feed.start(vec!["BTCUSDT".to_string()]));
        tokio_test::assert_ok!(feed.start(vec!["BTCUSDT".to_string()]));
        assert!(feed.is_running());

        feed.stop().await;
        feed.stop().await;
        assert!(!feed.is_running());
        assert_eq!(feed.state().status, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_degrades_to_polling_after_max_attempts() {
        let store = store();
        let source = Arc::new(MockTickerSource::new(ExchangeKind::Global, 42.0));
        let poller = Arc::new(TickerPoller::new(
            Arc::clone(&source) as Arc<dyn TickerSource>,
            Duration::from_millis(1),
            Duration::from_millis(10),
        ));
        let feed = FeedConnectionManager::new(
            GlobalCodec::new(),
            unreachable_config(false),
            Arc::clone(&store),
            Some(poller),
        );

        feed.start(vec!["BTCUSDT".to_string()]).unwrap();
        wait_for(|| store.get_quote(ExchangeKind::Global, "BTCUSDT").is_some()).await;

        let state = feed.state();
        assert_eq!(state.status, ConnectionStatus::Failed);
        assert!(state.degraded);
        assert_eq!(state.reconnect_attempts, 2);
        assert_eq!(
            store.get_quote(ExchangeKind::Global, "BTCUSDT").unwrap().source,
            SourceKind::Poll
        );

        feed.stop().await;
    }

    #[tokio::test]
    async fn test_synthetic_only_when_enabled() {
        let store = store();
        let feed = FeedConnectionManager::new(
            GlobalCodec::new(),
            unreachable_config(true),
            Arc::clone(&store),
            None,
        );
        feed.start(vec!["ETHUSDT".to_string()]).unwrap();
        wait_for(|| feed.stats().synthetic_quotes > 0).await;
        assert_eq!(
            store.get_quote(ExchangeKind::Global, "ETHUSDT").unwrap().source,
            SourceKind::Synthetic
        );
        feed.stop().await;

        let quiet_store = self::store();
        let quiet = FeedConnectionManager::new(
            GlobalCodec::new(),
            unreachable_config(false),
            Arc::clone(&quiet_store),
            None,
        );
        quiet.start(vec!["ETHUSDT".to_string()]).unwrap();
        let mut rx = quiet.subscribe_state();
        while !rx.borrow_and_update().degraded {
            rx.changed().await.unwrap();
        }
        sleep(Duration::from_millis(100)).await;
        assert!(quiet_store.get_quote(ExchangeKind::Global, "ETHUSDT").is_none());
        quiet.stop().await;
    }

    #[tokio::test]
    async fn test_no_writes_after_stop() {
        let store = store();
        let feed = FeedConnectionManager::new(
            GlobalCodec::new(),
            unreachable_config(true),
            Arc::clone(&store),
            None,
        );
        feed.start(vec!["SOLUSDT".to_string()]).unwrap();
        wait_for(|| feed.stats().synthetic_quotes > 0).await;

        feed.stop().await;
        let frozen = store.stats().accepted_count;
        sleep(Duration::from_millis(100)).await;
        assert_eq!(store.stats().accepted_count, frozen);
    }

    #[test]
    fn test_handle_payload_filters_unsubscribed() {
        let store = store();
        let feed = FeedConnectionManager::new(GlobalCodec::new(), unreachable_config(false), Arc::clone(&store), None);
        let subscribed: HashSet<&str> = ["BTCUSDT"].into_iter().collect();

        let frame = br#"{"action":"update","arg":{"channel":"ticker"},"data":[
            {"instId":"BTCUSDT","lastPr":"50000"},{"instId":"DOGEUSDT","lastPr":"0.1"}]}"#;
        assert!(feed.shared.handle_payload(frame, &subscribed));
        assert!(!feed.shared.handle_payload(b"not json", &subscribed));

        assert!(store.get_quote(ExchangeKind::Global, "BTCUSDT").is_some());
        assert!(store.get_quote(ExchangeKind::Global, "DOGEUSDT").is_none());
        let stats = feed.stats();
        assert_eq!(stats.quotes_merged, 1);
        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.messages, 2);
    }
}
