//! Scheduling supervisor - periodic REST work alongside the push feeds
//!
//! Three independent tasks: ticker polling, sparkline refresh and exchange
//! rate refresh, plus a housekeeping task that drops stale quotes and expired
//! cache entries. Each runs on its own tokio task and timer, so a slow or
//! failing upstream only ever delays its own task.

use futures::future::join_all;
use parking_lot::Mutex;
use rand::Rng;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use kimp_core::PollingSettings;

use crate::candles::CandlePoller;
use crate::fx::ExchangeRateProvider;
use crate::poller::{BatchOrigin, TickerPoller};
use crate::store::PriceStore;

const STOP_GRACE: Duration = Duration::from_secs(5);

/// Supervisor configuration
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub ticker_interval: Duration,
    pub candle_interval: Duration,
    pub fx_interval: Duration,
    /// Upper bound of the random delay added to every interval
    pub jitter: Duration,
    pub housekeeping_interval: Duration,
    pub max_quote_age: Duration,
}

impl SupervisorConfig {
    pub fn from_settings(settings: &PollingSettings) -> Self {
        Self {
            ticker_interval: settings.ticker_interval(),
            candle_interval: settings.candle_interval(),
            fx_interval: settings.fx_interval(),
            jitter: settings.jitter(),
            housekeeping_interval: settings.housekeeping_interval(),
            max_quote_age: settings.max_quote_age(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::from_settings(&PollingSettings::default())
    }
}

/// A ticker poller and the instruments it refreshes
pub struct TickerJob {
    pub poller: Arc<TickerPoller>,
    pub instruments: Vec<String>,
}

/// A candle poller and the instruments whose sparklines it refreshes
pub struct CandleJob {
    pub poller: Arc<CandlePoller>,
    pub instruments: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskStats {
    pub runs: u64,
    pub failures: u64,
}

/// Per-task counters
#[derive(Debug, Clone, Copy, Default)]
pub struct SupervisorStats {
    pub ticker: TaskStats,
    pub candle: TaskStats,
    pub fx: TaskStats,
    pub housekeeping: TaskStats,
}

#[derive(Default)]
struct TaskCounters {
    runs: AtomicU64,
    failures: AtomicU64,
}

impl TaskCounters {
    fn snapshot(&self) -> TaskStats {
        TaskStats {
            runs: self.runs.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    fn run(&self) {
        self.runs.fetch_add(1, Ordering::Relaxed);
    }

    fn fail(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Default)]
struct Counters {
    ticker: TaskCounters,
    candle: TaskCounters,
    fx: TaskCounters,
    housekeeping: TaskCounters,
}

struct Running {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

pub struct SchedulingSupervisor {
    config: SupervisorConfig,
    store: Arc<PriceStore>,
    ticker_jobs: Arc<Vec<TickerJob>>,
    candle_jobs: Arc<Vec<CandleJob>>,
    fx: Option<Arc<ExchangeRateProvider>>,
    counters: Arc<Counters>,
    running: Mutex<Option<Running>>,
}

/// Builder for the supervisor
pub struct SchedulingSupervisorBuilder {
    config: SupervisorConfig,
    ticker_jobs: Vec<TickerJob>,
    candle_jobs: Vec<CandleJob>,
    fx: Option<Arc<ExchangeRateProvider>>,
}

impl SchedulingSupervisorBuilder {
    pub fn new() -> Self {
        Self {
            config: SupervisorConfig::default(),
            ticker_jobs: vec![],
            candle_jobs: vec![],
            fx: None,
        }
    }

    pub fn config(mut self, config: SupervisorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn ticker(mut self, poller: Arc<TickerPoller>, instruments: Vec<String>) -> Self {
        if !instruments.is_empty() {
            self.ticker_jobs.push(TickerJob { poller, instruments });
        }
        self
    }

    pub fn candles(mut self, poller: Arc<CandlePoller>, instruments: Vec<String>) -> Self {
        if !instruments.is_empty() {
            self.candle_jobs.push(CandleJob { poller, instruments });
        }
        self
    }

    pub fn exchange_rate(mut self, provider: Arc<ExchangeRateProvider>) -> Self {
        self.fx = Some(provider);
        self
    }

    pub fn build(self, store: Arc<PriceStore>) -> SchedulingSupervisor {
        SchedulingSupervisor {
            config: self.config,
            store,
            ticker_jobs: Arc::new(self.ticker_jobs),
            candle_jobs: Arc::new(self.candle_jobs),
            fx: self.fx,
            counters: Arc::new(Counters::default()),
            running: Mutex::new(None),
        }
    }
}

impl Default for SchedulingSupervisorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulingSupervisor {
    pub fn builder() -> SchedulingSupervisorBuilder {
        SchedulingSupervisorBuilder::new()
    }

    /// Spawn the periodic tasks. Each fires once immediately. No-op when running.
    pub fn start(&self) {
        let mut running = self.running.lock();
        if running.is_some() {
            debug!("Scheduling supervisor already running");
            return;
        }

        info!(
            ticker_jobs = self.ticker_jobs.len(),
            candle_jobs = self.candle_jobs.len(),
            fx = self.fx.is_some(),
            "Starting scheduling supervisor"
        );

        let (shutdown, rx) = watch::channel(false);
        let jitter = self.config.jitter;
        let mut handles = Vec::with_capacity(4);

        if !self.ticker_jobs.is_empty() {
            let jobs = Arc::clone(&self.ticker_jobs);
            let store = Arc::clone(&self.store);
            let counters = Arc::clone(&self.counters);
            handles.push(spawn_periodic("ticker", self.config.ticker_interval, jitter, rx.clone(), move || {
                let (jobs, store, counters) = (Arc::clone(&jobs), Arc::clone(&store), Arc::clone(&counters));
                async move { ticker_cycle(&jobs, &store, &counters.ticker).await }
            }));
        }

        if !self.candle_jobs.is_empty() {
            let jobs = Arc::clone(&self.candle_jobs);
            let store = Arc::clone(&self.store);
            let counters = Arc::clone(&self.counters);
            handles.push(spawn_periodic("candle", self.config.candle_interval, jitter, rx.clone(), move || {
                let (jobs, store, counters) = (Arc::clone(&jobs), Arc::clone(&store), Arc::clone(&counters));
                async move { candle_cycle(&jobs, &store, &counters.candle).await }
            }));
        }

        if let Some(provider) = &self.fx {
            let provider = Arc::clone(provider);
            let store = Arc::clone(&self.store);
            let counters = Arc::clone(&self.counters);
            handles.push(spawn_periodic("fx", self.config.fx_interval, jitter, rx.clone(), move || {
                let (provider, store, counters) = (Arc::clone(&provider), Arc::clone(&store), Arc::clone(&counters));
                async move { fx_cycle(&provider, &store, &counters.fx).await }
            }));
        }

        {
            let ticker_jobs = Arc::clone(&self.ticker_jobs);
            let candle_jobs = Arc::clone(&self.candle_jobs);
            let store = Arc::clone(&self.store);
            let counters = Arc::clone(&self.counters);
            let max_age = self.config.max_quote_age;
            handles.push(spawn_periodic("housekeeping", self.config.housekeeping_interval, jitter, rx, move || {
                housekeeping_cycle(&ticker_jobs, &candle_jobs, &store, max_age, &counters.housekeeping);
                std::future::ready(())
            }));
        }

        *running = Some(Running { shutdown, handles });
    }

    /// Cancel in-flight work and wait for every task to finish
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        let Some(Running { shutdown, handles }) = running else {
            return;
        };

        info!("Stopping scheduling supervisor");
        let _ = shutdown.send(true);

        for mut handle in handles {
            if timeout(STOP_GRACE, &mut handle).await.is_err() {
                warn!("Scheduled task did not stop in time, aborting");
                handle.abort();
                let _ = handle.await;
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn stats(&self) -> SupervisorStats {
        SupervisorStats {
            ticker: self.counters.ticker.snapshot(),
            candle: self.counters.candle.snapshot(),
            fx: self.counters.fx.snapshot(),
            housekeeping: self.counters.housekeeping.snapshot(),
        }
    }
}

fn jittered(period: Duration, jitter: Duration) -> Duration {
    let max_ms = jitter.as_millis() as u64;
    if max_ms == 0 {
        return period;
    }
    period + Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

/// Run `cycle` now and then every `period` (+ jitter) until shutdown.
/// Shutdown also cancels a cycle that is still in flight.
fn spawn_periodic<F, Fut>(
    task: &'static str,
    period: Duration,
    jitter: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut cycle: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = cycle() => {}
            }

            let delay = jittered(period, jitter);
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = sleep(delay) => {}
            }
        }
        debug!(task, "Scheduled task stopped");
    })
}

async fn ticker_cycle(jobs: &[TickerJob], store: &PriceStore, counters: &TaskCounters) {
    counters.run();

    let polls = jobs.iter().map(|job| async move {
        (job, job.poller.fetch_batch_detailed(&job.instruments).await)
    });

    for (job, batch) in join_all(polls).await {
        let exchange = job.poller.exchange();
        match batch.origin {
            BatchOrigin::Network => {
                let merged = store.merge_quotes(exchange, batch.quotes.into_values());
                debug!(exchange = %exchange, merged, "Ticker poll merged");
            }
            // Already merged when it was fetched
            BatchOrigin::Cache => {}
            BatchOrigin::StaleCache | BatchOrigin::Empty => counters.fail(),
        }
    }
}

async fn candle_cycle(jobs: &[CandleJob], store: &PriceStore, counters: &TaskCounters) {
    counters.run();

    let refreshes = jobs.iter().map(|job| async move {
        let exchange = job.poller.exchange();
        let mut missing = 0usize;
        for id in &job.instruments {
            match job.poller.sparkline(id).await {
                Some(line) => {
                    store.merge_sparkline(exchange, line);
                }
                None => missing += 1,
            }
        }
        (exchange, missing)
    });

    for (exchange, missing) in join_all(refreshes).await {
        if missing > 0 {
            counters.fail();
            debug!(exchange = %exchange, missing, "Sparklines unavailable");
        }
    }
}

async fn fx_cycle(provider: &ExchangeRateProvider, store: &PriceStore, counters: &TaskCounters) {
    counters.run();

    match provider.current_rate().await {
        Some(rate) => {
            if !store.merge_exchange_rate(rate).is_applied() {
                counters.fail();
            }
        }
        None => {
            counters.fail();
            warn!(
                rate = store.exchange_rate(),
                "No exchange rate source available, keeping last rate"
            );
        }
    }
}

fn housekeeping_cycle(
    ticker_jobs: &[TickerJob],
    candle_jobs: &[CandleJob],
    store: &PriceStore,
    max_quote_age: Duration,
    counters: &TaskCounters,
) {
    counters.run();

    let removed = store.remove_stale(max_quote_age);
    for job in ticker_jobs {
        job.poller.evict_expired();
    }
    for job in candle_jobs {
        job.poller.evict_expired();
    }

    if removed > 0 {
        info!(removed, max_age = ?max_quote_age, "Housekeeping dropped stale quotes");
    }
}
