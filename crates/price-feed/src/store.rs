//! Shared price store
//!
//! Quotes live in one DashMap per exchange. A merge compares timestamps while
//! holding the key's shard lock, so two producers racing on the same
//! instrument cannot lose the newer write. The exchange rate sits behind its
//! own lock and only changes when the new value passes the sanity band.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use kimp_core::{
    now_ms, ExchangeKind, ExchangeRateEntry, InstrumentQuote, RateBand, SourceKind, Sparkline,
};

const EVENT_CAPACITY: usize = 4_096;

/// Change notification published after every accepted merge.
///
/// Events are sent after the shard lock is released, so two racing writers
/// may publish in either order. Re-read the store for the current value.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    Quote {
        exchange: ExchangeKind,
        instrument_id: String,
        source: SourceKind,
        price: f64,
    },
    ExchangeRate {
        rate: f64,
    },
    Sparkline {
        exchange: ExchangeKind,
        instrument_id: String,
    },
}

/// Why a write was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Price was zero, negative or not finite
    InvalidPrice,
    /// The quote's own id disagrees with the key it was merged under
    IdMismatch,
    /// Exchange rate outside the configured band
    RateOutOfBand,
}

/// Result of a merge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Replaced,
    /// An entry with a newer timestamp was already present
    Superseded,
    Rejected(RejectReason),
}

impl MergeOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, MergeOutcome::Inserted | MergeOutcome::Replaced)
    }
}

/// Point-in-time copy of the store
#[derive(Debug, Clone, Serialize)]
pub struct PriceStoreSnapshot {
    pub global_quotes: HashMap<String, InstrumentQuote>,
    pub local_quotes: HashMap<String, InstrumentQuote>,
    pub exchange_rate: f64,
    pub taken_at_ms: i64,
}

/// Statistics about the store
#[derive(Debug, Clone)]
pub struct PriceStoreStats {
    pub global_count: usize,
    pub local_count: usize,
    pub sparkline_count: usize,
    pub accepted_count: u64,
    pub rejected_count: u64,
    pub superseded_count: u64,
    pub last_update_age: Duration,
}

#[derive(Debug)]
pub struct PriceStore {
    global: DashMap<String, InstrumentQuote>,
    local: DashMap<String, InstrumentQuote>,
    sparklines: DashMap<(ExchangeKind, String), Sparkline>,

    exchange_rate: RwLock<ExchangeRateEntry>,
    rate_band: RateBand,

    events: broadcast::Sender<StoreEvent>,

    accepted_count: AtomicU64,
    rejected_count: AtomicU64,
    superseded_count: AtomicU64,
    last_update: RwLock<Instant>,
}

impl PriceStore {
    /// Create a store seeded with `default_rate` until the first FX load
    pub fn new(default_rate: f64, rate_band: RateBand) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            global: DashMap::new(),
            local: DashMap::new(),
            sparklines: DashMap::new(),
            exchange_rate: RwLock::new(ExchangeRateEntry {
                rate: default_rate,
                updated_at_ms: now_ms(),
                seeded: true,
            }),
            rate_band,
            events,
            accepted_count: AtomicU64::new(0),
            rejected_count: AtomicU64::new(0),
            superseded_count: AtomicU64::new(0),
            last_update: RwLock::new(Instant::now()),
        }
    }

    fn quotes(&self, exchange: ExchangeKind) -> &DashMap<String, InstrumentQuote> {
        match exchange {
            ExchangeKind::Global => &self.global,
            ExchangeKind::Local => &self.local,
        }
    }

    /// Merge a quote. Last write wins by ingestion timestamp; equal timestamps
    /// let this call win. Source kind carries no priority.
    pub fn merge_quote(
        &self,
        exchange: ExchangeKind,
        instrument_id: &str,
        quote: InstrumentQuote,
    ) -> MergeOutcome {
        if !quote.is_valid() {
            warn!(
                exchange = %exchange,
                instrument = instrument_id,
                price = quote.price,
                "Rejected quote with non-positive price"
            );
            return self.reject(RejectReason::InvalidPrice);
        }
        if quote.instrument_id != instrument_id {
            warn!(
                exchange = %exchange,
                instrument = instrument_id,
                quote_instrument = %quote.instrument_id,
                "Rejected quote merged under a different key"
            );
            return self.reject(RejectReason::IdMismatch);
        }

        let source = quote.source;
        let price = quote.price;

        let outcome = match self.quotes(exchange).entry(instrument_id.to_string()) {
            Entry::Occupied(mut entry) => {
                if quote.timestamp_ms >= entry.get().timestamp_ms {
                    entry.insert(quote);
                    MergeOutcome::Replaced
                } else {
                    MergeOutcome::Superseded
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(quote);
                MergeOutcome::Inserted
            }
        };

        if outcome.is_applied() {
            self.mark_accepted();
            let _ = self.events.send(StoreEvent::Quote {
                exchange,
                instrument_id: instrument_id.to_string(),
                source,
                price,
            });
        } else {
            self.superseded_count.fetch_add(1, Ordering::Relaxed);
            debug!(exchange = %exchange, instrument = instrument_id, "Ignored older quote");
        }

        outcome
    }

    /// Merge a batch from one producer, returning how many were applied
    pub fn merge_quotes<I>(&self, exchange: ExchangeKind, quotes: I) -> usize
    where
        I: IntoIterator<Item = InstrumentQuote>,
    {
        let mut applied = 0;
        for quote in quotes {
            let id = quote.instrument_id.clone();
            if self.merge_quote(exchange, &id, quote).is_applied() {
                applied += 1;
            }
        }
        applied
    }

    /// Replace the exchange rate if it lies inside the sanity band
    pub fn merge_exchange_rate(&self, rate: f64) -> MergeOutcome {
        if !self.rate_band.contains(rate) {
            warn!(
                rate,
                min = self.rate_band.min,
                max = self.rate_band.max,
                "Rejected exchange rate outside sanity band"
            );
            return self.reject(RejectReason::RateOutOfBand);
        }

        *self.exchange_rate.write() = ExchangeRateEntry {
            rate,
            updated_at_ms: now_ms(),
            seeded: false,
        };

        self.mark_accepted();
        let _ = self.events.send(StoreEvent::ExchangeRate { rate });
        MergeOutcome::Replaced
    }

    pub fn merge_sparkline(&self, exchange: ExchangeKind, sparkline: Sparkline) -> MergeOutcome {
        if sparkline.is_empty() {
            return MergeOutcome::Superseded;
        }
        let instrument_id = sparkline.instrument_id.clone();
        self.sparklines.insert((exchange, instrument_id.clone()), sparkline);

        self.mark_accepted();
        let _ = self.events.send(StoreEvent::Sparkline { exchange, instrument_id });
        MergeOutcome::Replaced
    }

    pub fn get_quote(&self, exchange: ExchangeKind, instrument_id: &str) -> Option<InstrumentQuote> {
        self.quotes(exchange).get(instrument_id).map(|r| r.value().clone())
    }

    pub fn get_sparkline(&self, exchange: ExchangeKind, instrument_id: &str) -> Option<Sparkline> {
        self.sparklines
            .get(&(exchange, instrument_id.to_string()))
            .map(|r| r.value().clone())
    }

    pub fn exchange_rate(&self) -> f64 {
        self.exchange_rate.read().rate
    }

    pub fn exchange_rate_entry(&self) -> ExchangeRateEntry {
        *self.exchange_rate.read()
    }

    pub fn rate_band(&self) -> RateBand {
        self.rate_band
    }

    /// All quotes for one exchange
    pub fn quotes_for(&self, exchange: ExchangeKind) -> HashMap<String, InstrumentQuote> {
        self.quotes(exchange)
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn snapshot(&self) -> PriceStoreSnapshot {
        PriceStoreSnapshot {
            global_quotes: self.quotes_for(ExchangeKind::Global),
            local_quotes: self.quotes_for(ExchangeKind::Local),
            exchange_rate: self.exchange_rate(),
            taken_at_ms: now_ms(),
        }
    }

    /// Receive a `StoreEvent` for every accepted merge
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Drop quotes older than `max_age`. Returns the number removed.
    pub fn remove_stale(&self, max_age: Duration) -> usize {
        let now = now_ms();
        let max_age_ms = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        let mut removed = 0;

        for quotes in [&self.global, &self.local] {
            quotes.retain(|_, q| {
                let keep = !q.is_stale(max_age_ms, now);
                if !keep {
                    removed += 1;
                }
                keep
            });
        }

        if removed > 0 {
            debug!(removed, max_age = ?max_age, "Removed stale quotes");
        }
        removed
    }

    pub fn stats(&self) -> PriceStoreStats {
        PriceStoreStats {
            global_count: self.global.len(),
            local_count: self.local.len(),
            sparkline_count: self.sparklines.len(),
            accepted_count: self.accepted_count.load(Ordering::Relaxed),
            rejected_count: self.rejected_count.load(Ordering::Relaxed),
            superseded_count: self.superseded_count.load(Ordering::Relaxed),
            last_update_age: self.last_update.read().elapsed(),
        }
    }

    fn mark_accepted(&self) {
        self.accepted_count.fetch_add(1, Ordering::Relaxed);
        *self.last_update.write() = Instant::now();
    }

    fn reject(&self, reason: RejectReason) -> MergeOutcome {
        self.rejected_count.fetch_add(1, Ordering::Relaxed);
        MergeOutcome::Rejected(reason)
    }
}

impl Default for PriceStore {
    fn default() -> Self {
        Self::new(1350.0, RateBand::default())
    }
}
