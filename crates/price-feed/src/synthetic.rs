//! Synthetic quotes for degraded mode
//!
//! Only used when a feed was built with `synthetic_fallback`. Every quote is
//! tagged `SourceKind::Synthetic` so consumers can tell it apart.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;

use kimp_core::{base_asset, now_ms, ExchangeKind, InstrumentQuote, SourceKind};

use crate::store::PriceStore;

/// Maximum relative move per tick
const DEFAULT_VOLATILITY: f64 = 0.002;

/// Rough USD levels used when the store has nothing for an instrument
const SEED_PRICES_USD: &[(&str, f64)] = &[
    ("BTC", 65_000.0),
    ("ETH", 3_200.0),
    ("XRP", 0.55),
    ("SOL", 150.0),
    ("DOGE", 0.12),
    ("ADA", 0.45),
    ("TRX", 0.12),
    ("AVAX", 30.0),
    ("LINK", 15.0),
    ("DOT", 6.0),
    ("BCH", 400.0),
    ("SUI", 1.5),
    ("XLM", 0.11),
    ("ETC", 25.0),
    ("NEAR", 5.0),
    ("APT", 8.0),
    ("HBAR", 0.08),
    ("SHIB", 0.000_02),
    ("BNB", 550.0),
    ("TON", 6.0),
    ("LTC", 80.0),
    ("PEPE", 0.000_01),
];

pub struct SyntheticSource {
    seeds: HashMap<String, f64>,
    volatility: f64,
    rng: Mutex<StdRng>,
}

impl SyntheticSource {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Reproducible walk for tests
    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            seeds: SEED_PRICES_USD
                .iter()
                .map(|(asset, price)| (asset.to_string(), *price))
                .collect(),
            volatility: DEFAULT_VOLATILITY,
            rng: Mutex::new(rng),
        }
    }

    pub fn with_volatility(mut self, volatility: f64) -> Self {
        self.volatility = volatility.abs();
        self
    }

    /// Seed price in the exchange's quote currency
    fn seed_price(&self, exchange: ExchangeKind, instrument_id: &str, rate: f64) -> Option<f64> {
        let asset = match exchange {
            ExchangeKind::Global => base_asset(instrument_id),
            ExchangeKind::Local => instrument_id.rsplit('-').next().unwrap_or(instrument_id),
        };
        let usd = *self.seeds.get(asset)?;
        Some(match exchange {
            ExchangeKind::Global => usd,
            ExchangeKind::Local => usd * rate,
        })
    }

    /// One synthetic tick per instrument, walking from the stored price.
    /// Instruments with neither a stored price nor a seed are skipped.
    pub fn next_quotes(
        &self,
        exchange: ExchangeKind,
        instruments: &[String],
        store: &PriceStore,
    ) -> Vec<InstrumentQuote> {
        let now = now_ms();
        let rate = store.exchange_rate();
        let mut rng = self.rng.lock();

        instruments
            .iter()
            .filter_map(|id| {
                let last = store
                    .get_quote(exchange, id)
                    .map(|q| q.price)
                    .or_else(|| self.seed_price(exchange, id, rate))?;

                let step = rng.gen_range(-1.0..=1.0) * self.volatility;
                let price = last * (1.0 + step);
                (price.is_finite() && price > 0.0)
                    .then(|| InstrumentQuote::new(id.clone(), price, now, SourceKind::Synthetic))
            })
            .collect()
    }
}

impl Default for SyntheticSource {
    fn default() -> Self {
        Self::new()
    }
}
