//! Kimchi premium calculation
//!
//! `premium = (local - global * rate) / (global * rate) * 100`, evaluated on
//! demand from the store. Results are never cached.

use rayon::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use kimp_core::{
    now_ms, ExchangeKind, PremiumInputs, PremiumResult, PremiumSummary, SymbolMapper,
    UnavailableReason,
};
use kimp_price_feed::PriceStore;

use crate::summary::summarize;

pub struct PremiumCalculator {
    store: Arc<PriceStore>,
    mapper: Arc<SymbolMapper>,
    staleness: Option<Duration>,
}

impl PremiumCalculator {
    pub fn new(store: Arc<PriceStore>, mapper: Arc<SymbolMapper>) -> Self {
        Self { store, mapper, staleness: None }
    }

    /// Quotes older than `threshold` make the result `StaleQuote`. `None` disables the check.
    pub fn with_staleness(mut self, threshold: Option<Duration>) -> Self {
        self.staleness = threshold;
        self
    }

    pub fn mapper(&self) -> &SymbolMapper {
        &self.mapper
    }

    pub fn compute(&self, global_id: &str) -> PremiumResult {
        self.compute_at(global_id, now_ms())
    }

    /// Premium as of `now_ms`, which only matters for the staleness check
    pub fn compute_at(&self, global_id: &str, now_ms: i64) -> PremiumResult {
        let Some(local_id) = self.mapper.to_local(global_id) else {
            return PremiumResult::unavailable(global_id, UnavailableReason::NotCrossListed);
        };

        let global = self.store.get_quote(ExchangeKind::Global, global_id);
        let local = self.store.get_quote(ExchangeKind::Local, local_id);
        let (Some(global), Some(local)) = (global, local) else {
            return PremiumResult::unavailable(global_id, UnavailableReason::MissingQuote);
        };
        if !global.is_valid() || !local.is_valid() {
            return PremiumResult::unavailable(global_id, UnavailableReason::MissingQuote);
        }

        if let Some(threshold) = self.staleness {
            let max_age_ms = i64::try_from(threshold.as_millis()).unwrap_or(i64::MAX);
            if global.is_stale(max_age_ms, now_ms) || local.is_stale(max_age_ms, now_ms) {
                debug!(
                    instrument = global_id,
                    global_age_ms = global.age_ms(now_ms),
                    local_age_ms = local.age_ms(now_ms),
                    "Premium unavailable, stale quote"
                );
                return PremiumResult::unavailable(global_id, UnavailableReason::StaleQuote);
            }
        }

        let inputs = PremiumInputs {
            global_price: global.price,
            local_price: local.price,
            exchange_rate: self.store.exchange_rate(),
        };
        let converted = inputs.global_price_local();
        if !(converted.is_finite() && converted > 0.0) {
            return PremiumResult::unavailable(global_id, UnavailableReason::MissingQuote);
        }

        let premium = (inputs.local_price - converted) / converted * 100.0;
        PremiumResult::available(global_id, premium, inputs)
    }

    /// Every table entry, in table order, computed in parallel
    pub fn compute_all(&self) -> Vec<PremiumResult> {
        let now = now_ms();
        self.mapper
            .entries()
            .par_iter()
            .map(|entry| self.compute_at(&entry.global_id, now))
            .collect()
    }

    /// The given ids, in order, computed in parallel
    pub fn compute_many(&self, global_ids: &[String]) -> Vec<PremiumResult> {
        let now = now_ms();
        global_ids
            .par_iter()
            .map(|id| self.compute_at(id, now))
            .collect()
    }

    pub fn summary(&self) -> PremiumSummary {
        summarize(&self.compute_all())
    }
}
