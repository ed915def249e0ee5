//! Premium result types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a premium could not be computed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnavailableReason {
    /// The instrument has no local listing
    NotCrossListed,
    /// One side has no usable quote
    MissingQuote,
    /// A quote is older than the configured staleness threshold
    StaleQuote,
}

impl fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnavailableReason::NotCrossListed => "not cross-listed",
            UnavailableReason::MissingQuote => "missing quote",
            UnavailableReason::StaleQuote => "stale quote",
        };
        f.write_str(s)
    }
}

/// Prices the premium was derived from
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PremiumInputs {
    pub global_price: f64,
    pub local_price: f64,
    pub exchange_rate: f64,
}

impl PremiumInputs {
    /// Global price converted into the local currency
    pub fn global_price_local(&self) -> f64 {
        self.global_price * self.exchange_rate
    }
}

/// Derived premium for one instrument. Never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PremiumResult {
    pub instrument_id: String,
    pub available: bool,
    pub premium_percent: Option<f64>,
    pub reason_unavailable: Option<UnavailableReason>,
    pub inputs: Option<PremiumInputs>,
}

impl PremiumResult {
    pub fn available(instrument_id: impl Into<String>, premium_percent: f64, inputs: PremiumInputs) -> Self {
        Self {
            instrument_id: instrument_id.into(),
            available: true,
            premium_percent: Some(premium_percent),
            reason_unavailable: None,
            inputs: Some(inputs),
        }
    }

    pub fn unavailable(instrument_id: impl Into<String>, reason: UnavailableReason) -> Self {
        Self {
            instrument_id: instrument_id.into(),
            available: false,
            premium_percent: None,
            reason_unavailable: Some(reason),
            inputs: None,
        }
    }

    pub fn is_available(&self) -> bool {
        self.available
    }
}

/// Aggregate over a batch of premium results. Unavailable results never
/// contribute to the statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PremiumSummary {
    pub available_count: usize,
    pub not_cross_listed_count: usize,
    pub missing_quote_count: usize,
    pub stale_quote_count: usize,
    pub mean_percent: Option<f64>,
    pub min_percent: Option<f64>,
    pub max_percent: Option<f64>,
}

impl PremiumSummary {
    pub fn unavailable_count(&self) -> usize {
        self.not_cross_listed_count + self.missing_quote_count + self.stale_quote_count
    }

    pub fn total(&self) -> usize {
        self.available_count + self.unavailable_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_shape() {
        let result = PremiumResult::unavailable("BNBUSDT", UnavailableReason::NotCrossListed);
        assert!(!result.is_available());
        assert!(result.premium_percent.is_none());
        assert_eq!(result.reason_unavailable, Some(UnavailableReason::NotCrossListed));
    }

    #[test]
    fn test_available_serializes_flat() {
        let inputs = PremiumInputs { global_price: 1.0, local_price: 1400.0, exchange_rate: 1350.0 };
        let result = PremiumResult::available("XRPUSDT", 3.7, inputs);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["available"], true);
        assert_eq!(json["reason_unavailable"], serde_json::Value::Null);
        assert_eq!(inputs.global_price_local(), 1350.0);
    }
}
