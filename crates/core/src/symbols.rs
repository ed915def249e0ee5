//! Symbol mapping between the global and local exchanges
//!
//! The table is asymmetric: a global instrument with no local listing maps to
//! `None`, and that is a permanent answer, not a cache miss.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::LazyLock;

/// One row of the mapping table
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SymbolMapping {
    pub global_id: String,
    pub local_id: Option<String>,
}

impl SymbolMapping {
    pub fn cross_listed(global_id: &str, local_id: &str) -> Self {
        Self {
            global_id: global_id.to_string(),
            local_id: Some(local_id.to_string()),
        }
    }

    pub fn global_only(global_id: &str) -> Self {
        Self {
            global_id: global_id.to_string(),
            local_id: None,
        }
    }
}

/// Built-in table: global USDT pair -> local KRW market
pub static DEFAULT_MAPPINGS: LazyLock<Vec<SymbolMapping>> = LazyLock::new(|| {
    vec![
        SymbolMapping::cross_listed("BTCUSDT", "KRW-BTC"),
        SymbolMapping::cross_listed("ETHUSDT", "KRW-ETH"),
        SymbolMapping::cross_listed("XRPUSDT", "KRW-XRP"),
        SymbolMapping::cross_listed("SOLUSDT", "KRW-SOL"),
        SymbolMapping::cross_listed("DOGEUSDT", "KRW-DOGE"),
        SymbolMapping::cross_listed("ADAUSDT", "KRW-ADA"),
        SymbolMapping::cross_listed("TRXUSDT", "KRW-TRX"),
        SymbolMapping::cross_listed("AVAXUSDT", "KRW-AVAX"),
        SymbolMapping::cross_listed("LINKUSDT", "KRW-LINK"),
        SymbolMapping::cross_listed("DOTUSDT", "KRW-DOT"),
        SymbolMapping::cross_listed("BCHUSDT", "KRW-BCH"),
        SymbolMapping::cross_listed("SUIUSDT", "KRW-SUI"),
        SymbolMapping::cross_listed("XLMUSDT", "KRW-XLM"),
        SymbolMapping::cross_listed("ETCUSDT", "KRW-ETC"),
        SymbolMapping::cross_listed("NEARUSDT", "KRW-NEAR"),
        SymbolMapping::cross_listed("APTUSDT", "KRW-APT"),
        SymbolMapping::cross_listed("HBARUSDT", "KRW-HBAR"),
        SymbolMapping::cross_listed("SHIBUSDT", "KRW-SHIB"),
        // Not listed on the local exchange
        SymbolMapping::global_only("BNBUSDT"),
        SymbolMapping::global_only("TONUSDT"),
        SymbolMapping::global_only("LTCUSDT"),
        SymbolMapping::global_only("PEPEUSDT"),
    ]
});

/// Bidirectional lookup over a fixed table
#[derive(Debug, Clone)]
pub struct SymbolMapper {
    entries: Vec<SymbolMapping>,
    to_local: HashMap<String, Option<String>>,
    to_global: HashMap<String, String>,
}

impl SymbolMapper {
    /// Build from an explicit table. Later rows win on duplicate global ids.
    pub fn from_entries(entries: Vec<SymbolMapping>) -> Self {
        let mut to_local = HashMap::with_capacity(entries.len());
        let mut to_global = HashMap::with_capacity(entries.len());

        for entry in &entries {
            to_local.insert(entry.global_id.clone(), entry.local_id.clone());
            if let Some(local) = &entry.local_id {
                to_global.insert(local.clone(), entry.global_id.clone());
            }
        }

        Self { entries, to_local, to_global }
    }

    /// Local counterpart of a global instrument, `None` if not cross-listed or unknown
    pub fn to_local(&self, global_id: &str) -> Option<&str> {
        self.to_local.get(global_id).and_then(|l| l.as_deref())
    }

    /// Global counterpart of a local instrument
    pub fn to_global(&self, local_id: &str) -> Option<&str> {
        self.to_global.get(local_id).map(String::as_str)
    }

    /// Whether the global id appears in the table at all
    pub fn contains(&self, global_id: &str) -> bool {
        self.to_local.contains_key(global_id)
    }

    pub fn entries(&self) -> &[SymbolMapping] {
        &self.entries
    }

    pub fn global_ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.global_id.clone()).collect()
    }

    /// Rows that have a local counterpart
    pub fn cross_listed(&self) -> impl Iterator<Item = &SymbolMapping> {
        self.entries.iter().filter(|e| e.local_id.is_some())
    }

    /// Local ids for the given global ids, skipping the ones not cross-listed
    pub fn local_ids_for(&self, global_ids: &[String]) -> Vec<String> {
        global_ids
            .iter()
            .filter_map(|g| self.to_local(g).map(str::to_string))
            .collect()
    }

    /// Restrict the table to the given global ids, keeping table order
    pub fn restricted_to(&self, global_ids: &[String]) -> Self {
        let entries = self
            .entries
            .iter()
            .filter(|e| global_ids.iter().any(|g| g == &e.global_id))
            .cloned()
            .collect();
        Self::from_entries(entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for SymbolMapper {
    fn default() -> Self {
        Self::from_entries(DEFAULT_MAPPINGS.clone())
    }
}

/// Base asset of a global USDT pair, e.g. `BTCUSDT` -> `BTC`
pub fn base_asset(global_id: &str) -> &str {
    global_id.strip_suffix("USDT").unwrap_or(global_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bidirectional_lookup() {
        let mapper = SymbolMapper::default();
        assert_eq!(mapper.to_local("BTCUSDT"), Some("KRW-BTC"));
        assert_eq!(mapper.to_global("KRW-BTC"), Some("BTCUSDT"));
        assert_eq!(mapper.to_local("ETHUSDT"), Some("KRW-ETH"));
    }

    #[test]
    fn test_not_cross_listed_is_preserved() {
        let mapper = SymbolMapper::default();
        assert!(mapper.contains("BNBUSDT"));
        assert_eq!(mapper.to_local("BNBUSDT"), None);
        // No guessing a local market from the base asset
        assert_eq!(mapper.to_global("KRW-BNB"), None);
    }

    #[test]
    fn test_unknown_instrument() {
        let mapper = SymbolMapper::default();
        assert!(!mapper.contains("FOOUSDT"));
        assert_eq!(mapper.to_local("FOOUSDT"), None);
    }

    #[test]
    fn test_local_ids_skip_global_only() {
        let mapper = SymbolMapper::default();
        let ids = vec!["BTCUSDT".to_string(), "BNBUSDT".to_string(), "XRPUSDT".to_string()];
        assert_eq!(mapper.local_ids_for(&ids), vec!["KRW-BTC", "KRW-XRP"]);
    }

    #[test]
    fn test_restricted_table() {
        let mapper = SymbolMapper::default();
        let subset = mapper.restricted_to(&["ETHUSDT".to_string(), "TONUSDT".to_string()]);
        assert_eq!(subset.len(), 2);
        assert_eq!(subset.to_local("ETHUSDT"), Some("KRW-ETH"));
        assert_eq!(subset.to_local("TONUSDT"), None);
        assert!(!subset.contains("BTCUSDT"));
    }

    #[test]
    fn test_base_asset() {
        assert_eq!(base_asset("BTCUSDT"), "BTC");
        assert_eq!(base_asset("KRW-BTC"), "KRW-BTC");
    }
}
