//! Aggregate statistics over premium results

use kimp_core::{PremiumResult, PremiumSummary, UnavailableReason};

/// Mean/min/max over available results only; unavailable ones are counted by reason
pub fn summarize(results: &[PremiumResult]) -> PremiumSummary {
    let mut summary = PremiumSummary::default();
    let mut sum = 0.0;

    for result in results {
        match (result.premium_percent, result.reason_unavailable) {
            (Some(pct), None) if result.available => {
                summary.available_count += 1;
                sum += pct;
                summary.min_percent = Some(summary.min_percent.map_or(pct, |m| m.min(pct)));
                summary.max_percent = Some(summary.max_percent.map_or(pct, |m| m.max(pct)));
            }
            (_, Some(UnavailableReason::NotCrossListed)) => summary.not_cross_listed_count += 1,
            (_, Some(UnavailableReason::StaleQuote)) => summary.stale_quote_count += 1,
            _ => summary.missing_quote_count += 1,
        }
    }

    if summary.available_count > 0 {
        summary.mean_percent = Some(sum / summary.available_count as f64);
    }
    summary
}
