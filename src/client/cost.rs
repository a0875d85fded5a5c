//! Run-scoped estimate of directory-service spend.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

/// Billable call types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    /// Text search used to resolve a listing.
    Resolve,
    /// Place details lookup.
    Details,
    /// Photo reference listing.
    Photos,
}

impl CallType {
    /// Estimated USD cost of a single call.
    pub fn unit_cost_usd(self) -> f64 {
        match self {
            CallType::Resolve => 0.032,
            CallType::Details => 0.017,
            CallType::Photos => 0.007,
        }
    }

    /// Label used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            CallType::Resolve => "resolve",
            CallType::Details => "details",
            CallType::Photos => "photos",
        }
    }
}

/// Call counts recorded during a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostSnapshot {
    /// Resolution calls issued.
    pub resolve_calls: usize,
    /// Details calls issued.
    pub details_calls: usize,
    /// Photo listing calls issued.
    pub photo_calls: usize,
    /// Estimated total spend in USD.
    pub estimated_cost_usd: f64,
}

/// Counts every attempted call. Observational only; nothing reads it to make
/// decisions.
#[derive(Debug, Default)]
pub struct CostLedger {
    resolve: AtomicUsize,
    details: AtomicUsize,
    photos: AtomicUsize,
}

impl CostLedger {
    /// Records one call of the given type.
    pub fn record(&self, call: CallType) {
        let counter = match call {
            CallType::Resolve => &self.resolve,
            CallType::Details => &self.details,
            CallType::Photos => &self.photos,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Current counts plus the derived cost estimate.
    pub fn snapshot(&self) -> CostSnapshot {
        let resolve_calls = self.resolve.load(Ordering::Relaxed);
        let details_calls = self.details.load(Ordering::Relaxed);
        let photo_calls = self.photos.load(Ordering::Relaxed);
        let estimated_cost_usd = resolve_calls as f64 * CallType::Resolve.unit_cost_usd()
            + details_calls as f64 * CallType::Details.unit_cost_usd()
            + photo_calls as f64 * CallType::Photos.unit_cost_usd();
        CostSnapshot {
            resolve_calls,
            details_calls,
            photo_calls,
            estimated_cost_usd,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_prices_each_call_type() {
        let ledger = CostLedger::default();
        ledger.record(CallType::Resolve);
        ledger.record(CallType::Details);
        ledger.record(CallType::Details);
        ledger.record(CallType::Photos);

        let snapshot = ledger.snapshot();
        assert_eq!(snapshot.resolve_calls, 1);
        assert_eq!(snapshot.details_calls, 2);
        assert_eq!(snapshot.photo_calls, 1);
        let expected = 0.032 + 2.0 * 0.017 + 0.007;
        assert!((snapshot.estimated_cost_usd - expected).abs() < 1e-9);
    }
}
