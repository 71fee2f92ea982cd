//! Pure health-score calculation (C9).
//!
//! Takes a snapshot of the fields a score depends on and returns a value in
//! `[0, 100]`. No I/O, no shared state — callers pass in whatever credential
//! fields are current.

/// The subset of a credential's state the score formula reads.
#[derive(Debug, Clone, Copy)]
pub struct HealthSnapshot {
    pub weekly_used: f64,
    pub weekly_budget: f64,
    pub current_block_cost: f64,
    pub assigned_clients_count: usize,
    pub burn_rate_usd_per_hour: f64,
}

/// Assumed expected spend across a full 5-hour block, used to normalise the
/// block-usage penalty.
const EXPECTED_BLOCK_SPEND_USD: f64 = 25.0;
const BURN_RATE_BASELINE_USD_PER_HOUR: f64 = 3.0;

/// `score(snapshot) -> [0, 100]`, per spec §4.9.
///
/// `weekly_budget` is guaranteed nonzero by the subscription manager's
/// initialisation gate (spec §4.6); a zero value here still can't panic
/// since division only ever multiplies a ratio, so a defensive zero-guard
/// keeps this function total regardless of that external guarantee.
pub fn score(snapshot: &HealthSnapshot) -> f64 {
    let mut value = 100.0_f64;

    let weekly_ratio = if snapshot.weekly_budget > 0.0 {
        snapshot.weekly_used / snapshot.weekly_budget
    } else {
        0.0
    };
    value -= 0.5 * (100.0 * weekly_ratio);

    let block_ratio = 100.0 * snapshot.current_block_cost / EXPECTED_BLOCK_SPEND_USD;
    value -= 0.3 * block_ratio.min(100.0);

    value -= 5.0 * snapshot.assigned_clients_count as f64;

    value -= 2.0 * (snapshot.burn_rate_usd_per_hour - BURN_RATE_BASELINE_USD_PER_HOUR).max(0.0);

    if snapshot.current_block_cost == 0.0 {
        value += 10.0;
    }

    value.clamp(0.0, 100.0)
}
