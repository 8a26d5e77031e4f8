use std::time::Duration;

/// Measurements from the cycle that just finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingInputs {
    /// Wall-clock time spent in the cycle.
    pub elapsed: Duration,
    /// Segments checked or reloaded during the cycle.
    pub segments_processed: u64,
    /// Per-cycle budget; half of it is kept free as headroom for new arrivals.
    pub sync_period: Duration,
}

/// What the loop does before the next cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingDecision {
    /// Ok segments to reset to Dirty for re-verification.
    pub mark_dirty: u64,
    /// Idle time left in the current period.
    pub sleep_for: Duration,
}

/// Decides how much re-verification to schedule for the next cycle.
///
/// The time left above the half-period floor is spent on re-checks, priced at twice the
/// average per-segment cost observed in this cycle. Growth is capped at `1 + 2 * processed`
/// so an idle loop ramps up gradually instead of jumping to a full re-scan.
pub fn plan_next_cycle(inputs: PacingInputs) -> PacingDecision {
    let remaining = inputs.sync_period.saturating_sub(inputs.elapsed);
    let half_period_floor = inputs.sync_period / 2;
    let spare_ms = remaining.saturating_sub(half_period_floor).as_millis();

    let per_segment_ms = (inputs.elapsed.as_millis()
        / u128::from(inputs.segments_processed.saturating_add(1)))
    .max(1);
    let affordable = spare_ms / per_segment_ms.saturating_mul(2);
    let ramp_cap = u128::from(inputs.segments_processed)
        .saturating_mul(2)
        .saturating_add(1);

    PacingDecision {
        mark_dirty: u64::try_from(affordable.min(ramp_cap)).unwrap_or(u64::MAX),
        sleep_for: remaining,
    }
}
