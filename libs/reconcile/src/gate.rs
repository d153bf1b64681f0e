//! Decides whether an invocation does a real pass or only re-arms its timer.

use std::time::Duration;

use ttpair_model::PairStatus;

/// Outcome of the gating check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Run a real pass now.
    Process(GateReason),
    /// Nothing to do yet; come back after this long.
    Requeue(Duration),
}

/// Why a real pass runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateReason {
    GenerationChanged,
    OwnerChanged,
    IntervalElapsed,
}

impl std::fmt::Display for GateReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateReason::GenerationChanged => write!(f, "generation_changed"),
            GateReason::OwnerChanged => write!(f, "owner_changed"),
            GateReason::IntervalElapsed => write!(f, "interval_elapsed"),
        }
    }
}

/// Gate one invocation. First match wins:
///
/// 1. spec generation differs from the observed one
/// 2. another operator instance ran the last pass
/// 3. the polling interval has elapsed since the last real pass
/// 4. otherwise requeue after the remainder of the interval
///
/// When processing, the generation, pass time and operator id are recorded
/// in `status` before anything else happens. A requeue leaves `status`
/// untouched so the cadence anchor never moves.
pub fn gate_pass(
    status: &mut PairStatus,
    generation: i64,
    operator_id: &str,
    now_ms: i64,
    interval: Duration,
) -> GateDecision {
    let interval_ms = i64::try_from(interval.as_millis()).unwrap_or(i64::MAX);
    let elapsed_ms = now_ms.saturating_sub(status.last_reconcile_time_ms);

    let reason = if generation != status.observed_generation {
        GateReason::GenerationChanged
    } else if status.last_reconciling_operator != operator_id {
        GateReason::OwnerChanged
    } else if elapsed_ms >= interval_ms {
        GateReason::IntervalElapsed
    } else {
        // A clock that went backwards never waits longer than one interval.
        let remaining = (interval_ms - elapsed_ms).min(interval_ms);
        return GateDecision::Requeue(Duration::from_millis(remaining.max(0) as u64));
    };

    status.observed_generation = generation;
    status.last_reconcile_time_ms = now_ms;
    status.last_reconciling_operator = operator_id.to_string();
    GateDecision::Process(reason)
}
