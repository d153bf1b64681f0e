//! Prometheus metrics for managed pairs.
//!
//! Recorded through the `metrics` facade; `main` installs the Prometheus
//! exporter when a metrics port is configured.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `ttpair_pair_state` | Gauge | `namespace`, `pair`, `state` |
//! | `ttpair_unit_state` | Gauge | `namespace`, `pair`, `unit`, `state` |
//! | `ttpair_unit_ready` | Gauge | `namespace`, `pair`, `unit` |
//! | `ttpair_ready_units` | Gauge | `namespace`, `pair` |
//! | `ttpair_awt_behind_mb` | Gauge | `namespace`, `pair` |
//! | `ttpair_async_task_duration_seconds` | Histogram | `task_type`, `outcome` |
//! | `ttpair_reconcile_passes_total` | Counter | `result` |
//!
//! State gauges carry one series per state token: 1 for the current state,
//! 0 for every other.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use ttpair_model::{HighLevelState, ManagedPair};

/// Metric names.
pub mod names {
    pub const PAIR_STATE: &str = "ttpair_pair_state";
    pub const UNIT_STATE: &str = "ttpair_unit_state";
    pub const UNIT_READY: &str = "ttpair_unit_ready";
    pub const READY_UNITS: &str = "ttpair_ready_units";
    pub const AWT_BEHIND_MB: &str = "ttpair_awt_behind_mb";
    pub const ASYNC_TASK_DURATION_SECONDS: &str = "ttpair_async_task_duration_seconds";
    pub const RECONCILE_PASSES_TOTAL: &str = "ttpair_reconcile_passes_total";
}

/// Label keys.
pub mod labels {
    pub const NAMESPACE: &str = "namespace";
    pub const PAIR: &str = "pair";
    pub const UNIT: &str = "unit";
    pub const STATE: &str = "state";
    pub const TASK_TYPE: &str = "task_type";
    pub const OUTCOME: &str = "outcome";
    pub const RESULT: &str = "result";
}

/// Register metric descriptions with the installed recorder.
pub fn register_metrics() {
    describe_gauge!(names::PAIR_STATE, "High level state of each managed pair");
    describe_gauge!(names::UNIT_STATE, "High level state of each unit");
    describe_gauge!(names::UNIT_READY, "Whether the unit reports ready");
    describe_gauge!(names::READY_UNITS, "Ready units per pair");
    describe_gauge!(
        names::AWT_BEHIND_MB,
        "Megabytes of cache group changes not yet propagated by the active"
    );
    describe_histogram!(
        names::ASYNC_TASK_DURATION_SECONDS,
        "Agent-reported duration of completed async tasks"
    );
    describe_counter!(names::RECONCILE_PASSES_TOTAL, "Reconcile passes by result");
}

fn flag(on: bool) -> f64 {
    if on {
        1.0
    } else {
        0.0
    }
}

/// Publish the state gauges for `pair` as its status now stands.
pub fn record_pair(pair: &ManagedPair) {
    let namespace = pair.namespace.clone();
    let name = pair.name.clone();
    let status = &pair.status;

    for state in HighLevelState::ALL {
        gauge!(
            names::PAIR_STATE,
            labels::NAMESPACE => namespace.clone(),
            labels::PAIR => name.clone(),
            labels::STATE => state.as_str(),
        )
        .set(flag(*state == status.high_level_state));
    }

    for unit in &status.units {
        for state in HighLevelState::ALL {
            gauge!(
                names::UNIT_STATE,
                labels::NAMESPACE => namespace.clone(),
                labels::PAIR => name.clone(),
                labels::UNIT => unit.name.clone(),
                labels::STATE => state.as_str(),
            )
            .set(flag(*state == unit.high_level_state));
        }
        gauge!(
            names::UNIT_READY,
            labels::NAMESPACE => namespace.clone(),
            labels::PAIR => name.clone(),
            labels::UNIT => unit.name.clone(),
        )
        .set(flag(unit.ready));
    }

    let ready = status.units.iter().filter(|u| u.ready).count();
    gauge!(
        names::READY_UNITS,
        labels::NAMESPACE => namespace.clone(),
        labels::PAIR => name.clone(),
    )
    .set(ready as f64);

    // Unknown until the active reports it.
    if let Some(mb) = status.awt_behind_mb {
        gauge!(
            names::AWT_BEHIND_MB,
            labels::NAMESPACE => namespace,
            labels::PAIR => name,
        )
        .set(f64::from(mb));
    }
}

/// Record a completed async task. `failed` is the task's own verdict.
pub fn record_async_task(task_type: &str, failed: bool, secs: i64) {
    let outcome = if failed { "failed" } else { "succeeded" };
    histogram!(
        names::ASYNC_TASK_DURATION_SECONDS,
        labels::TASK_TYPE => task_type.to_string(),
        labels::OUTCOME => outcome,
    )
    .record(secs.max(0) as f64);
}

/// Count a finished reconcile pass.
pub fn record_pass(failed: bool) {
    let result = if failed { "retry" } else { "ok" };
    counter!(names::RECONCILE_PASSES_TOTAL, labels::RESULT => result).increment(1);
}

#[cfg(test)]
mod tests {
    use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusRecorder};
    use ttpair_model::PairSpec;

    use super::*;

    fn render(recorder: &PrometheusRecorder) -> Vec<String> {
        recorder
            .handle()
            .render()
            .lines()
            .filter(|l| !l.starts_with('#'))
            .map(str::to_string)
            .collect()
    }

    fn series<'a>(lines: &'a [String], name: &str, parts: &[&str]) -> Option<&'a str> {
        lines
            .iter()
            .filter(|l| l.starts_with(&format!("{}{{", name)))
            .find(|l| parts.iter().all(|p| l.contains(p)))
            .map(String::as_str)
    }

    fn pair() -> ManagedPair {
        let mut pair = ManagedPair::new("ns", "db", PairSpec::default());
        pair.initialize_units();
        pair.status.high_level_state = HighLevelState::ActiveDown;
        pair.status.units[0].high_level_state = HighLevelState::Down;
        pair.status.units[1].high_level_state = HighLevelState::HealthyStandby;
        pair.status.units[1].ready = true;
        pair.status.awt_behind_mb = Some(12);
        pair
    }

    #[test]
    fn test_pair_gauges_follow_status() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let pair = pair();
        metrics::with_local_recorder(&recorder, || record_pair(&pair));
        let lines = render(&recorder);

        let current = series(&lines, names::PAIR_STATE, &[r#"pair="db""#, r#"state="ActiveDown""#]);
        assert!(current.is_some_and(|l| l.ends_with(" 1")), "{:?}", current);
        let other = series(&lines, names::PAIR_STATE, &[r#"pair="db""#, r#"state="Normal""#]);
        assert!(other.is_some_and(|l| l.ends_with(" 0")), "{:?}", other);

        let down = series(&lines, names::UNIT_STATE, &[r#"unit="db-0""#, r#"state="Down""#]);
        assert!(down.is_some_and(|l| l.ends_with(" 1")));
        let ready = series(&lines, names::UNIT_READY, &[r#"unit="db-1""#]);
        assert!(ready.is_some_and(|l| l.ends_with(" 1")));

        let count = series(&lines, names::READY_UNITS, &[r#"namespace="ns""#]);
        assert!(count.is_some_and(|l| l.ends_with(" 1")));
        let awt = series(&lines, names::AWT_BEHIND_MB, &[r#"pair="db""#]);
        assert!(awt.is_some_and(|l| l.ends_with(" 12")));
    }

    #[test]
    fn test_state_change_moves_flag() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let mut pair = pair();
        metrics::with_local_recorder(&recorder, || record_pair(&pair));
        pair.status.high_level_state = HighLevelState::ActiveTakeover;
        metrics::with_local_recorder(&recorder, || record_pair(&pair));
        let lines = render(&recorder);

        let old = series(&lines, names::PAIR_STATE, &[r#"state="ActiveDown""#]);
        assert!(old.is_some_and(|l| l.ends_with(" 0")));
        let new = series(&lines, names::PAIR_STATE, &[r#"state="ActiveTakeover""#]);
        assert!(new.is_some_and(|l| l.ends_with(" 1")));
    }

    #[test]
    fn test_unknown_awt_is_not_published() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let mut pair = pair();
        pair.status.awt_behind_mb = None;
        metrics::with_local_recorder(&recorder, || record_pair(&pair));

        assert!(series(&render(&recorder), names::AWT_BEHIND_MB, &[]).is_none());
    }

    #[test]
    fn test_async_task_duration_recorded() {
        let recorder = PrometheusBuilder::new().build_recorder();
        metrics::with_local_recorder(&recorder, || {
            record_async_task("repDuplicate", false, 42);
            record_pass(false);
        });
        let lines = render(&recorder);

        let count = series(
            &lines,
            &format!("{}_count", names::ASYNC_TASK_DURATION_SECONDS),
            &[r#"task_type="repDuplicate""#, r#"outcome="succeeded""#],
        );
        assert!(count.is_some_and(|l| l.ends_with(" 1")), "{:?}", count);
        let sum = series(
            &lines,
            &format!("{}_sum", names::ASYNC_TASK_DURATION_SECONDS),
            &[r#"task_type="repDuplicate""#],
        );
        assert!(sum.is_some_and(|l| l.ends_with(" 42")));
        let passes = series(&lines, names::RECONCILE_PASSES_TOTAL, &[r#"result="ok""#]);
        assert!(passes.is_some_and(|l| l.ends_with(" 1")));
    }

    #[test]
    fn test_recording_without_recorder_is_harmless() {
        record_pair(&pair());
        record_async_task("repDuplicate", true, -1);
    }

    #[test]
    fn test_units_without_status_publish_nothing_per_unit() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let mut pair = pair();
        pair.status.units.clear();
        metrics::with_local_recorder(&recorder, || record_pair(&pair));
        let lines = render(&recorder);

        assert!(series(&lines, names::UNIT_STATE, &[]).is_none());
        let count = series(&lines, names::READY_UNITS, &[]);
        assert!(count.is_some_and(|l| l.ends_with(" 0")));
    }
}
