//! Turns a unit's before/after snapshots into a minimal set of audit lines.
//!
//! The filter is pure: it only decides what to say. [`EventReporter`]
//! forwards the result to the sink.
//!
//! Rules, in order:
//! - a unit that was never seen going to `Pending`, or any `Pending` to
//!   `Running` start, produces nothing at all for the pass
//! - an agent in `Unknown`, or one going `Unknown` to `Down`, ends the pass
//!   (the unit is starting, not failing)
//! - transitions that are the expected consequence of a starting unit while
//!   the pair is `Initializing` are dropped
//!
//! [`EventReporter`]: crate::EventReporter

use ttpair_model::{AgentState, HighLevelState, IntendedState, UnitStatus, UNKNOWN};

use crate::record::{reason, Severity};

const PENDING: &str = "Pending";
const RUNNING: &str = "Running";

/// One rendered field change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitDelta {
    pub severity: Severity,
    pub reason: &'static str,
    pub message: String,
}

impl UnitDelta {
    fn info(message: String) -> Self {
        Self {
            severity: Severity::Normal,
            reason: reason::INFO,
            message,
        }
    }

    fn state_change(message: String) -> Self {
        Self {
            severity: Severity::Normal,
            reason: reason::STATE_CHANGE,
            message,
        }
    }

    fn warning(mut self) -> Self {
        self.severity = Severity::Warning;
        self
    }
}

/// Field changes of one unit worth reporting.
pub fn unit_changes(
    before: &UnitStatus,
    after: &UnitStatus,
    pair_state: HighLevelState,
    replicated: bool,
) -> Vec<UnitDelta> {
    let mut out = Vec::new();
    let name = &after.name;
    let initializing = pair_state == HighLevelState::Initializing;

    if before.pod.phase != after.pod.phase {
        if !before.has_been_seen && after.pod.phase == PENDING {
            return out;
        }
        if before.pod.phase == PENDING && after.pod.phase == RUNNING {
            return out;
        }
    }

    if before.intended_state != after.intended_state {
        out.push(UnitDelta::state_change(format!(
            "Unit {} Intended State '{}'",
            name, after.intended_state
        )));
    }

    if before.pod.phase != after.pod.phase {
        out.push(UnitDelta::state_change(format!(
            "Unit {} Phase '{}'",
            name, after.pod.phase
        )));
    }

    if after.pod.agent == AgentState::Unknown {
        return out;
    }

    if before.pod.agent != after.pod.agent {
        if before.pod.agent == AgentState::Unknown && after.pod.agent == AgentState::Down {
            return out;
        }
        let delta = UnitDelta::info(format!("Unit {} Agent {}", name, after.pod.agent));
        out.push(if after.pod.agent == AgentState::Down {
            delta.warning()
        } else {
            delta
        });
    }

    engine_changes(before, after, initializing, &mut out);
    db_changes(before, after, initializing, &mut out);

    if after.cache_groups_file
        && after.is_database()
        && before.cache.cache_agent != after.cache.cache_agent
        && !(initializing && before.cache.cache_agent == UNKNOWN && after.cache.cache_agent == "Not Running")
    {
        out.push(UnitDelta::info(format!(
            "Unit {} CacheAgent {}",
            name, after.cache.cache_agent
        )));
    }

    if after.is_database() {
        replication_changes(before, after, initializing, replicated, &mut out);
    }

    if before.high_level_state != after.high_level_state {
        let quiet = |s: HighLevelState| matches!(s, HighLevelState::Unknown | HighLevelState::Down);
        if !(initializing && quiet(before.high_level_state) && quiet(after.high_level_state)) {
            let delta = UnitDelta::state_change(format!(
                "Unit {} State '{}'",
                name, after.high_level_state
            ));
            out.push(
                if matches!(
                    after.high_level_state,
                    HighLevelState::Terminal | HighLevelState::Down | HighLevelState::UpgradeFailed
                ) {
                    delta.warning()
                } else {
                    delta
                },
            );
        }
    }

    out
}

fn engine_changes(before: &UnitStatus, after: &UnitStatus, initializing: bool, out: &mut Vec<UnitDelta>) {
    let name = &after.name;

    if after.engine.instance == "Exists" && before.engine.release != after.engine.release {
        out.push(UnitDelta::info(format!(
            "Unit {} Release {}",
            name, after.engine.release
        )));
    }

    if before.engine.instance != after.engine.instance
        && !(initializing && after.engine.instance == "Exists")
    {
        out.push(UnitDelta::info(format!(
            "Unit {} Instance {}",
            name, after.engine.instance
        )));
    }

    if before.engine.daemon != after.engine.daemon
        && !(initializing && before.engine.daemon == UNKNOWN && after.engine.daemon == "Down")
    {
        out.push(UnitDelta::info(format!(
            "Unit {} Daemon {}",
            name, after.engine.daemon
        )));
    }
}

fn db_changes(before: &UnitStatus, after: &UnitStatus, initializing: bool, out: &mut Vec<UnitDelta>) {
    let name = &after.name;
    let kind = after.unit_type;

    // A daemon that just came up obviously has nothing loaded.
    let daemon_just_started = before.engine.daemon == "Down" && after.engine.daemon == "Up";

    if before.db.db != after.db.db {
        let expected_first_report = initializing && before.db.db == UNKNOWN && after.db.db == "None";
        let expected_unload = daemon_just_started && after.db.db == "Unloaded";
        if !expected_first_report && !expected_unload {
            out.push(UnitDelta::info(format!("Unit {} {} {}", name, kind, after.db.db)));
        }
    }

    if before.db.db_updatable != after.db.db_updatable {
        match after.db.db_updatable.as_str() {
            "Yes" => out.push(UnitDelta::info(format!("Unit {} {} Updatable", name, kind))),
            "No" => {
                // Only worth a record while the pair initializes.
                if initializing && after.intended_state != IntendedState::Standby {
                    out.push(UnitDelta::info(format!("Unit {} {} Not Updatable", name, kind)));
                }
            }
            other => out.push(UnitDelta::info(format!(
                "Unit {} {} Updatable: {}",
                name, kind, other
            ))),
        }
    }
}

fn replication_changes(
    before: &UnitStatus,
    after: &UnitStatus,
    initializing: bool,
    replicated: bool,
    out: &mut Vec<UnitDelta>,
) {
    let name = &after.name;
    let (b, a) = (&before.replication, &after.replication);

    if b.rep_agent != a.rep_agent
        && !(initializing && b.rep_agent == UNKNOWN && a.rep_agent == "Not Running")
    {
        out.push(UnitDelta::info(format!("Unit {} RepAgent {}", name, a.rep_agent)));
    }

    if !replicated {
        return;
    }

    if b.rep_scheme != a.rep_scheme
        && !(initializing && b.rep_scheme == UNKNOWN && a.rep_scheme == "None")
    {
        out.push(UnitDelta::info(format!("Unit {} RepScheme {}", name, a.rep_scheme)));
    }

    if a.rep_scheme != "None" && b.rep_state != a.rep_state {
        let expected_idle = initializing
            && after.intended_state != IntendedState::Standby
            && b.rep_state == UNKNOWN
            && (a.rep_state == "IDLE" || a.rep_state.is_empty());
        if !expected_idle {
            out.push(UnitDelta::state_change(format!(
                "Unit {} RepState {}",
                name, a.rep_state
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use ttpair_model::UnitType;

    fn running_unit() -> UnitStatus {
        let mut u = UnitStatus::new("db-0", UnitType::Database, IntendedState::Active);
        u.has_been_seen = true;
        u.pod.phase = RUNNING.to_string();
        u.pod.agent = AgentState::Up;
        u
    }

    fn messages(deltas: &[UnitDelta]) -> Vec<&str> {
        deltas.iter().map(|d| d.message.as_str()).collect()
    }

    #[test]
    fn test_pending_to_running_is_silent() {
        let mut before = UnitStatus::new("db-0", UnitType::Database, IntendedState::Active);
        before.pod.phase = PENDING.to_string();
        let mut after = before.clone();
        after.has_been_seen = true;
        after.pod.phase = RUNNING.to_string();
        after.pod.agent = AgentState::Up;
        after.high_level_state = HighLevelState::Healthy;

        assert!(unit_changes(&before, &after, HighLevelState::Normal, true).is_empty());
    }

    #[test]
    fn test_first_sighting_pending_is_silent() {
        let before = UnitStatus::new("db-0", UnitType::Database, IntendedState::Active);
        let mut after = before.clone();
        after.pod.phase = PENDING.to_string();

        assert!(unit_changes(&before, &after, HighLevelState::Initializing, true).is_empty());
    }

    #[test]
    fn test_agent_unknown_to_down_stops_reporting() {
        let mut before = running_unit();
        before.pod.agent = AgentState::Unknown;
        let mut after = before.clone();
        after.pod.agent = AgentState::Down;
        after.engine.daemon = "Down".to_string();

        assert!(unit_changes(&before, &after, HighLevelState::Normal, true).is_empty());
    }

    #[test]
    fn test_agent_up_to_down_is_warning_and_continues() {
        let before = running_unit();
        let mut after = before.clone();
        after.pod.agent = AgentState::Down;
        after.high_level_state = HighLevelState::Down;

        let deltas = unit_changes(&before, &after, HighLevelState::Normal, true);
        assert_eq!(
            messages(&deltas),
            vec!["Unit db-0 Agent Down", "Unit db-0 State 'Down'"]
        );
        assert!(deltas.iter().all(|d| d.severity == Severity::Warning));
    }

    #[test]
    fn test_initializing_suppressions() {
        let before = running_unit();
        let mut after = before.clone();
        after.engine.instance = "Exists".to_string();
        after.engine.daemon = "Down".to_string();
        after.db.db = "None".to_string();
        after.replication.rep_agent = "Not Running".to_string();
        after.replication.rep_scheme = "None".to_string();
        after.high_level_state = HighLevelState::Down;

        let deltas = unit_changes(&before, &after, HighLevelState::Initializing, true);
        assert!(deltas.is_empty(), "unexpected: {:?}", messages(&deltas));

        // The same changes outside initialization are all reported.
        let deltas = unit_changes(&before, &after, HighLevelState::Normal, true);
        assert_eq!(deltas.len(), 6);
    }

    #[test]
    fn test_rep_state_reported_as_state_change() {
        let mut before = running_unit();
        before.replication.rep_scheme = "Exists".to_string();
        before.replication.rep_state = "IDLE".to_string();
        let mut after = before.clone();
        after.replication.rep_state = "ACTIVE".to_string();

        let deltas = unit_changes(&before, &after, HighLevelState::ConfiguringActive, true);
        assert_eq!(messages(&deltas), vec!["Unit db-0 RepState ACTIVE"]);
        assert_eq!(deltas[0].reason, reason::STATE_CHANGE);

        // Non-replicated topologies have no scheme to speak of.
        assert!(unit_changes(&before, &after, HighLevelState::Normal, false).is_empty());
    }

    #[test]
    fn test_updatable_rendering() {
        let before = running_unit();
        let mut after = before.clone();
        after.db.db_updatable = "Yes".to_string();
        let deltas = unit_changes(&before, &after, HighLevelState::Normal, true);
        assert_eq!(messages(&deltas), vec!["Unit db-0 Database Updatable"]);

        let mut standby = after.clone();
        standby.intended_state = IntendedState::Standby;
        standby.db.db_updatable = "No".to_string();
        let deltas = unit_changes(&after, &standby, HighLevelState::Normal, true);
        assert_eq!(messages(&deltas), vec!["Unit db-0 Intended State 'Standby'"]);
    }

    #[test]
    fn test_not_updatable_only_while_initializing() {
        let mut before = running_unit();
        before.db.db_updatable = "Yes".to_string();
        let mut after = before.clone();
        after.db.db_updatable = "No".to_string();

        assert!(unit_changes(&before, &after, HighLevelState::Normal, true).is_empty());
        let deltas = unit_changes(&before, &after, HighLevelState::Initializing, true);
        assert_eq!(messages(&deltas), vec!["Unit db-0 Database Not Updatable"]);
    }

    #[test]
    fn test_cache_agent_only_with_cache_groups() {
        let before = running_unit();
        let mut after = before.clone();
        after.cache.cache_agent = "Running".to_string();
        assert!(unit_changes(&before, &after, HighLevelState::Normal, true).is_empty());

        after.cache_groups_file = true;
        let deltas = unit_changes(&before, &after, HighLevelState::Normal, true);
        assert_eq!(messages(&deltas), vec!["Unit db-0 CacheAgent Running"]);
    }

    proptest! {
        #[test]
        fn identical_snapshots_report_nothing(
            phase in prop::sample::select(vec!["Pending", "Running", "Failed", ""]),
            agent in prop::sample::select(AgentState::ALL.to_vec()),
            state in prop::sample::select(HighLevelState::ALL.to_vec()),
            pair_state in prop::sample::select(HighLevelState::ALL.to_vec()),
            seen in any::<bool>(),
        ) {
            let mut unit = running_unit();
            unit.pod.phase = phase.to_string();
            unit.pod.agent = agent;
            unit.high_level_state = state;
            unit.has_been_seen = seen;
            prop_assert!(unit_changes(&unit, &unit.clone(), pair_state, true).is_empty());
        }
    }
}
