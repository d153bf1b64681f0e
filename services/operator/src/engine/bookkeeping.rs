//! State, readiness and summary bookkeeping.

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};
use ttpair_events::{reason, Severity};
use ttpair_model::{HighLevelState, IntendedState, ManagedPair};

use super::Engine;
use crate::agent::Endpoint;
use crate::pool::Credentials;

/// Deadline for readiness and activity actions.
pub const READINESS_TIMEOUT: Duration = Duration::from_secs(5);

const READINESS_CALLER: &str = "updateReadiness";

impl Engine {
    /// Move the pair to `next`, keeping the previous value and switch time.
    pub async fn update_pair_state(&self, pair: &mut ManagedPair, next: HighLevelState) {
        let current = pair.status.high_level_state;
        if current == next {
            return;
        }
        let now = Utc::now().timestamp();
        pair.status.prev_high_level_state = Some(current);
        pair.status.high_level_state = next;
        pair.status.last_high_level_state_switch = now.max(pair.status.last_high_level_state_switch);
        info!(pair = %pair.key(), from = %current, to = %next, "Pair state changed");

        if next == HighLevelState::Initializing {
            return;
        }
        let reason = if next == HighLevelState::Failed {
            reason::FAILED_CREATE
        } else {
            reason::STATE_CHANGE
        };
        let severity = if current == HighLevelState::Normal
            || matches!(
                next,
                HighLevelState::Failed | HighLevelState::ManualInterventionRequired
            ) {
            Severity::Warning
        } else {
            Severity::Normal
        };
        self.reporter
            .record(pair, severity, reason, format!("Pair state was {}, now {}", current, next))
            .await;
    }

    /// Move unit `index` to `next`.
    ///
    /// The change itself is rendered by the unit delta report. Standalone
    /// replicas have no pair state to summarise them, so they are also
    /// reported here.
    pub async fn update_unit_state(&self, pair: &mut ManagedPair, index: usize, next: HighLevelState) {
        let replicated = pair.is_replicated();
        let Some(unit) = pair.status.units.get_mut(index) else {
            return;
        };
        let current = unit.high_level_state;
        if current == next {
            return;
        }
        unit.prev_high_level_state = Some(current);
        unit.high_level_state = next;
        unit.last_high_level_state_switch = Utc::now().timestamp();
        debug!(unit = %unit.name, from = %current, to = %next, "Unit state changed");

        if replicated || !unit.is_database() {
            return;
        }
        let message = format!("Unit {} state was {}, now {}", unit.name, current, next);
        let severity = if matches!(next, HighLevelState::Terminal | HighLevelState::Down) {
            Severity::Warning
        } else {
            Severity::Normal
        };
        self.reporter
            .record(pair, severity, reason::STATE_CHANGE, message)
            .await;
    }

    /// Move the subscriber group to `next`.
    pub async fn update_subscriber_state(&self, pair: &mut ManagedPair, next: HighLevelState) {
        let sub = &mut pair.status.subscriber;
        if sub.high_level_state == Some(next) {
            return;
        }
        let previous = sub.high_level_state;
        sub.prev_high_level_state = previous;
        sub.high_level_state = Some(next);
        sub.last_high_level_state_switch = Utc::now().timestamp();

        let message = match previous {
            Some(previous) => format!("Subscriber state was {}, now {}", previous, next),
            None => format!("Subscriber state now {}", next),
        };
        self.reporter
            .normal(pair, reason::STATE_CHANGE, message)
            .await;
    }

    /// Fold a flow's readiness into unit `index` and tell its agent.
    ///
    /// Agent failures are logged only; readiness is retried on the next
    /// change.
    pub async fn update_readiness(
        &self,
        pair: &mut ManagedPair,
        index: usize,
        ready: bool,
        credentials: &Credentials,
    ) {
        let Some(unit) = pair.status.units.get(index) else {
            return;
        };
        let name = unit.name.clone();
        let was_ready = unit.ready;
        let was_active = unit.active;
        let active = ready && unit.intended_state == IntendedState::Active;
        let ep = Endpoint::new(&self.settings, pair, &name, credentials.clone());

        if ready != was_ready {
            let verb = if ready { "setReadiness" } else { "clearReadiness" };
            self.signal(&ep, verb).await;
            if let Some(unit) = pair.status.units.get_mut(index) {
                unit.prev_ready = was_ready;
                unit.ready = ready;
            }
            let message = if ready {
                format!("Unit {} is Ready", name)
            } else {
                format!("Unit {} is Not Ready", name)
            };
            self.reporter.normal(pair, reason::INFO, message).await;
        }

        if active != was_active {
            let verb = if active { "setActive" } else { "clearActive" };
            self.signal(&ep, verb).await;
            if let Some(unit) = pair.status.units.get_mut(index) {
                unit.prev_active = was_active;
                unit.active = active;
            }
            let message = if active {
                format!("Unit {} is Active Ready", name)
            } else {
                format!("Unit {} is Not Active Ready", name)
            };
            self.reporter.normal(pair, reason::INFO, message).await;
        }
    }

    async fn signal(&self, ep: &Endpoint, verb: &str) {
        if let Err(e) = self
            .agent
            .run_action(ep, verb, READINESS_CALLER, &[], Some(READINESS_TIMEOUT))
            .await
        {
            warn!(unit = %ep.unit_name, verb, error = %e, "Readiness signal failed");
        }
    }
}

/// Value of the `active_pods` summary field.
pub fn active_pods(pair: &ManagedPair) -> String {
    use HighLevelState::*;

    match pair.status.high_level_state {
        Normal | StandbyDown | ActiveTakeover | StandbyStarting | StandbyCatchup => {
            let both_initialized = pair.status.units.iter().take(2).all(|u| u.initialized);
            match pair.active_index() {
                Some(i) if both_initialized => pair.status.units[i].name.clone(),
                _ => pair.status.active_pods.clone(),
            }
        }
        s if s.is_non_replicated_aggregate() => "N/A".to_string(),
        _ => "None".to_string(),
    }
}

/// Replication lag worth reporting for the pair's current state.
pub fn awt_behind_mb(pair: &ManagedPair) -> Option<i32> {
    use HighLevelState::*;

    let index = match pair.status.high_level_state {
        Normal | ActiveDown => pair.standby_index(),
        StandbyDown | StandbyStarting | StandbyCatchup => pair.active_index(),
        _ => None,
    }?;
    pair.status.units.get(index)?.cache.awt_behind_mb
}

/// Copy per-role agent and memory figures into the pair summary.
pub fn refresh_summary(pair: &mut ManagedPair) {
    let numeric = |v: Option<&String>| v.filter(|s| s.trim().parse::<i64>().is_ok()).cloned();

    if let Some(i) = pair.active_index() {
        let unit = &pair.status.units[i];
        let (rep, cache) = (unit.replication.rep_agent.clone(), unit.cache.cache_agent.clone());
        let size = numeric(unit.db.configuration.get("PermSize"));
        let in_use = numeric(unit.db.monitor.get("perm_in_use_size"));
        let status = &mut pair.status;
        status.active_rep_agent = rep;
        status.active_cache_agent = cache;
        if let Some(size) = size {
            status.active_perm_size = size;
        }
        if let Some(in_use) = in_use {
            status.active_perm_in_use = in_use;
        }
    }
    if let Some(i) = pair.standby_index() {
        let unit = &pair.status.units[i];
        let (rep, cache) = (unit.replication.rep_agent.clone(), unit.cache.cache_agent.clone());
        let size = numeric(unit.db.configuration.get("PermSize"));
        let in_use = numeric(unit.db.monitor.get("perm_in_use_size"));
        let status = &mut pair.status;
        status.standby_rep_agent = rep;
        status.standby_cache_agent = cache;
        if let Some(size) = size {
            status.standby_perm_size = size;
        }
        if let Some(in_use) = in_use {
            status.standby_perm_in_use = in_use;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{engine, pair};

    #[tokio::test]
    async fn test_pair_state_records_previous() {
        let (engine, sink, _) = engine();
        let mut pair = pair();
        pair.status.high_level_state = HighLevelState::Normal;

        engine
            .update_pair_state(&mut pair, HighLevelState::StandbyDown)
            .await;

        assert_eq!(pair.status.prev_high_level_state, Some(HighLevelState::Normal));
        assert!(pair.status.last_high_level_state_switch > 0);
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].severity, Severity::Warning);
        assert_eq!(records[0].message, "Pair state was Normal, now StandbyDown");
    }

    #[tokio::test]
    async fn test_failed_uses_failed_create() {
        let (engine, sink, _) = engine();
        let mut pair = pair();

        engine.update_pair_state(&mut pair, HighLevelState::Failed).await;
        assert_eq!(sink.records()[0].reason, reason::FAILED_CREATE);

        engine
            .update_pair_state(&mut pair, HighLevelState::Initializing)
            .await;
        assert_eq!(sink.records().len(), 1);
    }

    #[tokio::test]
    async fn test_unchanged_state_is_quiet() {
        let (engine, sink, _) = engine();
        let mut pair = pair();
        let before = pair.status.clone();

        engine
            .update_pair_state(&mut pair, before.high_level_state)
            .await;
        engine
            .update_unit_state(&mut pair, 0, HighLevelState::Initializing)
            .await;

        assert_eq!(pair.status, before);
        assert!(sink.records().is_empty());
    }

    #[tokio::test]
    async fn test_standalone_unit_state_reported() {
        let (engine, sink, _) = engine();
        let mut spec = ttpair_model::PairSpec::default();
        spec.replication_topology = Some("none".to_string());
        let mut pair = ManagedPair::new("ns", "solo", spec);
        pair.initialize_units();

        engine.update_unit_state(&mut pair, 0, HighLevelState::Down).await;

        let records = sink.records();
        assert_eq!(records[0].message, "Unit solo-0 state was Initializing, now Down");
        assert_eq!(records[0].severity, Severity::Warning);
        assert_eq!(pair.status.units[0].prev_high_level_state, Some(HighLevelState::Initializing));
    }

    #[tokio::test]
    async fn test_readiness_signals_agent() {
        let (engine, sink, agent) = engine();
        let mut pair = pair();

        engine
            .update_readiness(&mut pair, 0, true, &Credentials::default())
            .await;

        assert_eq!(agent.verbs(), vec!["setReadiness", "setActive"]);
        assert!(pair.status.units[0].ready);
        assert!(pair.status.units[0].active);
        assert_eq!(
            sink.messages(),
            vec!["Unit db-0 is Ready", "Unit db-0 is Active Ready"]
        );

        engine
            .update_readiness(&mut pair, 1, true, &Credentials::default())
            .await;
        assert!(!pair.status.units[1].active);
        assert_eq!(agent.verbs().last().map(String::as_str), Some("setReadiness"));
    }

    #[tokio::test]
    async fn test_readiness_failure_is_not_fatal() {
        let (engine, _, agent) = engine();
        agent.fail_verb("setReadiness", 3);
        let mut pair = pair();

        engine
            .update_readiness(&mut pair, 0, true, &Credentials::default())
            .await;
        assert!(pair.status.units[0].ready);
    }

    #[test]
    fn test_active_pods() {
        let mut pair = pair();
        pair.status.high_level_state = HighLevelState::Normal;
        assert_eq!(active_pods(&pair), "db-0");

        pair.status.high_level_state = HighLevelState::WaitingForActive;
        assert_eq!(active_pods(&pair), "None");

        pair.status.high_level_state = HighLevelState::AllReplicasReady;
        assert_eq!(active_pods(&pair), "N/A");
    }

    #[test]
    fn test_awt_follows_surviving_side() {
        let mut pair = pair();
        pair.status.units[0].cache.awt_behind_mb = Some(7);
        pair.status.units[1].cache.awt_behind_mb = Some(3);

        pair.status.high_level_state = HighLevelState::Normal;
        assert_eq!(awt_behind_mb(&pair), Some(3));
        pair.status.high_level_state = HighLevelState::StandbyDown;
        assert_eq!(awt_behind_mb(&pair), Some(7));
        pair.status.high_level_state = HighLevelState::BothDown;
        assert_eq!(awt_behind_mb(&pair), None);
    }

    #[test]
    fn test_summary_copies_numeric_perm_only() {
        let mut pair = pair();
        pair.status.units[0]
            .db
            .configuration
            .insert("PermSize".to_string(), "1024".to_string());
        pair.status.units[0]
            .db
            .monitor
            .insert("perm_in_use_size".to_string(), "n/a".to_string());
        pair.status.units[1].replication.rep_agent = "Running".to_string();

        refresh_summary(&mut pair);

        assert_eq!(pair.status.active_perm_size, "1024");
        assert_eq!(pair.status.active_perm_in_use, "");
        assert_eq!(pair.status.standby_rep_agent, "Running");
    }
}
