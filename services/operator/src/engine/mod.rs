//! Failover / Recovery Decision Engine.
//!
//! Folds the outcomes of one pass into the next pair-level state:
//!
//! - `BothDown` runs the both-down heuristic instead of the table
//! - `Reexamine` maps the two units' health back to a concrete state
//! - every other state is looked up in the pair transition table, where
//!   `FAILOVER` swaps the units' roles
//! - non-replicated topologies and the subscriber group count ready units
//!
//! Upgrade progress is folded in by [`upgrade`], state and readiness
//! bookkeeping lives in [`bookkeeping`].

mod bookkeeping;
mod upgrade;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};
use ttpair_events::{reason, EventReporter};
use ttpair_model::{
    BothDownBehavior, HighLevelState, IntendedState, ManagedPair, ModelError, RoleUpgradeStatus,
    UpgradePhase,
};
use ttpair_reconcile::{Transition, TransitionTable};

use crate::agent::{AgentSettings, UnitAgent};
use crate::cluster::ClusterApi;
use crate::pool::Credentials;

pub use bookkeeping::{active_pods, awt_behind_mb, refresh_summary, READINESS_TIMEOUT};
pub use upgrade::{UpgradeError, UpgradeSettings};

/// Outcome of the pair-level decision for one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairDecision {
    pub state: HighLevelState,
    /// The standby side finished upgrading; quiesce and upgrade the active.
    pub upgrade_active: bool,
}

/// Computes pair-level state transitions.
pub struct Engine {
    transitions: Arc<TransitionTable>,
    reporter: Arc<EventReporter>,
    agent: Arc<dyn UnitAgent>,
    cluster: Arc<dyn ClusterApi>,
    settings: AgentSettings,
    upgrade: UpgradeSettings,
}

impl Engine {
    pub fn new(
        transitions: Arc<TransitionTable>,
        reporter: Arc<EventReporter>,
        agent: Arc<dyn UnitAgent>,
        cluster: Arc<dyn ClusterApi>,
        settings: AgentSettings,
        upgrade: UpgradeSettings,
    ) -> Self {
        Self {
            transitions,
            reporter,
            agent,
            cluster,
            settings,
            upgrade,
        }
    }

    pub fn reporter(&self) -> &EventReporter {
        &self.reporter
    }

    /// Next state of a replicated pair, before any anti-flicker handling.
    ///
    /// Roles may be reassigned here (both-down recovery) but a `FAILOVER`
    /// answer is returned as is.
    pub async fn determine_next_state(
        &self,
        pair: &mut ManagedPair,
        credentials: &Credentials,
    ) -> (Transition, bool) {
        let current = pair.status.high_level_state;

        if current == HighLevelState::BothDown {
            return (Transition::To(self.recover_both_down(pair).await), false);
        }

        let (Some(active), Some(standby)) = (pair.active_index(), pair.standby_index()) else {
            let roles: Vec<String> = pair
                .status
                .units
                .iter()
                .take(2)
                .map(|u| u.intended_state.to_string())
                .collect();
            warn!(pair = %pair.key(), roles = ?roles, "Units do not hold complementary roles");
            return (Transition::To(HighLevelState::ManualInterventionRequired), false);
        };

        let active_health = pair.status.units[active].high_level_state;
        let standby_health = pair.status.units[standby].high_level_state;
        let mut next = self
            .transitions
            .next_pair_state(current, active_health, standby_health)
            .unwrap_or_else(|| {
                debug!(state = %current, active = %active_health, standby = %standby_health, "No transition; state unchanged");
                Transition::To(current)
            });

        if !pair.upgrade_in_progress() {
            return (next, false);
        }

        let mut upgrade_active = false;
        let upgrade = pair.status.upgrade.clone();
        let in_flight = |s: Option<RoleUpgradeStatus>| {
            matches!(
                s,
                Some(RoleUpgradeStatus::DeleteStandby)
                    | Some(RoleUpgradeStatus::DeleteActive)
                    | Some(RoleUpgradeStatus::Processing)
            )
        };
        let next_state = match next {
            Transition::To(state) => state,
            Transition::Failover => HighLevelState::ActiveTakeover,
        };
        debug!(
            phase = ?upgrade.upgrade_state,
            active_status = ?upgrade.active_status,
            standby_status = ?upgrade.standby_status,
            "Upgrade in progress"
        );

        if in_flight(upgrade.standby_status) {
            let (phase, error) = self.check_upgrade_standby(pair, next_state, credentials).await;
            match phase {
                Some(UpgradePhase::UpgradingActive) => {
                    upgrade_active = true;
                    info!(pair = %pair.key(), "Standby upgrade complete");
                    self.reporter
                        .normal(pair, reason::UPGRADE, "Upgrade of standby complete")
                        .await;
                }
                Some(UpgradePhase::ManualInterventionRequired) => {
                    next = Transition::To(HighLevelState::ManualInterventionRequired);
                    let message = error.unwrap_or_else(|| "standby upgrade unsuccessful".to_string());
                    self.reporter
                        .warning(pair, reason::UPGRADE_ERROR, message)
                        .await;
                }
                _ => {}
            }
        } else if in_flight(upgrade.active_status) {
            let (phase, error) = self.check_upgrade_active(pair, next_state, credentials).await;
            match phase {
                Some(UpgradePhase::Complete) => {
                    let secs = Utc::now().timestamp() - pair.status.upgrade.upgrade_start_time;
                    self.reporter
                        .normal(pair, reason::UPGRADE, format!("Upgrade completed in {} secs", secs))
                        .await;
                    pair.status.upgrade.reset();
                    if let Err(e) = self.open_db(pair, credentials).await {
                        debug!(error = %e, "Reopening the database after upgrade failed");
                    }
                }
                Some(UpgradePhase::ManualInterventionRequired) => {
                    next = Transition::To(HighLevelState::ManualInterventionRequired);
                    let message = error.unwrap_or_else(|| "active upgrade unsuccessful".to_string());
                    self.reporter
                        .warning(pair, reason::UPGRADE_ERROR, message)
                        .await;
                }
                _ => {}
            }
        } else {
            let message = if upgrade.active_status == Some(RoleUpgradeStatus::Failed) {
                "Upgrade unsuccessful on the active unit, entering ManualInterventionRequired"
            } else if upgrade.standby_status == Some(RoleUpgradeStatus::Failed) {
                "Upgrade unsuccessful on the standby unit, entering ManualInterventionRequired"
            } else {
                "Error determining upgrade state, entering ManualInterventionRequired"
            };
            next = Transition::To(HighLevelState::ManualInterventionRequired);
            self.reporter
                .warning(pair, reason::UPGRADE_ERROR, message)
                .await;
        }

        (next, upgrade_active)
    }

    async fn recover_both_down(&self, pair: &mut ManagedPair) -> HighLevelState {
        let behavior = match pair.both_down_behavior() {
            Ok(behavior) => behavior,
            Err(e) => {
                warn!(pair = %pair.key(), error = %e, "Unsupported both-down behavior");
                return HighLevelState::ManualInterventionRequired;
            }
        };
        if behavior == BothDownBehavior::Manual {
            return HighLevelState::ManualInterventionRequired;
        }

        let Some((best, worst)) = both_down_choice(pair) else {
            self.reporter
                .warning(pair, reason::STATE_CHANGE, "Operator cannot determine Best database")
                .await;
            return HighLevelState::ManualInterventionRequired;
        };

        pair.status.units[best].assign_role(IntendedState::Active);
        pair.status.units[worst].assign_role(IntendedState::Standby);
        let unit = &pair.status.units[best];
        let message = format!(
            "Based on replication configuration {} will be the new 'active'; its previous role was {}",
            unit.name,
            unit.prev_intended_state.unwrap_or_default()
        );
        self.reporter
            .warning(pair, reason::STATE_CHANGE, message)
            .await;
        HighLevelState::WaitingForActive
    }

    /// Resolve a pair the user asked to reexamine.
    pub async fn handle_reexamine(&self, pair: &mut ManagedPair) -> HighLevelState {
        use HighLevelState::*;

        let (Some(first), Some(second)) = (pair.status.units.first(), pair.status.units.get(1))
        else {
            return ManualInterventionRequired;
        };
        let (s0, s1) = (first.high_level_state, second.high_level_state);
        debug!(pair = %pair.key(), unit0 = %s0, unit1 = %s1, "Reexamining pair");

        let upgrading = pair.upgrade_in_progress();
        match (s0, s1) {
            (HealthyActive | Healthy, HealthyStandby) => {
                set_roles(pair, 0);
                self.finish_upgrade_recovery(pair).await;
                Normal
            }
            (HealthyActive | Healthy, CatchingUp) => {
                pair.status.upgrade.standby_status = Some(RoleUpgradeStatus::CatchingUp);
                Reexamine
            }
            (HealthyActive | Healthy, _) => {
                if upgrading {
                    self.reporter
                        .warning(
                            pair,
                            reason::UPGRADE_ERROR,
                            "Upgrade: Waiting for standby, set reexamine attrib and try again",
                        )
                        .await;
                }
                ManualInterventionRequired
            }
            (HealthyStandby, Healthy | HealthyActive) => {
                set_roles(pair, 1);
                self.finish_upgrade_recovery(pair).await;
                Normal
            }
            (HealthyIdle, Down) => {
                set_roles(pair, 0);
                ConfiguringActive
            }
            (Down, HealthyIdle) => {
                set_roles(pair, 1);
                ConfiguringActive
            }
            _ => ManualInterventionRequired,
        }
    }

    async fn finish_upgrade_recovery(&self, pair: &mut ManagedPair) {
        if !pair.upgrade_in_progress() {
            return;
        }
        let secs = Utc::now().timestamp() - pair.status.upgrade.upgrade_start_time;
        info!(pair = %pair.key(), secs, "Failed upgrade resolved");
        self.reporter
            .normal(pair, reason::UPGRADE, "Recovery from upgrade failure complete")
            .await;
        pair.status.upgrade.reset();
    }

    /// Pair-level decision for a replicated pair, applied to `pair`.
    #[instrument(skip(self, pair, credentials), fields(pair = %pair.key()))]
    pub async fn determine_replicated(
        &self,
        pair: &mut ManagedPair,
        someone_other_down: bool,
        someone_healthy: bool,
        credentials: &Credentials,
    ) -> Result<PairDecision, ModelError> {
        let current = pair.status.high_level_state;
        let mut upgrade_active = false;

        let next = if current == HighLevelState::StandbyDown && someone_other_down && someone_healthy
        {
            // One side just recovered while the other still reports its peer
            // down. Reassess both on the next pass.
            info!("Peer recovered during StandbyDown; deferring reassessment");
            pair.unit_mut(0)?.high_level_state = HighLevelState::Unknown;
            pair.unit_mut(1)?.high_level_state = HighLevelState::Unknown;
            HighLevelState::Normal
        } else {
            let transition = if current == HighLevelState::Reexamine {
                Transition::To(self.handle_reexamine(pair).await)
            } else {
                let (transition, active) = self.determine_next_state(pair, credentials).await;
                upgrade_active = active;
                transition
            };
            match transition {
                Transition::To(state) => state,
                Transition::Failover => {
                    apply_failover(pair)?;
                    HighLevelState::ActiveTakeover
                }
            }
        };

        if next == current {
            debug!(state = %next, "Pair state unchanged");
        } else {
            self.update_pair_state(pair, next).await;
        }
        pair.status.awt_behind_mb = awt_behind_mb(pair);

        Ok(PairDecision {
            state: pair.status.high_level_state,
            upgrade_active,
        })
    }

    /// Aggregate state of a non-replicated topology.
    pub async fn determine_non_replicated(&self, pair: &mut ManagedPair) -> HighLevelState {
        let units: Vec<_> = pair
            .status
            .units
            .iter()
            .filter(|u| u.is_database())
            .collect();
        let ready = units.iter().filter(|u| u.ready).count();
        let next = classify_ready(
            ready,
            pair.database_unit_count(),
            [
                HighLevelState::AllReplicasReady,
                HighLevelState::SomeReplicasReady,
                HighLevelState::NoReplicasReady,
            ],
        );
        debug!(pair = %pair.key(), ready, state = %next, "Non-replicated aggregate");
        self.update_pair_state(pair, next).await;
        next
    }

    /// Aggregate state of the subscriber group.
    pub async fn determine_subscribers(&self, pair: &mut ManagedPair) -> HighLevelState {
        let ready = pair
            .status
            .units
            .iter()
            .filter(|u| u.is_subscriber() && u.ready)
            .count();
        let wanted = usize::try_from(pair.subscriber_replicas()).unwrap_or(usize::MAX);
        let next = classify_ready(
            ready,
            wanted,
            [
                HighLevelState::AllSubscribersReady,
                HighLevelState::SomeSubscribersReady,
                HighLevelState::NoSubscribersReady,
            ],
        );
        debug!(pair = %pair.key(), ready, wanted, state = %next, "Subscriber aggregate");
        self.update_subscriber_state(pair, next).await;
        next
    }
}

/// Pick the unit most likely to hold the newest data after both went down.
///
/// Returns `(best, worst)` unit indices, or `None` when no safe choice
/// exists. Under twosafe the standby normally commits first, so it is ahead
/// unless the pair was already running without it (`ActiveTakeover`,
/// `StandbyStarting`, `StandbyDown`). A `Normal` pair marked ineligible for
/// recovery has no safe choice. Otherwise the active is ahead.
pub fn both_down_choice(pair: &ManagedPair) -> Option<(usize, usize)> {
    use HighLevelState::*;

    let status = &pair.status;
    let ahead = if status.using_twosafe {
        match status.prev_high_level_state {
            Some(ActiveTakeover | StandbyStarting | StandbyDown) => IntendedState::Active,
            Some(ActiveDown) => IntendedState::Standby,
            Some(Normal) if status.both_down_recovery_ineligible => return None,
            Some(Normal) => IntendedState::Standby,
            _ => IntendedState::Active,
        }
    } else {
        IntendedState::Active
    };

    if status.units.len() < 2 {
        return None;
    }
    if status.units[0].intended_state == ahead {
        Some((0, 1))
    } else {
        Some((1, 0))
    }
}

/// Swap the roles of the two pair units.
pub fn apply_failover(pair: &mut ManagedPair) -> Result<(), ModelError> {
    let first_active = pair.unit(0)?.intended_state == IntendedState::Active;
    let (first, second) = if first_active {
        (IntendedState::Standby, IntendedState::Active)
    } else {
        (IntendedState::Active, IntendedState::Standby)
    };
    pair.unit_mut(0)?.assign_role(first);
    pair.unit_mut(1)?.assign_role(second);
    Ok(())
}

/// Make unit `active` the active and the other pair unit the standby.
fn set_roles(pair: &mut ManagedPair, active: usize) {
    for (index, unit) in pair.status.units.iter_mut().take(2).enumerate() {
        unit.assign_role(if index == active {
            IntendedState::Active
        } else {
            IntendedState::Standby
        });
    }
}

/// `[all, some, none]` by how many of `total` units are ready.
fn classify_ready(ready: usize, total: usize, states: [HighLevelState; 3]) -> HighLevelState {
    let [all, some, none] = states;
    if ready == total {
        all
    } else if ready == 0 {
        none
    } else {
        some
    }
}

fn secs(d: Duration) -> i64 {
    i64::try_from(d.as_secs()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use ttpair_events::MemorySink;
    use ttpair_model::PairSpec;

    use super::*;
    use crate::mock::{MemoryCluster, MockAgent};

    pub(crate) fn pair() -> ManagedPair {
        let mut pair = ManagedPair::new("ns", "db", PairSpec::default());
        pair.initialize_units();
        pair
    }

    pub(crate) fn engine() -> (Engine, Arc<MemorySink>, Arc<MockAgent>) {
        let sink = Arc::new(MemorySink::new());
        let agent = Arc::new(MockAgent::new());
        let engine = Engine::new(
            Arc::new(TransitionTable::builtin().unwrap()),
            Arc::new(EventReporter::new(sink.clone())),
            agent.clone(),
            Arc::new(MemoryCluster::new()),
            AgentSettings::default(),
            UpgradeSettings {
                verify_attempts: 2,
                verify_delay: Duration::ZERO,
                quiesce_wait_secs: 30,
            },
        );
        (engine, sink, agent)
    }

    fn both_down(prev: HighLevelState, twosafe: bool, ineligible: bool) -> ManagedPair {
        let mut pair = pair();
        pair.status.high_level_state = HighLevelState::BothDown;
        pair.status.prev_high_level_state = Some(prev);
        pair.status.using_twosafe = twosafe;
        pair.status.both_down_recovery_ineligible = ineligible;
        pair
    }

    #[rstest]
    #[case::takeover(HighLevelState::ActiveTakeover, true, false, Some((0, 1)))]
    #[case::starting(HighLevelState::StandbyStarting, true, false, Some((0, 1)))]
    #[case::standby_down(HighLevelState::StandbyDown, true, false, Some((0, 1)))]
    #[case::normal(HighLevelState::Normal, true, false, Some((1, 0)))]
    #[case::ineligible(HighLevelState::Normal, true, true, None)]
    #[case::active_down(HighLevelState::ActiveDown, true, false, Some((1, 0)))]
    #[case::other(HighLevelState::Initializing, true, false, Some((0, 1)))]
    #[case::not_twosafe(HighLevelState::Normal, false, true, Some((0, 1)))]
    fn test_both_down_choice(
        #[case] prev: HighLevelState,
        #[case] twosafe: bool,
        #[case] ineligible: bool,
        #[case] expected: Option<(usize, usize)>,
    ) {
        assert_eq!(both_down_choice(&both_down(prev, twosafe, ineligible)), expected);
    }

    #[test]
    fn test_both_down_choice_follows_roles() {
        let mut pair = both_down(HighLevelState::ActiveTakeover, true, false);
        set_roles(&mut pair, 1);
        assert_eq!(both_down_choice(&pair), Some((1, 0)));
    }

    #[tokio::test]
    async fn test_both_down_recovery_after_takeover() {
        let (engine, sink, _) = engine();
        let mut pair = both_down(HighLevelState::ActiveTakeover, true, false);

        let decision = engine
            .determine_replicated(&mut pair, false, false, &Credentials::default())
            .await
            .unwrap();

        assert_eq!(decision.state, HighLevelState::WaitingForActive);
        assert_eq!(pair.status.units[0].intended_state, IntendedState::Active);
        assert_eq!(pair.status.units[1].intended_state, IntendedState::Standby);
        assert_eq!(pair.status.prev_high_level_state, Some(HighLevelState::BothDown));
        assert!(sink
            .messages()
            .iter()
            .any(|m| m.starts_with("Based on replication configuration db-0 will be the new 'active'")));
    }

    #[tokio::test]
    async fn test_both_down_ambiguity() {
        let (engine, sink, _) = engine();
        let mut pair = both_down(HighLevelState::Normal, true, true);

        let decision = engine
            .determine_replicated(&mut pair, false, false, &Credentials::default())
            .await
            .unwrap();

        assert_eq!(decision.state, HighLevelState::ManualInterventionRequired);
        assert!(sink
            .messages()
            .contains(&"Operator cannot determine Best database".to_string()));
    }

    #[tokio::test]
    async fn test_both_down_manual_behavior() {
        let (engine, _, _) = engine();
        let mut pair = both_down(HighLevelState::ActiveTakeover, true, false);
        pair.spec.both_down_behavior = Some("Manual".to_string());

        let (transition, _) = engine
            .determine_next_state(&mut pair, &Credentials::default())
            .await;
        assert_eq!(transition, Transition::To(HighLevelState::ManualInterventionRequired));
        assert_eq!(pair.status.units[0].prev_intended_state, None);
    }

    #[tokio::test]
    async fn test_reexamine_success() {
        let (engine, _, _) = engine();
        let mut pair = pair();
        pair.status.high_level_state = HighLevelState::Reexamine;
        pair.status.units[0].high_level_state = HighLevelState::HealthyActive;
        pair.status.units[1].high_level_state = HighLevelState::HealthyStandby;

        let decision = engine
            .determine_replicated(&mut pair, false, true, &Credentials::default())
            .await
            .unwrap();

        assert_eq!(decision.state, HighLevelState::Normal);
        assert_eq!(pair.status.units[0].intended_state, IntendedState::Active);
        assert_eq!(pair.status.units[1].intended_state, IntendedState::Standby);
    }

    #[rstest]
    #[case(HighLevelState::HealthyStandby, HighLevelState::HealthyActive, HighLevelState::Normal, Some(1))]
    #[case(HighLevelState::HealthyIdle, HighLevelState::Down, HighLevelState::ConfiguringActive, Some(0))]
    #[case(HighLevelState::Down, HighLevelState::HealthyIdle, HighLevelState::ConfiguringActive, Some(1))]
    #[case(HighLevelState::Healthy, HighLevelState::CatchingUp, HighLevelState::Reexamine, None)]
    #[case(HighLevelState::Down, HighLevelState::Down, HighLevelState::ManualInterventionRequired, None)]
    #[tokio::test]
    async fn test_reexamine_outcomes(
        #[case] s0: HighLevelState,
        #[case] s1: HighLevelState,
        #[case] expected: HighLevelState,
        #[case] new_active: Option<usize>,
    ) {
        let (engine, _, _) = engine();
        let mut pair = pair();
        pair.status.high_level_state = HighLevelState::Reexamine;
        pair.status.units[0].high_level_state = s0;
        pair.status.units[1].high_level_state = s1;

        assert_eq!(engine.handle_reexamine(&mut pair).await, expected);
        if let Some(active) = new_active {
            assert_eq!(pair.active_index(), Some(active));
        }
    }

    #[tokio::test]
    async fn test_reexamine_resets_failed_upgrade() {
        let (engine, sink, _) = engine();
        let mut pair = pair();
        pair.status.upgrade.upgrade_state = Some(UpgradePhase::ManualInterventionRequired);
        pair.status.upgrade.standby_status = Some(RoleUpgradeStatus::Failed);
        pair.status.units[0].high_level_state = HighLevelState::Healthy;
        pair.status.units[1].high_level_state = HighLevelState::HealthyStandby;

        assert_eq!(engine.handle_reexamine(&mut pair).await, HighLevelState::Normal);
        assert!(!pair.upgrade_in_progress());
        assert!(sink
            .messages()
            .contains(&"Recovery from upgrade failure complete".to_string()));
    }

    #[tokio::test]
    async fn test_failover_swaps_roles() {
        let (engine, _, _) = engine();
        let mut pair = pair();
        pair.status.high_level_state = HighLevelState::ActiveDown;
        pair.status.units[0].high_level_state = HighLevelState::Healthy;
        pair.status.units[1].high_level_state = HighLevelState::HealthyActive;

        let decision = engine
            .determine_replicated(&mut pair, false, true, &Credentials::default())
            .await
            .unwrap();

        assert_eq!(decision.state, HighLevelState::ActiveTakeover);
        assert_eq!(pair.status.units[0].intended_state, IntendedState::Standby);
        assert_eq!(pair.status.units[0].prev_intended_state, Some(IntendedState::Active));
        assert_eq!(pair.status.units[1].intended_state, IntendedState::Active);
        assert_eq!(pair.status.units[1].prev_intended_state, Some(IntendedState::Standby));
    }

    #[tokio::test]
    async fn test_standby_down_anti_flicker() {
        let (engine, _, _) = engine();
        let mut pair = pair();
        pair.status.high_level_state = HighLevelState::StandbyDown;
        pair.status.units[0].high_level_state = HighLevelState::OtherDown;
        pair.status.units[1].high_level_state = HighLevelState::Healthy;

        let decision = engine
            .determine_replicated(&mut pair, true, true, &Credentials::default())
            .await
            .unwrap();

        assert_eq!(decision.state, HighLevelState::Normal);
        assert_eq!(pair.status.units[0].high_level_state, HighLevelState::Unknown);
        assert_eq!(pair.status.units[1].high_level_state, HighLevelState::Unknown);
    }

    #[tokio::test]
    async fn test_non_complementary_roles_need_intervention() {
        let (engine, _, _) = engine();
        let mut pair = pair();
        pair.status.high_level_state = HighLevelState::Normal;
        pair.status.units[1].intended_state = IntendedState::Active;

        let (transition, _) = engine
            .determine_next_state(&mut pair, &Credentials::default())
            .await;
        assert_eq!(transition, Transition::To(HighLevelState::ManualInterventionRequired));
    }

    #[tokio::test]
    async fn test_ready_count_classification() {
        let (engine, _, _) = engine();
        let mut spec = PairSpec::default();
        spec.replication_topology = Some("none".to_string());
        spec.replicas = Some(3);
        let mut pair = ManagedPair::new("ns", "solo", spec);
        pair.initialize_units();

        assert_eq!(engine.determine_non_replicated(&mut pair).await, HighLevelState::NoReplicasReady);
        pair.status.units[0].ready = true;
        assert_eq!(engine.determine_non_replicated(&mut pair).await, HighLevelState::SomeReplicasReady);
        for unit in &mut pair.status.units {
            unit.ready = true;
        }
        assert_eq!(engine.determine_non_replicated(&mut pair).await, HighLevelState::AllReplicasReady);
        assert_eq!(pair.status.prev_high_level_state, Some(HighLevelState::SomeReplicasReady));
    }
}
