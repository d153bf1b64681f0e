//! Unit Flow Dispatcher.
//!
//! Selects the control flow to run on one unit. Selection is a pure lookup
//! over a [`DispatchKey`]:
//!
//! - subscribers: the unit's own state
//! - standalone database units: the unit's own state
//! - replicated database units: the pair's state and the unit's intended role
//!
//! Keys with no flow log and select nothing; they never panic.

use tracing::{debug, error};
use ttpair_model::{HighLevelState, IntendedState, ManagedPair, RoleUpgradeStatus, UnitStatus};

/// Every flow the operator can run on a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowKind {
    ConfigureActiveActiveFromStandby,
    ConfigureActiveActiveFromActive,
    ConfigureActiveStandby,
    CheckNormalActive,
    CheckNormalStandby,
    BothDownActive,
    BothDownStandby,
    StandbyDownStandby,
    ActiveTakeoverActive,
    KillDeadStandby,
    StandbyStartingStandby,
    StandbyCatchupStandby,
    Reexamine,
    WaitingActive,
    WaitingStandby,
    ActiveDownActive,
    CheckActiveDownStandby,
    InitializeActive,
    InitializeStandby,
    NonrepInitializing,
    NonrepNormal,
    NonrepTerminal,
    NonrepDown,
    ReexamineNonrep,
    SubscriberNormal,
    SubscriberNotProvisioned,
    SubscriberDown,
    SubscriberFailed,
    SubscriberCatchingUp,
    SubscriberInitializing,
}

impl FlowKind {
    /// Name the agent knows the flow by; also the caller identity of its actions.
    pub const fn as_str(&self) -> &'static str {
        match self {
            FlowKind::ConfigureActiveActiveFromStandby => "configureActiveActiveFromStandbyAS",
            FlowKind::ConfigureActiveActiveFromActive => "configureActiveActiveFromActiveAS",
            FlowKind::ConfigureActiveStandby => "configureActiveStandbyAS",
            FlowKind::CheckNormalActive => "checkNormalActiveAS",
            FlowKind::CheckNormalStandby => "checkNormalStandbyAS",
            FlowKind::BothDownActive => "bothDownActiveAS",
            FlowKind::BothDownStandby => "bothDownStandbyAS",
            FlowKind::StandbyDownStandby => "standbyDownStandbyAS",
            FlowKind::ActiveTakeoverActive => "activeTakeoverActiveAS",
            FlowKind::KillDeadStandby => "killDeadStandbyAS",
            FlowKind::StandbyStartingStandby => "standbyStartingStandbyAS",
            FlowKind::StandbyCatchupStandby => "standbyCatchupStandbyAS",
            FlowKind::Reexamine => "reexamineAS",
            FlowKind::WaitingActive => "waitingActiveAS",
            FlowKind::WaitingStandby => "waitingStandbyAS",
            FlowKind::ActiveDownActive => "activeDownActiveAS",
            FlowKind::CheckActiveDownStandby => "checkActiveDownStandbyAS",
            FlowKind::InitializeActive => "initializeActiveAS",
            FlowKind::InitializeStandby => "initializeStandbyAS",
            FlowKind::NonrepInitializing => "nonrepInitializing",
            FlowKind::NonrepNormal => "nonrepNormal",
            FlowKind::NonrepTerminal => "nonrepTerminal",
            FlowKind::NonrepDown => "nonrepDown",
            FlowKind::ReexamineNonrep => "reexamineNonrep",
            FlowKind::SubscriberNormal => "subscriberNormal",
            FlowKind::SubscriberNotProvisioned => "subscriberNotProvisioned",
            FlowKind::SubscriberDown => "subscriberDown",
            FlowKind::SubscriberFailed => "subscriberFailed",
            FlowKind::SubscriberCatchingUp => "subscriberCatchingUp",
            FlowKind::SubscriberInitializing => "subscriberInitializing",
        }
    }
}

impl std::fmt::Display for FlowKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What flow selection depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchKey {
    Subscriber(HighLevelState),
    Standalone(HighLevelState),
    Replicated {
        pair: HighLevelState,
        role: IntendedState,
        /// The unit was standby before becoming active.
        promoted: bool,
        upgrading: bool,
        standby_catching_up: bool,
    },
}

impl DispatchKey {
    pub fn for_unit(pair: &ManagedPair, unit: &UnitStatus) -> Self {
        if unit.is_subscriber() {
            DispatchKey::Subscriber(unit.high_level_state)
        } else if !pair.is_replicated() {
            DispatchKey::Standalone(unit.high_level_state)
        } else {
            let upgrade = &pair.status.upgrade;
            DispatchKey::Replicated {
                pair: pair.status.high_level_state,
                role: unit.intended_state,
                promoted: unit.prev_intended_state == Some(IntendedState::Standby),
                upgrading: upgrade.in_progress(),
                standby_catching_up: upgrade.standby_status == Some(RoleUpgradeStatus::CatchingUp),
            }
        }
    }
}

/// Pick the flow for unit `index` of `pair`.
pub fn pick_flow(pair: &ManagedPair, index: usize) -> Option<FlowKind> {
    let unit = pair.status.units.get(index)?;
    let key = DispatchKey::for_unit(pair, unit);
    let flow = select(key);
    debug!(unit = %unit.name, ?key, flow = flow.map(|f| f.as_str()), "Picked flow");
    flow
}

/// The dispatch table.
pub fn select(key: DispatchKey) -> Option<FlowKind> {
    use HighLevelState as S;
    use IntendedState::{Active, Standby};

    match key {
        DispatchKey::Subscriber(state) => match state {
            S::Normal => Some(FlowKind::SubscriberNormal),
            S::NotProvisioned => Some(FlowKind::SubscriberNotProvisioned),
            S::Down => Some(FlowKind::SubscriberDown),
            S::Terminal | S::UpgradeFailed => Some(FlowKind::SubscriberFailed),
            S::CatchingUp => Some(FlowKind::SubscriberCatchingUp),
            S::Initializing => Some(FlowKind::SubscriberInitializing),
            other => {
                error!(state = %other, "Subscriber in unexpected state");
                None
            }
        },

        DispatchKey::Standalone(state) => match state {
            S::Initializing => Some(FlowKind::NonrepInitializing),
            S::Normal => Some(FlowKind::NonrepNormal),
            S::Terminal => Some(FlowKind::NonrepTerminal),
            S::Down => Some(FlowKind::NonrepDown),
            S::Reexamine => Some(FlowKind::ReexamineNonrep),
            S::ManualInterventionRequired => None,
            other => {
                debug!(state = %other, "No flow for standalone unit state");
                None
            }
        },

        DispatchKey::Replicated {
            pair,
            role,
            promoted,
            upgrading,
            standby_catching_up,
        } => match (pair, role) {
            (S::ConfiguringActive, Active) if promoted => {
                Some(FlowKind::ConfigureActiveActiveFromStandby)
            }
            (S::ConfiguringActive, Active) => Some(FlowKind::ConfigureActiveActiveFromActive),
            (S::ConfiguringActive, Standby) => Some(FlowKind::ConfigureActiveStandby),

            (S::Normal, Active) => Some(FlowKind::CheckNormalActive),
            (S::Normal, Standby) => Some(FlowKind::CheckNormalStandby),

            (S::BothDown, Active) => Some(FlowKind::BothDownActive),
            (S::BothDown, Standby) => Some(FlowKind::BothDownStandby),

            (S::StandbyDown, Active) => Some(FlowKind::CheckNormalActive),
            (S::StandbyDown, Standby) => Some(FlowKind::StandbyDownStandby),

            (S::ActiveTakeover, Active) => Some(FlowKind::ActiveTakeoverActive),
            (S::ActiveTakeover, Standby) => Some(FlowKind::KillDeadStandby),

            (S::StandbyStarting, Active) => Some(FlowKind::CheckNormalActive),
            (S::StandbyStarting, Standby) => Some(FlowKind::StandbyStartingStandby),

            (S::StandbyCatchup, Active) => Some(FlowKind::CheckNormalActive),
            (S::StandbyCatchup, Standby) => Some(FlowKind::StandbyCatchupStandby),

            // During an upgrade the standby side drives reexamination.
            (S::Reexamine, Active) if upgrading => None,
            (S::Reexamine, Standby) if upgrading && !standby_catching_up => {
                Some(FlowKind::StandbyDownStandby)
            }
            (S::Reexamine, Active | Standby) => Some(FlowKind::Reexamine),

            (S::WaitingForActive, Active) => Some(FlowKind::WaitingActive),
            (S::WaitingForActive, Standby) => Some(FlowKind::WaitingStandby),

            (S::ActiveDown, Active) => Some(FlowKind::ActiveDownActive),
            (S::ActiveDown, Standby) => Some(FlowKind::CheckActiveDownStandby),

            (S::Initializing, Active) => Some(FlowKind::InitializeActive),
            (S::Initializing, Standby) => Some(FlowKind::InitializeStandby),

            (S::ManualInterventionRequired, _) => None,

            // Active/active placeholder.
            (S::OneDown, _) | (_, IntendedState::NotApplicable) => {
                debug!(pair = %pair, role = %role, "Active/active topology has no flows");
                None
            }

            (pair, role) => {
                error!(pair = %pair, role = %role, "No flow for pair state and role");
                None
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use ttpair_model::{PairSpec, UpgradePhase};

    use super::*;

    fn replicated(pair: HighLevelState, role: IntendedState) -> DispatchKey {
        DispatchKey::Replicated {
            pair,
            role,
            promoted: false,
            upgrading: false,
            standby_catching_up: false,
        }
    }

    #[rstest]
    #[case(HighLevelState::Normal, IntendedState::Active, Some(FlowKind::CheckNormalActive))]
    #[case(HighLevelState::Normal, IntendedState::Standby, Some(FlowKind::CheckNormalStandby))]
    #[case(HighLevelState::BothDown, IntendedState::Standby, Some(FlowKind::BothDownStandby))]
    #[case(HighLevelState::StandbyDown, IntendedState::Active, Some(FlowKind::CheckNormalActive))]
    #[case(HighLevelState::StandbyDown, IntendedState::Standby, Some(FlowKind::StandbyDownStandby))]
    #[case(HighLevelState::ActiveTakeover, IntendedState::Standby, Some(FlowKind::KillDeadStandby))]
    #[case(HighLevelState::ActiveDown, IntendedState::Standby, Some(FlowKind::CheckActiveDownStandby))]
    #[case(HighLevelState::ConfiguringActive, IntendedState::Active, Some(FlowKind::ConfigureActiveActiveFromActive))]
    #[case(HighLevelState::Initializing, IntendedState::Standby, Some(FlowKind::InitializeStandby))]
    #[case(HighLevelState::Reexamine, IntendedState::Active, Some(FlowKind::Reexamine))]
    #[case(HighLevelState::ManualInterventionRequired, IntendedState::Active, None)]
    #[case(HighLevelState::OneDown, IntendedState::Active, None)]
    #[case(HighLevelState::Normal, IntendedState::NotApplicable, None)]
    fn test_replicated_table(
        #[case] pair: HighLevelState,
        #[case] role: IntendedState,
        #[case] expected: Option<FlowKind>,
    ) {
        assert_eq!(select(replicated(pair, role)), expected);
    }

    #[rstest]
    #[case(HighLevelState::Normal, Some(FlowKind::SubscriberNormal))]
    #[case(HighLevelState::UpgradeFailed, Some(FlowKind::SubscriberFailed))]
    #[case(HighLevelState::Terminal, Some(FlowKind::SubscriberFailed))]
    #[case(HighLevelState::NotProvisioned, Some(FlowKind::SubscriberNotProvisioned))]
    #[case(HighLevelState::HealthyActive, None)]
    fn test_subscriber_table(#[case] state: HighLevelState, #[case] expected: Option<FlowKind>) {
        assert_eq!(select(DispatchKey::Subscriber(state)), expected);
    }

    #[rstest]
    #[case(HighLevelState::Initializing, Some(FlowKind::NonrepInitializing))]
    #[case(HighLevelState::Reexamine, Some(FlowKind::ReexamineNonrep))]
    #[case(HighLevelState::ManualInterventionRequired, None)]
    #[case(HighLevelState::Unknown, None)]
    fn test_standalone_table(#[case] state: HighLevelState, #[case] expected: Option<FlowKind>) {
        assert_eq!(select(DispatchKey::Standalone(state)), expected);
    }

    #[test]
    fn test_promoted_active_configures_from_standby() {
        let key = DispatchKey::Replicated {
            pair: HighLevelState::ConfiguringActive,
            role: IntendedState::Active,
            promoted: true,
            upgrading: false,
            standby_catching_up: false,
        };
        assert_eq!(select(key), Some(FlowKind::ConfigureActiveActiveFromStandby));
    }

    #[test]
    fn test_reexamine_during_upgrade() {
        let mut pair = ManagedPair::new("ns", "db", PairSpec::default());
        pair.initialize_units();
        pair.status.high_level_state = HighLevelState::Reexamine;
        pair.status.upgrade.upgrade_state = Some(UpgradePhase::UpgradingStandby);

        assert_eq!(pick_flow(&pair, 0), None);
        assert_eq!(pick_flow(&pair, 1), Some(FlowKind::StandbyDownStandby));

        pair.status.upgrade.standby_status = Some(RoleUpgradeStatus::CatchingUp);
        assert_eq!(pick_flow(&pair, 1), Some(FlowKind::Reexamine));
    }

    #[test]
    fn test_pick_flow_uses_unit_kind() {
        let mut pair = ManagedPair::new("ns", "db", PairSpec::default());
        pair.spec.subscribers = Some(ttpair_model::SubscriberSpec {
            replicas: 1,
            ..Default::default()
        });
        pair.initialize_units();
        assert_eq!(pick_flow(&pair, 0), Some(FlowKind::InitializeActive));
        assert_eq!(pick_flow(&pair, 2), Some(FlowKind::SubscriberInitializing));
        assert_eq!(pick_flow(&pair, 9), None);
    }
}
