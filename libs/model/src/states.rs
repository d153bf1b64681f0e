//! State vocabularies shared by pairs, units and the subscriber group.

define_vocabulary! {
    /// Coarse operational phase of a pair, a unit, or the subscriber group.
    ///
    /// One vocabulary covers all three because flow outcomes, unit states and
    /// pair states are compared against each other in the transition table.
    HighLevelState {
        // Pair states
        Initializing => "Initializing",
        Normal => "Normal",
        ActiveDown => "ActiveDown",
        StandbyDown => "StandbyDown",
        ActiveTakeover => "ActiveTakeover",
        StandbyStarting => "StandbyStarting",
        StandbyCatchup => "StandbyCatchup",
        BothDown => "BothDown",
        WaitingForActive => "WaitingForActive",
        ConfiguringActive => "ConfiguringActive",
        Reexamine => "Reexamine",
        ManualInterventionRequired => "ManualInterventionRequired",
        Failed => "Failed",
        /// Active/active placeholder; never produced by automatic transitions.
        OneDown => "OneDown",

        // Non-replicated aggregate states
        AllReplicasReady => "AllReplicasReady",
        SomeReplicasReady => "SomeReplicasReady",
        NoReplicasReady => "NoReplicasReady",

        // Subscriber group states
        AllSubscribersReady => "AllSubscribersReady",
        SomeSubscribersReady => "SomeSubscribersReady",
        NoSubscribersReady => "NoSubscribersReady",

        // Unit health and flow outcomes
        Healthy => "Healthy",
        HealthyActive => "HealthyActive",
        HealthyStandby => "HealthyStandby",
        HealthyIdle => "HealthyIdle",
        Down => "Down",
        OtherDown => "OtherDown",
        Unknown => "Unknown",
        Terminal => "Terminal",
        UpgradeFailed => "UpgradeFailed",
        CatchingUp => "CatchingUp",
        NotProvisioned => "NotProvisioned",
    }
}

impl Default for HighLevelState {
    fn default() -> Self {
        HighLevelState::Unknown
    }
}

impl HighLevelState {
    /// States of a non-replicated topology's aggregate.
    #[must_use]
    pub fn is_non_replicated_aggregate(&self) -> bool {
        matches!(
            self,
            Self::AllReplicasReady | Self::SomeReplicasReady | Self::NoReplicasReady
        )
    }

    /// Unit states that mean the unit's database is serving.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        matches!(
            self,
            Self::Healthy | Self::HealthyActive | Self::HealthyStandby | Self::HealthyIdle
        )
    }
}

define_vocabulary! {
    /// Operator-assigned target role of a unit.
    IntendedState {
        Active => "Active",
        Standby => "Standby",
        Standalone => "Standalone",
        Subscriber => "Subscriber",
        /// Role of both units in the unimplemented active/active topology.
        NotApplicable => "N/A",
    }
}

impl Default for IntendedState {
    fn default() -> Self {
        IntendedState::NotApplicable
    }
}

define_vocabulary! {
    /// Kind of workload a unit hosts.
    UnitType {
        Database => "Database",
        Subscriber => "Subscriber",
    }
}

impl Default for UnitType {
    fn default() -> Self {
        UnitType::Database
    }
}

define_vocabulary! {
    /// Reachability of a unit's agent.
    AgentState {
        Up => "Up",
        Down => "Down",
        Unknown => "Unknown",
    }
}

impl Default for AgentState {
    fn default() -> Self {
        AgentState::Unknown
    }
}

define_vocabulary! {
    /// What to do when both units of a pair are down.
    BothDownBehavior {
        /// Pick the unit most likely to hold the newest data.
        Best => "Best",
        /// Always wait for the user.
        Manual => "Manual",
    }
}

define_vocabulary! {
    /// Whether image changes trigger an automatic rolling upgrade.
    ImageUpgradeStrategy {
        Auto => "Auto",
        Manual => "Manual",
    }
}

define_vocabulary! {
    /// Phase of an automatic rolling upgrade.
    UpgradePhase {
        UpgradingStandby => "UpgradingStandby",
        UpgradingActive => "UpgradingActive",
        Complete => "Complete",
        ManualInterventionRequired => "ManualInterventionRequired",
    }
}

define_vocabulary! {
    /// Per-role progress of an automatic rolling upgrade.
    RoleUpgradeStatus {
        Waiting => "waiting",
        DeleteStandby => "deleteStandby",
        DeleteActive => "deleteActive",
        Processing => "processing",
        Success => "success",
        Failed => "failed",
        Unknown => "unknown",
        /// Standby came back during reexamine but is still catching up.
        CatchingUp => "CatchingUp",
    }
}

impl RoleUpgradeStatus {
    /// True while the unit is being removed for its upgrade.
    #[must_use]
    pub fn is_delete(&self) -> bool {
        matches!(self, Self::DeleteStandby | Self::DeleteActive)
    }
}
