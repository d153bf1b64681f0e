//! Per-unit status.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::states::{AgentState, HighLevelState, IntendedState, UnitType};

/// Token used by observed blocks before anything has been reported.
pub const UNKNOWN: &str = "Unknown";

fn unknown() -> String {
    UNKNOWN.to_string()
}

/// One managed unit (a database host or a subscriber host).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitStatus {
    pub name: String,
    pub unit_type: UnitType,

    /// Both initial flows have run on this unit at least once.
    pub initialized: bool,

    pub intended_state: IntendedState,
    pub prev_intended_state: Option<IntendedState>,

    pub high_level_state: HighLevelState,
    pub prev_high_level_state: Option<HighLevelState>,
    /// Epoch seconds of the last high-level state change.
    pub last_high_level_state_switch: i64,

    pub ready: bool,
    pub prev_ready: bool,
    pub active: bool,
    pub prev_active: bool,

    /// The cluster has reported this unit at least once.
    pub has_been_seen: bool,
    pub quiescing: bool,
    /// The unit ships a cache-group definition, so cache-agent state matters.
    pub cache_groups_file: bool,

    pub using_twosafe: Option<bool>,
    pub disable_return: Option<bool>,
    pub local_commit: Option<bool>,

    pub pod: PodObservation,
    pub engine: EngineStatus,
    pub db: DbStatus,
    pub replication: ReplicationStatus,
    pub cache: CacheStatus,
}

impl Default for UnitStatus {
    fn default() -> Self {
        Self {
            name: String::new(),
            unit_type: UnitType::Database,
            initialized: false,
            intended_state: IntendedState::NotApplicable,
            prev_intended_state: None,
            high_level_state: HighLevelState::Unknown,
            prev_high_level_state: None,
            last_high_level_state_switch: 0,
            ready: false,
            prev_ready: false,
            active: false,
            prev_active: false,
            has_been_seen: false,
            quiescing: false,
            cache_groups_file: false,
            using_twosafe: None,
            disable_return: None,
            local_commit: None,
            pod: PodObservation::default(),
            engine: EngineStatus::default(),
            db: DbStatus::default(),
            replication: ReplicationStatus::default(),
            cache: CacheStatus::default(),
        }
    }
}

impl UnitStatus {
    /// Create a unit in its initial state.
    pub fn new(name: impl Into<String>, unit_type: UnitType, intended_state: IntendedState) -> Self {
        let high_level_state = match unit_type {
            UnitType::Database => HighLevelState::Unknown,
            UnitType::Subscriber => HighLevelState::Initializing,
        };
        Self {
            name: name.into(),
            unit_type,
            intended_state,
            high_level_state,
            ..Self::default()
        }
    }

    pub fn is_database(&self) -> bool {
        self.unit_type == UnitType::Database
    }

    pub fn is_subscriber(&self) -> bool {
        self.unit_type == UnitType::Subscriber
    }

    /// Change the intended role, keeping the old one for audit.
    pub fn assign_role(&mut self, role: IntendedState) {
        self.prev_intended_state = Some(self.intended_state);
        self.intended_state = role;
    }

    /// Major release reported by the unit, if any (`"22.1.1.9"` → `"22"`).
    pub fn major_release(&self) -> Option<&str> {
        major_release(&self.engine.release)
    }

    /// Forget everything the agent reported.
    pub fn clear_agent_report(&mut self) {
        self.pod.agent = AgentState::Unknown;
        self.db.db = unknown();
        self.db.db_updatable = unknown();
        self.engine.instance = unknown();
        self.engine.daemon = unknown();
        self.replication.rep_agent = unknown();
        self.replication.rep_state = unknown();
        self.replication.rep_scheme = unknown();
        self.replication.rep_peer_p_state = unknown();
        self.cache.cache_agent = unknown();
        self.cache.awt_behind_mb = None;
    }
}

/// First dot-separated component of a release string.
pub fn major_release(release: &str) -> Option<&str> {
    let major = release.split('.').next()?.trim();
    if major.is_empty() {
        None
    } else {
        Some(major)
    }
}

/// What the cluster and the agent's transport say about the unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PodObservation {
    /// Cluster-reported lifecycle phase (`Pending`, `Running`, ...).
    pub phase: String,
    pub ip: String,
    pub agent: AgentState,
    /// Epoch seconds of the last successful agent contact.
    pub last_time_reachable: i64,
}

/// Engine installation state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineStatus {
    pub release: String,
    /// `Exists`, `Missing` or `Unknown`.
    pub instance: String,
    /// `Up`, `Down` or `Unknown`.
    pub daemon: String,
}

impl Default for EngineStatus {
    fn default() -> Self {
        Self {
            release: String::new(),
            instance: unknown(),
            daemon: unknown(),
        }
    }
}

/// Database load/open state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbStatus {
    /// `None`, `Loading`, `Loaded`, `Unloading`, `Unloaded`, `Transitioning` or `Unknown`.
    pub db: String,
    /// `Yes`, `No` or `Unknown`.
    pub db_updatable: String,
    /// Replication probe counter; equal ids on both units mean the standby caught up.
    pub db_id: i64,
    pub open: bool,
    pub configuration: BTreeMap<String, String>,
    pub monitor: BTreeMap<String, String>,
}

impl Default for DbStatus {
    fn default() -> Self {
        Self {
            db: unknown(),
            db_updatable: unknown(),
            db_id: 0,
            open: false,
            configuration: BTreeMap::new(),
            monitor: BTreeMap::new(),
        }
    }
}

/// Replication agent and scheme state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationStatus {
    /// `Running`, `Not Running` or `Unknown`.
    pub rep_agent: String,
    /// `Exists`, `None` or `Unknown`.
    pub rep_scheme: String,
    /// `ACTIVE`, `STANDBY`, `IDLE`, ... as reported by the engine.
    pub rep_state: String,
    pub rep_peer_p_state: String,
    pub last_time_rep_state_changed: i64,
}

impl Default for ReplicationStatus {
    fn default() -> Self {
        Self {
            rep_agent: unknown(),
            rep_scheme: unknown(),
            rep_state: unknown(),
            rep_peer_p_state: unknown(),
            last_time_rep_state_changed: 0,
        }
    }
}

/// Cache agent state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheStatus {
    /// `Running`, `Not Running` or `Unknown`.
    pub cache_agent: String,
    /// Asynchronous write-through lag in MB, rounded up.
    pub awt_behind_mb: Option<i32>,
    pub n_cache_groups: i32,
}

impl Default for CacheStatus {
    fn default() -> Self {
        Self {
            cache_agent: unknown(),
            awt_behind_mb: None,
            n_cache_groups: 0,
        }
    }
}
