//! The managed pair document: desired spec plus observed status.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::states::{
    BothDownBehavior, HighLevelState, ImageUpgradeStrategy, IntendedState, RoleUpgradeStatus,
    UnitType, UpgradePhase,
};
use crate::unit::UnitStatus;

/// Default polling interval between real reconciliation passes.
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_millis(5000);

/// Value of `active_pods` when no unit is serving as active.
pub const NO_ACTIVE_PODS: &str = "None";

/// Value of `active_pods` for non-replicated topologies.
pub const NOT_APPLICABLE: &str = "N/A";

/// Stable identity of a managed object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// One replicated (or standalone) database topology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedPair {
    pub name: String,
    pub namespace: String,
    /// Incremented by the cluster whenever the spec changes.
    #[serde(default)]
    pub generation: i64,
    #[serde(default)]
    pub spec: PairSpec,
    #[serde(default)]
    pub status: PairStatus,
}

/// Desired configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PairSpec {
    /// `"none"` selects a non-replicated topology.
    pub replication_topology: Option<String>,
    /// Unit count of a non-replicated topology.
    pub replicas: Option<u32>,
    pub subscribers: Option<SubscriberSpec>,

    /// Changing this token parks the pair in manual intervention.
    pub stop_managing: String,
    /// Changing this token asks the engine to re-evaluate a parked pair.
    pub reexamine: String,
    /// Changing this token clears upgrade bookkeeping.
    pub reset_upgrade_state: String,

    pub both_down_behavior: Option<String>,
    pub polling_interval_secs: Option<u64>,

    pub agent_tcp_timeout_secs: Option<u64>,
    pub agent_tls_timeout_secs: Option<u64>,
    pub agent_get_timeout_secs: Option<u64>,
    pub agent_post_timeout_secs: Option<u64>,
    pub agent_async_timeout_secs: Option<u64>,

    pub image_upgrade_strategy: Option<String>,
    /// Seconds an upgraded unit may stay down before the upgrade fails; 0 = never.
    pub upgrade_down_pod_timeout_secs: Option<u64>,
}

/// Read-only subscriber replicas.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriberSpec {
    pub replicas: u32,
    pub max_replicas: Option<u32>,
    pub name: Option<String>,
}

/// Timeouts applied to agent requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentTimeouts {
    pub tcp: Duration,
    pub tls: Duration,
    pub get: Duration,
    pub post: Duration,
    pub async_task: Duration,
}

impl Default for AgentTimeouts {
    fn default() -> Self {
        Self {
            tcp: Duration::from_secs(10),
            tls: Duration::from_secs(10),
            get: Duration::from_secs(60),
            post: Duration::from_secs(600),
            async_task: Duration::from_secs(600),
        }
    }
}

/// Observed state, written only by the operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PairStatus {
    pub observed_generation: i64,
    /// Epoch milliseconds of the last real pass.
    pub last_reconcile_time_ms: i64,
    pub last_reconciling_operator: String,

    pub high_level_state: HighLevelState,
    pub prev_high_level_state: Option<HighLevelState>,
    pub last_high_level_state_switch: i64,

    /// Name of the serving active unit, `"None"`, or `"N/A"`.
    pub active_pods: String,
    pub prev_stop_managing: String,
    pub prev_reexamine: String,

    pub awt_behind_mb: Option<i32>,
    pub using_twosafe: bool,
    /// Set once a twosafe scheme allows commits without the standby.
    pub both_down_recovery_ineligible: bool,
    /// Count of audit records emitted for this object.
    pub last_event: u64,

    pub active_rep_agent: String,
    pub active_cache_agent: String,
    pub standby_rep_agent: String,
    pub standby_cache_agent: String,
    pub active_perm_size: String,
    pub active_perm_in_use: String,
    pub standby_perm_size: String,
    pub standby_perm_in_use: String,

    pub async_status: AsyncStatus,
    pub standby_recovery: StandbyRecovery,
    pub upgrade: UpgradeStatus,
    pub subscriber: SubscriberStatus,

    /// Database units first (two when replicated), subscribers after.
    pub units: Vec<UnitStatus>,
}

impl Default for PairStatus {
    fn default() -> Self {
        Self {
            observed_generation: 0,
            last_reconcile_time_ms: 0,
            last_reconciling_operator: String::new(),
            high_level_state: HighLevelState::Initializing,
            prev_high_level_state: None,
            last_high_level_state_switch: 0,
            active_pods: NO_ACTIVE_PODS.to_string(),
            prev_stop_managing: String::new(),
            prev_reexamine: String::new(),
            awt_behind_mb: None,
            using_twosafe: false,
            both_down_recovery_ineligible: false,
            last_event: 0,
            active_rep_agent: String::new(),
            active_cache_agent: String::new(),
            standby_rep_agent: String::new(),
            standby_cache_agent: String::new(),
            active_perm_size: String::new(),
            active_perm_in_use: String::new(),
            standby_perm_size: String::new(),
            standby_perm_in_use: String::new(),
            async_status: AsyncStatus::default(),
            standby_recovery: StandbyRecovery::default(),
            upgrade: UpgradeStatus::default(),
            subscriber: SubscriberStatus::default(),
            units: Vec::new(),
        }
    }
}

/// The single outstanding long-running remote task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AsyncStatus {
    /// Request id; empty when no task has been tracked.
    pub id: String,
    pub errno: i32,
    pub errmsg: String,
    /// Agent verb, e.g. `repDuplicate`.
    pub task_type: String,
    /// Flow that submitted the task.
    pub caller: String,
    /// Network name of the unit running the task.
    pub host: String,
    pub unit_name: String,
    pub running: bool,
    pub complete: bool,
    pub updated: Option<i64>,
    pub started: Option<i64>,
    pub ended: Option<i64>,
}

/// Progress of the standby recovery procedure that runs after a standby was down.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StandbyRecovery {
    pub id: String,
    /// Request id of the duplication task this procedure submitted.
    pub async_id: String,
    pub unit_name: String,
    /// `pending` while the procedure runs, `complete` after.
    pub status: String,
    pub destroy_db: bool,
    pub rep_duplicate: bool,
    pub start_rep_agent: bool,
}

impl StandbyRecovery {
    pub const PENDING: &'static str = "pending";

    pub fn is_pending(&self) -> bool {
        self.status == Self::PENDING
    }
}

/// Bookkeeping of an automatic rolling upgrade.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpgradeStatus {
    pub upgrade_state: Option<UpgradePhase>,
    pub image_update_pending: bool,
    pub upgrade_start_time: i64,
    pub prev_upgrade_state: Option<UpgradePhase>,
    pub last_upgrade_state_switch: i64,
    pub standby_status: Option<RoleUpgradeStatus>,
    pub standby_start_time: i64,
    pub active_status: Option<RoleUpgradeStatus>,
    pub active_start_time: i64,
    pub prev_reset_upgrade_state: String,
}

impl UpgradeStatus {
    pub fn in_progress(&self) -> bool {
        self.upgrade_state.is_some()
    }

    /// Clear all upgrade bookkeeping except the reset token.
    pub fn reset(&mut self) {
        let token = std::mem::take(&mut self.prev_reset_upgrade_state);
        *self = Self {
            prev_reset_upgrade_state: token,
            ..Self::default()
        };
    }
}

/// Aggregate state of the subscriber group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriberStatus {
    pub high_level_state: Option<HighLevelState>,
    pub prev_high_level_state: Option<HighLevelState>,
    pub last_high_level_state_switch: i64,
    pub new_replicas: u32,
    pub prev_replicas: u32,
    pub surplusing: bool,
}

impl ManagedPair {
    /// Create a pair with default status.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: PairSpec) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            generation: 1,
            spec,
            status: PairStatus::default(),
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }

    /// True for an active/standby pair, false for standalone replicas.
    pub fn is_replicated(&self) -> bool {
        !matches!(
            self.spec.replication_topology.as_deref(),
            Some(t) if t.eq_ignore_ascii_case("none")
        )
    }

    /// Number of database units (the pair, or the standalone replicas).
    pub fn database_unit_count(&self) -> usize {
        if self.is_replicated() {
            2
        } else {
            self.spec.replicas.unwrap_or(1) as usize
        }
    }

    /// Upper bound on subscriber units.
    pub fn max_subscribers(&self) -> u32 {
        self.spec
            .subscribers
            .as_ref()
            .map(|s| s.max_replicas.unwrap_or(s.replicas))
            .unwrap_or(0)
    }

    /// Base name of subscriber units.
    pub fn subscriber_name(&self) -> String {
        self.spec
            .subscribers
            .as_ref()
            .and_then(|s| s.name.clone())
            .unwrap_or_else(|| format!("{}-sub", self.name))
    }

    pub fn polling_interval(&self) -> Duration {
        match self.spec.polling_interval_secs {
            Some(secs) if secs > 0 => Duration::from_secs(secs),
            _ => DEFAULT_POLLING_INTERVAL,
        }
    }

    /// Configured both-down behavior; an unrecognised value is an error.
    pub fn both_down_behavior(&self) -> Result<BothDownBehavior, ModelError> {
        match self.spec.both_down_behavior.as_deref() {
            None => Ok(BothDownBehavior::Best),
            Some(token) => token.parse(),
        }
    }

    pub fn image_upgrade_strategy(&self) -> ImageUpgradeStrategy {
        match self.spec.image_upgrade_strategy.as_deref() {
            Some("Manual") => ImageUpgradeStrategy::Manual,
            _ => ImageUpgradeStrategy::Auto,
        }
    }

    pub fn upgrade_down_pod_timeout(&self) -> Duration {
        Duration::from_secs(self.spec.upgrade_down_pod_timeout_secs.unwrap_or(600))
    }

    pub fn agent_timeouts(&self) -> AgentTimeouts {
        let d = AgentTimeouts::default();
        let secs = |v: Option<u64>, default: Duration| v.map(Duration::from_secs).unwrap_or(default);
        let post = secs(self.spec.agent_post_timeout_secs, d.post);
        AgentTimeouts {
            tcp: secs(self.spec.agent_tcp_timeout_secs, d.tcp),
            tls: secs(self.spec.agent_tls_timeout_secs, d.tls),
            get: secs(self.spec.agent_get_timeout_secs, d.get),
            post,
            async_task: secs(self.spec.agent_async_timeout_secs, post),
        }
    }

    pub fn unit(&self, index: usize) -> Result<&UnitStatus, ModelError> {
        let len = self.status.units.len();
        self.status
            .units
            .get(index)
            .ok_or(ModelError::UnitOutOfRange { index, len })
    }

    pub fn unit_mut(&mut self, index: usize) -> Result<&mut UnitStatus, ModelError> {
        let len = self.status.units.len();
        self.status
            .units
            .get_mut(index)
            .ok_or(ModelError::UnitOutOfRange { index, len })
    }

    /// Indices of database units, in status order.
    pub fn database_indices(&self) -> Vec<usize> {
        self.status
            .units
            .iter()
            .enumerate()
            .filter(|(_, u)| u.is_database())
            .map(|(i, _)| i)
            .collect()
    }

    /// Indices of subscriber units, in status order.
    pub fn subscriber_indices(&self) -> Vec<usize> {
        self.status
            .units
            .iter()
            .enumerate()
            .filter(|(_, u)| u.is_subscriber())
            .map(|(i, _)| i)
            .collect()
    }

    /// Index of the pair unit intended to be active.
    pub fn active_index(&self) -> Option<usize> {
        self.pair_unit_with_role(IntendedState::Active)
    }

    /// Index of the pair unit intended to be standby.
    pub fn standby_index(&self) -> Option<usize> {
        self.pair_unit_with_role(IntendedState::Standby)
    }

    fn pair_unit_with_role(&self, role: IntendedState) -> Option<usize> {
        self.status
            .units
            .iter()
            .take(2)
            .position(|u| u.is_database() && u.intended_state == role)
    }

    pub fn upgrade_in_progress(&self) -> bool {
        self.status.upgrade.in_progress()
    }

    /// Subscriber units that should currently be provisioned.
    pub fn subscriber_replicas(&self) -> u32 {
        self.spec.subscribers.as_ref().map(|s| s.replicas).unwrap_or(0)
    }

    /// Create the unit list on first sight of the object.
    ///
    /// Returns false when units already exist. Database units are named
    /// `<pair>-<n>`, subscribers `<subscriber name>-<n>`; subscriber slots
    /// beyond the requested replicas start out `NotProvisioned`.
    pub fn initialize_units(&mut self) -> bool {
        if !self.status.units.is_empty() {
            return false;
        }

        let replicated = self.is_replicated();
        let mut units = Vec::new();
        for n in 0..self.database_unit_count() {
            let role = match (replicated, n) {
                (true, 0) => IntendedState::Active,
                (true, _) => IntendedState::Standby,
                (false, _) => IntendedState::Standalone,
            };
            let mut unit = UnitStatus::new(format!("{}-{}", self.name, n), UnitType::Database, role);
            unit.high_level_state = HighLevelState::Initializing;
            unit.initialized = true;
            units.push(unit);
        }

        let sub_name = self.subscriber_name();
        let wanted = self.subscriber_replicas();
        for n in 0..self.max_subscribers() {
            let mut unit = UnitStatus::new(
                format!("{}-{}", sub_name, n),
                UnitType::Subscriber,
                IntendedState::Subscriber,
            );
            if n >= wanted {
                unit.high_level_state = HighLevelState::NotProvisioned;
            }
            unit.initialized = true;
            units.push(unit);
        }

        self.status.units = units;
        self.status.high_level_state = HighLevelState::Initializing;
        self.status.subscriber.high_level_state =
            (wanted > 0).then_some(HighLevelState::NoSubscribersReady);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> ManagedPair {
        let mut pair = ManagedPair::new("prod", "sales", PairSpec::default());
        pair.status.units = vec![
            UnitStatus::new("sales-0", UnitType::Database, IntendedState::Standby),
            UnitStatus::new("sales-1", UnitType::Database, IntendedState::Active),
            UnitStatus::new("sales-sub-0", UnitType::Subscriber, IntendedState::Subscriber),
        ];
        pair
    }

    #[test]
    fn test_replication_topology() {
        let mut p = pair();
        assert!(p.is_replicated());
        assert_eq!(p.database_unit_count(), 2);

        p.spec.replication_topology = Some("None".to_string());
        p.spec.replicas = Some(3);
        assert!(!p.is_replicated());
        assert_eq!(p.database_unit_count(), 3);
    }

    #[test]
    fn test_role_lookup() {
        let p = pair();
        assert_eq!(p.active_index(), Some(1));
        assert_eq!(p.standby_index(), Some(0));
        assert_eq!(p.database_indices(), vec![0, 1]);
        assert_eq!(p.subscriber_indices(), vec![2]);
    }

    #[test]
    fn test_polling_interval() {
        let mut p = pair();
        assert_eq!(p.polling_interval(), Duration::from_millis(5000));
        p.spec.polling_interval_secs = Some(0);
        assert_eq!(p.polling_interval(), Duration::from_millis(5000));
        p.spec.polling_interval_secs = Some(12);
        assert_eq!(p.polling_interval(), Duration::from_secs(12));
    }

    #[test]
    fn test_async_timeout_defaults_to_post_timeout() {
        let mut p = pair();
        p.spec.agent_post_timeout_secs = Some(90);
        let t = p.agent_timeouts();
        assert_eq!(t.post, Duration::from_secs(90));
        assert_eq!(t.async_task, Duration::from_secs(90));

        p.spec.agent_async_timeout_secs = Some(30);
        assert_eq!(p.agent_timeouts().async_task, Duration::from_secs(30));
    }

    #[test]
    fn test_both_down_behavior() {
        let mut p = pair();
        assert_eq!(p.both_down_behavior().unwrap(), BothDownBehavior::Best);
        p.spec.both_down_behavior = Some("Manual".to_string());
        assert_eq!(p.both_down_behavior().unwrap(), BothDownBehavior::Manual);
        p.spec.both_down_behavior = Some("Whatever".to_string());
        assert!(p.both_down_behavior().is_err());
    }

    #[test]
    fn test_subscriber_defaults() {
        let mut p = pair();
        assert_eq!(p.max_subscribers(), 0);
        p.spec.subscribers = Some(SubscriberSpec {
            replicas: 2,
            ..SubscriberSpec::default()
        });
        assert_eq!(p.max_subscribers(), 2);
        assert_eq!(p.subscriber_name(), "sales-sub");
    }

    #[test]
    fn test_upgrade_reset_keeps_token() {
        let mut u = UpgradeStatus {
            upgrade_state: Some(UpgradePhase::UpgradingActive),
            active_status: Some(RoleUpgradeStatus::Processing),
            upgrade_start_time: 10,
            prev_reset_upgrade_state: "r1".to_string(),
            ..UpgradeStatus::default()
        };
        assert!(u.in_progress());
        u.reset();
        assert!(!u.in_progress());
        assert_eq!(u.active_status, None);
        assert_eq!(u.prev_reset_upgrade_state, "r1");
    }

    #[test]
    fn test_default_status() {
        let status = PairStatus::default();
        assert_eq!(status.high_level_state, HighLevelState::Initializing);
        assert_eq!(status.active_pods, NO_ACTIVE_PODS);
    }

    #[test]
    fn test_initialize_units() {
        let mut p = ManagedPair::new("prod", "sales", PairSpec::default());
        p.spec.subscribers = Some(SubscriberSpec {
            replicas: 1,
            max_replicas: Some(2),
            name: None,
        });
        assert!(p.initialize_units());
        assert!(!p.initialize_units());

        let names: Vec<_> = p.status.units.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, vec!["sales-0", "sales-1", "sales-sub-0", "sales-sub-1"]);
        assert_eq!(p.status.units[0].intended_state, IntendedState::Active);
        assert_eq!(p.status.units[1].intended_state, IntendedState::Standby);
        assert_eq!(p.status.units[2].high_level_state, HighLevelState::Initializing);
        assert_eq!(p.status.units[3].high_level_state, HighLevelState::NotProvisioned);
        assert_eq!(
            p.status.subscriber.high_level_state,
            Some(HighLevelState::NoSubscribersReady)
        );
    }

    #[test]
    fn test_initialize_standalone_units() {
        let mut p = ManagedPair::new("prod", "cache", PairSpec::default());
        p.spec.replication_topology = Some("none".to_string());
        p.spec.replicas = Some(3);
        p.initialize_units();
        assert_eq!(p.status.units.len(), 3);
        assert!(p
            .status
            .units
            .iter()
            .all(|u| u.intended_state == IntendedState::Standalone
                && u.high_level_state == HighLevelState::Initializing));
        assert_eq!(p.status.subscriber.high_level_state, None);
    }

    #[test]
    fn test_unit_out_of_range() {
        let p = pair();
        assert!(matches!(
            p.unit(7),
            Err(ModelError::UnitOutOfRange { index: 7, len: 3 })
        ));
    }
}
