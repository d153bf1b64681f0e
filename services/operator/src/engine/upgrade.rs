//! Rolling image upgrade of a replicated pair.
//!
//! The standby is replaced first. Once its replacement has caught up the
//! active is quiesced and replaced, which fails the pair over to the
//! upgraded unit. Phase changes come from the upgrade table; this module
//! moves the per-role statuses that feed it.

use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use ttpair_events::reason;
use ttpair_model::{
    HighLevelState, ImageUpgradeStrategy, IntendedState, ManagedPair, ModelError,
    RoleUpgradeStatus, UpgradePhase,
};

use super::{secs, Engine};
use crate::agent::{AgentError, Endpoint};
use crate::cluster::ClusterError;
use crate::pool::Credentials;

const UPGRADE_CALLER: &str = "upgrade";
const REP_WAIT_ATTEMPTS: u32 = 10;

/// Tunables of the upgrade checks.
#[derive(Debug, Clone, Copy)]
pub struct UpgradeSettings {
    /// Standby polls before replication counts as broken.
    pub verify_attempts: u32,
    pub verify_delay: Duration,
    /// Seconds the active waits for the standby to drain before it goes.
    pub quiesce_wait_secs: u64,
}

impl Default for UpgradeSettings {
    fn default() -> Self {
        Self {
            verify_attempts: 30,
            verify_delay: Duration::from_secs(10),
            quiesce_wait_secs: 30,
        }
    }
}

/// Why an upgrade step did not happen.
#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("cannot initiate the upgrade, pair state is {0}")]
    NotNormal(HighLevelState),

    #[error("automatic upgrade disabled")]
    ManualStrategy,

    #[error("Engine release mismatch, {unit}={release} {other}={other_release}, upgrade cancelled.")]
    ReleaseMismatch {
        unit: usize,
        release: String,
        other: usize,
        other_release: String,
    },

    #[error("no unit holds the {0} role")]
    NoUnitWithRole(IntendedState),

    #[error("Replication cannot be verified; error upgrading standby")]
    ReplicationNotVerified,

    #[error("Cannot delete {role} unit {unit}: {source}")]
    Delete {
        role: IntendedState,
        unit: String,
        #[source]
        source: ClusterError,
    },

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Which side of the pair a check follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Standby,
    Active,
}

impl Engine {
    /// Follow the standby replacement. Returns the next phase and an error
    /// text when the upgrade failed.
    pub async fn check_upgrade_standby(
        &self,
        pair: &mut ManagedPair,
        next: HighLevelState,
        credentials: &Credentials,
    ) -> (Option<UpgradePhase>, Option<String>) {
        self.check_upgrade(pair, next, credentials, Side::Standby).await
    }

    /// Follow the active replacement.
    pub async fn check_upgrade_active(
        &self,
        pair: &mut ManagedPair,
        next: HighLevelState,
        credentials: &Credentials,
    ) -> (Option<UpgradePhase>, Option<String>) {
        self.check_upgrade(pair, next, credentials, Side::Active).await
    }

    #[instrument(skip(self, pair, credentials), fields(pair = %pair.key()))]
    async fn check_upgrade(
        &self,
        pair: &mut ManagedPair,
        next: HighLevelState,
        credentials: &Credentials,
        side: Side,
    ) -> (Option<UpgradePhase>, Option<String>) {
        let (Some(active), Some(standby)) = (pair.active_index(), pair.standby_index()) else {
            return (
                Some(UpgradePhase::ManualInterventionRequired),
                Some(UpgradeError::NoUnitWithRole(IntendedState::Active).to_string()),
            );
        };
        let now = Utc::now().timestamp();
        let current = pair.status.high_level_state;
        let prev = pair.status.prev_high_level_state;
        let timeout = secs(pair.upgrade_down_pod_timeout());

        // The replaced unit is the standby in both phases: the active
        // replacement fails the pair over first.
        let replaced = &pair.status.units[standby];
        let replaced_health = replaced.high_level_state;
        let switched = pair.status.upgrade.last_upgrade_state_switch;
        let timed_out = replaced_health == HighLevelState::Down
            && switched != 0
            && timeout != 0
            && now - switched > timeout;
        if replaced_health == HighLevelState::Down && switched != 0 {
            debug!(unit = %replaced.name, down_secs = now - switched, timeout, "Replaced unit still down");
        }

        let upgrade = &mut pair.status.upgrade;
        if timed_out {
            info!(?side, "Replaced unit did not come back in time");
            let message = match side {
                Side::Standby => {
                    upgrade.standby_status = Some(RoleUpgradeStatus::Failed);
                    "standby upgrade unsuccessful"
                }
                Side::Active => {
                    upgrade.active_status = Some(RoleUpgradeStatus::Failed);
                    "active upgrade unsuccessful"
                }
            };
            let phase = self.table_phase(upgrade);
            return (phase, Some(message.to_string()));
        }

        if current != next {
            match side {
                Side::Standby => {
                    if upgrade.standby_status == Some(RoleUpgradeStatus::DeleteStandby)
                        && !replaced_health.is_healthy()
                    {
                        upgrade.standby_status = Some(RoleUpgradeStatus::Processing);
                        debug!("Standby replacement underway");
                    }
                }
                Side::Active => {
                    let old_active = pair.status.units[active].high_level_state;
                    if upgrade.active_status == Some(RoleUpgradeStatus::DeleteActive)
                        && !old_active.is_healthy()
                    {
                        upgrade.active_status = Some(RoleUpgradeStatus::Processing);
                        debug!("Active replacement underway");
                    }
                }
            }

            let awaiting_delete = upgrade.standby_status.is_some_and(|s| s.is_delete())
                || (upgrade.active_status.is_some_and(|s| s.is_delete())
                    && next == HighLevelState::Normal);
            if !awaiting_delete && Some(next) != prev {
                let phase = match side {
                    Side::Standby => UpgradePhase::UpgradingStandby,
                    Side::Active => UpgradePhase::UpgradingActive,
                };
                if side == Side::Active || upgrade.prev_upgrade_state != upgrade.upgrade_state {
                    upgrade.prev_upgrade_state = upgrade.upgrade_state;
                    upgrade.upgrade_state = Some(phase);
                    upgrade.last_upgrade_state_switch = now;
                }
            }
        }

        let recovering = matches!(
            current,
            HighLevelState::StandbyDown | HighLevelState::StandbyStarting | HighLevelState::StandbyCatchup
        );
        let mut error = None;
        if recovering && next == HighLevelState::Normal {
            let verified = self.verify_replication(pair, active, standby, credentials).await;
            let status = match &verified {
                Ok(()) => RoleUpgradeStatus::Success,
                Err(e) => {
                    warn!(error = %e, "Upgraded unit did not catch up");
                    error = Some(e.to_string());
                    RoleUpgradeStatus::Failed
                }
            };
            let upgrade = &mut pair.status.upgrade;
            match side {
                Side::Standby => upgrade.standby_status = Some(status),
                Side::Active => upgrade.active_status = Some(status),
            }
            if error.is_some() {
                return (Some(UpgradePhase::ManualInterventionRequired), error);
            }
            let started = match side {
                Side::Standby => upgrade.standby_start_time,
                Side::Active => upgrade.active_start_time,
            };
            info!(?side, secs = now - started, "Upgraded unit verified");
        }

        let upgrade = &mut pair.status.upgrade;
        let phase = self.table_phase(upgrade);
        if let Some(phase) = phase {
            upgrade.upgrade_state = Some(phase);
        }
        debug!(
            phase = ?upgrade.upgrade_state,
            active_status = ?upgrade.active_status,
            standby_status = ?upgrade.standby_status,
            "Upgrade checked"
        );
        (phase, error)
    }

    fn table_phase(&self, upgrade: &ttpair_model::UpgradeStatus) -> Option<UpgradePhase> {
        self.transitions.next_upgrade_phase(
            upgrade.upgrade_state?,
            upgrade.active_status.unwrap_or(RoleUpgradeStatus::Unknown),
            upgrade.standby_status.unwrap_or(RoleUpgradeStatus::Unknown),
        )
    }

    /// Wait until the standby has applied the active's latest write marker.
    pub async fn verify_replication(
        &self,
        pair: &mut ManagedPair,
        active: usize,
        standby: usize,
        credentials: &Credentials,
    ) -> Result<(), UpgradeError> {
        let target = self.refresh_unit(pair, active, credentials).await?;
        debug!(db_id = target, "Active write marker");

        for attempt in 1..=self.upgrade.verify_attempts {
            let seen = self.refresh_unit(pair, standby, credentials).await.unwrap_or(0);
            if seen == target {
                debug!(attempt, db_id = seen, "Replication verified");
                return Ok(());
            }
            debug!(attempt, expected = target, seen, "Standby behind");
            if attempt < self.upgrade.verify_attempts {
                tokio::time::sleep(self.upgrade.verify_delay).await;
            }
        }
        Err(UpgradeError::ReplicationNotVerified)
    }

    async fn refresh_unit(
        &self,
        pair: &mut ManagedPair,
        index: usize,
        credentials: &Credentials,
    ) -> Result<i64, UpgradeError> {
        let name = pair.unit(index)?.name.clone();
        let ep = Endpoint::new(&self.settings, pair, &name, credentials.clone());
        let reply = self.agent.fetch_status(&ep).await?;
        let unit = pair.unit_mut(index)?;
        reply.fold_into(unit, Utc::now().timestamp());
        Ok(unit.db.db_id)
    }

    fn active_endpoint(
        &self,
        pair: &ManagedPair,
        credentials: &Credentials,
    ) -> Result<Endpoint, UpgradeError> {
        let index = pair
            .active_index()
            .ok_or(UpgradeError::NoUnitWithRole(IntendedState::Active))?;
        Ok(Endpoint::new(
            &self.settings,
            pair,
            &pair.status.units[index].name,
            credentials.clone(),
        ))
    }

    /// Reopen the database on the active.
    pub async fn open_db(
        &self,
        pair: &mut ManagedPair,
        credentials: &Credentials,
    ) -> Result<(), UpgradeError> {
        let ep = self.active_endpoint(pair, credentials)?;
        let params = [("dbName".to_string(), pair.name.clone())];
        match self
            .agent
            .run_action(&ep, "openDb", UPGRADE_CALLER, &params, None)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_unsupported_verb() => {
                debug!(unit = %ep.unit_name, "Agent cannot open the database");
                Ok(())
            }
            Err(e) => {
                warn!(unit = %ep.unit_name, error = %e, "openDb failed");
                self.reporter
                    .warning(pair, reason::INFO, "Unable to open the database")
                    .await;
                Err(e.into())
            }
        }
    }

    /// Stop new work on the active and wait for the standby to drain.
    #[instrument(skip(self, pair, credentials), fields(pair = %pair.key()))]
    pub async fn quiesce(
        &self,
        pair: &mut ManagedPair,
        credentials: &Credentials,
    ) -> Result<(), UpgradeError> {
        let ep = self.active_endpoint(pair, credentials)?;

        match self
            .agent
            .run_action(&ep, "closeDb", UPGRADE_CALLER, &[], None)
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_unsupported_verb() => {}
            Err(e) => {
                warn!(error = %e, "closeDb failed");
                self.reporter
                    .warning(pair, reason::INFO, "Unable to close the database")
                    .await;
            }
        }

        let mut params = vec![(
            "timeout".to_string(),
            self.upgrade.quiesce_wait_secs.to_string(),
        )];
        if let Some(i) = pair.standby_index() {
            params.push((
                "standbyHost".to_string(),
                self.settings.dns_name(pair, &pair.status.units[i].name),
            ));
        }

        let mut last = None;
        for attempt in 1..=REP_WAIT_ATTEMPTS {
            match self
                .agent
                .run_action(&ep, "doRepAdminWait", UPGRADE_CALLER, &params, None)
                .await
            {
                Ok(_) => return Ok(()),
                Err(e) if e.is_unsupported_verb() => return Ok(()),
                Err(e) => {
                    debug!(attempt, error = %e, "Replication wait failed");
                    last = Some(e);
                }
            }
        }
        match last {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Start replacing the unit holding `role`.
    #[instrument(skip(self, pair), fields(pair = %pair.key()))]
    pub async fn init_upgrade(
        &self,
        pair: &mut ManagedPair,
        role: IntendedState,
    ) -> Result<(), UpgradeError> {
        let state = pair.status.high_level_state;
        if state != HighLevelState::Normal {
            // Retried quietly once the pair settles.
            pair.status.upgrade.image_update_pending = true;
            debug!(state = %state, "Upgrade deferred until the pair is Normal");
            return Err(UpgradeError::NotNormal(state));
        }
        if pair.image_upgrade_strategy() == ImageUpgradeStrategy::Manual {
            return Err(UpgradeError::ManualStrategy);
        }

        let index = match role {
            IntendedState::Active => pair.active_index(),
            _ => pair.standby_index(),
        }
        .ok_or(UpgradeError::NoUnitWithRole(role))?;
        let other = if index == 0 { 1 } else { 0 };
        let name = pair.unit(index)?.name.clone();

        if pair.status.upgrade.standby_status.is_none() {
            let release = pair.unit(index)?.engine.release.clone();
            let other_release = pair.unit(other)?.engine.release.clone();
            if release != other_release {
                let err = UpgradeError::ReleaseMismatch {
                    unit: index,
                    release,
                    other,
                    other_release,
                };
                self.reporter
                    .warning(pair, reason::UPGRADE_ERROR, err.to_string())
                    .await;
                return Err(err);
            }
        }

        if let Err(source) = self.cluster.delete_unit(pair, &name).await {
            let forbidden = source.is_forbidden();
            let err = UpgradeError::Delete {
                role,
                unit: name,
                source,
            };
            if forbidden {
                self.reporter
                    .warning(pair, reason::FAILED_UPGRADE, err.to_string())
                    .await;
            } else {
                pair.status.upgrade.image_update_pending = true;
                self.reporter
                    .normal(pair, reason::UPGRADE_ERROR, err.to_string())
                    .await;
            }
            return Err(err);
        }

        let now = Utc::now().timestamp();
        let upgrade = &mut pair.status.upgrade;
        if upgrade.upgrade_start_time == 0 {
            upgrade.upgrade_start_time = now;
        }
        upgrade.last_upgrade_state_switch = now;
        upgrade.image_update_pending = false;
        let phase = match role {
            IntendedState::Active => {
                upgrade.active_start_time = now;
                if upgrade.standby_status.is_none() {
                    upgrade.standby_status = Some(RoleUpgradeStatus::Unknown);
                }
                upgrade.active_status = Some(RoleUpgradeStatus::DeleteActive);
                UpgradePhase::UpgradingActive
            }
            _ => {
                upgrade.standby_start_time = now;
                upgrade.active_status = Some(RoleUpgradeStatus::Waiting);
                upgrade.standby_status = Some(RoleUpgradeStatus::DeleteStandby);
                UpgradePhase::UpgradingStandby
            }
        };
        upgrade.upgrade_state = self
            .transitions
            .next_upgrade_phase(
                phase,
                upgrade.active_status.unwrap_or(RoleUpgradeStatus::Unknown),
                upgrade.standby_status.unwrap_or(RoleUpgradeStatus::Unknown),
            )
            .or(Some(phase));
        info!(unit = %name, phase = ?upgrade.upgrade_state, "Unit deleted for upgrade");

        let message = format!(
            "Deleted {} unit {} during upgrade",
            role.as_str().to_lowercase(),
            name
        );
        self.reporter.normal(pair, reason::UPGRADE, message).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ttpair_events::{EventReporter, MemorySink};
    use ttpair_reconcile::TransitionTable;

    use super::*;
    use crate::agent::AgentSettings;
    use crate::engine::tests::pair;
    use crate::mock::{MemoryCluster, MockAgent};

    struct Harness {
        engine: Engine,
        sink: Arc<MemorySink>,
        agent: Arc<MockAgent>,
        cluster: Arc<MemoryCluster>,
    }

    fn harness() -> Harness {
        let sink = Arc::new(MemorySink::new());
        let agent = Arc::new(MockAgent::new());
        let cluster = Arc::new(MemoryCluster::new());
        let engine = Engine::new(
            Arc::new(TransitionTable::builtin().unwrap()),
            Arc::new(EventReporter::new(sink.clone())),
            agent.clone(),
            cluster.clone(),
            AgentSettings::default(),
            UpgradeSettings {
                verify_attempts: 3,
                verify_delay: Duration::ZERO,
                quiesce_wait_secs: 30,
            },
        );
        Harness {
            engine,
            sink,
            agent,
            cluster,
        }
    }

    fn normal_pair() -> ManagedPair {
        let mut pair = pair();
        pair.status.high_level_state = HighLevelState::Normal;
        for unit in &mut pair.status.units {
            unit.high_level_state = HighLevelState::Healthy;
            unit.engine.release = "22.1.1.9".to_string();
        }
        pair
    }

    #[tokio::test]
    async fn test_init_standby_upgrade() {
        let h = harness();
        let mut pair = normal_pair();

        h.engine
            .init_upgrade(&mut pair, IntendedState::Standby)
            .await
            .unwrap();

        let upgrade = &pair.status.upgrade;
        assert_eq!(upgrade.upgrade_state, Some(UpgradePhase::UpgradingStandby));
        assert_eq!(upgrade.active_status, Some(RoleUpgradeStatus::Waiting));
        assert_eq!(upgrade.standby_status, Some(RoleUpgradeStatus::DeleteStandby));
        assert!(upgrade.upgrade_start_time > 0);
        assert_eq!(h.cluster.deleted_units(), vec!["db-1"]);
        assert!(h
            .sink
            .messages()
            .contains(&"Deleted standby unit db-1 during upgrade".to_string()));
    }

    #[tokio::test]
    async fn test_init_requires_normal() {
        let h = harness();
        let mut pair = normal_pair();
        pair.status.high_level_state = HighLevelState::StandbyDown;

        let err = h
            .engine
            .init_upgrade(&mut pair, IntendedState::Standby)
            .await
            .unwrap_err();

        assert!(matches!(err, UpgradeError::NotNormal(HighLevelState::StandbyDown)));
        assert!(pair.status.upgrade.image_update_pending);
        assert!(h.cluster.deleted_units().is_empty());
        assert!(h.sink.records().is_empty());
    }

    #[tokio::test]
    async fn test_init_release_mismatch() {
        let h = harness();
        let mut pair = normal_pair();
        pair.status.units[0].engine.release = "22.1.1.10".to_string();

        let err = h
            .engine
            .init_upgrade(&mut pair, IntendedState::Standby)
            .await
            .unwrap_err();

        assert!(matches!(err, UpgradeError::ReleaseMismatch { .. }));
        assert_eq!(
            h.sink.messages(),
            vec!["Engine release mismatch, 1=22.1.1.9 0=22.1.1.10, upgrade cancelled."]
        );
    }

    #[tokio::test]
    async fn test_init_forbidden_delete() {
        let h = harness();
        h.cluster.forbid_unit("db-1");
        let mut pair = normal_pair();

        let err = h
            .engine
            .init_upgrade(&mut pair, IntendedState::Standby)
            .await
            .unwrap_err();

        assert!(matches!(err, UpgradeError::Delete { .. }));
        assert_eq!(h.sink.records()[0].reason, reason::FAILED_UPGRADE);
        assert!(!pair.status.upgrade.image_update_pending);
        assert!(!pair.upgrade_in_progress());
    }

    #[tokio::test]
    async fn test_standby_processing_then_verified() {
        let h = harness();
        let mut pair = normal_pair();
        h.engine
            .init_upgrade(&mut pair, IntendedState::Standby)
            .await
            .unwrap();

        // Standby goes away.
        pair.status.units[1].high_level_state = HighLevelState::Down;
        let (phase, error) = h
            .engine
            .check_upgrade_standby(&mut pair, HighLevelState::StandbyDown, &Credentials::default())
            .await;
        assert_eq!(phase, Some(UpgradePhase::UpgradingStandby));
        assert!(error.is_none());
        assert_eq!(pair.status.upgrade.standby_status, Some(RoleUpgradeStatus::Processing));

        // Standby is back and caught up.
        pair.status.prev_high_level_state = Some(HighLevelState::Normal);
        pair.status.high_level_state = HighLevelState::StandbyDown;
        pair.status.units[1].high_level_state = HighLevelState::Healthy;
        h.agent.set_status("db-0", MockAgent::loaded_status("22.1.1.9", 42));
        h.agent.set_status("db-1", MockAgent::loaded_status("22.1.1.10", 42));
        let (phase, error) = h
            .engine
            .check_upgrade_standby(&mut pair, HighLevelState::Normal, &Credentials::default())
            .await;

        assert!(error.is_none());
        assert_eq!(pair.status.upgrade.standby_status, Some(RoleUpgradeStatus::Success));
        assert_eq!(phase, Some(UpgradePhase::UpgradingActive));
    }

    #[tokio::test]
    async fn test_replication_not_verified() {
        let h = harness();
        let mut pair = normal_pair();
        h.agent.set_status("db-0", MockAgent::loaded_status("22.1.1.9", 42));
        h.agent.set_status("db-1", MockAgent::loaded_status("22.1.1.10", 41));

        let err = h
            .engine
            .verify_replication(&mut pair, 0, 1, &Credentials::default())
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "Replication cannot be verified; error upgrading standby");
    }

    #[tokio::test]
    async fn test_standby_down_timeout() {
        let h = harness();
        let mut pair = normal_pair();
        pair.spec.upgrade_down_pod_timeout_secs = Some(60);
        pair.status.upgrade.upgrade_state = Some(UpgradePhase::UpgradingStandby);
        pair.status.upgrade.active_status = Some(RoleUpgradeStatus::Waiting);
        pair.status.upgrade.standby_status = Some(RoleUpgradeStatus::Processing);
        pair.status.upgrade.last_upgrade_state_switch = Utc::now().timestamp() - 120;
        pair.status.high_level_state = HighLevelState::StandbyDown;
        pair.status.units[1].high_level_state = HighLevelState::Down;

        let (phase, error) = h
            .engine
            .check_upgrade_standby(&mut pair, HighLevelState::StandbyDown, &Credentials::default())
            .await;

        assert_eq!(phase, Some(UpgradePhase::ManualInterventionRequired));
        assert_eq!(error.as_deref(), Some("standby upgrade unsuccessful"));
        assert_eq!(pair.status.upgrade.standby_status, Some(RoleUpgradeStatus::Failed));
    }

    #[tokio::test]
    async fn test_quiesce_tolerates_unsupported_verbs() {
        let h = harness();
        h.agent.fail_verb("closeDb", 255);
        h.agent.fail_verb("doRepAdminWait", 255);
        let mut pair = normal_pair();

        h.engine
            .quiesce(&mut pair, &Credentials::default())
            .await
            .unwrap();
        assert_eq!(h.agent.verbs(), vec!["closeDb", "doRepAdminWait"]);
        assert!(h.sink.records().is_empty());
    }

    #[tokio::test]
    async fn test_quiesce_fails_after_retries() {
        let h = harness();
        h.agent.fail_verb("doRepAdminWait", 8);
        let mut pair = normal_pair();

        assert!(h.engine.quiesce(&mut pair, &Credentials::default()).await.is_err());
        let waits = h.agent.verbs().iter().filter(|v| *v == "doRepAdminWait").count();
        assert_eq!(waits, REP_WAIT_ATTEMPTS as usize);
    }

    #[tokio::test]
    async fn test_open_db_failure_recorded() {
        let h = harness();
        h.agent.fail_verb("openDb", 12);
        let mut pair = normal_pair();

        assert!(h.engine.open_db(&mut pair, &Credentials::default()).await.is_err());
        assert_eq!(h.sink.messages(), vec!["Unable to open the database"]);
    }
}
