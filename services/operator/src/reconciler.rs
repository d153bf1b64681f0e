//! One reconciliation pass over a managed pair.
//!
//! A pass:
//! - gates the invocation against the polling cadence
//! - observes every unit (cluster phase and agent report)
//! - runs one flow per unit and folds the outcomes in
//! - asks the decision engine for the pair and subscriber states
//! - starts rolling upgrades when the image changed
//!
//! After the gate, status is written back on every path.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};
use ttpair_events::{reason, AuditSink, EventReporter};
use ttpair_model::{
    major_release, AgentState, HighLevelState, ImageUpgradeStrategy, IntendedState, ManagedPair,
    ObjectKey, UnitStatus, DEFAULT_POLLING_INTERVAL,
};
use ttpair_reconcile::{gate_pass, GateDecision, TransitionTable};

use crate::agent::{AgentSettings, Endpoint, UnitAgent};
use crate::cluster::ClusterApi;
use crate::config::Config;
use crate::dispatch::pick_flow;
use crate::engine::{active_pods, refresh_summary, Engine, UpgradeSettings};
use crate::flows::{FlowContext, UnitFlows};
use crate::metrics;
use crate::pool::{ConnectionPool, CredentialCache, CredentialSource, Credentials};
use crate::tracker::AsyncTracker;

/// What the caller should do after a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassResult {
    /// Run again after this long; `None` waits for a spec change.
    pub requeue_after: Option<Duration>,
    pub error: Option<String>,
}

impl PassResult {
    pub fn done() -> Self {
        Self {
            requeue_after: None,
            error: None,
        }
    }

    pub fn after(delay: Duration) -> Self {
        Self {
            requeue_after: Some(delay),
            error: None,
        }
    }

    /// Retry after the default interval, reporting `error`.
    pub fn retry(error: impl Into<String>) -> Self {
        Self {
            requeue_after: Some(DEFAULT_POLLING_INTERVAL),
            error: Some(error.into()),
        }
    }
}

/// Process-level settings of the reconciler.
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub operator_id: String,
    /// Major engine release units must run.
    pub engine_major: String,
    pub agent: AgentSettings,
    pub async_poll_interval: Duration,
    pub task_debug: bool,
    pub upgrade: UpgradeSettings,
}

impl ReconcilerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            operator_id: config.operator_id.clone(),
            engine_major: config.engine_major().to_string(),
            agent: config.agent.clone(),
            async_poll_interval: config.async_poll_interval(),
            task_debug: config.task_debug,
            upgrade: UpgradeSettings {
                verify_attempts: config.verify_attempts,
                verify_delay: config.verify_delay(),
                quiesce_wait_secs: config.quiesce_wait_secs,
            },
        }
    }
}

/// Everything the reconciler talks to.
pub struct Backends {
    pub cluster: Arc<dyn ClusterApi>,
    pub agent: Arc<dyn UnitAgent>,
    pub flows: Arc<dyn UnitFlows>,
    pub sink: Arc<dyn AuditSink>,
    pub transitions: Arc<TransitionTable>,
    pub credential_source: Arc<dyn CredentialSource>,
    pub pool: Arc<ConnectionPool>,
}

/// Runs passes for any managed pair.
pub struct Reconciler {
    settings: ReconcilerSettings,
    cluster: Arc<dyn ClusterApi>,
    agent: Arc<dyn UnitAgent>,
    flows: Arc<dyn UnitFlows>,
    reporter: Arc<EventReporter>,
    engine: Engine,
    tracker: AsyncTracker,
    credentials: CredentialCache,
    credential_source: Arc<dyn CredentialSource>,
    pool: Arc<ConnectionPool>,
}

impl Reconciler {
    pub fn new(settings: ReconcilerSettings, backends: Backends) -> Self {
        let reporter = Arc::new(EventReporter::new(backends.sink));
        let engine = Engine::new(
            backends.transitions,
            reporter.clone(),
            backends.agent.clone(),
            backends.cluster.clone(),
            settings.agent.clone(),
            settings.upgrade,
        );
        let tracker = AsyncTracker::new(
            backends.agent.clone(),
            reporter.clone(),
            backends.cluster.clone(),
            settings.agent.clone(),
            settings.async_poll_interval,
            settings.task_debug,
        );
        Self {
            settings,
            cluster: backends.cluster,
            agent: backends.agent,
            flows: backends.flows,
            reporter,
            engine,
            tracker,
            credentials: CredentialCache::new(),
            credential_source: backends.credential_source,
            pool: backends.pool,
        }
    }

    pub fn cluster(&self) -> &Arc<dyn ClusterApi> {
        &self.cluster
    }

    /// Reconcile the pair stored under `key`.
    #[instrument(skip(self), fields(pair = %key))]
    pub async fn reconcile(&self, key: &ObjectKey) -> PassResult {
        let mut pair = match self.cluster.get(key).await {
            Ok(pair) => pair,
            Err(e) if e.is_not_found() => {
                info!("Pair is gone; dropping cached connections and credentials");
                self.pool.evict_object(key);
                self.credentials.evict(key);
                return PassResult::done();
            }
            Err(e) => {
                warn!(error = %e, "Failed to fetch pair");
                return PassResult::retry(e.to_string());
            }
        };

        let interval = pair.polling_interval();
        let now_ms = Utc::now().timestamp_millis();
        match gate_pass(
            &mut pair.status,
            pair.generation,
            &self.settings.operator_id,
            now_ms,
            interval,
        ) {
            GateDecision::Requeue(after) => {
                debug!(after_ms = after.as_millis() as u64, "Not due yet");
                return PassResult::after(after);
            }
            GateDecision::Process(why) => debug!(reason = %why, "Running pass"),
        }

        let mut result = self.run_pass(&mut pair, interval).await;
        metrics::record_pair(&pair);

        if let Err(e) = self.cluster.update_status(&pair).await {
            warn!(error = %e, "Failed to write status");
            if result.error.is_none() {
                result = PassResult::retry(e.to_string());
            }
        }
        metrics::record_pass(result.error.is_some());
        result
    }

    async fn run_pass(&self, pair: &mut ManagedPair, interval: Duration) -> PassResult {
        if pair.initialize_units() {
            info!(units = pair.status.units.len(), "Initialized unit list");
        }

        let key = pair.key();
        let credentials = match self
            .credentials
            .resolve(&key, self.credential_source.as_ref())
            .await
        {
            Ok(credentials) => credentials,
            Err(e) => {
                warn!(error = %e, "Cannot resolve agent credentials");
                return PassResult::retry(e.to_string());
            }
        };

        match self.tracker.check_pending(pair, &credentials).await {
            Ok(false) => {}
            Ok(true) => {
                debug!(task = %pair.status.async_status.task_type, "Async task still running");
                return PassResult::after(interval);
            }
            Err(e) => {
                info!(error = %e, "Async task check failed");
                return PassResult::after(interval);
            }
        }

        if pair.status.high_level_state == HighLevelState::Failed {
            debug!("Pair has failed; nothing to do");
            return PassResult::done();
        }

        if let Some(result) = self.apply_user_tokens(pair, interval).await {
            return result;
        }

        let snapshots: Vec<UnitStatus> = pair.status.units.clone();
        if !self.observe_units(pair, &credentials).await {
            self.report_all(pair, &snapshots).await;
            return PassResult::done();
        }

        if pair.status.high_level_state == HighLevelState::ManualInterventionRequired {
            self.report_all(pair, &snapshots).await;
            return PassResult::after(interval);
        }

        record_durability(pair);

        if let Some(message) = self.version_mismatch(pair) {
            let next = if pair.status.high_level_state == HighLevelState::Initializing {
                HighLevelState::Failed
            } else {
                HighLevelState::ManualInterventionRequired
            };
            let message = format!("{}; state set to {}", message, next);
            self.reporter.warning(pair, reason::FATAL, message).await;
            self.engine.update_pair_state(pair, next).await;
            self.report_all(pair, &snapshots).await;
            return PassResult::done();
        }

        let databases = pair.database_indices();
        let (someone_other_down, someone_healthy) = self
            .run_unit_flows(pair, &databases, &snapshots, &credentials)
            .await;

        let upgrade_active = if pair.is_replicated() {
            match self
                .engine
                .determine_replicated(pair, someone_other_down, someone_healthy, &credentials)
                .await
            {
                Ok(decision) => decision.upgrade_active,
                Err(e) => return PassResult::retry(e.to_string()),
            }
        } else {
            self.engine.determine_non_replicated(pair).await;
            false
        };
        pair.status.active_pods = active_pods(pair);

        if pair.is_replicated() {
            if !pair.upgrade_in_progress() {
                self.start_upgrade_if_requested(pair).await;
            } else if upgrade_active {
                self.upgrade_active_side(pair, &credentials).await;
            }
            pair.status.active_pods = active_pods(pair);
        }

        let subscribers = pair.subscriber_indices();
        if !subscribers.is_empty() {
            self.run_unit_flows(pair, &subscribers, &snapshots, &credentials)
                .await;
            self.engine.determine_subscribers(pair).await;
        }

        refresh_summary(pair);
        PassResult::after(interval)
    }

    /// React to changed stop-managing, reexamine and reset tokens.
    async fn apply_user_tokens(&self, pair: &mut ManagedPair, interval: Duration) -> Option<PassResult> {
        let spec = pair.spec.clone();
        let state = pair.status.high_level_state;

        if spec.stop_managing != pair.status.prev_stop_managing {
            pair.status.prev_stop_managing = spec.stop_managing.clone();
            if state != HighLevelState::ManualInterventionRequired {
                info!("Management stopped by request");
                self.engine
                    .update_pair_state(pair, HighLevelState::ManualInterventionRequired)
                    .await;
                return Some(PassResult::after(interval));
            }
        }

        if spec.reexamine != pair.status.prev_reexamine {
            pair.status.prev_reexamine = spec.reexamine.clone();
            info!(state = %state, "Reexamine requested");
            if matches!(
                state,
                HighLevelState::SomeReplicasReady | HighLevelState::NoReplicasReady
            ) {
                for index in pair.database_indices() {
                    if pair.status.units[index].high_level_state
                        == HighLevelState::ManualInterventionRequired
                    {
                        self.engine
                            .update_unit_state(pair, index, HighLevelState::Reexamine)
                            .await;
                    }
                }
            }
            if state == HighLevelState::ManualInterventionRequired {
                self.engine
                    .update_pair_state(pair, HighLevelState::Reexamine)
                    .await;
                pair.status.active_pods = ttpair_model::NO_ACTIVE_PODS.to_string();
                return Some(PassResult::after(interval));
            }
        }

        if spec.reset_upgrade_state != pair.status.upgrade.prev_reset_upgrade_state {
            pair.status.upgrade.prev_reset_upgrade_state = spec.reset_upgrade_state.clone();
            self.reporter
                .warning(pair, reason::UPGRADE, "Resetting upgrade state")
                .await;
            pair.status.upgrade.reset();
        }
        None
    }

    /// Refresh every unit's observed state. Returns false when the pass
    /// must stop because the operator may not look at a unit.
    async fn observe_units(&self, pair: &mut ManagedPair, credentials: &Credentials) -> bool {
        let now = Utc::now().timestamp();
        for index in 0..pair.status.units.len() {
            let name = pair.status.units[index].name.clone();

            let phase = match self.cluster.unit_phase(pair, &name).await {
                Ok(phase) => phase,
                Err(e) if e.is_forbidden() => {
                    warn!(unit = %name, error = %e, "Not allowed to read unit");
                    self.reporter
                        .warning(pair, reason::FAILED_GET_STATUS, e.to_string())
                        .await;
                    self.engine
                        .update_pair_state(pair, HighLevelState::Failed)
                        .await;
                    return false;
                }
                Err(e) => {
                    warn!(unit = %name, error = %e, "Cannot read unit phase");
                    continue;
                }
            };

            let Some(phase) = phase else {
                let unit = &mut pair.status.units[index];
                unit.pod.phase = String::new();
                unit.clear_agent_report();
                unit.pod.agent = AgentState::Down;
                continue;
            };

            let ep = Endpoint::new(&self.settings.agent, pair, &name, credentials.clone());
            let report = self.agent.fetch_status(&ep).await;
            let unit = &mut pair.status.units[index];
            unit.pod.phase = phase;
            match report {
                Ok(reply) => reply.fold_into(unit, now),
                Err(e) => {
                    debug!(unit = %name, error = %e, "Agent unreachable");
                    unit.clear_agent_report();
                    unit.pod.agent = AgentState::Down;
                }
            }
            unit.has_been_seen = true;
        }
        true
    }

    /// A release mismatch between this operator and any reachable unit.
    fn version_mismatch(&self, pair: &ManagedPair) -> Option<String> {
        let ours = self.settings.engine_major.as_str();
        pair.status
            .units
            .iter()
            .filter(|u| u.is_database() && u.pod.agent == AgentState::Up)
            .find_map(|u| {
                let theirs = major_release(&u.engine.release)?;
                if theirs == ours {
                    None
                } else {
                    Some(format!(
                        "v{} operator not patch compatible with v{} object",
                        ours, theirs
                    ))
                }
            })
    }

    /// Run one flow per unit in `indices` and fold the outcomes in.
    ///
    /// Returns whether any unit reported its peer down and whether any
    /// reported healthy.
    async fn run_unit_flows(
        &self,
        pair: &mut ManagedPair,
        indices: &[usize],
        snapshots: &[UnitStatus],
        credentials: &Credentials,
    ) -> (bool, bool) {
        let mut someone_other_down = false;
        let mut someone_healthy = false;
        let replicated = pair.is_replicated();

        for &index in indices {
            let unit = &pair.status.units[index];
            let name = unit.name.clone();
            let role = unit.intended_state;
            let standalone = unit.is_database() && !replicated;

            match pick_flow(pair, index) {
                None => {
                    let parked = standalone
                        && unit.high_level_state == HighLevelState::ManualInterventionRequired;
                    if !parked {
                        self.reporter
                            .warning(
                                pair,
                                reason::ERROR,
                                format!("Not running any state machine for unit {}", name),
                            )
                            .await;
                    }
                }
                Some(kind) => {
                    let result = {
                        let mut ctx = FlowContext {
                            pair: &mut *pair,
                            index,
                            caller: kind.as_str(),
                            agent: self.agent.as_ref(),
                            tracker: &self.tracker,
                            settings: &self.settings.agent,
                            credentials,
                        };
                        self.flows.run(kind, &mut ctx).await
                    };
                    debug!(unit = %name, flow = %kind, outcome = %result.outcome, ready = result.ready, "Flow outcome");

                    if let Some(error) = &result.error {
                        let message = format!("Unit {}: {} error: {}", name, role, error);
                        self.reporter.warning(pair, reason::ERROR, message).await;
                    }
                    if result.outcome != HighLevelState::Unknown {
                        self.engine
                            .update_readiness(pair, index, result.ready, credentials)
                            .await;
                    }
                    if !(standalone && result.outcome == HighLevelState::Unknown) {
                        self.engine
                            .update_unit_state(pair, index, result.outcome)
                            .await;
                    }
                    someone_other_down |= result.outcome == HighLevelState::OtherDown;
                    someone_healthy |= result.outcome.is_healthy();
                }
            }

            if let Some(before) = snapshots.get(index) {
                self.reporter.report_unit_changes(pair, before, index).await;
            }
        }
        (someone_other_down, someone_healthy)
    }

    async fn report_all(&self, pair: &mut ManagedPair, snapshots: &[UnitStatus]) {
        for (index, before) in snapshots.iter().enumerate() {
            self.reporter.report_unit_changes(pair, before, index).await;
        }
    }

    async fn start_upgrade_if_requested(&self, pair: &mut ManagedPair) {
        let requested = match self.cluster.image_update_requested(pair).await {
            Ok(requested) => requested,
            Err(e) => {
                warn!(error = %e, "Cannot tell whether the image changed");
                false
            }
        };
        let pending = pair.status.upgrade.image_update_pending;
        if !(requested || pending) {
            return;
        }

        match pair.image_upgrade_strategy() {
            ImageUpgradeStrategy::Manual => {
                if !pending {
                    self.reporter
                        .warning(pair, reason::UPGRADE, "Image updated, automatic upgrade disabled")
                        .await;
                    pair.status.upgrade.image_update_pending = true;
                }
            }
            ImageUpgradeStrategy::Auto => {
                if !pending {
                    self.reporter
                        .normal(pair, reason::UPGRADE, "Image updated, automatic upgrade started")
                        .await;
                }
                if let Err(e) = self.engine.init_upgrade(pair, IntendedState::Standby).await {
                    info!(error = %e, "Standby upgrade not started");
                }
            }
        }
    }

    async fn upgrade_active_side(&self, pair: &mut ManagedPair, credentials: &Credentials) {
        match self.engine.quiesce(pair, credentials).await {
            Ok(()) => {
                if let Err(e) = self.engine.init_upgrade(pair, IntendedState::Active).await {
                    warn!(error = %e, "Active upgrade not started");
                }
            }
            Err(e) => {
                warn!(error = %e, "Quiesce failed");
                self.reporter
                    .warning(
                        pair,
                        reason::UPGRADE_ERROR,
                        "Could not quiesce the database, standby behind active",
                    )
                    .await;
                self.reporter
                    .warning(pair, reason::UPGRADE_ERROR, "Upgrade aborted")
                    .await;
                self.engine
                    .update_pair_state(pair, HighLevelState::ManualInterventionRequired)
                    .await;
                if let Err(e) = self.engine.open_db(pair, credentials).await {
                    debug!(error = %e, "Reopen after aborted upgrade failed");
                }
            }
        }
    }
}

/// Durability facts that steer both-down recovery.
fn record_durability(pair: &mut ManagedPair) {
    let mut twosafe = false;
    let mut ineligible = false;
    for unit in pair.status.units.iter().filter(|u| u.is_database()) {
        if unit.using_twosafe == Some(true) {
            twosafe = true;
            if unit.disable_return == Some(true) || unit.local_commit == Some(true) {
                ineligible = true;
            }
        }
    }
    pair.status.using_twosafe = twosafe;
    if ineligible && !pair.status.both_down_recovery_ineligible {
        info!("Pair not eligible for automatic both-down recovery");
        pair.status.both_down_recovery_ineligible = true;
    }
}

#[cfg(test)]
mod tests {
    use ttpair_events::MemorySink;
    use ttpair_model::PairSpec;

    use super::*;
    use crate::flows::FlowResult;
    use crate::mock::{MemoryCluster, MockAgent, MockFlows};
    use crate::pool::EnvCredentialSource;

    struct Harness {
        reconciler: Reconciler,
        cluster: Arc<MemoryCluster>,
        agent: Arc<MockAgent>,
        flows: Arc<MockFlows>,
        sink: Arc<MemorySink>,
    }

    fn harness() -> Harness {
        let cluster = Arc::new(MemoryCluster::new());
        let agent = Arc::new(MockAgent::new());
        let flows = Arc::new(MockFlows::new());
        let sink = Arc::new(MemorySink::new());
        let settings = ReconcilerSettings {
            operator_id: "op-a".to_string(),
            engine_major: "22".to_string(),
            agent: AgentSettings::default(),
            async_poll_interval: Duration::from_millis(1),
            task_debug: false,
            upgrade: UpgradeSettings {
                verify_attempts: 1,
                verify_delay: Duration::ZERO,
                quiesce_wait_secs: 30,
            },
        };
        let reconciler = Reconciler::new(
            settings,
            Backends {
                cluster: cluster.clone(),
                agent: agent.clone(),
                flows: flows.clone(),
                sink: sink.clone(),
                transitions: Arc::new(TransitionTable::builtin().unwrap()),
                credential_source: Arc::new(EnvCredentialSource::new(Credentials::default())),
                pool: Arc::new(ConnectionPool::new(false)),
            },
        );
        Harness {
            reconciler,
            cluster,
            agent,
            flows,
            sink,
        }
    }

    fn stored(h: &Harness) -> ObjectKey {
        let pair = ManagedPair::new("ns", "db", PairSpec::default());
        let key = pair.key();
        h.cluster.insert(pair);
        key
    }

    #[tokio::test]
    async fn test_missing_pair_not_requeued() {
        let h = harness();
        let result = h.reconciler.reconcile(&ObjectKey::new("ns", "gone")).await;
        assert_eq!(result, PassResult::done());
    }

    #[tokio::test]
    async fn test_second_call_waits_for_interval() {
        let h = harness();
        let key = stored(&h);

        let first = h.reconciler.reconcile(&key).await;
        assert_eq!(first.requeue_after, Some(DEFAULT_POLLING_INTERVAL));
        let writes = h.cluster.status_writes();

        let second = h.reconciler.reconcile(&key).await;
        let after = second.requeue_after.unwrap();
        assert!(after <= DEFAULT_POLLING_INTERVAL && after > Duration::ZERO);
        assert_eq!(h.cluster.status_writes(), writes);
    }

    #[tokio::test]
    async fn test_first_pass_initializes_and_dispatches() {
        let h = harness();
        let key = stored(&h);

        h.reconciler.reconcile(&key).await;

        let pair = h.cluster.pair(&key).unwrap();
        assert_eq!(pair.status.units.len(), 2);
        assert_eq!(pair.status.observed_generation, 1);
        assert_eq!(pair.status.last_reconciling_operator, "op-a");
        let runs = h.flows.runs();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].0, "db-0");
    }

    #[tokio::test]
    async fn test_healthy_units_reach_normal() {
        let h = harness();
        let key = stored(&h);
        h.flows
            .set_outcome("db-0", FlowResult::new(HighLevelState::HealthyActive, true));
        h.flows
            .set_outcome("db-1", FlowResult::new(HighLevelState::HealthyStandby, true));

        h.reconciler.reconcile(&key).await;

        let pair = h.cluster.pair(&key).unwrap();
        assert_eq!(pair.status.high_level_state, HighLevelState::Normal);
        assert_eq!(pair.status.active_pods, "db-0");
        assert!(pair.status.units[0].active);
        assert!(h
            .sink
            .messages()
            .contains(&"Pair state was Initializing, now Normal".to_string()));
    }

    #[test]
    fn test_pass_publishes_pair_metrics() {
        use metrics_exporter_prometheus::PrometheusBuilder;

        let h = harness();
        let key = stored(&h);
        h.flows
            .set_outcome("db-0", FlowResult::new(HighLevelState::HealthyActive, true));
        h.flows
            .set_outcome("db-1", FlowResult::new(HighLevelState::HealthyStandby, true));

        // Current-thread runtime keeps the pass on the recorder's thread.
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let recorder = PrometheusBuilder::new().build_recorder();
        ::metrics::with_local_recorder(&recorder, || {
            runtime.block_on(h.reconciler.reconcile(&key));
        });
        let rendered = recorder.handle().render();

        let normal = rendered
            .lines()
            .find(|l| l.starts_with("ttpair_pair_state{") && l.contains(r#"state="Normal""#));
        assert!(normal.is_some_and(|l| l.ends_with(" 1")), "{}", rendered);
        let passes = rendered
            .lines()
            .find(|l| l.starts_with("ttpair_reconcile_passes_total{"));
        assert!(passes.is_some_and(|l| l.contains(r#"result="ok""#) && l.ends_with(" 1")));
    }

    #[tokio::test]
    async fn test_version_mismatch_fails_initializing_pair() {
        let h = harness();
        let key = stored(&h);
        h.agent.set_status("db-0", MockAgent::loaded_status("18.1.4.1", 1));

        let result = h.reconciler.reconcile(&key).await;

        assert_eq!(result, PassResult::done());
        let pair = h.cluster.pair(&key).unwrap();
        assert_eq!(pair.status.high_level_state, HighLevelState::Failed);
        assert!(h.sink.messages().contains(
            &"v22 operator not patch compatible with v18 object; state set to Failed".to_string()
        ));
        assert!(h.flows.runs().is_empty());
    }

    #[tokio::test]
    async fn test_forbidden_unit_fails_pair() {
        let h = harness();
        let key = stored(&h);
        h.cluster.forbid_unit("db-1");

        h.reconciler.reconcile(&key).await;

        let pair = h.cluster.pair(&key).unwrap();
        assert_eq!(pair.status.high_level_state, HighLevelState::Failed);
        let records = h.sink.records();
        assert!(records.iter().any(|r| r.reason == reason::FAILED_GET_STATUS));
    }

    #[tokio::test]
    async fn test_stop_managing_parks_pair() {
        let h = harness();
        let mut pair = ManagedPair::new("ns", "db", PairSpec::default());
        pair.spec.stop_managing = "1".to_string();
        let key = pair.key();
        h.cluster.insert(pair);

        h.reconciler.reconcile(&key).await;

        let pair = h.cluster.pair(&key).unwrap();
        assert_eq!(pair.status.high_level_state, HighLevelState::ManualInterventionRequired);
        assert_eq!(pair.status.prev_stop_managing, "1");
        assert!(h.flows.runs().is_empty());
    }

    #[tokio::test]
    async fn test_flow_error_recorded() {
        let h = harness();
        let key = stored(&h);
        h.flows.set_outcome("db-0", FlowResult::failed("boom"));

        h.reconciler.reconcile(&key).await;

        assert!(h
            .sink
            .messages()
            .contains(&"Unit db-0: Active error: boom".to_string()));
    }

    #[test]
    fn test_ineligible_flag_sticks() {
        let mut pair = ManagedPair::new("ns", "db", PairSpec::default());
        pair.initialize_units();
        pair.status.units[0].using_twosafe = Some(true);
        pair.status.units[0].local_commit = Some(true);
        record_durability(&mut pair);
        assert!(pair.status.using_twosafe);
        assert!(pair.status.both_down_recovery_ineligible);

        pair.status.units[0].local_commit = Some(false);
        pair.status.units[0].using_twosafe = Some(false);
        record_durability(&mut pair);
        assert!(!pair.status.using_twosafe);
        assert!(pair.status.both_down_recovery_ineligible);
    }
}
