//! In-memory collaborators for tests and local development.
//!
//! - [`MockAgent`]: scripted unit agents
//! - [`MemoryCluster`]: a cluster store held in a map
//! - [`MockFlows`]: flows that return scripted outcomes

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;
use ttpair_model::{HighLevelState, ManagedPair, ObjectKey};

use crate::agent::{
    ActionReply, AgentError, AgentResult, AgentStatusReply, AsyncTaskReply, Endpoint, Submission,
    UnitAgent, UNSUPPORTED_VERB_ERRNO,
};
use crate::cluster::{ClusterApi, ClusterError, ClusterResult, ObjectRef, DEFAULT_UNIT_PHASE};
use crate::dispatch::FlowKind;
use crate::flows::{FlowContext, FlowResult, UnitFlows};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted answer to an async status poll.
#[derive(Debug, Clone)]
pub enum AsyncScript {
    /// Still running; started this many seconds ago.
    Running { started_secs_ago: i64 },
    Complete,
    Failed { errno: i32, errmsg: String },
    /// The agent has no record of the task.
    Forgotten,
    /// The agent cannot be reached.
    Unreachable,
}

/// One call made to a [`MockAgent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCall {
    pub unit: String,
    pub verb: String,
    pub caller: String,
}

#[derive(Default)]
struct AgentState {
    statuses: HashMap<String, AgentStatusReply>,
    unreachable: HashSet<String>,
    failing_verbs: HashMap<String, i32>,
    action_fields: HashMap<String, serde_json::Map<String, serde_json::Value>>,
    async_script: VecDeque<AsyncScript>,
    submission: Option<Submission>,
    calls: Vec<AgentCall>,
    kills: Vec<String>,
}

/// Unit agents answering from a script.
///
/// Units without a scripted status report a running engine with no
/// database. Actions succeed unless their verb was made to fail. Async
/// submissions are accepted, and status polls follow the async script,
/// reporting completion once it runs out.
#[derive(Default)]
pub struct MockAgent {
    state: Mutex<AgentState>,
}

impl MockAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// A loaded, open, replicated database on `release`.
    pub fn loaded_status(release: &str, db_id: i64) -> AgentStatusReply {
        serde_json::from_value(serde_json::json!({
            "jsonVer": 1,
            "errno": 0,
            "daemonUp": true,
            "instanceExists": true,
            "installRelease": release,
            "ttStatus": {"db info": [{
                "# of conns": 3,
                "open": "yes",
                "conn info": [{"proc type": "Replication"}]
            }]},
            "repState": "ACTIVE",
            "nRepSchemes": 1,
            "updatable": true,
            "newId": db_id
        }))
        .unwrap_or_default()
    }

    pub fn set_status(&self, unit: &str, reply: AgentStatusReply) {
        let mut state = lock(&self.state);
        state.unreachable.remove(unit);
        state.statuses.insert(unit.to_string(), reply);
    }

    /// Refuse connections from `unit`'s agent.
    pub fn set_unreachable(&self, unit: &str) {
        lock(&self.state).unreachable.insert(unit.to_string());
    }

    /// Make every action named `verb` fail with `errno`.
    pub fn fail_verb(&self, verb: &str, errno: i32) {
        lock(&self.state)
            .failing_verbs
            .insert(verb.to_string(), errno);
    }

    /// Answer action `verb` with these payload fields.
    pub fn set_action_reply(&self, verb: &str, fields: serde_json::Value) {
        if let serde_json::Value::Object(map) = fields {
            lock(&self.state)
                .action_fields
                .insert(verb.to_string(), map);
        }
    }

    pub fn push_async(&self, script: AsyncScript) {
        lock(&self.state).async_script.push_back(script);
    }

    /// Answer the next async submissions with `submission`.
    pub fn set_submission(&self, submission: Submission) {
        lock(&self.state).submission = Some(submission);
    }

    pub fn calls(&self) -> Vec<AgentCall> {
        lock(&self.state).calls.clone()
    }

    /// Verbs run, in order.
    pub fn verbs(&self) -> Vec<String> {
        lock(&self.state)
            .calls
            .iter()
            .map(|c| c.verb.clone())
            .collect()
    }

    /// Units whose agent was killed, in order.
    pub fn kills(&self) -> Vec<String> {
        lock(&self.state).kills.clone()
    }

    fn record(&self, ep: &Endpoint, verb: &str, caller: &str) -> AgentResult<()> {
        let mut state = lock(&self.state);
        state.calls.push(AgentCall {
            unit: ep.unit_name.clone(),
            verb: verb.to_string(),
            caller: caller.to_string(),
        });
        if state.unreachable.contains(&ep.unit_name) {
            return Err(AgentError::ConnectRefused(ep.host.clone()));
        }
        match state.failing_verbs.get(verb) {
            Some(&errno) if errno == UNSUPPORTED_VERB_ERRNO => Err(AgentError::UnsupportedVerb {
                verb: verb.to_string(),
            }),
            Some(&errno) => Err(AgentError::Remote {
                verb: verb.to_string(),
                errno,
                errmsg: "scripted failure".to_string(),
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl UnitAgent for MockAgent {
    async fn fetch_status(&self, ep: &Endpoint) -> AgentResult<AgentStatusReply> {
        let state = lock(&self.state);
        if state.unreachable.contains(&ep.unit_name) {
            return Err(AgentError::ConnectRefused(ep.host.clone()));
        }
        Ok(state.statuses.get(&ep.unit_name).cloned().unwrap_or_else(|| {
            AgentStatusReply {
                json_ver: Some(1),
                daemon_up: true,
                instance_exists: Some(true),
                ..AgentStatusReply::default()
            }
        }))
    }

    async fn run_action(
        &self,
        ep: &Endpoint,
        verb: &str,
        caller: &str,
        _params: &[(String, String)],
        _timeout: Option<Duration>,
    ) -> AgentResult<ActionReply> {
        self.record(ep, verb, caller)?;
        let fields = lock(&self.state)
            .action_fields
            .get(verb)
            .cloned()
            .unwrap_or_default();
        Ok(ActionReply {
            json_ver: Some(1),
            fields,
            ..ActionReply::default()
        })
    }

    async fn submit_async(
        &self,
        ep: &Endpoint,
        verb: &str,
        caller: &str,
        request_id: &str,
        _params: &[(String, String)],
    ) -> AgentResult<Submission> {
        self.record(ep, verb, caller)?;
        Ok(lock(&self.state)
            .submission
            .clone()
            .unwrap_or_else(|| Submission::Accepted {
                echoed_id: Some(request_id.to_string()),
            }))
    }

    async fn async_status(&self, ep: &Endpoint, request_id: &str) -> AgentResult<AsyncTaskReply> {
        let script = lock(&self.state)
            .async_script
            .pop_front()
            .unwrap_or(AsyncScript::Complete);
        let now = Utc::now().timestamp();
        let reply = AsyncTaskReply {
            json_ver: Some(1),
            id: request_id.to_string(),
            ..AsyncTaskReply::default()
        };

        match script {
            AsyncScript::Running { started_secs_ago } => Ok(AsyncTaskReply {
                running: true,
                started: Some(now - started_secs_ago),
                updated: Some(now),
                ..reply
            }),
            AsyncScript::Complete => Ok(AsyncTaskReply {
                complete: true,
                errno: Some(0),
                started: Some(now),
                ended: Some(now),
                updated: Some(now),
                ..reply
            }),
            AsyncScript::Failed { errno, errmsg } => Ok(AsyncTaskReply {
                complete: true,
                errno: Some(errno),
                errmsg: Some(errmsg),
                ..reply
            }),
            AsyncScript::Forgotten => Ok(AsyncTaskReply {
                id: String::new(),
                ..reply
            }),
            AsyncScript::Unreachable => Err(AgentError::ConnectRefused(ep.host.clone())),
        }
    }

    async fn kill(&self, ep: &Endpoint) -> AgentResult<()> {
        info!(unit = %ep.unit_name, "[MOCK] Killing agent");
        lock(&self.state).kills.push(ep.unit_name.clone());
        Ok(())
    }
}

#[derive(Default)]
struct ClusterState {
    pairs: BTreeMap<ObjectKey, ManagedPair>,
    phases: HashMap<String, Option<String>>,
    forbidden_units: HashSet<String>,
    outdated_units: Vec<String>,
    deleted_units: Vec<String>,
    status_writes: usize,
}

/// Cluster store held in memory.
#[derive(Default)]
pub struct MemoryCluster {
    state: Mutex<ClusterState>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, pair: ManagedPair) {
        lock(&self.state).pairs.insert(pair.key(), pair);
    }

    pub fn remove(&self, key: &ObjectKey) {
        lock(&self.state).pairs.remove(key);
    }

    pub fn pair(&self, key: &ObjectKey) -> Option<ManagedPair> {
        lock(&self.state).pairs.get(key).cloned()
    }

    /// Override a unit's phase; `None` means the unit does not exist.
    pub fn set_phase(&self, unit: &str, phase: Option<&str>) {
        lock(&self.state)
            .phases
            .insert(unit.to_string(), phase.map(str::to_string));
    }

    /// Deny reading `unit`'s phase.
    pub fn forbid_unit(&self, unit: &str) {
        lock(&self.state).forbidden_units.insert(unit.to_string());
    }

    /// Report `unit` as running an outdated image.
    pub fn mark_outdated(&self, unit: &str) {
        lock(&self.state).outdated_units.push(unit.to_string());
    }

    pub fn deleted_units(&self) -> Vec<String> {
        lock(&self.state).deleted_units.clone()
    }

    pub fn status_writes(&self) -> usize {
        lock(&self.state).status_writes
    }
}

#[async_trait]
impl ClusterApi for MemoryCluster {
    async fn get(&self, key: &ObjectKey) -> ClusterResult<ManagedPair> {
        lock(&self.state)
            .pairs
            .get(key)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(key.clone()))
    }

    async fn update_status(&self, pair: &ManagedPair) -> ClusterResult<()> {
        let mut state = lock(&self.state);
        let stored = state
            .pairs
            .get_mut(&pair.key())
            .ok_or_else(|| ClusterError::NotFound(pair.key()))?;
        stored.status = pair.status.clone();
        state.status_writes += 1;
        Ok(())
    }

    async fn list_keys(&self) -> ClusterResult<Vec<ObjectRef>> {
        Ok(lock(&self.state)
            .pairs
            .values()
            .map(|p| ObjectRef {
                key: p.key(),
                generation: p.generation,
            })
            .collect())
    }

    async fn unit_phase(&self, _pair: &ManagedPair, unit: &str) -> ClusterResult<Option<String>> {
        let state = lock(&self.state);
        if state.forbidden_units.contains(unit) {
            return Err(ClusterError::Forbidden(format!("pods \"{}\" is forbidden", unit)));
        }
        Ok(state
            .phases
            .get(unit)
            .cloned()
            .unwrap_or_else(|| Some(DEFAULT_UNIT_PHASE.to_string())))
    }

    async fn image_update_requested(&self, _pair: &ManagedPair) -> ClusterResult<bool> {
        Ok(!lock(&self.state).outdated_units.is_empty())
    }

    async fn delete_unit(&self, _pair: &ManagedPair, unit: &str) -> ClusterResult<()> {
        let mut state = lock(&self.state);
        state.outdated_units.retain(|u| u != unit);
        state.deleted_units.push(unit.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct FlowsState {
    outcomes: HashMap<String, FlowResult>,
    async_actions: HashMap<String, String>,
    runs: Vec<(String, FlowKind)>,
}

/// Flows returning scripted outcomes per unit.
///
/// A unit without a script reports `Unknown` and not ready.
#[derive(Default)]
pub struct MockFlows {
    state: Mutex<FlowsState>,
}

impl MockFlows {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_outcome(&self, unit: &str, result: FlowResult) {
        lock(&self.state)
            .outcomes
            .insert(unit.to_string(), result);
    }

    /// Have the flow on `unit` submit async action `verb`.
    pub fn submit_on(&self, unit: &str, verb: &str) {
        lock(&self.state)
            .async_actions
            .insert(unit.to_string(), verb.to_string());
    }

    /// Flows run so far as (unit, flow).
    pub fn runs(&self) -> Vec<(String, FlowKind)> {
        lock(&self.state).runs.clone()
    }
}

#[async_trait]
impl UnitFlows for MockFlows {
    async fn run(&self, kind: FlowKind, ctx: &mut FlowContext<'_>) -> FlowResult {
        let unit = ctx.unit_name().to_string();
        let (mut result, action) = {
            let mut state = lock(&self.state);
            state.runs.push((unit.clone(), kind));
            let result = state
                .outcomes
                .get(&unit)
                .cloned()
                .unwrap_or_else(|| FlowResult::new(HighLevelState::Unknown, false));
            (result, state.async_actions.get(&unit).cloned())
        };

        if let Some(verb) = action {
            if let Err(e) = ctx.submit_async(&verb, &[]).await {
                result.error = Some(e.to_string());
            }
        }
        result
    }
}
