//! Wire types of the unit agent protocol.
//!
//! Every reply is a JSON envelope carrying `jsonVer` (always 1), an integer
//! `errno` (0 = success) and an optional `errmsg`. Status replies add the
//! engine report that [`AgentStatusReply::fold_into`] copies into a unit's
//! observed blocks.

use std::collections::BTreeMap;

use serde::Deserialize;
use ttpair_model::{AgentState, AgentTimeouts, ManagedPair, UnitStatus};

use super::error::{AgentError, AgentResult, UNSUPPORTED_VERB_ERRNO};
use crate::pool::Credentials;

/// Protocol version spoken by this operator.
pub const PROTOCOL_VERSION: i32 = 1;

/// The agent could not produce a report at all.
const ERRNO_NO_REPORT: i32 = 999;
/// Transient connect failure while the engine recovers processes.
const ERRNO_TRANSIENT_CONNECT: i32 = 9996;
/// The database is not loaded.
const ERRNO_NOT_LOADED: i32 = 707;

/// How unit agents are reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSettings {
    pub scheme: String,
    pub port: u16,
    pub cluster_domain: String,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            scheme: "https".to_string(),
            port: 8443,
            cluster_domain: "svc.cluster.local".to_string(),
        }
    }
}

impl AgentSettings {
    /// Stable network name of a unit.
    pub fn dns_name(&self, pair: &ManagedPair, unit_name: &str) -> String {
        format!(
            "{}.{}.{}.{}",
            unit_name, pair.name, pair.namespace, self.cluster_domain
        )
    }
}

/// Everything needed to call one unit's agent.
#[derive(Debug, Clone)]
pub struct Endpoint {
    /// Stable network name; also the connection pool key.
    pub host: String,
    /// `scheme://host:port`.
    pub base_url: String,
    pub unit_name: String,
    pub timeouts: AgentTimeouts,
    pub credentials: Credentials,
    /// Identity parameters sent with every action.
    pub params: Vec<(String, String)>,
}

impl Endpoint {
    /// Build the endpoint of `unit_name` within `pair`.
    pub fn new(
        settings: &AgentSettings,
        pair: &ManagedPair,
        unit_name: &str,
        credentials: Credentials,
    ) -> Self {
        let host = settings.dns_name(pair, unit_name);
        let base_url = format!("{}://{}:{}", settings.scheme, host, settings.port);

        // Data store names stop at the first dash of the object name.
        let db_name = pair.name.split('-').next().unwrap_or(&pair.name).to_string();

        let mut params = vec![
            ("dbName".to_string(), db_name),
            ("ourDNSName".to_string(), host.clone()),
            ("objectName".to_string(), pair.name.clone()),
            ("objectNamespace".to_string(), pair.namespace.clone()),
        ];

        let active = pair.active_index().map(|i| &pair.status.units[i].name);
        let standby = pair.standby_index().map(|i| &pair.status.units[i].name);
        if let Some(name) = active {
            params.push(("activeDNSName".to_string(), settings.dns_name(pair, name)));
        }
        if let Some(name) = standby {
            params.push(("standbyDNSName".to_string(), settings.dns_name(pair, name)));
        }

        let is_subscriber = pair
            .status
            .units
            .iter()
            .any(|u| u.is_subscriber() && u.name == unit_name);
        if is_subscriber {
            params.push(("weAreSubscriber".to_string(), "1".to_string()));
        } else if pair.is_replicated() {
            if let Some(name) = active {
                params.push(("otherDNSName".to_string(), settings.dns_name(pair, name)));
            }
        }

        Self {
            host,
            base_url,
            unit_name: unit_name.to_string(),
            timeouts: pair.agent_timeouts(),
            credentials,
            params,
        }
    }

    pub fn agent_url(&self) -> String {
        format!("{}/agent", self.base_url)
    }

    pub fn async_status_url(&self) -> String {
        format!("{}/agent/status", self.base_url)
    }
}

/// Reply to a synchronous action.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActionReply {
    #[serde(rename = "jsonVer")]
    pub json_ver: Option<i32>,
    #[serde(default)]
    pub errno: i32,
    #[serde(default)]
    pub errmsg: Option<String>,
    /// Action-specific payload.
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl ActionReply {
    /// Turn a remote failure into an error.
    pub fn check(self, verb: &str) -> AgentResult<Self> {
        if self.json_ver != Some(PROTOCOL_VERSION) {
            return Err(AgentError::Protocol(format!(
                "{} reply has jsonVer {:?}, expecting {}",
                verb, self.json_ver, PROTOCOL_VERSION
            )));
        }
        match self.errno {
            0 => Ok(self),
            UNSUPPORTED_VERB_ERRNO => Err(AgentError::UnsupportedVerb {
                verb: verb.to_string(),
            }),
            errno => Err(AgentError::Remote {
                verb: verb.to_string(),
                errno,
                errmsg: self.errmsg.unwrap_or_default(),
            }),
        }
    }

    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(|v| v.as_str())
    }

    pub fn bool_field(&self, name: &str) -> Option<bool> {
        self.fields.get(name).and_then(|v| v.as_bool())
    }
}

/// Engine status block of a status reply.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineReport {
    #[serde(rename = "db info", default)]
    pub db_info: Vec<DbInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DbInfo {
    #[serde(rename = "# of conns", default)]
    pub connections: i64,
    pub loading: Option<bool>,
    pub unloading: Option<bool>,
    #[serde(rename = "obsolete info")]
    pub obsolete_info: Option<Vec<serde_json::Value>>,
    #[serde(rename = "conn info", default)]
    pub conn_info: Vec<ConnInfo>,
    #[serde(default)]
    pub open: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnInfo {
    #[serde(rename = "proc type", default)]
    pub proc_type: String,
}

/// Reply to a status GET.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatusReply {
    #[serde(default)]
    pub id: String,
    pub json_ver: Option<i32>,
    #[serde(default)]
    pub errno: i32,
    #[serde(default)]
    pub errmsg: String,
    #[serde(default)]
    pub daemon_up: bool,
    pub instance_exists: Option<bool>,
    #[serde(default)]
    pub install_release: String,
    #[serde(rename = "ttStatus", default)]
    pub engine: EngineReport,
    #[serde(default)]
    pub rep_state: String,
    #[serde(default)]
    pub n_rep_schemes: i32,
    #[serde(default)]
    pub updatable: bool,
    #[serde(default)]
    pub new_id: i64,
    #[serde(default)]
    pub rep_peer_p_state: String,
    #[serde(default)]
    pub n_cache_groups: i32,
    #[serde(rename = "cgFile", default)]
    pub cache_groups_file: bool,
    pub using_twosafe: Option<bool>,
    pub disable_return: Option<bool>,
    pub local_commit: Option<bool>,
    pub awt_behind_mb: Option<f32>,
    pub monitor: Option<BTreeMap<String, serde_json::Value>>,
    pub configuration: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default)]
    pub quiescing: bool,
    #[serde(default)]
    pub stderr: Vec<String>,
}

impl AgentStatusReply {
    /// Copy this report into `unit`'s observed blocks.
    pub fn fold_into(&self, unit: &mut UnitStatus, now: i64) {
        unit.db.db_id = 0;

        if self.errno == ERRNO_NO_REPORT {
            unit.clear_agent_report();
            return;
        }

        unit.pod.agent = AgentState::Up;
        unit.pod.last_time_reachable = now;
        unit.quiescing = self.quiescing;
        unit.cache_groups_file = self.cache_groups_file;
        unit.engine.instance = match self.instance_exists {
            Some(true) => "Exists",
            Some(false) => "Missing",
            None => "Unknown",
        }
        .to_string();
        unit.engine.release = self.install_release.clone();

        if !self.daemon_up {
            unit.engine.daemon = "Down".to_string();
            return;
        }
        unit.engine.daemon = "Up".to_string();

        if self.errno == ERRNO_TRANSIENT_CONNECT {
            let unknown = || "Unknown".to_string();
            unit.db.db = unknown();
            unit.db.db_updatable = unknown();
            unit.replication.rep_agent = unknown();
            unit.replication.rep_state = unknown();
            unit.replication.rep_scheme = unknown();
            unit.replication.rep_peer_p_state = unknown();
            unit.cache.cache_agent = unknown();
            unit.cache.awt_behind_mb = None;
            return;
        }

        if let Some(conf) = &self.configuration {
            unit.db.configuration = stringify(conf);
        }
        if let Some(monitor) = &self.monitor {
            unit.db.monitor = stringify(monitor);
        }

        let Some(info) = self.engine.db_info.first() else {
            unit.db.db = "None".to_string();
            return;
        };

        let no_obsolete = info.obsolete_info.as_ref().map_or(true, |o| o.is_empty());
        if info.loading.is_some() {
            unit.db.db = "Loading".to_string();
        } else if info.unloading.is_some() {
            unit.db.db = "Unloading".to_string();
        } else if (no_obsolete && info.connections == 0) || self.errno == ERRNO_NOT_LOADED {
            unit.db.db = "Unloaded".to_string();
        } else if info.obsolete_info.is_some() {
            unit.db.db = "Transitioning".to_string();
        } else if info.connections > 0 {
            self.fold_loaded(info, unit);
        } else {
            unit.db.db = "Unloaded".to_string();
            unit.replication.rep_agent = "Not Running".to_string();
            unit.replication.rep_state = "Unknown".to_string();
            unit.cache.cache_agent = "Not Running".to_string();
        }
    }

    fn fold_loaded(&self, info: &DbInfo, unit: &mut UnitStatus) {
        unit.db.db = "Loaded".to_string();
        unit.db.db_id = self.new_id;
        unit.db.open = info.open == "yes";
        unit.db.db_updatable = if self.updatable { "Yes" } else { "No" }.to_string();

        unit.using_twosafe = self.using_twosafe;
        unit.disable_return = self.disable_return;
        unit.local_commit = self.local_commit;
        unit.cache.awt_behind_mb = self.awt_behind_mb.map(|mb| (mb + 0.5) as i32);

        let running = |proc_type: &str| {
            if info.conn_info.iter().any(|c| c.proc_type == proc_type) {
                "Running"
            } else {
                "Not Running"
            }
            .to_string()
        };
        unit.replication.rep_agent = running("Replication");
        unit.cache.cache_agent = running("Cache Agent");

        unit.replication.rep_state = self.rep_state.clone();
        unit.replication.rep_scheme = if self.n_rep_schemes > 0 {
            "Exists"
        } else {
            "None"
        }
        .to_string();
        unit.replication.rep_peer_p_state = self.rep_peer_p_state.clone();
        unit.cache.n_cache_groups = self.n_cache_groups;
    }
}

fn stringify(map: &BTreeMap<String, serde_json::Value>) -> BTreeMap<String, String> {
    map.iter()
        .map(|(k, v)| {
            let text = match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), text)
        })
        .collect()
}

/// Reply to an async status GET.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AsyncTaskReply {
    #[serde(rename = "jsonVer")]
    pub json_ver: Option<i32>,
    pub errno: Option<i32>,
    pub errmsg: Option<String>,
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub task_type: String,
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub complete: bool,
    pub updated: Option<i64>,
    pub started: Option<i64>,
    pub ended: Option<i64>,
}

impl AsyncTaskReply {
    /// A nonzero error code, if the task reported one.
    pub fn failure(&self) -> Option<i32> {
        self.errno.filter(|e| *e != 0)
    }
}

/// Outcome of submitting an async-capable action.
#[derive(Debug, Clone)]
pub enum Submission {
    /// HTTP 200: the agent ran the action synchronously.
    Synchronous(ActionReply),
    /// HTTP 202: the agent accepted the task.
    Accepted { echoed_id: Option<String> },
    /// Any other status.
    Rejected { status: u16 },
}
