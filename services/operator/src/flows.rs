//! Flow invocation.
//!
//! Flow bodies live outside the decision engine. The engine hands a flow a
//! [`FlowContext`] and folds the [`FlowResult`] it returns.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};
use ttpair_model::{HighLevelState, ManagedPair};

use crate::agent::{ActionReply, AgentResult, AgentSettings, Endpoint, UnitAgent};
use crate::dispatch::FlowKind;
use crate::pool::Credentials;
use crate::tracker::{AsyncTracker, TrackerError};

/// What a flow reports about its unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowResult {
    pub outcome: HighLevelState,
    pub error: Option<String>,
    pub ready: bool,
}

impl FlowResult {
    pub fn new(outcome: HighLevelState, ready: bool) -> Self {
        Self {
            outcome,
            error: None,
            ready,
        }
    }

    /// The flow could not determine anything.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            outcome: HighLevelState::Unknown,
            error: Some(error.into()),
            ready: false,
        }
    }
}

/// Everything a flow may touch while it runs on one unit.
pub struct FlowContext<'a> {
    pub pair: &'a mut ManagedPair,
    pub index: usize,
    /// Name of the running flow, recorded as the caller of its actions.
    pub caller: &'static str,
    pub agent: &'a dyn UnitAgent,
    pub tracker: &'a AsyncTracker,
    pub settings: &'a AgentSettings,
    pub credentials: &'a Credentials,
}

impl FlowContext<'_> {
    pub fn unit_name(&self) -> &str {
        self.pair
            .status
            .units
            .get(self.index)
            .map(|u| u.name.as_str())
            .unwrap_or_default()
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(
            self.settings,
            &*self.pair,
            self.unit_name(),
            self.credentials.clone(),
        )
    }

    /// Run a synchronous action on this unit.
    pub async fn run_action(
        &self,
        verb: &str,
        params: &[(String, String)],
        timeout: Option<Duration>,
    ) -> AgentResult<ActionReply> {
        let ep = self.endpoint();
        self.agent
            .run_action(&ep, verb, self.caller, params, timeout)
            .await
    }

    /// Submit an async-capable action on this unit and wait for it.
    pub async fn submit_async(
        &mut self,
        verb: &str,
        params: &[(String, String)],
    ) -> Result<(), TrackerError> {
        self.tracker
            .submit(
                &mut *self.pair,
                self.index,
                verb,
                self.caller,
                params,
                self.credentials,
            )
            .await
    }
}

/// Runs a selected flow.
#[async_trait]
pub trait UnitFlows: Send + Sync {
    async fn run(&self, kind: FlowKind, ctx: &mut FlowContext<'_>) -> FlowResult;
}

/// Runs flows inside the unit's agent.
///
/// The flow is POSTed as `verb=<flow name>`. The reply carries the outcome
/// in `highLevelState` and the readiness in `ready`; it may also name an
/// async-capable action in `asyncAction` for the operator to submit and
/// track.
#[derive(Debug, Default, Clone, Copy)]
pub struct RemoteFlows;

#[async_trait]
impl UnitFlows for RemoteFlows {
    async fn run(&self, kind: FlowKind, ctx: &mut FlowContext<'_>) -> FlowResult {
        let reply = match ctx.run_action(kind.as_str(), &[], None).await {
            Ok(reply) => reply,
            Err(e) => return FlowResult::failed(e.to_string()),
        };

        let outcome = match reply.str_field("highLevelState") {
            None => HighLevelState::Unknown,
            Some(token) => match token.parse() {
                Ok(state) => state,
                Err(e) => {
                    warn!(flow = %kind, token, "Flow returned an unknown state");
                    return FlowResult::failed(format!("{}: {}", kind, e));
                }
            },
        };
        let ready = reply.bool_field("ready").unwrap_or(false);
        debug!(flow = %kind, unit = %ctx.unit_name(), outcome = %outcome, ready, "Flow finished");

        let mut result = FlowResult::new(outcome, ready);
        if let Some(verb) = reply.str_field("asyncAction").map(str::to_string) {
            if let Err(e) = ctx.submit_async(&verb, &[]).await {
                result.error = Some(e.to_string());
            }
        }
        result
    }
}
