//! Unit agent access.
//!
//! [`UnitAgent`] is the seam between decision logic and the HTTP protocol;
//! [`AgentClient`] speaks it over pooled connections.

mod client;
mod error;
mod protocol;

use std::time::Duration;

use async_trait::async_trait;

pub use client::AgentClient;
pub use error::{AgentError, AgentResult, UNKNOWN_REQUEST_ERRNO, UNSUPPORTED_VERB_ERRNO};
pub use protocol::{
    ActionReply, AgentSettings, AgentStatusReply, AsyncTaskReply, ConnInfo, DbInfo, Endpoint,
    EngineReport, Submission, PROTOCOL_VERSION,
};

/// Operations the operator performs against one unit's agent.
#[async_trait]
pub trait UnitAgent: Send + Sync {
    /// Fetch the unit's engine report.
    async fn fetch_status(&self, ep: &Endpoint) -> AgentResult<AgentStatusReply>;

    /// Run a synchronous action. `timeout` overrides the POST timeout.
    async fn run_action(
        &self,
        ep: &Endpoint,
        verb: &str,
        caller: &str,
        params: &[(String, String)],
        timeout: Option<Duration>,
    ) -> AgentResult<ActionReply>;

    /// Submit an async-capable action under `request_id`.
    async fn submit_async(
        &self,
        ep: &Endpoint,
        verb: &str,
        caller: &str,
        request_id: &str,
        params: &[(String, String)],
    ) -> AgentResult<Submission>;

    /// Status of the async task `request_id`.
    ///
    /// A reply with an empty id means the agent no longer knows any task.
    /// A reply naming another task is [`AgentError::UnknownRequestId`].
    async fn async_status(&self, ep: &Endpoint, request_id: &str) -> AgentResult<AsyncTaskReply>;

    /// Terminate the agent process; there is no gentler cancel.
    async fn kill(&self, ep: &Endpoint) -> AgentResult<()>;
}
