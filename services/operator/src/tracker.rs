//! Async Task Tracker.
//!
//! A managed pair has one [`AsyncStatus`] slot. A flow submits an
//! async-capable action through [`AsyncTracker::submit`], which waits for it
//! on a fixed tick up to the async timeout. Every later pass calls
//! [`AsyncTracker::check_pending`], a single non-blocking status fetch, so
//! tracking survives operator restarts through persisted status alone.
//!
//! The only way to cancel a task is to kill the agent running it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use ttpair_events::{reason, EventReporter};
use ttpair_model::{AsyncStatus, ManagedPair, ModelError};
use uuid::Uuid;

use crate::agent::{
    AgentError, AgentSettings, AsyncTaskReply, Endpoint, Submission, UnitAgent,
};
use crate::cluster::ClusterApi;
use crate::metrics;
use crate::pool::Credentials;

/// Actions the agent may run asynchronously.
pub const ASYNC_VERBS: [&str; 2] = ["repDuplicate", "createCg"];

/// Flow whose duplication step is tracked across passes.
pub const STANDBY_RECOVERY_FLOW: &str = "standbyDownStandbyAS";

/// Error code recorded when a task timed out.
pub const ERRNO_TIMED_OUT: i32 = 10;
/// Error code recorded when the agent could not be reached or refused a task.
pub const ERRNO_AGENT_UNAVAILABLE: i32 = 11;

const TIMED_OUT_MESSAGE: &str = "task timed out";
const CONNECT_FAILED_MESSAGE: &str = "agent connect failed";

/// Errors raised by the tracker.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Model(#[from] ModelError),

    /// The agent answered the submission with neither 200 nor 202.
    #[error("agent rejected task, http code {0}")]
    Rejected(u16),

    #[error("Async task {task} timed out on {host}")]
    TimedOut { task: String, host: String },

    /// The task finished with a remote error.
    #[error("{errmsg}")]
    TaskFailed { errno: i32, errmsg: String },

    #[error("{0} is not an async-capable action")]
    NotAsync(String),

    /// Another task already occupies the slot.
    #[error("async task {0} is still running")]
    Busy(String),
}

/// Why the blocking wait stopped without a clean completion.
enum PollFailure {
    Agent(AgentError),
    Failed(AsyncTaskReply),
    TimedOut,
}

/// Owns the lifecycle of each pair's async task slot.
pub struct AsyncTracker {
    agent: Arc<dyn UnitAgent>,
    reporter: Arc<EventReporter>,
    cluster: Arc<dyn ClusterApi>,
    settings: AgentSettings,
    poll_interval: Duration,
    task_debug: bool,
}

impl AsyncTracker {
    pub fn new(
        agent: Arc<dyn UnitAgent>,
        reporter: Arc<EventReporter>,
        cluster: Arc<dyn ClusterApi>,
        settings: AgentSettings,
        poll_interval: Duration,
        task_debug: bool,
    ) -> Self {
        Self {
            agent,
            reporter,
            cluster,
            settings,
            poll_interval,
            task_debug,
        }
    }

    /// Look at the outstanding task once.
    ///
    /// Returns `Ok(true)` while the task is still running and within its
    /// timeout. A task past its timeout is force-completed with error code
    /// 10 after killing its agent.
    #[instrument(skip(self, pair, credentials), fields(pair = %pair.key()))]
    pub async fn check_pending(
        &self,
        pair: &mut ManagedPair,
        credentials: &Credentials,
    ) -> Result<bool, TrackerError> {
        if !pair.status.async_status.running {
            return Ok(false);
        }

        let slot = pair.status.async_status.clone();
        let ep = Endpoint::new(&self.settings, pair, &slot.unit_name, credentials.clone());

        let reply = match self.agent.async_status(&ep, &slot.id).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(task = %slot.task_type, host = %ep.host, error = %e, "Async status unavailable");
                self.kill_agent(pair, &ep).await?;
                return Err(e.into());
            }
        };

        let now = Utc::now().timestamp();

        if reply.id.is_empty() {
            info!(task = %slot.task_type, "Agent no longer knows the task; clearing it");
            pair.status.async_status.running = false;
            return Ok(false);
        }

        if reply.complete {
            let status = &mut pair.status.async_status;
            status.running = false;
            status.complete = true;
            status.updated = reply.updated.or(Some(now));
            status.ended = reply.ended;
            if let Some(errno) = reply.failure() {
                status.errno = errno;
                status.errmsg = reply.errmsg.clone().unwrap_or_default();
            }
            info!(task = %slot.task_type, host = %slot.host, "Async task complete");
            if let (Some(started), Some(ended)) = (reply.started.or(slot.started), reply.ended) {
                let failed = reply.failure().is_some();
                metrics::record_async_task(&slot.task_type, failed, ended - started);
            }

            let recovery = &mut pair.status.standby_recovery;
            if slot.caller == STANDBY_RECOVERY_FLOW
                && recovery.is_pending()
                && slot.id == recovery.async_id
                && slot.task_type == "repDuplicate"
                && reply.failure().is_none()
            {
                recovery.rep_duplicate = true;
            }
            return Ok(false);
        }

        let Some(started) = reply.started.or(slot.started) else {
            debug!(task = %slot.task_type, "Async task running, start time unknown");
            return Ok(true);
        };

        let timeout = secs(pair.agent_timeouts().async_task);
        let elapsed = now - started;
        if self.task_debug {
            let message = format!(
                "Async polling for {}, timeout in {} secs",
                slot.task_type,
                timeout - elapsed
            );
            self.reporter.normal(pair, reason::INFO, message).await;
        }

        if elapsed > timeout {
            let message = format!("Async task {} timed out on {}", slot.task_type, slot.host);
            self.reporter.warning(pair, reason::TASK_FAILED, &message).await;
            if !slot.unit_name.is_empty() {
                if let Err(e) = self.kill_agent(pair, &ep).await {
                    warn!(host = %ep.host, error = %e, "Failed to kill agent of timed out task");
                }
            }
            let status = &mut pair.status.async_status;
            status.complete = true;
            status.running = false;
            status.errno = ERRNO_TIMED_OUT;
            status.errmsg = TIMED_OUT_MESSAGE.to_string();
            status.updated = Some(now);
            return Ok(false);
        }

        Ok(true)
    }

    /// Submit `verb` on unit `index` and wait for it to finish.
    #[instrument(skip(self, pair, params, credentials), fields(pair = %pair.key()))]
    pub async fn submit(
        &self,
        pair: &mut ManagedPair,
        index: usize,
        verb: &str,
        caller: &str,
        params: &[(String, String)],
        credentials: &Credentials,
    ) -> Result<(), TrackerError> {
        if !ASYNC_VERBS.contains(&verb) {
            return Err(TrackerError::NotAsync(verb.to_string()));
        }
        if pair.status.async_status.running {
            return Err(TrackerError::Busy(pair.status.async_status.task_type.clone()));
        }

        let unit_name = pair.unit(index)?.name.clone();
        let ep = Endpoint::new(&self.settings, pair, &unit_name, credentials.clone());
        let request_id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp();

        pair.status.async_status = AsyncStatus {
            id: request_id.clone(),
            task_type: verb.to_string(),
            caller: caller.to_string(),
            host: ep.host.clone(),
            unit_name,
            started: Some(now),
            updated: Some(now),
            ..AsyncStatus::default()
        };
        if caller == STANDBY_RECOVERY_FLOW {
            pair.status.standby_recovery.async_id = request_id.clone();
        }

        let submission = match self
            .agent
            .submit_async(&ep, verb, caller, &request_id, params)
            .await
        {
            Ok(submission) => submission,
            Err(e) => {
                let status = &mut pair.status.async_status;
                status.complete = true;
                status.errno = if e.is_connect_refused() {
                    ERRNO_AGENT_UNAVAILABLE
                } else {
                    e.errno().unwrap_or(ERRNO_TIMED_OUT)
                };
                status.errmsg = e.to_string();
                return Err(e.into());
            }
        };

        match submission {
            Submission::Synchronous(reply) => {
                info!(verb, host = %ep.host, "Agent ran async action synchronously");
                let status = &mut pair.status.async_status;
                status.id.clear();
                status.running = false;
                status.complete = true;
                if let Err(e) = reply.check(verb) {
                    status.errno = e.errno().unwrap_or(ERRNO_TIMED_OUT);
                    status.errmsg = e.to_string();
                    return Err(e.into());
                }
                Ok(())
            }
            Submission::Rejected { status: code } => {
                let status = &mut pair.status.async_status;
                status.running = false;
                status.complete = true;
                status.errno = ERRNO_AGENT_UNAVAILABLE;
                status.errmsg = format!("agent returned http {}, expecting 202", code);
                Err(TrackerError::Rejected(code))
            }
            Submission::Accepted { echoed_id } => {
                match echoed_id.as_deref() {
                    Some(id) if id != request_id => {
                        warn!(request_id = %request_id, echoed = id, "Agent echoed another request id")
                    }
                    None => warn!(request_id = %request_id, "Agent did not echo the request id"),
                    _ => {}
                }
                pair.status.async_status.running = true;
                if let Err(e) = self.cluster.update_status(pair).await {
                    warn!(error = %e, "Failed to persist submitted async task");
                }
                self.await_completion(pair, &ep, verb, &request_id).await
            }
        }
    }

    async fn await_completion(
        &self,
        pair: &mut ManagedPair,
        ep: &Endpoint,
        verb: &str,
        request_id: &str,
    ) -> Result<(), TrackerError> {
        let outcome = self.poll(pair, ep, request_id).await;
        let now = Utc::now().timestamp();

        let failure = match outcome {
            Ok(reply) => {
                let status = &mut pair.status.async_status;
                status.running = false;
                status.complete = true;
                status.updated = reply.updated.or(Some(now));
                status.ended = reply.ended.or(Some(now));
                if let (Some(started), Some(ended)) = (reply.started, reply.ended) {
                    info!(verb, host = %ep.host, secs = ended - started, "Async task complete");
                    metrics::record_async_task(verb, reply.failure().is_some(), ended - started);
                    if self.task_debug {
                        let message = format!("{} completed in {} secs", verb, ended - started);
                        self.reporter.normal(pair, reason::INFO, message).await;
                    }
                }
                return Ok(());
            }
            Err(failure) => failure,
        };

        let (errno, errmsg, event, error) = match failure {
            PollFailure::Agent(e) if e.is_connect_refused() => (
                ERRNO_AGENT_UNAVAILABLE,
                CONNECT_FAILED_MESSAGE.to_string(),
                CONNECT_FAILED_MESSAGE.to_string(),
                TrackerError::Agent(e),
            ),
            PollFailure::Failed(reply) => {
                let errno = reply.failure().unwrap_or(ERRNO_TIMED_OUT);
                match reply.errmsg.filter(|m| !m.is_empty()) {
                    Some(errmsg) => (
                        errno,
                        errmsg.clone(),
                        format!(
                            "Async task {} failed on {}: Error {}: {}",
                            verb, ep.host, errno, errmsg
                        ),
                        TrackerError::TaskFailed { errno, errmsg },
                    ),
                    None => (
                        errno,
                        TIMED_OUT_MESSAGE.to_string(),
                        format!("Async task {} timed out on {}", verb, ep.host),
                        TrackerError::TaskFailed {
                            errno,
                            errmsg: format!("async task {} failed with errno={}", verb, errno),
                        },
                    ),
                }
            }
            other => {
                let error = match other {
                    PollFailure::Agent(e) => TrackerError::Agent(e),
                    _ => TrackerError::TimedOut {
                        task: verb.to_string(),
                        host: ep.host.clone(),
                    },
                };
                (
                    ERRNO_TIMED_OUT,
                    TIMED_OUT_MESSAGE.to_string(),
                    format!("Async task {} timed out on {}", verb, ep.host),
                    error,
                )
            }
        };

        {
            let status = &mut pair.status.async_status;
            status.errno = errno;
            status.errmsg = errmsg;
            status.running = false;
            status.complete = true;
            status.updated = Some(now);
        }
        self.reporter.warning(pair, reason::TASK_FAILED, event).await;

        if let Err(e) = self.kill_agent(pair, ep).await {
            debug!(host = %ep.host, error = %e, "Kill after failed task did not succeed");
        }
        Err(error)
    }

    /// Fetch the task status on every tick until it completes, fails, or the
    /// async timeout passes.
    async fn poll(
        &self,
        pair: &mut ManagedPair,
        ep: &Endpoint,
        request_id: &str,
    ) -> Result<AsyncTaskReply, PollFailure> {
        let timeout = pair.agent_timeouts().async_task;
        let deadline = tokio::time::Instant::now() + timeout;
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.poll_interval,
            self.poll_interval,
        );
        let mut task_type = pair.status.async_status.task_type.clone();

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(task = %task_type, host = %ep.host, "Async task wait timed out");
                    return Err(PollFailure::TimedOut);
                }
                _ = ticker.tick() => {}
            }

            let reply = self
                .agent
                .async_status(ep, request_id)
                .await
                .map_err(PollFailure::Agent)?;
            if !reply.task_type.is_empty() {
                task_type = reply.task_type.clone();
            }

            if let Some(errno) = reply.failure() {
                debug!(task = %task_type, errno, "Async task reported an error");
                return Err(PollFailure::Failed(reply));
            }

            if reply.running {
                if let Some(started) = reply.started {
                    let elapsed = Utc::now().timestamp() - started;
                    let remaining = secs(timeout) - elapsed;
                    debug!(task = %task_type, elapsed, remaining, "Async task running");
                    if self.task_debug {
                        let message = format!(
                            "Async polling for {}, timeout in {} secs",
                            task_type, remaining
                        );
                        self.reporter.normal(pair, reason::INFO, message).await;
                    }
                }
            }

            if reply.complete {
                return Ok(reply);
            }
        }
    }

    /// Kill the agent at `ep` and record it.
    pub async fn kill_agent(&self, pair: &mut ManagedPair, ep: &Endpoint) -> Result<(), AgentError> {
        let message = format!("Unit {}: terminating container by killing agent", ep.unit_name);
        self.reporter.warning(pair, reason::INFO, message).await;
        self.agent.kill(ep).await
    }
}

fn secs(d: Duration) -> i64 {
    i64::try_from(d.as_secs()).unwrap_or(i64::MAX)
}
