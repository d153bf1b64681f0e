//! HTTP client for unit agents.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info};

use super::error::{AgentError, AgentResult};
use super::protocol::{ActionReply, AgentStatusReply, AsyncTaskReply, Endpoint, Submission};
use super::UnitAgent;
use crate::pool::{ConnectionPool, MethodClass};

const REQUEST_ID_HEADER: &str = "X-Request-Id";
const GET_TIMEOUT: &str = "agentGetTimeout";
const POST_TIMEOUT: &str = "agentPostTimeout";

/// Talks to unit agents over pooled persistent connections.
pub struct AgentClient {
    pool: Arc<ConnectionPool>,
}

impl AgentClient {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    fn client(&self, ep: &Endpoint, method: MethodClass) -> AgentResult<reqwest::Client> {
        self.pool
            .fetch_or_create(&ep.host, method, &ep.timeouts)
            .map_err(|e| AgentError::Transport(e.to_string()))
    }

    fn form(ep: &Endpoint, verb: &str, caller: &str, params: &[(String, String)]) -> Vec<(String, String)> {
        let mut form = Vec::with_capacity(ep.params.len() + params.len() + 2);
        form.push(("verb".to_string(), verb.to_string()));
        form.push(("caller".to_string(), caller.to_string()));
        form.extend(ep.params.iter().cloned());
        form.extend(params.iter().cloned());
        form
    }

    async fn decode<T: DeserializeOwned>(
        response: reqwest::Response,
        what: &'static str,
    ) -> AgentResult<T> {
        let body = response
            .text()
            .await
            .map_err(|e| AgentError::from_reqwest(e, what))?;
        serde_json::from_str(&body).map_err(|e| AgentError::Protocol(format!("{}: {}", e, body)))
    }

    async fn failed_status(response: reqwest::Response, what: &str) -> AgentError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        error!(status = %status, body = %body, "Agent {} failed", what);
        AgentError::HttpStatus {
            status: status.as_u16(),
            body,
        }
    }
}

#[async_trait]
impl UnitAgent for AgentClient {
    async fn fetch_status(&self, ep: &Endpoint) -> AgentResult<AgentStatusReply> {
        let client = self.client(ep, MethodClass::Get)?;
        debug!(host = %ep.host, "Fetching agent status");

        let response = client
            .get(ep.agent_url())
            .query(&[("ourDNSName", ep.host.as_str()), ("ttObjectName", object_name(ep))])
            .basic_auth(&ep.credentials.user, Some(&ep.credentials.password))
            .send()
            .await
            .map_err(|e| AgentError::from_reqwest(e, GET_TIMEOUT))?;

        if !response.status().is_success() {
            return Err(Self::failed_status(response, "status").await);
        }
        Self::decode(response, GET_TIMEOUT).await
    }

    async fn run_action(
        &self,
        ep: &Endpoint,
        verb: &str,
        caller: &str,
        params: &[(String, String)],
        timeout: Option<Duration>,
    ) -> AgentResult<ActionReply> {
        let client = self.client(ep, MethodClass::Post)?;
        info!(host = %ep.host, verb, caller, "Running agent action");

        let mut request = client
            .post(ep.agent_url())
            .form(&Self::form(ep, verb, caller, params))
            .basic_auth(&ep.credentials.user, Some(&ep.credentials.password));
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AgentError::from_reqwest(e, POST_TIMEOUT))?;

        if !response.status().is_success() {
            return Err(Self::failed_status(response, verb).await);
        }
        let reply: ActionReply = Self::decode(response, POST_TIMEOUT).await?;
        reply.check(verb)
    }

    async fn submit_async(
        &self,
        ep: &Endpoint,
        verb: &str,
        caller: &str,
        request_id: &str,
        params: &[(String, String)],
    ) -> AgentResult<Submission> {
        let client = self.client(ep, MethodClass::Post)?;
        info!(host = %ep.host, verb, caller, request_id, "Submitting async agent action");

        let response = client
            .post(ep.agent_url())
            .header(REQUEST_ID_HEADER, request_id)
            .form(&Self::form(ep, verb, caller, params))
            .basic_auth(&ep.credentials.user, Some(&ep.credentials.password))
            .send()
            .await
            .map_err(|e| AgentError::from_reqwest(e, POST_TIMEOUT))?;

        match response.status() {
            StatusCode::OK => {
                let reply: ActionReply = Self::decode(response, POST_TIMEOUT).await?;
                Ok(Submission::Synchronous(reply))
            }
            StatusCode::ACCEPTED => {
                let echoed_id = response
                    .headers()
                    .get(REQUEST_ID_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                Ok(Submission::Accepted { echoed_id })
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                error!(status = %status, body = %body, verb, "Agent rejected async task");
                Ok(Submission::Rejected {
                    status: status.as_u16(),
                })
            }
        }
    }

    async fn async_status(&self, ep: &Endpoint, request_id: &str) -> AgentResult<AsyncTaskReply> {
        let client = self.client(ep, MethodClass::Get)?;

        let response = client
            .get(ep.async_status_url())
            .header(REQUEST_ID_HEADER, request_id)
            .basic_auth(&ep.credentials.user, Some(&ep.credentials.password))
            .send()
            .await
            .map_err(|e| AgentError::from_reqwest(e, GET_TIMEOUT))?;

        if !response.status().is_success() {
            return Err(Self::failed_status(response, "async status").await);
        }
        let reply: AsyncTaskReply = Self::decode(response, GET_TIMEOUT).await?;

        if !reply.id.is_empty() && reply.id != request_id {
            error!(host = %ep.host, request_id, reported = %reply.id, "Agent tracks another task");
            return Err(AgentError::UnknownRequestId {
                request_id: request_id.to_string(),
                host: ep.host.clone(),
            });
        }
        Ok(reply)
    }

    async fn kill(&self, ep: &Endpoint) -> AgentResult<()> {
        let client = self.client(ep, MethodClass::Post)?;
        info!(host = %ep.host, "Killing agent");

        let response = client
            .post(ep.agent_url())
            .form(&Self::form(ep, "die", "kill", &[]))
            .basic_auth(&ep.credentials.user, Some(&ep.credentials.password))
            .timeout(ep.timeouts.get)
            .send()
            .await;

        match response {
            Ok(r) if r.status().is_success() => Ok(()),
            Ok(r) => Err(Self::failed_status(r, "die").await),
            // A dying agent may drop the connection mid-reply.
            Err(e) if !e.is_connect() && !e.is_timeout() => {
                debug!(host = %ep.host, error = %e, "Agent went away while dying");
                Ok(())
            }
            Err(e) => Err(AgentError::from_reqwest(e, POST_TIMEOUT)),
        }
    }
}

fn object_name(ep: &Endpoint) -> &str {
    ep.params
        .iter()
        .find(|(k, _)| k == "objectName")
        .map(|(_, v)| v.as_str())
        .unwrap_or_default()
}
