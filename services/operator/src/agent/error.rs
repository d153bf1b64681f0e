//! Errors talking to unit agents.

use thiserror::Error;

/// Remote error code for a verb the agent does not implement.
pub const UNSUPPORTED_VERB_ERRNO: i32 = 255;

/// Error code recorded when a status reply names another request.
pub const UNKNOWN_REQUEST_ERRNO: i32 = 99;

/// Errors that can occur when calling a unit agent.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Nothing listens on the agent port.
    #[error("agent connect failed: {0}")]
    ConnectRefused(String),

    /// The request did not finish within its deadline.
    #[error("{what} exceeded")]
    Timeout { what: &'static str },

    /// Any other transport failure.
    #[error("agent transport error: {0}")]
    Transport(String),

    /// Non-success HTTP status.
    #[error("agent returned http {status}: {body}")]
    HttpStatus { status: u16, body: String },

    /// Reply could not be understood.
    #[error("agent protocol error: {0}")]
    Protocol(String),

    /// The agent ran the verb and reported a failure.
    #[error("Error {errno} {verb}: {errmsg}")]
    Remote {
        verb: String,
        errno: i32,
        errmsg: String,
    },

    /// The agent does not implement the verb.
    #[error("Error 255 {verb}: unsupported verb")]
    UnsupportedVerb { verb: String },

    /// The agent is tracking a different async request.
    #[error("request id {request_id} unknown on {host}")]
    UnknownRequestId { request_id: String, host: String },
}

impl AgentError {
    /// Classify a transport error. `what` names the deadline that applies.
    pub fn from_reqwest(err: reqwest::Error, what: &'static str) -> Self {
        if err.is_timeout() {
            return AgentError::Timeout { what };
        }
        let text = error_chain(&err);
        if text.to_ascii_lowercase().contains("connection refused") {
            AgentError::ConnectRefused(text)
        } else {
            AgentError::Transport(text)
        }
    }

    pub fn is_connect_refused(&self) -> bool {
        matches!(self, AgentError::ConnectRefused(_))
    }

    pub fn is_unsupported_verb(&self) -> bool {
        matches!(self, AgentError::UnsupportedVerb { .. })
    }

    /// Remote error code carried by this error, if any.
    pub fn errno(&self) -> Option<i32> {
        match self {
            AgentError::Remote { errno, .. } => Some(*errno),
            AgentError::UnsupportedVerb { .. } => Some(UNSUPPORTED_VERB_ERRNO),
            AgentError::UnknownRequestId { .. } => Some(UNKNOWN_REQUEST_ERRNO),
            _ => None,
        }
    }
}

/// Result type for agent calls.
pub type AgentResult<T> = Result<T, AgentError>;

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}
