//! Configuration for the operator.

use std::time::Duration;

use anyhow::{Context, Result};

use crate::agent::AgentSettings;
use crate::pool::Credentials;

/// Operator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Identity recorded as the last reconciling operator.
    pub operator_id: String,

    /// Engine release this operator was built against.
    pub engine_release: String,

    /// Directory of managed pair documents.
    pub state_dir: String,

    /// Scheme, port and DNS suffix used to reach unit agents.
    pub agent: AgentSettings,

    /// Basic-auth pair returned by the environment credential source.
    pub agent_credentials: Credentials,

    /// Skip TLS verification of agent certificates.
    pub accept_invalid_certs: bool,

    /// Optional TOML file replacing the built-in transition tables.
    pub transitions_path: Option<String>,

    /// How often the worker looks for due objects, in milliseconds.
    pub scan_interval_ms: u64,

    /// Emit async task progress as audit records.
    pub task_debug: bool,

    /// Tick of the blocking async task wait, in milliseconds.
    pub async_poll_interval_ms: u64,

    /// Attempts made to see the standby catch up after an upgrade.
    pub verify_attempts: u32,

    /// Delay between replication verification attempts, in milliseconds.
    pub verify_delay_ms: u64,

    /// Replication wait applied to the active while quiescing, in seconds.
    pub quiesce_wait_secs: u64,

    /// Port of the Prometheus endpoint; 0 disables it.
    pub metrics_port: u16,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let operator_id = std::env::var("TTPAIR_OPERATOR_ID")
            .or_else(|_| std::env::var("POD_NAME"))
            .unwrap_or_else(|_| format!("operator-{}", uuid::Uuid::new_v4()));

        let engine_release =
            std::env::var("TTPAIR_ENGINE_RELEASE").unwrap_or_else(|_| "22.1.1.0".to_string());
        if ttpair_model::major_release(&engine_release).is_none() {
            anyhow::bail!("TTPAIR_ENGINE_RELEASE '{}' has no major release", engine_release);
        }

        let state_dir =
            std::env::var("TTPAIR_STATE_DIR").unwrap_or_else(|_| "/var/lib/ttpair".to_string());

        let agent_port = match std::env::var("TTPAIR_AGENT_PORT") {
            Ok(port) => port
                .parse()
                .with_context(|| format!("invalid TTPAIR_AGENT_PORT '{}'", port))?,
            Err(_) => 8443,
        };

        let agent = AgentSettings {
            scheme: std::env::var("TTPAIR_AGENT_SCHEME").unwrap_or_else(|_| "https".to_string()),
            port: agent_port,
            cluster_domain: std::env::var("TTPAIR_CLUSTER_DOMAIN")
                .unwrap_or_else(|_| "svc.cluster.local".to_string()),
        };

        let agent_credentials = Credentials {
            user: std::env::var("TTPAIR_AGENT_USER").unwrap_or_else(|_| "ttagent".to_string()),
            password: std::env::var("TTPAIR_AGENT_PASSWORD").unwrap_or_default(),
        };

        let accept_invalid_certs = env_flag("TTPAIR_ACCEPT_INVALID_CERTS");

        let transitions_path = std::env::var("TTPAIR_TRANSITIONS_PATH").ok();

        let task_debug = std::env::var("TTPAIR_TASK_DEBUG").is_ok() || std::env::var("TT_DEBUG").is_ok();

        let log_level = std::env::var("TTPAIR_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            operator_id,
            engine_release,
            state_dir,
            agent,
            agent_credentials,
            accept_invalid_certs,
            transitions_path,
            scan_interval_ms: env_number("TTPAIR_SCAN_INTERVAL_MS", 1000),
            task_debug,
            async_poll_interval_ms: env_number("TTPAIR_ASYNC_POLL_INTERVAL_MS", 3000),
            verify_attempts: env_number("TTPAIR_VERIFY_ATTEMPTS", 30),
            verify_delay_ms: env_number("TTPAIR_VERIFY_DELAY_MS", 10_000),
            quiesce_wait_secs: env_number("TTPAIR_QUIESCE_WAIT_SECS", 30),
            metrics_port: env_number("TTPAIR_METRICS_PORT", 9090),
            log_level,
        })
    }

    /// Major component of the operator's engine release.
    pub fn engine_major(&self) -> &str {
        ttpair_model::major_release(&self.engine_release).unwrap_or_default()
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms.max(1))
    }

    pub fn async_poll_interval(&self) -> Duration {
        Duration::from_millis(self.async_poll_interval_ms.max(1))
    }

    pub fn verify_delay(&self) -> Duration {
        Duration::from_millis(self.verify_delay_ms)
    }
}

fn env_number<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_major() {
        let config = Config {
            operator_id: "op".to_string(),
            engine_release: "22.1.1.0".to_string(),
            state_dir: "/tmp".to_string(),
            agent: AgentSettings::default(),
            agent_credentials: Credentials::default(),
            accept_invalid_certs: false,
            transitions_path: None,
            scan_interval_ms: 0,
            task_debug: false,
            async_poll_interval_ms: 3000,
            verify_attempts: 30,
            verify_delay_ms: 10_000,
            quiesce_wait_secs: 30,
            metrics_port: 0,
            log_level: "info".to_string(),
        };
        assert_eq!(config.engine_major(), "22");
        assert_eq!(config.scan_interval(), Duration::from_millis(1));
    }
}
