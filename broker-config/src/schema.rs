//! Strongly typed configuration schema.

use std::collections::HashSet;
use std::time::Duration;

use broker_primitives::AppName;
use serde::{Deserialize, Serialize};

use crate::{ConfigError, ConfigResult};

/// Root of the broker configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerConfig {
    /// App-facing listener.
    pub listener: ListenerConfig,
    /// Agent-facing transport.
    pub agent: AgentConfig,
    /// Call forwarding.
    pub calls: CallConfig,
    /// Log output.
    pub logging: LoggingConfig,
    /// Apps expected to connect, reported by `apps/list` before they do.
    pub known_apps: Vec<KnownApp>,
}

impl BrokerConfig {
    /// Validates every section.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for zero limits or empty addresses,
    /// and [`ConfigError::InvalidKnownApp`] for bad or repeated app names.
    pub fn validate(&self) -> ConfigResult<()> {
        self.listener.validate()?;
        self.agent.validate()?;
        self.calls.validate()?;
        self.logging.validate()?;

        let mut seen = HashSet::new();
        for app in &self.known_apps {
            let name = app.app_name()?;
            if !seen.insert(name) {
                return Err(ConfigError::InvalidKnownApp {
                    name: app.name.clone(),
                    reason: "listed more than once".into(),
                });
            }
        }
        Ok(())
    }
}

/// `[listener]`: where apps connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ListenerConfig {
    /// Bind address, `host:port`.
    pub bind: String,
    /// Cap on simultaneously connected apps.
    pub max_connections: usize,
    /// Longest accepted frame, in bytes.
    pub max_frame_bytes: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7420".into(),
            max_connections: 64,
            max_frame_bytes: 8 * 1024 * 1024,
        }
    }
}

impl ListenerConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.bind.trim().is_empty() {
            return Err(ConfigError::Invalid("listener.bind cannot be empty"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "listener.max_connections must be greater than zero",
            ));
        }
        if self.max_frame_bytes == 0 {
            return Err(ConfigError::Invalid(
                "listener.max_frame_bytes must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// How agents reach the broker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentTransport {
    /// One agent on the process's stdin/stdout.
    #[default]
    Stdio,
    /// Any number of agents on a TCP listener.
    Tcp,
}

/// `[agent]`: agent-facing transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    /// Transport mode.
    pub transport: AgentTransport,
    /// Bind address used in TCP mode.
    pub bind: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            transport: AgentTransport::Stdio,
            bind: "127.0.0.1:7421".into(),
        }
    }
}

impl AgentConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.transport == AgentTransport::Tcp && self.bind.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "agent.bind cannot be empty in tcp mode",
            ));
        }
        Ok(())
    }
}

/// `[calls]`: forwarding limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CallConfig {
    /// Window a call waits for its app's response, in milliseconds.
    pub default_timeout_ms: u64,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
        }
    }
}

impl CallConfig {
    /// Returns the call window.
    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.default_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "calls.default_timeout_ms must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Output format for log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Single-line human-readable output.
    #[default]
    Compact,
    /// Multi-line human-readable output.
    Pretty,
    /// Newline-delimited JSON.
    Json,
}

/// `[logging]`: log verbosity and format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, used when `RUST_LOG` is unset.
    pub level: String,
    /// Line format.
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Compact,
        }
    }
}

impl LoggingConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.level.trim().is_empty() {
            return Err(ConfigError::Invalid("logging.level cannot be empty"));
        }
        Ok(())
    }
}

/// `[[known_apps]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KnownApp {
    /// App name as it will register.
    pub name: String,
    /// Informational launch hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl KnownApp {
    /// Returns the validated app name.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidKnownApp`] when the name is not a valid
    /// app name.
    pub fn app_name(&self) -> ConfigResult<AppName> {
        AppName::new(self.name.as_str()).map_err(|err| ConfigError::InvalidKnownApp {
            name: self.name.clone(),
            reason: err.to_string(),
        })
    }
}
