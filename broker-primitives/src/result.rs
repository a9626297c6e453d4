//! Terminal outcome of a tool call.

use std::fmt::{self, Display, Formatter};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Category of a failed call.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    /// No connected app advertises the tool.
    ToolNotFound,
    /// The app-side handler returned an error or panicked.
    ExecutionError,
    /// No response arrived within the call window.
    Timeout,
    /// The owning app's connection dropped before it replied.
    AppDisconnected,
}

impl FailureKind {
    /// Stable camelCase label used on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ToolNotFound => "toolNotFound",
            Self::ExecutionError => "executionError",
            Self::Timeout => "timeout",
            Self::AppDisconnected => "appDisconnected",
        }
    }
}

impl Display for FailureKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a tool call: a success payload or a failure message.
///
/// Wire shape: `{"success": true, "payload": ...}` or
/// `{"success": false, "errorMessage": "...", "errorKind": "..."}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_kind: Option<FailureKind>,
}

impl ToolResult {
    /// Creates a successful result carrying `payload`.
    #[must_use]
    pub fn success(payload: Value) -> Self {
        Self {
            success: true,
            payload: Some(payload),
            error_message: None,
            error_kind: None,
        }
    }

    /// Creates a failed result of the given kind.
    #[must_use]
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            payload: None,
            error_message: Some(message.into()),
            error_kind: Some(kind),
        }
    }

    /// Failure for a tool that nobody advertises.
    #[must_use]
    pub fn tool_not_found(tool: &str) -> Self {
        Self::failure(FailureKind::ToolNotFound, format!("tool not found: {tool}"))
    }

    /// Failure raised by a tool handler.
    #[must_use]
    pub fn execution_error(reason: impl Display) -> Self {
        Self::failure(FailureKind::ExecutionError, format!("execution error: {reason}"))
    }

    /// Failure for a call that outlived its window.
    #[must_use]
    pub fn timeout(window: Duration) -> Self {
        Self::failure(
            FailureKind::Timeout,
            format!("timeout: no response within {} ms", window.as_millis()),
        )
    }

    /// Failure for a call whose owning app went away.
    #[must_use]
    pub fn app_disconnected(app: impl Display) -> Self {
        Self::failure(
            FailureKind::AppDisconnected,
            format!("app disconnected: {app}"),
        )
    }

    /// Returns `true` for successful results.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.success
    }

    /// Returns the payload of a successful result.
    #[must_use]
    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref()
    }

    /// Returns the failure message.
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// Returns the failure kind; failures reported without one count as
    /// execution errors.
    #[must_use]
    pub fn failure_kind(&self) -> Option<FailureKind> {
        if self.success {
            None
        } else {
            Some(self.error_kind.unwrap_or(FailureKind::ExecutionError))
        }
    }
}
