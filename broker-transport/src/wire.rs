//! Wire-level messages exchanged between the broker and app processes.

use broker_primitives::{CorrelationId, ToolDefinition, ToolInvocation, ToolResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One newline-delimited frame on an app connection, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum AppMessage {
    /// App -> broker: declares the app identity and its full tool catalog.
    Register {
        /// Namespace and registry key for the app.
        app_name: String,
        /// Tools offered by the app.
        #[serde(default)]
        tools: Vec<ToolDefinition>,
    },
    /// Broker -> app: run a tool for the call identified by `correlation_id`.
    ToolInvocation {
        /// Token echoed back in the response.
        correlation_id: CorrelationId,
        /// Fully qualified tool name.
        tool: String,
        /// Named parameters.
        #[serde(default)]
        parameters: Map<String, Value>,
    },
    /// App -> broker: outcome of a previous invocation.
    ToolResponse {
        /// Token copied from the invocation.
        correlation_id: CorrelationId,
        /// Call outcome.
        result: ToolResult,
    },
}

impl AppMessage {
    /// Builds an invocation frame.
    #[must_use]
    pub fn invocation(correlation_id: CorrelationId, invocation: ToolInvocation) -> Self {
        Self::ToolInvocation {
            correlation_id,
            tool: invocation.tool_name,
            parameters: invocation.parameters,
        }
    }

    /// Returns the `type` discriminator, for logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::ToolInvocation { .. } => "toolInvocation",
            Self::ToolResponse { .. } => "toolResponse",
        }
    }
}
