//! Core shared types for the tool broker and the apps that register with it.

#![warn(missing_docs, clippy::pedantic)]

mod error;
mod ids;
mod names;
mod result;
mod tool;

/// Error type and result alias shared across the workspace.
pub use error::{Error, Result};
/// Process-local identifiers for calls and connections.
pub use ids::{ConnectionId, CorrelationId};
/// App identity and tool namespacing helpers.
pub use names::{AppName, NAMESPACE_SEPARATOR, namespace_tool, split_tool_name};
/// Terminal call outcomes.
pub use result::{FailureKind, ToolResult};
/// Tool catalog entries and per-call invocations.
pub use tool::{ToolDefinition, ToolInvocation};
