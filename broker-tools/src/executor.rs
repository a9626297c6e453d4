//! Runtime registry for an app's tools and their handlers.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use broker_primitives::{AppName, ToolDefinition, ToolInvocation, ToolResult};
use broker_transport::AppMessage;
use futures::FutureExt;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

/// Result alias for executor operations.
pub type ExecutorResult<T> = Result<T, ToolError>;

/// Named parameters handed to a tool.
pub type Parameters = Map<String, Value>;

/// Trait implemented by tool handlers.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Runs the tool with the invocation's parameters.
    async fn invoke(&self, parameters: Parameters) -> ExecutorResult<Value>;
}

#[async_trait]
impl<F, Fut> Tool for F
where
    F: Send + Sync + Fn(Parameters) -> Fut,
    Fut: Future<Output = ExecutorResult<Value>> + Send,
{
    async fn invoke(&self, parameters: Parameters) -> ExecutorResult<Value> {
        (self)(parameters).await
    }
}

/// Handle returned by the executor for direct invocation.
#[derive(Clone)]
pub struct ToolHandle {
    definition: ToolDefinition,
    handler: Arc<dyn Tool>,
}

impl ToolHandle {
    /// Returns the namespaced definition.
    #[must_use]
    pub fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    /// Runs the handler, converting returned errors and panics into failure
    /// results.
    pub async fn invoke(&self, parameters: Parameters) -> ToolResult {
        let outcome = AssertUnwindSafe(self.handler.invoke(parameters))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(payload)) => ToolResult::success(payload),
            Ok(Err(err)) => {
                debug!(tool = %self.definition.name(), %err, "tool returned an error");
                ToolResult::execution_error(err.reason())
            }
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                warn!(tool = %self.definition.name(), %reason, "tool panicked");
                ToolResult::execution_error(reason)
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "tool panicked".to_owned()
    }
}

/// Holds an app's tools keyed by their namespaced name (`"{app}:{tool}"`).
///
/// Registration happens before the app connects; afterwards the map is only
/// read, so concurrent invocations never contend on it.
pub struct ToolExecutor {
    app_name: AppName,
    tools: RwLock<HashMap<String, ToolHandle>>,
}

impl std::fmt::Debug for ToolExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self
            .tools
            .read()
            .map(|tools| tools.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("ToolExecutor")
            .field("app_name", &self.app_name)
            .field("registered", &names)
            .finish()
    }
}

impl ToolExecutor {
    /// Creates an empty executor for `app_name`.
    #[must_use]
    pub fn new(app_name: AppName) -> Self {
        Self {
            app_name,
            tools: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the owning app's name.
    #[must_use]
    pub fn app_name(&self) -> &AppName {
        &self.app_name
    }

    /// Registers a handler under the definition's namespaced name.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::InvalidDefinition`] if the name cannot be
    /// namespaced under this app, or [`ToolError::DuplicateTool`] if it is
    /// already present.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn register_tool<T>(&self, definition: ToolDefinition, handler: T) -> ExecutorResult<()>
    where
        T: Tool + 'static,
    {
        let definition =
            definition
                .namespaced(&self.app_name)
                .map_err(|err| ToolError::InvalidDefinition {
                    reason: err.to_string(),
                })?;

        let mut tools = self.tools.write().expect("tool executor poisoned");
        let name = definition.name().to_owned();
        if tools.contains_key(&name) {
            return Err(ToolError::DuplicateTool { name });
        }

        debug!(tool = %name, "tool registered");
        tools.insert(
            name,
            ToolHandle {
                definition,
                handler: Arc::new(handler),
            },
        );
        Ok(())
    }

    /// Returns a handle to the tool with the exact namespaced name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<ToolHandle> {
        let tools = self.tools.read().ok()?;
        tools.get(name).cloned()
    }

    /// Runs an invocation. Never fails: unknown tools and handler faults come
    /// back as failure results.
    pub async fn execute(&self, invocation: ToolInvocation) -> ToolResult {
        let Some(handle) = self.get(&invocation.tool_name) else {
            debug!(tool = %invocation.tool_name, "invocation for unknown tool");
            return ToolResult::tool_not_found(&invocation.tool_name);
        };
        handle.invoke(invocation.parameters).await
    }

    /// Namespaced definitions of every registered tool, sorted by name.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let tools = self.tools.read().expect("tool executor poisoned");
        let mut definitions: Vec<_> = tools
            .values()
            .map(|handle| handle.definition.clone())
            .collect();
        definitions.sort_by(|a, b| a.name().cmp(b.name()));
        definitions
    }

    /// Builds the registration frame sent on connect.
    #[must_use]
    pub fn registration(&self) -> AppMessage {
        AppMessage::Register {
            app_name: self.app_name.to_string(),
            tools: self.definitions(),
        }
    }
}

/// Errors produced by tool registration and handlers.
#[derive(Debug, Error)]
pub enum ToolError {
    /// Tool definition failed validation.
    #[error("invalid tool definition: {reason}")]
    InvalidDefinition {
        /// Human-readable reason for rejection.
        reason: String,
    },

    /// Tool name collided with an existing registration.
    #[error("tool `{name}` is already registered")]
    DuplicateTool {
        /// Name of the offending tool.
        name: String,
    },

    /// Tool execution failed.
    #[error("tool execution failed: {reason}")]
    Execution {
        /// Human-readable error returned by the tool implementation.
        reason: String,
    },
}

impl ToolError {
    /// Creates an execution error from the supplied reason.
    #[must_use]
    pub fn execution(reason: impl Into<String>) -> Self {
        Self::Execution {
            reason: reason.into(),
        }
    }

    fn reason(&self) -> String {
        match self {
            Self::Execution { reason } => reason.clone(),
            other => other.to_string(),
        }
    }
}
