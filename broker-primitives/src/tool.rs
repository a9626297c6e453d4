//! Tool catalog entries and invocations.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::{Error, Result};
use crate::names::{AppName, split_tool_name};

/// Describes a callable tool as advertised for discovery.
///
/// Inside an app the name is the local name (`Add`); once registered with a
/// broker it is namespaced (`Calc:Add`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default = "empty_object_schema")]
    input_schema: Value,
}

fn empty_object_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

impl ToolDefinition {
    /// Creates a definition with an empty object input schema.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: empty_object_schema(),
        }
    }

    /// Replaces the JSON schema describing accepted parameters.
    #[must_use]
    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    /// Returns the tool name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the human-readable description.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Returns the input schema.
    #[must_use]
    pub fn input_schema(&self) -> &Value {
        &self.input_schema
    }

    /// Returns a copy namespaced under `app`.
    ///
    /// Names already carrying `app`'s prefix are kept as-is.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ForeignNamespace`] when the name is qualified with a
    /// different app, or [`Error::InvalidToolName`] when the local part is
    /// invalid.
    pub fn namespaced(&self, app: &AppName) -> Result<Self> {
        let name = match split_tool_name(&self.name) {
            Some((owner, local)) if owner == app.as_str() => app.qualify(local)?,
            Some(_) => {
                return Err(Error::ForeignNamespace {
                    tool: self.name.clone(),
                    app: app.to_string(),
                });
            }
            None => app.qualify(&self.name)?,
        };

        Ok(Self {
            name,
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
        })
    }
}

/// A single request to run a tool. Built per call and never retained.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
    /// Fully qualified tool name.
    pub tool_name: String,
    /// Named parameters passed to the handler.
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl ToolInvocation {
    /// Creates an invocation for the supplied tool and parameters.
    #[must_use]
    pub fn new(tool_name: impl Into<String>, parameters: Map<String, Value>) -> Self {
        Self {
            tool_name: tool_name.into(),
            parameters,
        }
    }
}
