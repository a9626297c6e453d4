//! App identity and tool-name namespacing.

use std::borrow::Borrow;
use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Separator between the owning app and the local tool name.
pub const NAMESPACE_SEPARATOR: char = ':';

const MAX_NAME_LEN: usize = 128;

/// Unique identity of an app process; doubles as the namespace for its tools.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AppName(String);

impl AppName {
    /// Creates an app name after validating its format.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAppName`] if the name is empty, too long, or
    /// contains whitespace or the namespace separator.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if let Some(reason) = name_violation(&name) {
            return Err(Error::InvalidAppName { name, reason });
        }
        Ok(Self(name))
    }

    /// Returns the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Qualifies a local tool name with this app's namespace.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidToolName`] when the local name is invalid.
    pub fn qualify(&self, local: &str) -> Result<String> {
        namespace_tool(self, local)
    }

    /// Returns `true` when the fully qualified tool name lives in this namespace.
    #[must_use]
    pub fn owns(&self, tool: &str) -> bool {
        split_tool_name(tool).is_some_and(|(app, _)| app == self.0)
    }
}

impl Display for AppName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for AppName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for AppName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for AppName {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<&str> for AppName {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl From<AppName> for String {
    fn from(value: AppName) -> Self {
        value.0
    }
}

/// Builds `"<app>:<local>"`.
///
/// # Errors
///
/// Returns [`Error::InvalidToolName`] if `local` is empty, too long, or
/// contains whitespace or the namespace separator.
pub fn namespace_tool(app: &AppName, local: &str) -> Result<String> {
    if let Some(reason) = name_violation(local) {
        return Err(Error::InvalidToolName {
            name: local.to_owned(),
            reason,
        });
    }
    Ok(format!("{app}{NAMESPACE_SEPARATOR}{local}"))
}

/// Splits a qualified name at its first separator into `(app, local)`.
///
/// Returns `None` when the name has no separator or either side is empty.
#[must_use]
pub fn split_tool_name(name: &str) -> Option<(&str, &str)> {
    let (app, local) = name.split_once(NAMESPACE_SEPARATOR)?;
    if app.is_empty() || local.is_empty() {
        return None;
    }
    Some((app, local))
}

fn name_violation(name: &str) -> Option<String> {
    if name.trim().is_empty() {
        return Some("name cannot be empty".into());
    }
    if name.len() > MAX_NAME_LEN {
        return Some(format!("name length must be <= {MAX_NAME_LEN}"));
    }
    if name.contains(NAMESPACE_SEPARATOR) {
        return Some(format!("name cannot contain `{NAMESPACE_SEPARATOR}`"));
    }
    if name.chars().any(char::is_whitespace) {
        return Some("name cannot contain whitespace".into());
    }
    None
}
