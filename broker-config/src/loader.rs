//! Layered configuration loading.

use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use tracing::debug;

use crate::schema::BrokerConfig;
use crate::{ConfigError, ConfigResult};

/// Prefix for environment overrides, e.g. `TOOL_BROKER_LISTENER__BIND`.
pub const ENV_PREFIX: &str = "TOOL_BROKER_";

/// Merges built-in defaults, an optional TOML file, and environment
/// variables, later sources winning.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    file: Option<PathBuf>,
    env_prefix: String,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Creates a loader reading defaults and `TOOL_BROKER_*` variables.
    #[must_use]
    pub fn new() -> Self {
        Self {
            file: None,
            env_prefix: ENV_PREFIX.to_owned(),
        }
    }

    /// Adds a TOML file between the defaults and the environment.
    #[must_use]
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Overrides the environment prefix.
    #[must_use]
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Returns the configured file, if any.
    #[must_use]
    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    /// Builds the merged provider stack.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingFile`] when the configured file does not
    /// exist.
    pub fn figment(&self) -> ConfigResult<Figment> {
        let mut figment = Figment::new().merge(Serialized::defaults(BrokerConfig::default()));

        if let Some(path) = &self.file {
            if !path.is_file() {
                return Err(ConfigError::MissingFile { path: path.clone() });
            }
            debug!(path = %path.display(), "loading configuration file");
            figment = figment.merge(Toml::file(path));
        }

        Ok(figment.merge(Env::prefixed(&self.env_prefix).split("__")))
    }

    /// Extracts the merged configuration without validating it, so callers
    /// can apply command-line overrides first.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingFile`] or [`ConfigError::Load`] when a
    /// source cannot be read or does not match the schema.
    pub fn extract(&self) -> ConfigResult<BrokerConfig> {
        self.figment()?
            .extract()
            .map_err(|err| ConfigError::Load(Box::new(err)))
    }

    /// Extracts and validates the merged configuration.
    ///
    /// # Errors
    ///
    /// Propagates [`extract`](Self::extract) and
    /// [`BrokerConfig::validate`] failures.
    pub fn load(&self) -> ConfigResult<BrokerConfig> {
        let config = self.extract()?;
        config.validate()?;
        Ok(config)
    }
}
