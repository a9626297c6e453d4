//! Tool broker: routes agent tool calls to the app processes that registered
//! them.
//!
//! This crate bundles the internal broker crates behind feature flags and
//! ships the `tool-broker` binary.

#![warn(missing_docs, clippy::pedantic)]

/// Re-export shared primitives for convenience.
pub use broker_primitives as primitives;

/// Line transport and app wire messages.
pub use broker_transport as transport;

/// Registry, correlator and session loops.
pub use broker_kernel as kernel;

/// App-side executor and client (enabled by `tools` feature).
#[cfg(feature = "tools")]
pub use broker_tools as tools;

/// Configuration schema and loader (enabled by `config` feature).
#[cfg(feature = "config")]
pub use broker_config as config;

/// Log subscriber installation (enabled by `telemetry` feature).
#[cfg(feature = "telemetry")]
pub use broker_telemetry as telemetry;

#[cfg(feature = "config")]
mod bootstrap {
    use std::num::NonZeroUsize;

    use broker_config::{BrokerConfig, ConfigError};
    use broker_kernel::{Broker, BrokerSettings};
    use tracing::debug;

    /// Converts loaded configuration into broker settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the connection cap is zero.
    pub fn settings_from_config(config: &BrokerConfig) -> Result<BrokerSettings, ConfigError> {
        let max_connections = NonZeroUsize::new(config.listener.max_connections).ok_or(
            ConfigError::Invalid("listener.max_connections must be greater than zero"),
        )?;
        Ok(BrokerSettings::new(
            config.calls.default_timeout(),
            max_connections,
            config.listener.max_frame_bytes,
        ))
    }

    /// Builds a broker from configuration, seeding the known-app list.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when a limit or a known app name is
    /// invalid.
    pub fn broker_from_config(config: &BrokerConfig) -> Result<Broker, ConfigError> {
        let broker = Broker::new(settings_from_config(config)?);
        for known in &config.known_apps {
            let name = known.app_name()?;
            debug!(app = %name, "known app");
            broker.add_known_app(name, known.endpoint.clone());
        }
        Ok(broker)
    }
}

#[cfg(feature = "config")]
pub use bootstrap::{broker_from_config, settings_from_config};
