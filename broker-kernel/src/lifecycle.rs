//! Lifecycle state machine for app connections.

use broker_primitives::ConnectionId;
use thiserror::Error;
use tracing::debug;

/// States an app connection moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted; no registration received yet.
    Connecting,
    /// Registration accepted and recorded in the registry.
    Registered,
    /// Serving invocations.
    Active,
    /// Closed; no further traffic is processed.
    Disconnected,
}

impl ConnectionState {
    /// Returns `true` once the connection has an app name bound to it.
    #[must_use]
    pub const fn is_registered(self) -> bool {
        matches!(self, Self::Registered | Self::Active)
    }

    /// Returns `true` once the connection is closed.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected)
    }
}

/// Events that trigger lifecycle transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// First registration frame accepted.
    Register,
    /// Session entered its serving loop.
    Activate,
    /// Registration frame received on an already active connection.
    Reregister,
    /// Connection closed or failed.
    Disconnect,
}

/// Per-connection lifecycle tracker.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLifecycle {
    connection_id: ConnectionId,
    state: ConnectionState,
}

impl ConnectionLifecycle {
    /// Starts tracking a freshly accepted connection.
    #[must_use]
    pub const fn new(connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            state: ConnectionState::Connecting,
        }
    }

    /// Returns the tracked connection.
    #[must_use]
    pub const fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Returns the current state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Applies an event, returning the resulting state.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidTransition`] when the event is not
    /// allowed from the current state.
    pub fn transition(&mut self, event: ConnectionEvent) -> LifecycleResult<ConnectionState> {
        let next = match (self.state, event) {
            (ConnectionState::Connecting, ConnectionEvent::Register) => {
                Some(ConnectionState::Registered)
            }
            (ConnectionState::Registered, ConnectionEvent::Activate)
            | (ConnectionState::Active, ConnectionEvent::Reregister) => {
                Some(ConnectionState::Active)
            }
            (_, ConnectionEvent::Disconnect) => Some(ConnectionState::Disconnected),
            _ => None,
        };

        let Some(next_state) = next else {
            return Err(LifecycleError::InvalidTransition {
                connection_id: self.connection_id,
                from: self.state,
                event,
            });
        };

        if next_state != self.state {
            debug!(
                connection = %self.connection_id,
                ?self.state,
                ?next_state,
                ?event,
                "connection lifecycle transition"
            );
            self.state = next_state;
        }

        Ok(self.state)
    }
}

/// Errors emitted by the lifecycle tracker.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Transition was not permitted from the current state.
    #[error("invalid lifecycle transition from {from:?} via {event:?} for {connection_id}")]
    InvalidTransition {
        /// Connection whose transition failed.
        connection_id: ConnectionId,
        /// State prior to the attempted transition.
        from: ConnectionState,
        /// Event that triggered the failure.
        event: ConnectionEvent,
    },
}

/// Result alias used for lifecycle operations.
pub type LifecycleResult<T> = Result<T, LifecycleError>;
