//! Transport error definitions.

use std::io;

use thiserror::Error;

/// Result alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors surfaced by connections and listeners.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Could not open a connection to the endpoint.
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        /// Endpoint that was dialed.
        endpoint: String,
        /// Underlying socket error.
        #[source]
        source: io::Error,
    },

    /// Could not bind a listener.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: String,
        /// Underlying socket error.
        #[source]
        source: io::Error,
    },

    /// Socket-level I/O failure; the connection is gone.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// A received line exceeded the frame limit; the connection is gone.
    #[error("frame exceeds {max} bytes")]
    FrameTooLong {
        /// Configured frame limit.
        max: usize,
    },

    /// A received line was not a valid message. Only that line is dropped.
    #[error("malformed message: {reason}")]
    Decode {
        /// Parser diagnostic.
        reason: String,
    },

    /// An outbound message could not be serialized.
    #[error("failed to encode message: {reason}")]
    Encode {
        /// Serializer diagnostic.
        reason: String,
    },

    /// The connection is already closed.
    #[error("connection closed")]
    Closed,
}

impl TransportError {
    /// Returns `true` when the error ends the connection, `false` when only the
    /// offending message was dropped.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::Decode { .. } | Self::Encode { .. })
    }
}
