//! Message transport for the tool broker.
//!
//! Connections carry newline-delimited JSON frames. The [`Transport`],
//! [`MessageSink`] and [`MessageSource`] traits form the capability seam;
//! [`TcpTransport`] and [`TcpLineListener`] are the stream-socket carrier, and
//! [`AppMessage`] is the app-facing wire vocabulary.

#![warn(missing_docs, clippy::pedantic)]

mod error;
mod line;
mod stdio;
mod tcp;
mod transport;
mod wire;

pub use error::{TransportError, TransportResult};
pub use line::{
    ConnectionStatus, DEFAULT_MAX_FRAME_BYTES, LineReceiver, LineSender, line_channel,
};
pub use stdio::stdio_channel;
pub use tcp::{TcpLineListener, TcpTransport};
pub use transport::{MessageSink, MessageSource, Transport};
pub use wire::AppMessage;
