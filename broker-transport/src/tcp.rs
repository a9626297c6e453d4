//! Stream-socket carrier for line channels.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use crate::error::{TransportError, TransportResult};
use crate::line::{DEFAULT_MAX_FRAME_BYTES, LineReceiver, LineSender, line_channel};
use crate::transport::Transport;

/// Dials TCP endpoints and frames them as line channels.
#[derive(Debug, Clone, Copy)]
pub struct TcpTransport {
    max_frame_bytes: usize,
}

impl TcpTransport {
    /// Creates a transport with the supplied frame limit.
    #[must_use]
    pub const fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    type Sink = LineSender;
    type Source = LineReceiver;

    async fn connect(&self, endpoint: &str) -> TransportResult<(LineSender, LineReceiver)> {
        let stream = TcpStream::connect(endpoint)
            .await
            .map_err(|source| TransportError::Connect {
                endpoint: endpoint.to_owned(),
                source,
            })?;
        stream.set_nodelay(true)?;
        debug!(%endpoint, "connected");
        let (reader, writer) = stream.into_split();
        Ok(line_channel(reader, writer, endpoint, self.max_frame_bytes))
    }
}

/// Accepts TCP connections and frames them as line channels.
#[derive(Debug)]
pub struct TcpLineListener {
    listener: TcpListener,
    max_frame_bytes: usize,
}

impl TcpLineListener {
    /// Binds `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Bind`] when the address is unavailable.
    pub async fn bind(addr: &str, max_frame_bytes: usize) -> TransportResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.to_owned(),
                source,
            })?;
        Ok(Self {
            listener,
            max_frame_bytes,
        })
    }

    /// Returns the bound address, useful when binding port `0`.
    ///
    /// # Errors
    ///
    /// Propagates the socket error.
    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Waits for the next connection.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] when accepting fails.
    pub async fn accept(&self) -> TransportResult<(LineSender, LineReceiver, SocketAddr)> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        let (sender, receiver) =
            line_channel(reader, writer, peer.to_string(), self.max_frame_bytes);
        Ok((sender, receiver, peer))
    }
}
