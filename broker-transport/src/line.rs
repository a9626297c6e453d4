//! Newline-delimited JSON channel over any async byte stream.
//!
//! Each frame is one compact JSON document followed by `\n`. Outbound frames
//! go through a single writer task per connection, so concurrent senders never
//! interleave bytes and per-connection send order is preserved.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

use crate::error::{TransportError, TransportResult};

/// Default upper bound for a single received frame.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

const OUTBOUND_QUEUE: usize = 512;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Shared liveness flag for one connection.
///
/// The transition to disconnected happens exactly once, no matter how many
/// parties (reader, writer, explicit disconnect) observe the loss.
#[derive(Clone)]
pub struct ConnectionStatus {
    connected: Arc<AtomicBool>,
    changes: Arc<watch::Sender<bool>>,
}

impl fmt::Debug for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionStatus")
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStatus {
    /// Creates a status in the connected state.
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = watch::channel(true);
        Self {
            connected: Arc::new(AtomicBool::new(true)),
            changes: Arc::new(changes),
        }
    }

    /// Returns `true` while the connection is usable.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Flags the connection as lost. Returns `true` only for the call that
    /// performed the transition.
    pub fn mark_disconnected(&self) -> bool {
        if self.connected.swap(false, Ordering::AcqRel) {
            self.changes.send_replace(false);
            true
        } else {
            false
        }
    }

    /// Resolves once the connection has been flagged as lost.
    pub async fn closed(&self) {
        let mut changes = self.changes.subscribe();
        // The sender lives as long as `self`, so `wait_for` cannot fail here.
        let _ = changes.wait_for(|connected| !*connected).await;
    }
}

enum Outbound {
    Frame(String),
    Close,
}

/// Cloneable sending half of a line channel.
#[derive(Clone)]
pub struct LineSender {
    outbound: mpsc::Sender<Outbound>,
    status: ConnectionStatus,
    peer: Arc<str>,
}

impl fmt::Debug for LineSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineSender")
            .field("peer", &self.peer)
            .field("connected", &self.status.is_connected())
            .finish()
    }
}

impl LineSender {
    /// Serializes `message` and queues it for the writer task.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Encode`] if serialization fails or
    /// [`TransportError::Closed`] once the connection is gone.
    pub async fn send<T>(&self, message: &T) -> TransportResult<()>
    where
        T: Serialize + ?Sized,
    {
        if !self.status.is_connected() {
            return Err(TransportError::Closed);
        }
        let frame = serde_json::to_string(message).map_err(|err| TransportError::Encode {
            reason: err.to_string(),
        })?;
        self.outbound
            .send(Outbound::Frame(frame))
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Flags the connection as closed and asks the writer to shut down after
    /// flushing frames already queued.
    pub async fn disconnect(&self) {
        if self.status.mark_disconnected() {
            debug!(peer = %self.peer, "disconnect requested");
        }
        let _ = self.outbound.send(Outbound::Close).await;
    }

    /// Returns `true` while the connection is usable.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.status.is_connected()
    }

    /// Returns the shared liveness flag.
    #[must_use]
    pub fn status(&self) -> &ConnectionStatus {
        &self.status
    }

    /// Returns the peer label used in logs.
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.peer
    }
}

/// Receiving half of a line channel.
pub struct LineReceiver {
    frames: FramedRead<BoxedReader, LinesCodec>,
    status: ConnectionStatus,
    max_frame_bytes: usize,
    peer: Arc<str>,
}

impl fmt::Debug for LineReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineReceiver")
            .field("peer", &self.peer)
            .field("max_frame_bytes", &self.max_frame_bytes)
            .finish_non_exhaustive()
    }
}

impl LineReceiver {
    /// Waits for the next frame and decodes it as `M`.
    ///
    /// Returns `None` once the connection is closed. A
    /// [`TransportError::Decode`] item means only that line was dropped and the
    /// caller may keep reading; any other error is the last item before `None`.
    pub async fn recv<M>(&mut self) -> Option<TransportResult<M>>
    where
        M: DeserializeOwned,
    {
        loop {
            let next = tokio::select! {
                biased;
                () = self.status.closed() => return None,
                next = self.frames.next() => next,
            };

            match next {
                None => {
                    if self.status.mark_disconnected() {
                        debug!(peer = %self.peer, "peer closed connection");
                    }
                    return None;
                }
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    self.status.mark_disconnected();
                    return Some(Err(TransportError::FrameTooLong {
                        max: self.max_frame_bytes,
                    }));
                }
                Some(Err(LinesCodecError::Io(err))) => {
                    self.status.mark_disconnected();
                    return Some(Err(TransportError::Io(err)));
                }
                Some(Ok(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    return Some(serde_json::from_str(trimmed).map_err(|err| {
                        TransportError::Decode {
                            reason: err.to_string(),
                        }
                    }));
                }
            }
        }
    }

    /// Returns the shared liveness flag.
    #[must_use]
    pub fn status(&self) -> &ConnectionStatus {
        &self.status
    }

    /// Returns the peer label used in logs.
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.peer
    }
}

/// Wraps a reader/writer pair in a line channel and spawns its writer task.
///
/// Must be called from within a `tokio` runtime.
pub fn line_channel<R, W>(
    reader: R,
    writer: W,
    peer: impl Into<String>,
    max_frame_bytes: usize,
) -> (LineSender, LineReceiver)
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let peer: Arc<str> = Arc::from(peer.into());
    let status = ConnectionStatus::new();
    let (outbound, queue) = mpsc::channel(OUTBOUND_QUEUE);

    let sink = FramedWrite::new(Box::new(writer) as BoxedWriter, LinesCodec::new());
    tokio::spawn(run_writer(sink, queue, status.clone(), Arc::clone(&peer)));

    let frames = FramedRead::new(
        Box::new(reader) as BoxedReader,
        LinesCodec::new_with_max_length(max_frame_bytes),
    );

    (
        LineSender {
            outbound,
            status: status.clone(),
            peer: Arc::clone(&peer),
        },
        LineReceiver {
            frames,
            status,
            max_frame_bytes,
            peer,
        },
    )
}

async fn run_writer(
    mut sink: FramedWrite<BoxedWriter, LinesCodec>,
    mut queue: mpsc::Receiver<Outbound>,
    status: ConnectionStatus,
    peer: Arc<str>,
) {
    loop {
        let next = tokio::select! {
            next = queue.recv() => next,
            () = status.closed() => {
                // Flush whatever was queued before the loss was observed.
                while let Ok(Outbound::Frame(frame)) = queue.try_recv() {
                    if sink.feed(frame).await.is_err() {
                        break;
                    }
                }
                None
            }
        };

        match next {
            Some(Outbound::Frame(frame)) => {
                if let Err(err) = sink.send(frame).await {
                    warn!(peer = %peer, %err, "write failed; closing connection");
                    status.mark_disconnected();
                    break;
                }
            }
            Some(Outbound::Close) | None => break,
        }
    }

    let _ = SinkExt::<String>::close(&mut sink).await;
}
