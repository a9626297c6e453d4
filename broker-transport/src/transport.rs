//! Narrow capability interface implemented by concrete carriers.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::TransportResult;
use crate::line::{LineReceiver, LineSender};

/// Sending half of a connection carrying messages of type `M`.
#[async_trait]
pub trait MessageSink<M>: Send + Sync
where
    M: Send + Sync + 'static,
{
    /// Queues `message`; messages on one connection arrive in send order.
    async fn send(&self, message: &M) -> TransportResult<()>;

    /// Returns `true` while the connection is usable.
    fn is_connected(&self) -> bool;

    /// Closes the connection.
    async fn disconnect(&self);
}

/// Receiving half of a connection carrying messages of type `M`.
#[async_trait]
pub trait MessageSource<M>: Send
where
    M: Send + 'static,
{
    /// Waits for the next message; `None` once the connection is closed.
    async fn recv(&mut self) -> Option<TransportResult<M>>;
}

/// Opens connections to an endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sending half produced by [`Transport::connect`].
    type Sink: Clone + Send + Sync + 'static;
    /// Receiving half produced by [`Transport::connect`].
    type Source: Send + 'static;

    /// Connects to `endpoint`.
    async fn connect(&self, endpoint: &str) -> TransportResult<(Self::Sink, Self::Source)>;
}

#[async_trait]
impl<M> MessageSink<M> for LineSender
where
    M: Serialize + Send + Sync + 'static,
{
    async fn send(&self, message: &M) -> TransportResult<()> {
        LineSender::send(self, message).await
    }

    fn is_connected(&self) -> bool {
        LineSender::is_connected(self)
    }

    async fn disconnect(&self) {
        LineSender::disconnect(self).await;
    }
}

#[async_trait]
impl<M> MessageSource<M> for LineReceiver
where
    M: DeserializeOwned + Send + 'static,
{
    async fn recv(&mut self) -> Option<TransportResult<M>> {
        LineReceiver::recv(self).await
    }
}
