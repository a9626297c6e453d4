//! Connection from an app process to the broker.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use broker_primitives::ToolInvocation;
use broker_transport::{
    AppMessage, MessageSink, MessageSource, TcpTransport, Transport, TransportError,
};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::executor::ToolExecutor;

/// Result alias for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced while connecting or serving.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Reconnect configuration was invalid.
    #[error("invalid reconnect configuration: {0}")]
    InvalidConfig(&'static str),
    /// Transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Backoff used by [`AppClient::run_until`] between connection attempts.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectConfig {
    initial_retry_delay: Duration,
    max_retry_delay: Duration,
}

impl ReconnectConfig {
    /// Creates a new configuration.
    #[must_use]
    pub const fn new(initial_retry_delay: Duration, max_retry_delay: Duration) -> Self {
        Self {
            initial_retry_delay,
            max_retry_delay,
        }
    }

    /// Returns the initial retry delay.
    #[must_use]
    pub const fn initial_retry_delay(self) -> Duration {
        self.initial_retry_delay
    }

    /// Returns the maximum retry delay.
    #[must_use]
    pub const fn max_retry_delay(self) -> Duration {
        self.max_retry_delay
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidConfig`] when either delay is zero or the
    /// bounds are inconsistent.
    pub fn validate(self) -> ClientResult<()> {
        if self.initial_retry_delay.is_zero() {
            return Err(ClientError::InvalidConfig(
                "initial retry delay must be greater than zero",
            ));
        }
        if self.max_retry_delay.is_zero() {
            return Err(ClientError::InvalidConfig(
                "max retry delay must be greater than zero",
            ));
        }
        if self.initial_retry_delay > self.max_retry_delay {
            return Err(ClientError::InvalidConfig(
                "initial retry delay cannot exceed max retry delay",
            ));
        }
        Ok(())
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(30),
        }
    }
}

/// Connects an app's [`ToolExecutor`] to a broker.
pub struct AppClient<T = TcpTransport> {
    endpoint: String,
    executor: Arc<ToolExecutor>,
    transport: T,
    reconnect: ReconnectConfig,
}

impl<T> fmt::Debug for AppClient<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppClient")
            .field("endpoint", &self.endpoint)
            .field("app_name", self.executor.app_name())
            .field("reconnect", &self.reconnect)
            .finish_non_exhaustive()
    }
}

impl AppClient<TcpTransport> {
    /// Creates a client that dials the broker over TCP.
    #[must_use]
    pub fn new(endpoint: impl Into<String>, executor: Arc<ToolExecutor>) -> Self {
        Self::with_transport(endpoint, executor, TcpTransport::default())
    }
}

impl<T> AppClient<T>
where
    T: Transport,
    T::Sink: MessageSink<AppMessage>,
    T::Source: MessageSource<AppMessage>,
{
    /// Creates a client over a custom transport.
    #[must_use]
    pub fn with_transport(
        endpoint: impl Into<String>,
        executor: Arc<ToolExecutor>,
        transport: T,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            executor,
            transport,
            reconnect: ReconnectConfig::default(),
        }
    }

    /// Overrides the reconnect backoff.
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Returns the executor served by this client.
    #[must_use]
    pub fn executor(&self) -> &Arc<ToolExecutor> {
        &self.executor
    }

    /// Connects once and sends the registration frame.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Transport`] when the broker is unreachable or the
    /// registration cannot be sent.
    pub async fn connect(&self) -> ClientResult<AppSession<T::Sink, T::Source>> {
        let (sink, source) = self.transport.connect(&self.endpoint).await?;
        sink.send(&self.executor.registration()).await?;
        info!(
            app = %self.executor.app_name(),
            endpoint = %self.endpoint,
            "registered with broker"
        );
        Ok(AppSession {
            sink,
            source,
            executor: Arc::clone(&self.executor),
        })
    }

    /// Keeps the app connected until `shutdown` resolves, reconnecting with
    /// exponential backoff and re-registering after every loss.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidConfig`] if the backoff is invalid.
    pub async fn run_until<F>(&self, shutdown: F) -> ClientResult<()>
    where
        F: Future<Output = ()>,
    {
        self.reconnect.validate()?;
        tokio::pin!(shutdown);

        let mut retry_delay = self.reconnect.initial_retry_delay();
        loop {
            let attempt = async {
                match self.connect().await {
                    Ok(session) => {
                        session.serve().await;
                        true
                    }
                    Err(err) => {
                        warn!(?err, endpoint = %self.endpoint, "broker connection failed; retrying");
                        false
                    }
                }
            };

            let served = tokio::select! {
                () = &mut shutdown => break,
                served = attempt => served,
            };

            if served {
                info!(app = %self.executor.app_name(), "broker connection lost; reconnecting");
                retry_delay = self.reconnect.initial_retry_delay();
            }

            tokio::select! {
                () = &mut shutdown => break,
                () = sleep(retry_delay) => {}
            }
            if !served {
                retry_delay = (retry_delay * 2).min(self.reconnect.max_retry_delay());
            }
        }

        info!(app = %self.executor.app_name(), "app client stopped");
        Ok(())
    }
}

/// One live, registered connection to the broker.
pub struct AppSession<S, R> {
    sink: S,
    source: R,
    executor: Arc<ToolExecutor>,
}

impl<S, R> fmt::Debug for AppSession<S, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppSession")
            .field("app_name", self.executor.app_name())
            .finish_non_exhaustive()
    }
}

impl<S, R> AppSession<S, R>
where
    S: MessageSink<AppMessage> + Clone + 'static,
    R: MessageSource<AppMessage>,
{
    /// Returns the sending half, e.g. to disconnect from another task.
    #[must_use]
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Serves invocations until the connection closes.
    ///
    /// Each invocation runs on its own task so a slow tool never holds up the
    /// others; responses share the connection's ordered writer.
    pub async fn serve(mut self) {
        let app = self.executor.app_name().clone();

        while let Some(frame) = self.source.recv().await {
            match frame {
                Ok(AppMessage::ToolInvocation {
                    correlation_id,
                    tool,
                    parameters,
                }) => {
                    debug!(app = %app, %correlation_id, %tool, "invocation received");
                    let executor = Arc::clone(&self.executor);
                    let sink = self.sink.clone();
                    tokio::spawn(async move {
                        let result = executor
                            .execute(ToolInvocation::new(tool, parameters))
                            .await;
                        let response = AppMessage::ToolResponse {
                            correlation_id,
                            result,
                        };
                        if let Err(err) = sink.send(&response).await {
                            warn!(%correlation_id, %err, "failed to send tool response");
                        }
                    });
                }
                Ok(other) => {
                    debug!(app = %app, kind = other.kind(), "ignoring unexpected message");
                }
                Err(err) if !err.is_fatal() => {
                    warn!(app = %app, %err, "dropping malformed message");
                }
                Err(err) => {
                    warn!(app = %app, %err, "broker connection failed");
                    break;
                }
            }
        }

        debug!(app = %app, "session ended");
    }

    /// Closes the connection.
    pub async fn disconnect(&self) {
        self.sink.disconnect().await;
    }
}
