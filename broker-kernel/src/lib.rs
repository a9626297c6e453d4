//! Broker core: connected-app registry, call correlation, and the app- and
//! agent-facing session loops.
//!
//! [`Broker`] ties the pieces together. Apps connect to the listener returned
//! by [`Broker::bind_apps`] and register their tools; agents reach the same
//! broker through [`Broker::serve_agent`] (stdio or any line channel) or
//! [`Broker::serve_agents`] (TCP).

#![warn(missing_docs, clippy::pedantic)]

pub mod agent;
mod correlator;
mod lifecycle;
mod registry;
mod scheduler;
mod session;

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use broker_primitives::{AppName, ConnectionId, ToolDefinition, ToolInvocation, ToolResult};
use broker_transport::{
    AppMessage, DEFAULT_MAX_FRAME_BYTES, MessageSink, MessageSource, TcpLineListener,
    TransportError,
};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use correlator::{Correlator, DEFAULT_CALL_TIMEOUT, PendingCall};
pub use lifecycle::{
    ConnectionEvent, ConnectionLifecycle, ConnectionState, LifecycleError, LifecycleResult,
};
pub use registry::{
    AppRegistration, AppRegistry, AppStatus, ConnectionHandle, RegistrationSummary,
};
pub use scheduler::{
    DEFAULT_MAX_CONNECTIONS, SchedulerConfig, SchedulerError, SchedulerResult, SessionScheduler,
};
pub use session::AppSession;

/// Pause after a failed accept so a persistent error does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Result alias for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors surfaced by the broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Settings were invalid.
    #[error("invalid broker settings: {0}")]
    InvalidConfig(&'static str),
    /// Transport failure, including listener bind errors.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl BrokerError {
    /// Returns `true` when the error is a listener bind failure.
    #[must_use]
    pub const fn is_bind_failure(&self) -> bool {
        matches!(self, Self::Transport(TransportError::Bind { .. }))
    }
}

/// Runtime limits applied by the broker.
#[derive(Debug, Clone, Copy)]
pub struct BrokerSettings {
    call_timeout: Duration,
    max_connections: NonZeroUsize,
    max_frame_bytes: usize,
}

impl BrokerSettings {
    /// Creates settings with explicit values.
    #[must_use]
    pub const fn new(
        call_timeout: Duration,
        max_connections: NonZeroUsize,
        max_frame_bytes: usize,
    ) -> Self {
        Self {
            call_timeout,
            max_connections,
            max_frame_bytes,
        }
    }

    /// Returns the window a forwarded call waits for its response.
    #[must_use]
    pub const fn call_timeout(self) -> Duration {
        self.call_timeout
    }

    /// Returns the cap on simultaneously connected apps.
    #[must_use]
    pub const fn max_connections(self) -> NonZeroUsize {
        self.max_connections
    }

    /// Returns the longest accepted frame, in bytes.
    #[must_use]
    pub const fn max_frame_bytes(self) -> usize {
        self.max_frame_bytes
    }

    /// Overrides the call window.
    #[must_use]
    pub const fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// Overrides the connection cap.
    #[must_use]
    pub const fn with_max_connections(mut self, max_connections: NonZeroUsize) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Validates the settings.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::InvalidConfig`] when the call window or the
    /// frame limit is zero.
    pub fn validate(self) -> BrokerResult<()> {
        if self.call_timeout.is_zero() {
            return Err(BrokerError::InvalidConfig(
                "call timeout must be greater than zero",
            ));
        }
        if self.max_frame_bytes == 0 {
            return Err(BrokerError::InvalidConfig(
                "max frame size must be greater than zero",
            ));
        }
        Ok(())
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            max_connections: SchedulerConfig::default().max_connections(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// Routes agent tool calls to the apps that registered them.
///
/// Cloning is cheap; clones share the same registry and correlator.
#[derive(Debug, Clone)]
pub struct Broker {
    registry: Arc<AppRegistry>,
    correlator: Arc<Correlator>,
    settings: BrokerSettings,
    next_connection: Arc<AtomicU64>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerSettings::default())
    }
}

impl Broker {
    /// Creates a broker with no apps connected.
    #[must_use]
    pub fn new(settings: BrokerSettings) -> Self {
        let correlator = Arc::new(Correlator::new(settings.call_timeout()));
        Self {
            registry: Arc::new(AppRegistry::new(Arc::clone(&correlator))),
            correlator,
            settings,
            next_connection: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Returns the settings in effect.
    #[must_use]
    pub const fn settings(&self) -> BrokerSettings {
        self.settings
    }

    /// Returns the connected-app registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<AppRegistry> {
        &self.registry
    }

    /// Returns the call correlator.
    #[must_use]
    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    /// Records an app expected to connect, shown by [`apps`](Self::apps)
    /// before it does.
    pub fn add_known_app(&self, name: AppName, endpoint: Option<String>) {
        self.registry.add_known_app(name, endpoint);
    }

    /// Tools of every connected app, sorted by name.
    #[must_use]
    pub fn list_tools(&self) -> Vec<ToolDefinition> {
        self.registry.all_tools()
    }

    /// Registered and known apps.
    #[must_use]
    pub fn apps(&self) -> Vec<AppStatus> {
        self.registry.apps()
    }

    /// Forwards `invocation` to the owning app and waits up to the configured
    /// call window.
    pub async fn call_tool(&self, invocation: ToolInvocation) -> ToolResult {
        self.call_tool_with_timeout(invocation, self.settings.call_timeout())
            .await
    }

    /// Forwards `invocation` and waits up to `window` for the response.
    /// The window covers forwarding too.
    ///
    /// Never fails: unknown tools, disconnects and timeouts all come back as
    /// failure results.
    pub async fn call_tool_with_timeout(
        &self,
        invocation: ToolInvocation,
        window: Duration,
    ) -> ToolResult {
        let Some(registration) = self.registry.find_app_by_tool(&invocation.tool_name) else {
            debug!(tool = %invocation.tool_name, "call for unknown tool");
            return ToolResult::tool_not_found(&invocation.tool_name);
        };

        let app = registration.app_name().clone();
        let call = self
            .correlator
            .register(app.clone(), registration.connection().id());
        let id = call.id();
        debug!(%id, app = %app, tool = %invocation.tool_name, "forwarding call");

        // An app that stops reading backs up the outbound queue; the send
        // shares the call window so it cannot block past it.
        let message = AppMessage::invocation(id, invocation);
        let forwarded = registration.connection().send(&message);
        match tokio::time::timeout_at(call.deadline(window), forwarded).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(%id, app = %app, %err, "failed to forward call");
                self.correlator
                    .resolve(id, ToolResult::app_disconnected(&app));
            }
            Err(_) => warn!(%id, app = %app, "app is not accepting calls; forward timed out"),
        }

        self.correlator.wait(call, window).await
    }

    /// Binds the app-facing listener.
    ///
    /// # Errors
    ///
    /// Returns a bind failure when the address is unavailable.
    pub async fn bind_apps(&self, addr: &str) -> BrokerResult<TcpLineListener> {
        let listener = TcpLineListener::bind(addr, self.settings.max_frame_bytes()).await?;
        info!(addr = %listener.local_addr()?, "listening for apps");
        Ok(listener)
    }

    /// Builds a session for an app connection accepted by any carrier.
    pub fn app_session<S, R>(&self, peer: impl Into<String>, sink: S, source: R) -> AppSession<R>
    where
        S: MessageSink<AppMessage> + 'static,
        R: MessageSource<AppMessage>,
    {
        AppSession::new(
            self.next_connection_id(),
            peer,
            sink,
            source,
            Arc::clone(&self.registry),
            Arc::clone(&self.correlator),
        )
    }

    /// Accepts app connections until `shutdown` resolves.
    ///
    /// Connections beyond the configured cap are closed straight away.
    pub async fn serve_apps<F>(&self, listener: TcpLineListener, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let scheduler = SessionScheduler::new(SchedulerConfig::new(self.settings.max_connections()));
        tokio::pin!(shutdown);

        loop {
            let accepted = tokio::select! {
                () = &mut shutdown => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((sender, receiver, peer)) => {
                    let session = self.app_session(peer.to_string(), sender.clone(), receiver);
                    if let Err(err) = scheduler.try_spawn(session.run()) {
                        warn!(%peer, %err, "rejecting app connection");
                        sender.disconnect().await;
                    }
                }
                Err(err) => {
                    warn!(%err, "failed to accept app connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }

        scheduler.close();
        info!("app listener stopped");
    }

    /// Serves one agent over a line channel until its input ends.
    pub async fn serve_agent<S, R>(&self, sink: S, source: R)
    where
        S: MessageSink<Value> + Clone + 'static,
        R: MessageSource<Value>,
    {
        agent::serve_agent(Arc::new(self.clone()), sink, source).await;
    }

    /// Binds a TCP listener for agents.
    ///
    /// # Errors
    ///
    /// Returns a bind failure when the address is unavailable.
    pub async fn bind_agents(&self, addr: &str) -> BrokerResult<TcpLineListener> {
        let listener = TcpLineListener::bind(addr, self.settings.max_frame_bytes()).await?;
        info!(addr = %listener.local_addr()?, "listening for agents");
        Ok(listener)
    }

    /// Accepts agent connections until `shutdown` resolves, serving each on
    /// its own task.
    pub async fn serve_agents<F>(&self, listener: TcpLineListener, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            let accepted = tokio::select! {
                () = &mut shutdown => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((sender, receiver, peer)) => {
                    debug!(%peer, "agent connected");
                    let broker = self.clone();
                    tokio::spawn(async move {
                        broker.serve_agent(sender, receiver).await;
                        debug!(%peer, "agent disconnected");
                    });
                }
                Err(err) => {
                    warn!(%err, "failed to accept agent connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }

        info!("agent listener stopped");
    }

    fn next_connection_id(&self) -> ConnectionId {
        ConnectionId::new(self.next_connection.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_primitives::FailureKind;
    use broker_transport::{LineReceiver, LineSender, TcpTransport, Transport, line_channel};
    use serde_json::{Map, json};

    async fn connect_app(addr: &str, name: &str, tools: &[&str]) -> (LineSender, LineReceiver) {
        let (sender, receiver) = TcpTransport::default().connect(addr).await.unwrap();
        sender
            .send(&AppMessage::Register {
                app_name: name.into(),
                tools: tools
                    .iter()
                    .map(|tool| ToolDefinition::new(*tool, ""))
                    .collect(),
            })
            .await
            .unwrap();
        (sender, receiver)
    }

    async fn started(broker: &Broker) -> (String, tokio::sync::oneshot::Sender<()>) {
        let listener = broker.bind_apps("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let serving = broker.clone();
        tokio::spawn(async move {
            serving
                .serve_apps(listener, async {
                    let _ = stopped.await;
                })
                .await;
        });
        (addr, stop)
    }

    async fn wait_for_tool(broker: &Broker, tool: &str) {
        for _ in 0..200 {
            if broker.registry().find_app_by_tool(tool).is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("{tool} never registered");
    }

    #[test]
    fn settings_validation() {
        assert!(BrokerSettings::default().validate().is_ok());
        let err = BrokerSettings::default()
            .with_call_timeout(Duration::ZERO)
            .validate()
            .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let broker = Broker::default();
        let result = broker
            .call_tool(ToolInvocation::new("Nope:Missing", Map::new()))
            .await;
        assert_eq!(result.failure_kind(), Some(FailureKind::ToolNotFound));
        assert_eq!(result.error_message(), Some("tool not found: Nope:Missing"));
    }

    #[tokio::test]
    async fn forwards_call_and_returns_response() {
        let broker = Broker::default();
        let (addr, _stop) = started(&broker).await;
        let (sender, mut receiver) = connect_app(&addr, "Calc", &["Add"]).await;
        wait_for_tool(&broker, "Calc:Add").await;

        let app = tokio::spawn(async move {
            let Some(Ok(AppMessage::ToolInvocation {
                correlation_id,
                tool,
                parameters,
            })) = receiver.recv::<AppMessage>().await
            else {
                panic!("expected invocation");
            };
            assert_eq!(tool, "Calc:Add");
            let sum = parameters["a"].as_i64().unwrap() + parameters["b"].as_i64().unwrap();
            sender
                .send(&AppMessage::ToolResponse {
                    correlation_id,
                    result: ToolResult::success(json!(sum)),
                })
                .await
                .unwrap();
            (sender, receiver)
        });

        let mut arguments = Map::new();
        arguments.insert("a".into(), json!(2));
        arguments.insert("b".into(), json!(3));
        let result = broker
            .call_tool(ToolInvocation::new("Calc:Add", arguments))
            .await;
        assert_eq!(result, ToolResult::success(json!(5)));
        let _connection = app.await.unwrap();
    }

    #[tokio::test]
    async fn short_window_times_out() {
        let broker = Broker::new(
            BrokerSettings::default().with_call_timeout(Duration::from_millis(50)),
        );
        let (addr, _stop) = started(&broker).await;
        let (_sender, _receiver) = connect_app(&addr, "Slow", &["Wait"]).await;
        wait_for_tool(&broker, "Slow:Wait").await;

        let result = broker
            .call_tool(ToolInvocation::new("Slow:Wait", Map::new()))
            .await;
        assert_eq!(result.failure_kind(), Some(FailureKind::Timeout));
        assert_eq!(broker.correlator().pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_app_times_out_at_default_window() {
        let broker = Broker::default();
        let (broker_io, app_io) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(broker_io);
        let (sink, source) = line_channel(reader, writer, "slow", 64 * 1024);
        tokio::spawn(broker.app_session("slow", sink, source).run());

        let (reader, writer) = tokio::io::split(app_io);
        let (app_tx, mut app_rx) = line_channel(reader, writer, "broker", 64 * 1024);
        app_tx
            .send(&AppMessage::Register {
                app_name: "Slow".into(),
                tools: vec![ToolDefinition::new("Sleep", "")],
            })
            .await
            .unwrap();
        wait_for_tool(&broker, "Slow:Sleep").await;

        let started = tokio::time::Instant::now();
        let result = broker
            .call_tool(ToolInvocation::new("Slow:Sleep", Map::new()))
            .await;
        let elapsed = started.elapsed();

        assert_eq!(result.failure_kind(), Some(FailureKind::Timeout));
        assert!(elapsed >= DEFAULT_CALL_TIMEOUT);
        assert!(elapsed < DEFAULT_CALL_TIMEOUT + Duration::from_secs(1));
        assert!(matches!(
            app_rx.recv::<AppMessage>().await,
            Some(Ok(AppMessage::ToolInvocation { .. }))
        ));
        assert_eq!(broker.correlator().pending_count(), 0);
    }

    #[tokio::test]
    async fn app_that_stops_reading_still_times_out() {
        use tokio::io::AsyncWriteExt;

        let window = Duration::from_millis(100);
        let broker = Broker::new(BrokerSettings::default().with_call_timeout(window));
        let (broker_io, mut app_io) = tokio::io::duplex(256);
        let (reader, writer) = tokio::io::split(broker_io);
        let (sink, source) = line_channel(reader, writer, "hung", 64 * 1024);
        tokio::spawn(broker.app_session("hung", sink, source).run());

        app_io
            .write_all(b"{\"type\":\"register\",\"appName\":\"Hung\",\"tools\":[{\"name\":\"Op\",\"description\":\"\"}]}\n")
            .await
            .unwrap();
        wait_for_tool(&broker, "Hung:Op").await;

        // Enough calls to fill the socket buffer and the outbound queue.
        let started = tokio::time::Instant::now();
        let mut calls = tokio::task::JoinSet::new();
        for _ in 0..700 {
            let broker = broker.clone();
            calls.spawn(async move {
                broker
                    .call_tool(ToolInvocation::new("Hung:Op", Map::new()))
                    .await
            });
        }
        while let Some(result) = calls.join_next().await {
            assert_eq!(result.unwrap().failure_kind(), Some(FailureKind::Timeout));
        }

        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(broker.correlator().pending_count(), 0);
        drop(app_io);
    }

    #[tokio::test]
    async fn connections_beyond_cap_are_closed() {
        let broker = Broker::new(
            BrokerSettings::default().with_max_connections(NonZeroUsize::new(1).unwrap()),
        );
        let (addr, _stop) = started(&broker).await;
        let (_first, _first_rx) = connect_app(&addr, "One", &["A"]).await;
        wait_for_tool(&broker, "One:A").await;

        let (_second, mut second_rx) = connect_app(&addr, "Two", &["A"]).await;
        // Closed without a reply: clean EOF or a reset, depending on timing.
        assert!(!matches!(
            second_rx.recv::<AppMessage>().await,
            Some(Ok(_))
        ));
        assert!(broker.registry().find_app_by_tool("Two:A").is_none());
    }

    #[tokio::test]
    async fn bind_conflict_is_a_bind_failure() {
        let broker = Broker::default();
        let listener = broker.bind_apps("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let err = broker.bind_apps(&addr).await.unwrap_err();
        assert!(err.is_bind_failure());
    }
}
