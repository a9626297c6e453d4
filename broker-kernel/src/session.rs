//! Broker side of one app connection.

use std::fmt;
use std::sync::Arc;

use broker_primitives::{AppName, ConnectionId, ToolDefinition};
use broker_transport::{AppMessage, MessageSink, MessageSource};
use tracing::{debug, info, warn};

use crate::correlator::Correlator;
use crate::lifecycle::{ConnectionEvent, ConnectionLifecycle, ConnectionState};
use crate::registry::{AppRegistry, ConnectionHandle};

/// Reads frames from one app connection and applies them to the registry and
/// correlator until the connection closes.
pub struct AppSession<R> {
    peer: String,
    handle: ConnectionHandle,
    source: R,
    lifecycle: ConnectionLifecycle,
    app: Option<AppName>,
    registry: Arc<AppRegistry>,
    correlator: Arc<Correlator>,
}

impl<R> fmt::Debug for AppSession<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppSession")
            .field("peer", &self.peer)
            .field("connection", &self.handle.id())
            .field("state", &self.lifecycle.state())
            .field("app", &self.app)
            .finish_non_exhaustive()
    }
}

impl<R> AppSession<R>
where
    R: MessageSource<AppMessage>,
{
    /// Creates a session for a freshly accepted connection.
    pub fn new<S>(
        id: ConnectionId,
        peer: impl Into<String>,
        sink: S,
        source: R,
        registry: Arc<AppRegistry>,
        correlator: Arc<Correlator>,
    ) -> Self
    where
        S: MessageSink<AppMessage> + 'static,
    {
        Self {
            peer: peer.into(),
            handle: ConnectionHandle::new(id, Arc::new(sink)),
            source,
            lifecycle: ConnectionLifecycle::new(id),
            app: None,
            registry,
            correlator,
        }
    }

    /// Returns the connection's current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.lifecycle.state()
    }

    /// Serves the connection until it closes or fails, then unregisters the
    /// app it carried.
    pub async fn run(mut self) {
        let id = self.handle.id();
        debug!(connection = %id, peer = %self.peer, "app connection accepted");

        while let Some(frame) = self.source.recv().await {
            match frame {
                Ok(AppMessage::Register { app_name, tools }) => {
                    self.on_register(app_name, tools);
                }
                Ok(AppMessage::ToolResponse {
                    correlation_id,
                    result,
                }) => {
                    if self.app.is_none() {
                        warn!(connection = %id, %correlation_id, "response before registration; dropped");
                    } else if !self.correlator.resolve_from(id, correlation_id, result) {
                        debug!(connection = %id, %correlation_id, "late or unknown response ignored");
                    }
                }
                Ok(other) => {
                    warn!(connection = %id, kind = other.kind(), "unexpected message from app; dropped");
                }
                Err(err) if !err.is_fatal() => {
                    warn!(connection = %id, %err, "malformed frame from app; dropped");
                }
                Err(err) => {
                    warn!(connection = %id, %err, "app connection failed");
                    break;
                }
            }
        }

        // Close the sink before unregistering so no new call can be sent
        // over this connection once its pending calls are failed.
        self.handle.disconnect().await;
        let _ = self.lifecycle.transition(ConnectionEvent::Disconnect);
        if let Some(app) = self.app.take() {
            self.registry.unregister_connection(&app, id);
            info!(app = %app, connection = %id, "app disconnected");
        } else {
            debug!(connection = %id, "unregistered connection closed");
        }
    }

    fn on_register(&mut self, app_name: String, tools: Vec<ToolDefinition>) {
        let id = self.handle.id();
        let app = match AppName::new(app_name) {
            Ok(app) => app,
            Err(err) => {
                warn!(connection = %id, %err, "registration rejected");
                return;
            }
        };

        if let Some(previous) = self.app.as_ref().filter(|previous| **previous != app) {
            info!(connection = %id, from = %previous, to = %app, "connection re-registered under a new name");
            self.registry.unregister_connection(previous, id);
        }

        let event = if self.lifecycle.state() == ConnectionState::Connecting {
            ConnectionEvent::Register
        } else {
            ConnectionEvent::Reregister
        };
        if let Err(err) = self.lifecycle.transition(event) {
            warn!(connection = %id, %err, "registration ignored");
            return;
        }

        let summary = self.registry.register(app.clone(), tools, self.handle.clone());
        debug!(
            app = %app,
            connection = %id,
            accepted = summary.accepted,
            rejected = summary.rejected.len(),
            "registration applied"
        );
        self.app = Some(app);

        if self.lifecycle.state() == ConnectionState::Registered {
            let _ = self.lifecycle.transition(ConnectionEvent::Activate);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use broker_primitives::{FailureKind, ToolResult};
    use broker_transport::{LineReceiver, LineSender, line_channel};
    use serde_json::json;
    use tokio::io::duplex;

    struct Harness {
        registry: Arc<AppRegistry>,
        correlator: Arc<Correlator>,
        app_side: (LineSender, LineReceiver),
        running: tokio::task::JoinHandle<()>,
    }

    fn start() -> Harness {
        let correlator = Arc::new(Correlator::default());
        let registry = Arc::new(AppRegistry::new(Arc::clone(&correlator)));

        let (broker_io, app_io) = duplex(64 * 1024);
        let (broker_read, broker_write) = tokio::io::split(broker_io);
        let (app_read, app_write) = tokio::io::split(app_io);
        let (sink, source) = line_channel(broker_read, broker_write, "test-app", 64 * 1024);
        let app_side = line_channel(app_read, app_write, "test-broker", 64 * 1024);

        let session = AppSession::new(
            ConnectionId::new(1),
            "test-app",
            sink,
            source,
            Arc::clone(&registry),
            Arc::clone(&correlator),
        );
        let running = tokio::spawn(session.run());

        Harness {
            registry,
            correlator,
            app_side,
            running,
        }
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn register(app: &str, tools: &[&str]) -> AppMessage {
        AppMessage::Register {
            app_name: app.into(),
            tools: tools
                .iter()
                .map(|name| ToolDefinition::new(*name, ""))
                .collect(),
        }
    }

    #[tokio::test]
    async fn registration_and_response_flow() {
        let harness = start();
        let (sender, mut receiver) = harness.app_side;

        sender.send(&register("Calc", &["Add"])).await.unwrap();
        let registry = Arc::clone(&harness.registry);
        wait_for(|| registry.find_app_by_tool("Calc:Add").is_some()).await;

        let registration = harness.registry.find_app_by_tool("Calc:Add").unwrap();
        let call = harness
            .correlator
            .register(registration.app_name().clone(), registration.connection().id());
        registration
            .connection()
            .send(&AppMessage::ToolInvocation {
                correlation_id: call.id(),
                tool: "Calc:Add".into(),
                parameters: serde_json::Map::new(),
            })
            .await
            .unwrap();

        let AppMessage::ToolInvocation { correlation_id, .. } =
            receiver.recv::<AppMessage>().await.unwrap().unwrap()
        else {
            panic!("expected invocation");
        };
        sender
            .send(&AppMessage::ToolResponse {
                correlation_id,
                result: ToolResult::success(json!(5)),
            })
            .await
            .unwrap();

        let result = harness.correlator.wait_default(call).await;
        assert_eq!(result, ToolResult::success(json!(5)));

        sender.disconnect().await;
        harness.running.await.unwrap();
        assert!(harness.registry.is_empty());
    }

    #[tokio::test]
    async fn response_before_registration_is_dropped() {
        let harness = start();
        let (sender, _receiver) = harness.app_side;

        let call = harness
            .correlator
            .register(AppName::new("Calc").unwrap(), ConnectionId::new(9));
        sender
            .send(&AppMessage::ToolResponse {
                correlation_id: call.id(),
                result: ToolResult::success(json!(1)),
            })
            .await
            .unwrap();
        sender.send(&register("Calc", &["Add"])).await.unwrap();

        let registry = Arc::clone(&harness.registry);
        wait_for(|| !registry.is_empty()).await;
        assert_eq!(harness.correlator.pending_count(), 1);
    }

    #[tokio::test]
    async fn response_for_another_connections_call_is_ignored() {
        let harness = start();
        let (sender, _receiver) = harness.app_side;

        sender.send(&register("Calc", &["Add"])).await.unwrap();
        let call = harness
            .correlator
            .register(AppName::new("Files").unwrap(), ConnectionId::new(7));
        sender
            .send(&AppMessage::ToolResponse {
                correlation_id: call.id(),
                result: ToolResult::success(json!("forged")),
            })
            .await
            .unwrap();
        // Frames are handled in order, so once `Sub` shows up the response
        // has been seen.
        sender.send(&register("Calc", &["Add", "Sub"])).await.unwrap();

        let registry = Arc::clone(&harness.registry);
        wait_for(|| registry.find_app_by_tool("Calc:Sub").is_some()).await;
        assert_eq!(harness.correlator.pending_count(), 1);

        assert!(harness.correlator.resolve_from(
            ConnectionId::new(7),
            call.id(),
            ToolResult::success(json!("real")),
        ));
        let result = harness.correlator.wait_default(call).await;
        assert_eq!(result, ToolResult::success(json!("real")));
    }

    #[tokio::test]
    async fn malformed_frames_do_not_end_session() {
        let harness = start();
        let (sender, _receiver) = harness.app_side;

        sender.send(&json!({"type": "nonsense"})).await.unwrap();
        sender.send(&json!({"no": "type"})).await.unwrap();
        sender.send(&register("Calc", &["Add"])).await.unwrap();

        let registry = Arc::clone(&harness.registry);
        wait_for(|| registry.find_app_by_tool("Calc:Add").is_some()).await;
    }

    #[tokio::test]
    async fn disconnect_fails_pending_calls() {
        let harness = start();
        let (sender, _receiver) = harness.app_side;

        sender.send(&register("Calc", &["Add"])).await.unwrap();
        let registry = Arc::clone(&harness.registry);
        wait_for(|| !registry.is_empty()).await;

        let call = harness
            .correlator
            .register(AppName::new("Calc").unwrap(), ConnectionId::new(1));
        sender.disconnect().await;
        harness.running.await.unwrap();

        let result = harness.correlator.wait_default(call).await;
        assert_eq!(result.failure_kind(), Some(FailureKind::AppDisconnected));
        assert!(harness.registry.all_tools().is_empty());
    }

    #[tokio::test]
    async fn rename_on_same_connection_drops_old_name() {
        let harness = start();
        let (sender, _receiver) = harness.app_side;

        sender.send(&register("Calc", &["Add"])).await.unwrap();
        sender.send(&register("Math", &["Add"])).await.unwrap();

        let registry = Arc::clone(&harness.registry);
        wait_for(|| registry.find_app_by_tool("Math:Add").is_some()).await;
        assert!(harness.registry.find_app_by_tool("Calc:Add").is_none());
        assert_eq!(harness.registry.len(), 1);
    }
}
