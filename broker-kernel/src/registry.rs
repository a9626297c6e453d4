//! Connected-app registry: who is connected, over which connection, and which
//! tools each app offers.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use broker_primitives::{AppName, ConnectionId, ToolDefinition, split_tool_name};
use broker_transport::{AppMessage, MessageSink, TransportResult};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::correlator::Correlator;

/// Sending half of an app connection, shared between the session that owns
/// it and every caller forwarding an invocation.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    sink: Arc<dyn MessageSink<AppMessage>>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("connected", &self.sink.is_connected())
            .finish_non_exhaustive()
    }
}

impl ConnectionHandle {
    /// Wraps a connection's sending half.
    #[must_use]
    pub fn new(id: ConnectionId, sink: Arc<dyn MessageSink<AppMessage>>) -> Self {
        Self { id, sink }
    }

    /// Returns the connection id.
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Sends one frame to the app.
    ///
    /// # Errors
    ///
    /// Propagates the transport error when the connection is gone.
    pub async fn send(&self, message: &AppMessage) -> TransportResult<()> {
        self.sink.send(message).await
    }

    /// Returns `true` while the underlying connection is usable.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.sink.is_connected()
    }

    /// Closes the connection.
    pub async fn disconnect(&self) {
        self.sink.disconnect().await;
    }
}

/// One app's current registration.
#[derive(Debug, Clone)]
pub struct AppRegistration {
    app_name: AppName,
    tools: Arc<[ToolDefinition]>,
    connection: ConnectionHandle,
    registered_at: DateTime<Utc>,
    connected: Arc<AtomicBool>,
}

impl AppRegistration {
    /// Returns the app's name.
    #[must_use]
    pub fn app_name(&self) -> &AppName {
        &self.app_name
    }

    /// Returns the app's namespaced tools.
    #[must_use]
    pub fn tools(&self) -> &[ToolDefinition] {
        &self.tools
    }

    /// Returns the connection the app registered over.
    #[must_use]
    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    /// Returns when the registration was accepted.
    #[must_use]
    pub const fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    /// Returns `true` until the registration is removed or its connection
    /// drops.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && self.connection.is_connected()
    }

    fn offers(&self, tool: &str) -> bool {
        self.tools.iter().any(|definition| definition.name() == tool)
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
    }
}

/// Outcome of [`AppRegistry::register`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationSummary {
    /// Tools accepted under the app's namespace.
    pub accepted: usize,
    /// Declared names that were dropped, with the reason.
    pub rejected: Vec<(String, String)>,
    /// Connection whose registration was replaced, if any.
    pub replaced: Option<ConnectionId>,
}

/// Listing entry returned by [`AppRegistry::apps`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppStatus {
    /// App name.
    pub name: String,
    /// Whether the app is currently connected.
    pub connected: bool,
    /// Number of tools the app offers.
    pub tool_count: usize,
    /// Registration time, absent for known apps that never connected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registered_at: Option<DateTime<Utc>>,
    /// Launch hint from configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

/// Registry of connected apps.
///
/// Every declared tool is stored under `"{app}:{local}"`, so lookups go
/// straight from a tool name to its owning app's entry.
pub struct AppRegistry {
    apps: DashMap<AppName, AppRegistration>,
    known: DashMap<AppName, Option<String>>,
    correlator: Arc<Correlator>,
}

impl fmt::Debug for AppRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppRegistry")
            .field("apps", &self.apps.len())
            .field("known", &self.known.len())
            .field("correlator", &self.correlator)
            .finish()
    }
}

impl AppRegistry {
    /// Creates an empty registry that fails pending calls through
    /// `correlator` when apps go away.
    #[must_use]
    pub fn new(correlator: Arc<Correlator>) -> Self {
        Self {
            apps: DashMap::new(),
            known: DashMap::new(),
            correlator,
        }
    }

    /// Records apps expected to connect so listings can show them before
    /// they do.
    pub fn add_known_app(&self, name: AppName, endpoint: Option<String>) {
        self.known.insert(name, endpoint);
    }

    /// Records or replaces `app_name`'s registration.
    ///
    /// Each declared tool is namespaced under the app. Names that are invalid
    /// or carry another app's prefix are dropped, as are repeats of a name
    /// already accepted in this registration.
    pub fn register(
        &self,
        app_name: AppName,
        declared: Vec<ToolDefinition>,
        connection: ConnectionHandle,
    ) -> RegistrationSummary {
        let mut tools: Vec<ToolDefinition> = Vec::with_capacity(declared.len());
        let mut rejected = Vec::new();
        for definition in declared {
            let original = definition.name().to_owned();
            match definition.namespaced(&app_name) {
                Ok(definition) if tools.iter().any(|t| t.name() == definition.name()) => {
                    rejected.push((original, "duplicate tool name".to_owned()));
                }
                Ok(definition) => tools.push(definition),
                Err(err) => rejected.push((original, err.to_string())),
            }
        }
        for (tool, reason) in &rejected {
            warn!(app = %app_name, %tool, %reason, "dropping declared tool");
        }

        let connection_id = connection.id();
        let registration = AppRegistration {
            app_name: app_name.clone(),
            tools: tools.into(),
            connection,
            registered_at: Utc::now(),
            connected: Arc::new(AtomicBool::new(true)),
        };
        let accepted = registration.tools.len();

        let replaced = self
            .apps
            .insert(app_name.clone(), registration)
            .map(|previous| {
                previous.mark_disconnected();
                previous.connection.id()
            })
            .filter(|previous| *previous != connection_id);

        if let Some(previous) = replaced {
            info!(app = %app_name, %previous, connection = %connection_id, "app registration replaced");
        } else {
            info!(app = %app_name, connection = %connection_id, tools = accepted, "app registered");
        }

        RegistrationSummary {
            accepted,
            rejected,
            replaced,
        }
    }

    /// Removes `app_name` and fails every call still waiting on it.
    ///
    /// Returns `false` if the app was not registered.
    pub fn unregister(&self, app_name: &AppName) -> bool {
        let Some((_, registration)) = self.apps.remove(app_name) else {
            return false;
        };
        registration.mark_disconnected();
        self.correlator.fail_owner(app_name);
        info!(app = %app_name, "app unregistered");
        true
    }

    /// Removes `app_name` only if it is still registered over `connection`.
    ///
    /// Calls sent over `connection` are failed either way, so a superseded
    /// connection closing never disturbs the app's newer registration.
    pub fn unregister_connection(&self, app_name: &AppName, connection: ConnectionId) -> bool {
        let removed = self
            .apps
            .remove_if(app_name, |_, registration| {
                registration.connection.id() == connection
            })
            .map(|(_, registration)| registration.mark_disconnected())
            .is_some();

        self.correlator.fail_connection(connection);
        if removed {
            info!(app = %app_name, %connection, "app unregistered");
        } else {
            debug!(app = %app_name, %connection, "stale connection closed");
        }
        removed
    }

    /// Returns the connected registration offering exactly `tool`.
    #[must_use]
    pub fn find_app_by_tool(&self, tool: &str) -> Option<AppRegistration> {
        let (app, _) = split_tool_name(tool)?;
        let registration = self.apps.get(app)?;
        (registration.is_connected() && registration.offers(tool))
            .then(|| registration.value().clone())
    }

    /// Returns the registration for `app_name`, connected or not.
    #[must_use]
    pub fn get(&self, app_name: &str) -> Option<AppRegistration> {
        self.apps.get(app_name).map(|entry| entry.value().clone())
    }

    /// Tools of every connected app, sorted by name.
    #[must_use]
    pub fn all_tools(&self) -> Vec<ToolDefinition> {
        let mut tools: Vec<_> = self
            .apps
            .iter()
            .filter(|entry| entry.is_connected())
            .flat_map(|entry| entry.tools.iter().cloned().collect::<Vec<_>>())
            .collect();
        tools.sort_by(|a, b| a.name().cmp(b.name()));
        tools
    }

    /// Registered and known apps, sorted by name.
    #[must_use]
    pub fn apps(&self) -> Vec<AppStatus> {
        let mut listing: Vec<_> = self
            .apps
            .iter()
            .map(|entry| AppStatus {
                name: entry.key().to_string(),
                connected: entry.is_connected(),
                tool_count: entry.tools.len(),
                registered_at: Some(entry.registered_at),
                endpoint: self.known.get(entry.key()).and_then(|known| known.clone()),
            })
            .collect();

        listing.extend(
            self.known
                .iter()
                .filter(|known| !self.apps.contains_key(known.key()))
                .map(|known| AppStatus {
                    name: known.key().to_string(),
                    connected: false,
                    tool_count: 0,
                    registered_at: None,
                    endpoint: known.value().clone(),
                }),
        );

        listing.sort_by(|a, b| a.name.cmp(&b.name));
        listing
    }

    /// Number of registered apps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.apps.len()
    }

    /// Returns `true` when no app is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use broker_primitives::FailureKind;
    use broker_transport::TransportError;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<AppMessage>>,
        closed: AtomicBool,
    }

    #[async_trait]
    impl MessageSink<AppMessage> for RecordingSink {
        async fn send(&self, message: &AppMessage) -> TransportResult<()> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(TransportError::Closed);
            }
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }

        fn is_connected(&self) -> bool {
            !self.closed.load(Ordering::SeqCst)
        }

        async fn disconnect(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn app(name: &str) -> AppName {
        AppName::new(name).unwrap()
    }

    fn handle(id: u64) -> (ConnectionHandle, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        (ConnectionHandle::new(ConnectionId::new(id), sink.clone()), sink)
    }

    fn registry() -> (AppRegistry, Arc<Correlator>) {
        let correlator = Arc::new(Correlator::default());
        (AppRegistry::new(Arc::clone(&correlator)), correlator)
    }

    fn calc_tools() -> Vec<ToolDefinition> {
        vec![
            ToolDefinition::new("Add", "Adds"),
            ToolDefinition::new("Calc:Divide", "Divides"),
        ]
    }

    #[test]
    fn register_namespaces_and_finds_exact_names() {
        let (registry, _) = registry();
        let (connection, _) = handle(1);

        let summary = registry.register(app("Calc"), calc_tools(), connection);
        assert_eq!(summary.accepted, 2);
        assert!(summary.rejected.is_empty());

        let names: Vec<_> = registry
            .all_tools()
            .iter()
            .map(|tool| tool.name().to_owned())
            .collect();
        assert_eq!(names, ["Calc:Add", "Calc:Divide"]);

        let found = registry.find_app_by_tool("Calc:Add").unwrap();
        assert_eq!(found.app_name().as_str(), "Calc");
        assert!(registry.find_app_by_tool("Add").is_none());
        assert!(registry.find_app_by_tool("Calc:Sub").is_none());
        assert!(registry.find_app_by_tool("Other:Add").is_none());
    }

    #[test]
    fn foreign_and_duplicate_declarations_are_dropped() {
        let (registry, _) = registry();
        let (connection, _) = handle(1);

        let summary = registry.register(
            app("Calc"),
            vec![
                ToolDefinition::new("Add", ""),
                ToolDefinition::new("Calc:Add", ""),
                ToolDefinition::new("Files:Read", ""),
                ToolDefinition::new("", ""),
            ],
            connection,
        );

        assert_eq!(summary.accepted, 1);
        assert_eq!(summary.rejected.len(), 3);
        assert!(registry.find_app_by_tool("Files:Read").is_none());
    }

    #[test]
    fn reregistration_replaces_tool_set() {
        let (registry, _) = registry();
        let (first, _) = handle(1);
        let (second, _) = handle(2);

        registry.register(app("Calc"), calc_tools(), first);
        let summary = registry.register(
            app("Calc"),
            vec![ToolDefinition::new("Sub", "")],
            second,
        );

        assert_eq!(summary.replaced, Some(ConnectionId::new(1)));
        assert_eq!(registry.len(), 1);
        assert!(registry.find_app_by_tool("Calc:Add").is_none());
        let found = registry.find_app_by_tool("Calc:Sub").unwrap();
        assert_eq!(found.connection().id(), ConnectionId::new(2));
    }

    #[test]
    fn same_connection_refresh_is_not_a_replacement() {
        let (registry, _) = registry();
        let (connection, _) = handle(1);

        registry.register(app("Calc"), calc_tools(), connection.clone());
        let summary = registry.register(app("Calc"), calc_tools(), connection);
        assert_eq!(summary.replaced, None);
    }

    #[tokio::test]
    async fn unregister_fails_pending_calls() {
        let (registry, correlator) = registry();
        let (connection, _) = handle(1);
        registry.register(app("Calc"), calc_tools(), connection);

        let call = correlator.register(app("Calc"), ConnectionId::new(1));
        assert!(registry.unregister(&app("Calc")));
        assert!(!registry.unregister(&app("Calc")));

        let result = correlator.wait(call, Duration::from_secs(5)).await;
        assert_eq!(result.failure_kind(), Some(FailureKind::AppDisconnected));
        assert!(registry.all_tools().is_empty());
        assert!(registry.find_app_by_tool("Calc:Add").is_none());
    }

    #[tokio::test]
    async fn stale_connection_does_not_remove_newer_registration() {
        let (registry, correlator) = registry();
        let (old, _) = handle(1);
        let (fresh, _) = handle(2);
        registry.register(app("Calc"), calc_tools(), old);

        let stale_call = correlator.register(app("Calc"), ConnectionId::new(1));
        registry.register(app("Calc"), calc_tools(), fresh);

        assert!(!registry.unregister_connection(&app("Calc"), ConnectionId::new(1)));
        assert!(registry.find_app_by_tool("Calc:Add").is_some());

        let result = correlator.wait(stale_call, Duration::from_secs(5)).await;
        assert_eq!(result.failure_kind(), Some(FailureKind::AppDisconnected));

        assert!(registry.unregister_connection(&app("Calc"), ConnectionId::new(2)));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn dropped_connection_hides_tools() {
        let (registry, _) = registry();
        let (connection, sink) = handle(1);
        registry.register(app("Calc"), calc_tools(), connection);

        sink.disconnect().await;
        assert!(registry.all_tools().is_empty());
        assert!(registry.find_app_by_tool("Calc:Add").is_none());
    }

    #[test]
    fn listing_merges_known_apps() {
        let (registry, _) = registry();
        let (connection, _) = handle(1);
        registry.add_known_app(app("Files"), Some("files-app --stdio".into()));
        registry.add_known_app(app("Calc"), None);
        registry.register(app("Calc"), calc_tools(), connection);

        let apps = registry.apps();
        assert_eq!(apps.len(), 2);
        assert_eq!(apps[0].name, "Calc");
        assert!(apps[0].connected);
        assert_eq!(apps[0].tool_count, 2);
        assert_eq!(apps[1].name, "Files");
        assert!(!apps[1].connected);
        assert_eq!(apps[1].endpoint.as_deref(), Some("files-app --stdio"));
    }
}
