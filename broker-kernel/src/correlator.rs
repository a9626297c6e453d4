//! Request/response correlation for calls forwarded to apps.
//!
//! Every forwarded call gets a fresh [`CorrelationId`] and a pending entry.
//! The entry is settled exactly once, by whichever happens first: the app's
//! response, the call window elapsing, or the owning connection going away.
//! Settling removes the entry from the map, so the map only ever holds calls
//! that are genuinely in flight.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use broker_primitives::{AppName, ConnectionId, CorrelationId, ToolResult};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Default window a call may wait for its response.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

struct PendingRequest {
    owner_app: AppName,
    owner_connection: ConnectionId,
    created_at: Instant,
    completion: oneshot::Sender<ToolResult>,
}

/// Caller's side of a pending call, consumed by [`Correlator::wait`].
#[derive(Debug)]
pub struct PendingCall {
    id: CorrelationId,
    owner_app: AppName,
    registered_at: Instant,
    completion: oneshot::Receiver<ToolResult>,
}

impl PendingCall {
    /// Returns the call's correlation id.
    #[must_use]
    pub const fn id(&self) -> CorrelationId {
        self.id
    }

    /// Returns the app expected to answer.
    #[must_use]
    pub fn owner_app(&self) -> &AppName {
        &self.owner_app
    }

    /// Returns the instant a `window` measured from registration runs out.
    #[must_use]
    pub fn deadline(&self, window: Duration) -> Instant {
        self.registered_at + window
    }
}

/// Issues correlation ids and settles each pending call exactly once.
pub struct Correlator {
    next_id: AtomicU64,
    pending: Mutex<HashMap<CorrelationId, PendingRequest>>,
    default_timeout: Duration,
}

impl fmt::Debug for Correlator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Correlator")
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .field("pending", &self.pending_count())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new(DEFAULT_CALL_TIMEOUT)
    }
}

impl Correlator {
    /// Creates a correlator whose calls wait `default_timeout` unless told
    /// otherwise.
    #[must_use]
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            default_timeout,
        }
    }

    /// Returns the default call window.
    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Returns a fresh id from a strictly increasing counter.
    pub fn new_id(&self) -> CorrelationId {
        CorrelationId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Allocates an id and records a pending entry owned by the given
    /// app/connection.
    pub fn register(&self, owner_app: AppName, owner_connection: ConnectionId) -> PendingCall {
        let id = self.new_id();
        let (completion, receiver) = oneshot::channel();
        let registered_at = Instant::now();
        self.lock().insert(
            id,
            PendingRequest {
                owner_app: owner_app.clone(),
                owner_connection,
                created_at: registered_at,
                completion,
            },
        );
        PendingCall {
            id,
            owner_app,
            registered_at,
            completion: receiver,
        }
    }

    /// Suspends until the call is settled or `window` has passed since it
    /// was registered. Time spent forwarding the call counts against it.
    ///
    /// If the caller's future is dropped early, the entry is discarded so it
    /// cannot accumulate.
    pub async fn wait(&self, call: PendingCall, window: Duration) -> ToolResult {
        let deadline = call.deadline(window);
        let PendingCall {
            id,
            owner_app,
            mut completion,
            ..
        } = call;
        let _cleanup = DiscardOnDrop { correlator: self, id };

        match tokio::time::timeout_at(deadline, &mut completion).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => ToolResult::app_disconnected(&owner_app),
            Err(_) => {
                if let Some(entry) = self.take(id) {
                    debug!(
                        %id,
                        app = %owner_app,
                        waited_ms = entry.created_at.elapsed().as_millis(),
                        "call timed out"
                    );
                    ToolResult::timeout(window)
                } else {
                    // A resolver removed the entry first; its result is already
                    // on the way.
                    completion
                        .await
                        .unwrap_or_else(|_| ToolResult::app_disconnected(&owner_app))
                }
            }
        }
    }

    /// Waits using the default window.
    pub async fn wait_default(&self, call: PendingCall) -> ToolResult {
        self.wait(call, self.default_timeout).await
    }

    /// Settles the call `id` with `result`.
    ///
    /// Returns `false` when the id is unknown or already settled; that case is
    /// a silent no-op.
    pub fn resolve(&self, id: CorrelationId, result: ToolResult) -> bool {
        let Some(entry) = self.take(id) else {
            return false;
        };
        // The waiter may have gone away; nothing else to do then.
        let _ = entry.completion.send(result);
        true
    }

    /// Settles the call `id` only if it was sent over `connection`.
    ///
    /// A response arriving on any other connection leaves the call pending and
    /// returns `false`.
    pub fn resolve_from(
        &self,
        connection: ConnectionId,
        id: CorrelationId,
        result: ToolResult,
    ) -> bool {
        let entry = {
            let mut pending = self.lock();
            match pending.get(&id).map(|entry| entry.owner_connection) {
                Some(owner) if owner == connection => pending.remove(&id),
                Some(owner) => {
                    warn!(
                        %id,
                        %connection,
                        %owner,
                        "response from a connection that does not own the call; ignored"
                    );
                    None
                }
                None => None,
            }
        };
        let Some(entry) = entry else {
            return false;
        };
        let _ = entry.completion.send(result);
        true
    }

    /// Settles every call owned by `app` as disconnected. Returns how many
    /// calls were settled.
    pub fn fail_owner(&self, app: &AppName) -> usize {
        let settled = self.drain_where(|entry| &entry.owner_app == app);
        let count = settled.len();
        for entry in settled {
            let _ = entry
                .completion
                .send(ToolResult::app_disconnected(&entry.owner_app));
        }
        if count > 0 {
            warn!(app = %app, count, "failed pending calls after app disconnect");
        }
        count
    }

    /// Settles every call sent over `connection` as disconnected. Returns how
    /// many calls were settled.
    pub fn fail_connection(&self, connection: ConnectionId) -> usize {
        let settled = self.drain_where(|entry| entry.owner_connection == connection);
        let count = settled.len();
        for entry in settled {
            let _ = entry
                .completion
                .send(ToolResult::app_disconnected(&entry.owner_app));
        }
        if count > 0 {
            warn!(%connection, count, "failed pending calls after connection loss");
        }
        count
    }

    /// Returns the number of calls currently in flight.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    fn take(&self, id: CorrelationId) -> Option<PendingRequest> {
        self.lock().remove(&id)
    }

    fn drain_where<P>(&self, predicate: P) -> Vec<PendingRequest>
    where
        P: Fn(&PendingRequest) -> bool,
    {
        let mut pending = self.lock();
        let ids: Vec<_> = pending
            .iter()
            .filter(|(_, entry)| predicate(entry))
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| pending.remove(&id))
            .collect()
    }

    // Map mutations are single inserts/removes, so a poisoned lock still
    // guards a consistent map.
    fn lock(&self) -> MutexGuard<'_, HashMap<CorrelationId, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct DiscardOnDrop<'a> {
    correlator: &'a Correlator,
    id: CorrelationId,
}

impl Drop for DiscardOnDrop<'_> {
    fn drop(&mut self) {
        self.correlator.take(self.id);
    }
}
