//! Bounded spawner for app connection sessions.

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tokio::sync::{Semaphore, TryAcquireError};
use tokio::task::JoinHandle;

/// Default cap on simultaneously served app connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;

/// Limits applied to connection sessions.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    max_connections: NonZeroUsize,
}

impl SchedulerConfig {
    /// Creates a new configuration with the supplied connection limit.
    #[must_use]
    pub const fn new(max_connections: NonZeroUsize) -> Self {
        Self { max_connections }
    }

    /// Returns the configured connection limit.
    #[must_use]
    pub const fn max_connections(self) -> NonZeroUsize {
        self.max_connections
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::new(NonZeroUsize::new(DEFAULT_MAX_CONNECTIONS).unwrap_or(NonZeroUsize::MIN))
    }
}

/// Wrapper around `tokio::spawn` that refuses work beyond the connection cap
/// instead of queueing it.
#[derive(Debug, Clone)]
pub struct SessionScheduler {
    semaphore: Arc<Semaphore>,
    closed: Arc<AtomicBool>,
    config: SchedulerConfig,
}

impl SessionScheduler {
    /// Creates a scheduler with `config.max_connections()` slots.
    #[must_use]
    pub fn new(config: SchedulerConfig) -> Self {
        let permits = config.max_connections().get();
        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
            closed: Arc::new(AtomicBool::new(false)),
            config,
        }
    }

    /// Returns the slot configuration.
    #[must_use]
    pub const fn config(&self) -> SchedulerConfig {
        self.config
    }

    /// Returns the number of sessions currently holding a slot.
    #[must_use]
    pub fn active(&self) -> usize {
        self.config
            .max_connections()
            .get()
            .saturating_sub(self.semaphore.available_permits())
    }

    /// Returns `true` once [`close`](Self::close) has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Refuses every later spawn; running sessions are unaffected.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.semaphore.close();
    }

    /// Spawns `future` if a slot is free. The slot is released when the
    /// future completes.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::AtCapacity`] when every slot is taken, or
    /// [`SchedulerError::Closed`] after [`close`](Self::close).
    pub fn try_spawn<F, T>(&self, future: F) -> SchedulerResult<JoinHandle<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_closed() {
            return Err(SchedulerError::Closed);
        }

        let permit = Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .map_err(|err| match err {
                TryAcquireError::Closed => SchedulerError::Closed,
                TryAcquireError::NoPermits => SchedulerError::AtCapacity {
                    limit: self.config.max_connections().get(),
                },
            })?;

        Ok(tokio::spawn(async move {
            let output = future.await;
            drop(permit);
            output
        }))
    }
}

impl Default for SessionScheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

/// Reasons a session could not be spawned.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    /// Scheduler is closed and will not accept new sessions.
    #[error("scheduler closed")]
    Closed,
    /// Every connection slot is in use.
    #[error("connection limit of {limit} reached")]
    AtCapacity {
        /// Configured limit.
        limit: usize,
    },
}

/// Result alias for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;
