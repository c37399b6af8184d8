//! Tracking of live sessions
//!
//! Every open connection holds a [`SessionGuard`]. Dropping the guard
//! deregisters the session, so a session whose task ends for any reason
//! (including a panic) never stays registered.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::types::{SessionId, SessionState};

/// Errors that occur when opening a session
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("session limit of {0} reached")]
    Full(usize),

    #[error("server is shutting down")]
    ShuttingDown,
}

/// Point-in-time view of one session
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: SessionId,
    pub state: SessionState,
    pub opened: Instant,
}

#[derive(Debug)]
struct SessionEntry {
    state: SessionState,
    opened: Instant,
}

#[derive(Debug)]
struct Inner {
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
    permits: Option<(Arc<Semaphore>, usize)>,
    shutdown: CancellationToken,
    idle: Notify,
}

/// Registry of live sessions
///
/// Cheap to clone; all clones share the same state.
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

impl SessionRegistry {
    /// Create a registry, optionally capping concurrent sessions
    pub fn new(max_sessions: Option<usize>) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: Mutex::new(HashMap::new()),
                permits: max_sessions.map(|max| (Arc::new(Semaphore::new(max)), max)),
                shutdown: CancellationToken::new(),
                idle: Notify::new(),
            }),
        }
    }

    /// Register a new session
    pub fn open(&self) -> Result<SessionGuard, RegistryError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(RegistryError::ShuttingDown);
        }

        let permit = match &self.inner.permits {
            Some((semaphore, max)) => Some(
                Arc::clone(semaphore)
                    .try_acquire_owned()
                    .map_err(|_| RegistryError::Full(*max))?,
            ),
            None => None,
        };

        let id = SessionId::new();
        let count = {
            let mut sessions = self.inner.sessions.lock();
            sessions.insert(
                id,
                SessionEntry {
                    state: SessionState::Idle,
                    opened: Instant::now(),
                },
            );
            sessions.len()
        };
        info!(session = %id, active = count, "session opened");

        Ok(SessionGuard {
            id,
            inner: Arc::clone(&self.inner),
            shutdown: self.inner.shutdown.child_token(),
            _permit: permit,
        })
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    /// Check if no sessions are live
    pub fn is_empty(&self) -> bool {
        self.inner.sessions.lock().is_empty()
    }

    /// Snapshot of all live sessions
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        self.inner
            .sessions
            .lock()
            .iter()
            .map(|(id, entry)| SessionInfo {
                id: *id,
                state: entry.state,
                opened: entry.opened,
            })
            .collect()
    }

    /// Refuse new sessions and tell the live ones to stop
    pub fn shutdown(&self) {
        info!(active = self.len(), "shutting down sessions");
        self.inner.shutdown.cancel();
    }

    /// Wait until every session has deregistered
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

/// Registration of one live session
///
/// Deregisters the session when dropped.
#[derive(Debug)]
pub struct SessionGuard {
    id: SessionId,
    inner: Arc<Inner>,
    shutdown: CancellationToken,
    _permit: Option<OwnedSemaphorePermit>,
}

impl SessionGuard {
    /// Session identifier
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Record a state transition
    pub fn set_state(&self, state: SessionState) {
        if let Some(entry) = self.inner.sessions.lock().get_mut(&self.id) {
            debug!(session = %self.id, from = %entry.state, to = %state, "state change");
            entry.state = state;
        }
    }

    /// Cancelled when the server shuts down
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let remaining = {
            let mut sessions = self.inner.sessions.lock();
            sessions.remove(&self.id);
            sessions.len()
        };
        info!(session = %self.id, active = remaining, "session closed");
        if remaining == 0 {
            self.inner.idle.notify_waiters();
        }
    }
}
