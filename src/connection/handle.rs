//! Connection handles
//!
//! A [`ConnectionHandle`] is exclusive to one caller for one call. It goes
//! back to the pool through [`ConnectionManager::release`] or is destroyed
//! through [`ConnectionManager::invalidate`]. A handle dropped without
//! either (the caller was cancelled) is returned to the pool marked for a
//! health probe before its next use.
//!
//! [`ConnectionManager::release`]: super::ConnectionManager::release
//! [`ConnectionManager::invalidate`]: super::ConnectionManager::invalidate

use std::sync::Arc;
use tokio::time::Instant;

use serde::Serialize;
use tokio::sync::OwnedSemaphorePermit;
use tracing::debug;

use super::{IdleEntry, PoolShared};

/// Health of one handle as last observed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HandleHealth {
    Healthy,
    /// Invalidated; never handed out again
    Broken,
}

/// Exclusive lease on a live backend session
pub struct ConnectionHandle<S: Send + Sync + 'static> {
    id: u64,
    session: Arc<S>,
    settled: bool,
    created_at: Instant,
    last_used: Instant,
    health: HandleHealth,
    pool: Arc<PoolShared<S>>,
    _permit: OwnedSemaphorePermit,
}

impl<S: Send + Sync + 'static> ConnectionHandle<S> {
    pub(super) fn new(entry: IdleEntry<S>, pool: Arc<PoolShared<S>>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            id: entry.id,
            session: entry.session,
            settled: false,
            created_at: entry.created_at,
            last_used: entry.last_used,
            health: HandleHealth::Healthy,
            pool,
            _permit: permit,
        }
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub const fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When the session was last handed back to the pool
    #[must_use]
    pub const fn last_used(&self) -> Instant {
        self.last_used
    }

    #[must_use]
    pub const fn health(&self) -> HandleHealth {
        self.health
    }

    /// The live session. Handlers get a clone for one call and must not keep it.
    #[must_use]
    pub const fn session(&self) -> &Arc<S> {
        &self.session
    }

    pub(super) fn mark(&mut self, health: HandleHealth) {
        self.health = health;
    }

    /// Put the session back in the idle list
    pub(super) fn settle_release(mut self, needs_probe: bool) {
        self.return_to_pool(needs_probe);
    }

    /// Destroy the session and free its pool slot
    pub(super) fn settle_invalidate(mut self) {
        if !self.settled {
            self.settled = true;
            self.pool.discard(self.id);
        }
    }

    fn return_to_pool(&mut self, needs_probe: bool) {
        if self.settled {
            return;
        }
        self.settled = true;
        self.pool.push_idle(IdleEntry {
            id: self.id,
            session: Arc::clone(&self.session),
            created_at: self.created_at,
            last_used: Instant::now(),
            needs_probe,
        });
    }
}

impl<S: Send + Sync + 'static> Drop for ConnectionHandle<S> {
    fn drop(&mut self) {
        if !self.settled {
            debug!(handle_id = self.id, "Handle dropped without release, returning for probe");
            self.return_to_pool(true);
        }
    }
}

impl<S: Send + Sync + 'static> std::fmt::Debug for ConnectionHandle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("health", &self.health)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}
