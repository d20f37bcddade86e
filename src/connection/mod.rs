//! Backend Connection Manager
//!
//! Owns every session to one backend: lazy creation, pooling, idle health
//! probes, wake-from-suspend and retry-with-backoff.
//!
//! # States
//! `Uninitialized → Connecting → Healthy → {Suspended, Broken}`
//!
//! # Single-flight
//! Only one handshake runs at a time. Acquirers that arrive while one is in
//! flight wait on its result instead of starting their own. Once it has
//! finished, an acquirer that still finds no idle session starts the next
//! handshake if the pool has room, so the pool grows to `pool_size` under
//! concurrent load.
//!
//! # Waiting
//! Waiting for a pool slot or for a session to come back is bounded by
//! `acquire_timeout` as a whole. Joining a handshake is not: its length is
//! bounded by the retry profiles.
//!
//! # Synchronization
//! All pool state sits behind one mutex. A semaphore with `pool_size`
//! permits bounds the number of handles out at once. Handshakes run in a
//! spawned task, so a cancelled acquirer never strands the acquirers waiting
//! on it.

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::config::ResolvedConfig;
use crate::error::{GatewayError, Result};
use crate::redact::SecretRedactor;
use crate::retry::RetryPolicy;

pub mod handle;

pub use handle::{ConnectionHandle, HandleHealth};

/// Lifecycle state of the backend as seen by the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendState {
    Uninitialized,
    Connecting,
    Healthy,
    /// Last handshake found the compute asleep or starting
    Suspended,
    /// Last handshake failed for good
    Broken,
}

/// Pool sizing and timeouts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_size: usize,
    /// Longest wait for a free pool slot
    pub acquire_timeout: Duration,
    /// Sessions idle longer than this are probed before reuse
    pub idle_timeout: Duration,
    pub probe_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: 4,
            acquire_timeout: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(300),
            probe_timeout: Duration::from_secs(10),
        }
    }
}

impl PoolSettings {
    #[must_use]
    pub fn from_config(config: &ResolvedConfig) -> Self {
        let defaults = Self::default();
        Self {
            max_size: config
                .get_u64("pool_size")
                .map_or(defaults.max_size, |n| usize::try_from(n).unwrap_or(usize::MAX)),
            acquire_timeout: config.get_secs("acquire_timeout_secs").unwrap_or(defaults.acquire_timeout),
            idle_timeout: config.get_secs("idle_timeout_secs").unwrap_or(defaults.idle_timeout),
            probe_timeout: config.get_secs("probe_timeout_secs").unwrap_or(defaults.probe_timeout),
        }
    }
}

/// A pooled session not currently leased
pub(crate) struct IdleEntry<S> {
    pub(crate) id: u64,
    pub(crate) session: Arc<S>,
    pub(crate) created_at: Instant,
    pub(crate) last_used: Instant,
    /// Set when the session came back without an explicit release
    pub(crate) needs_probe: bool,
}

/// Handshake result shared by every joiner
type ConnectFuture = Shared<BoxFuture<'static, Result<()>>>;

struct PoolState<S> {
    phase: BackendState,
    idle: Vec<IdleEntry<S>>,
    /// Sessions in existence: idle, leased or being probed
    live: usize,
    inflight: Option<ConnectFuture>,
}

pub(crate) struct PoolShared<S> {
    state: Mutex<PoolState<S>>,
    changed: Notify,
    next_id: AtomicU64,
    handshakes: AtomicU64,
}

impl<S> PoolShared<S> {
    pub(crate) fn push_idle(&self, entry: IdleEntry<S>) {
        self.state.lock().idle.push(entry);
        self.changed.notify_waiters();
    }

    pub(crate) fn discard(&self, id: u64) {
        {
            let mut state = self.state.lock();
            state.live = state.live.saturating_sub(1);
        }
        debug!(handle_id = id, "Discarded handle");
        self.changed.notify_waiters();
    }

    fn finish_connect(&self, outcome: Result<S>) -> Result<()> {
        let result = {
            let mut state = self.state.lock();
            state.inflight = None;
            match outcome {
                Ok(session) => {
                    let now = Instant::now();
                    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                    state.idle.push(IdleEntry {
                        id,
                        session: Arc::new(session),
                        created_at: now,
                        last_used: now,
                        needs_probe: false,
                    });
                    state.live += 1;
                    state.phase = BackendState::Healthy;
                    info!(handle_id = id, live = state.live, "Backend session established");
                    Ok(())
                }
                Err(err) => {
                    state.phase = match err {
                        GatewayError::SuspendedResource(_) => BackendState::Suspended,
                        _ => BackendState::Broken,
                    };
                    Err(err)
                }
            }
        };
        self.changed.notify_waiters();
        result
    }
}

/// Session taken off the idle list while it is checked; goes back on drop
struct Leased<S> {
    entry: Option<IdleEntry<S>>,
    pool: Arc<PoolShared<S>>,
}

impl<S> Leased<S> {
    fn keep(mut self) -> Option<IdleEntry<S>> {
        self.entry.take()
    }

    fn discard(mut self) {
        if let Some(entry) = self.entry.take() {
            self.pool.discard(entry.id);
        }
    }
}

impl<S> Drop for Leased<S> {
    fn drop(&mut self) {
        if let Some(mut entry) = self.entry.take() {
            entry.needs_probe = true;
            self.pool.push_idle(entry);
        }
    }
}

enum Step<S> {
    Reuse(IdleEntry<S>),
    Join(ConnectFuture),
    Wait,
}

/// Pool of sessions to one backend
pub struct ConnectionManager<B: Backend> {
    backend: Arc<B>,
    config: Arc<ResolvedConfig>,
    settings: PoolSettings,
    policy: RetryPolicy,
    redactor: Arc<SecretRedactor>,
    shared: Arc<PoolShared<B::Session>>,
    slots: Arc<Semaphore>,
}

impl<B: Backend> Clone for ConnectionManager<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            config: Arc::clone(&self.config),
            settings: self.settings.clone(),
            policy: self.policy.clone(),
            redactor: Arc::clone(&self.redactor),
            shared: Arc::clone(&self.shared),
            slots: Arc::clone(&self.slots),
        }
    }
}

impl<B: Backend> ConnectionManager<B> {
    /// Manager with pool settings and retry profiles read from `config`
    pub fn new(backend: Arc<B>, config: Arc<ResolvedConfig>) -> Self {
        let settings = PoolSettings::from_config(&config);
        let policy = RetryPolicy::from_config(&config);
        let redactor = Arc::new(SecretRedactor::for_config(&config));
        Self::with_settings(backend, config, settings, policy, redactor)
    }

    pub fn with_settings(
        backend: Arc<B>,
        config: Arc<ResolvedConfig>,
        settings: PoolSettings,
        policy: RetryPolicy,
        redactor: Arc<SecretRedactor>,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(settings.max_size.max(1)));
        Self {
            backend,
            config,
            settings,
            policy,
            redactor,
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    phase: BackendState::Uninitialized,
                    idle: Vec::new(),
                    live: 0,
                    inflight: None,
                }),
                changed: Notify::new(),
                next_id: AtomicU64::new(1),
                handshakes: AtomicU64::new(0),
            }),
            slots,
        }
    }

    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    #[must_use]
    pub const fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    #[must_use]
    pub fn state(&self) -> BackendState {
        self.shared.state.lock().phase
    }

    /// Handshakes started so far (retries inside one handshake count once)
    #[must_use]
    pub fn handshake_count(&self) -> u64 {
        self.shared.handshakes.load(Ordering::SeqCst)
    }

    /// Sessions currently in existence
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.shared.state.lock().live
    }

    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.shared.state.lock().idle.len()
    }

    /// Lease a ready session, connecting or waking the backend if needed
    pub async fn acquire(&self) -> Result<ConnectionHandle<B::Session>> {
        let deadline = Instant::now() + self.settings.acquire_timeout;

        let permit = tokio::time::timeout_at(deadline, Arc::clone(&self.slots).acquire_owned())
            .await
            .map_err(|_| self.acquire_timed_out())?
            .map_err(|_| GatewayError::connection("connection pool is closed"))?;

        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let step = {
                let mut state = self.shared.state.lock();
                if let Some(entry) = state.idle.pop() {
                    Step::Reuse(entry)
                } else if let Some(inflight) = state.inflight.clone() {
                    Step::Join(inflight)
                } else if state.live < self.settings.max_size {
                    Step::Join(self.start_connect(&mut state))
                } else {
                    Step::Wait
                }
            };

            match step {
                Step::Reuse(entry) => {
                    let session = Arc::clone(&entry.session);
                    let stale = entry.needs_probe || entry.last_used.elapsed() >= self.settings.idle_timeout;
                    let leased = Leased { entry: Some(entry), pool: Arc::clone(&self.shared) };

                    if stale && !self.probe(&session).await {
                        leased.discard();
                        continue;
                    }
                    if let Some(entry) = leased.keep() {
                        debug!(handle_id = entry.id, "Leased handle");
                        return Ok(ConnectionHandle::new(entry, Arc::clone(&self.shared), permit));
                    }
                }
                Step::Join(inflight) => inflight.await?,
                Step::Wait => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(self.acquire_timed_out());
                    }
                }
            }
        }
    }

    fn acquire_timed_out(&self) -> GatewayError {
        GatewayError::connection(format!(
            "no connection became available within {}s",
            self.settings.acquire_timeout.as_secs()
        ))
    }

    /// Return a handle to the pool for reuse
    pub fn release(&self, handle: ConnectionHandle<B::Session>) {
        debug!(handle_id = handle.id(), "Released handle");
        handle.settle_release(false);
    }

    /// Destroy a handle that may be unsafe to reuse
    pub fn invalidate(&self, mut handle: ConnectionHandle<B::Session>) {
        handle.mark(HandleHealth::Broken);
        debug!(handle_id = handle.id(), "Invalidating handle");
        handle.settle_invalidate();
    }

    async fn probe(&self, session: &B::Session) -> bool {
        match tokio::time::timeout(self.settings.probe_timeout, self.backend.probe(session)).await {
            Ok(healthy) => healthy,
            Err(_) => {
                debug!(timeout_ms = self.settings.probe_timeout.as_millis() as u64, "Probe timed out");
                false
            }
        }
    }

    /// Spawn a handshake and record it as in flight. Caller holds the state lock.
    fn start_connect(&self, state: &mut PoolState<B::Session>) -> ConnectFuture {
        state.phase = BackendState::Connecting;
        let number = self.shared.handshakes.fetch_add(1, Ordering::SeqCst) + 1;

        let backend = Arc::clone(&self.backend);
        let config = Arc::clone(&self.config);
        let policy = self.policy.clone();
        let redactor = Arc::clone(&self.redactor);
        let shared = Arc::clone(&self.shared);

        let task = tokio::spawn(async move {
            debug!(backend = backend.name(), handshake = number, "Starting handshake");
            let outcome = policy
                .run(
                    |_| backend.authenticate(&config),
                    |err, delay, next_attempt| {
                        if matches!(err, GatewayError::SuspendedResource(_)) {
                            shared.state.lock().phase = BackendState::Suspended;
                        }
                        warn!(
                            backend = backend.name(),
                            kind = %err.kind(),
                            next_attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %redactor.scrub(&err.message()),
                            "Handshake failed, retrying"
                        );
                    },
                )
                .await;

            if let Err(err) = &outcome {
                warn!(
                    backend = backend.name(),
                    kind = %err.kind(),
                    error = %redactor.scrub(&err.message()),
                    "Handshake failed"
                );
            }
            shared.finish_connect(outcome)
        });

        let shared = Arc::clone(&self.shared);
        let inflight = async move {
            match task.await {
                Ok(result) => result,
                Err(join_err) => {
                    let err = GatewayError::connection(format!("handshake task ended abnormally: {join_err}"));
                    shared.finish_connect(Err(err))
                }
            }
        }
        .boxed()
        .shared();

        state.inflight = Some(inflight.clone());
        inflight
    }
}
