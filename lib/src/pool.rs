//! Generic connection pool
//!
//! Pools arbitrary connection values behind an async factory: idle entries
//! are reused, new ones created while under the cap, and everything else
//! parks in a FIFO waiter queue bounded by an acquire timeout. A periodic
//! reaper destroys idle entries past their idle budget. All state lives
//! under one lock that is never held across an await.

use crate::config::PoolConfig;
use crate::{AgentError, Result};
use std::collections::VecDeque;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Reaper cadence.
const REAP_INTERVAL: Duration = Duration::from_secs(30);

/// How long `drain` waits for active connections before proceeding anyway.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// EWMA weight for the average wait time.
const WAIT_EWMA_ALPHA: f64 = 0.1;

struct Entry<T> {
    id: u64,
    conn: T,
    created_at: Instant,
    last_used_at: Instant,
    request_count: u64,
}

struct PoolState<T> {
    idle: Vec<Entry<T>>,
    active: usize,
    /// active + idle + in-flight creations
    total: usize,
    next_entry_id: u64,
    waiters: VecDeque<oneshot::Sender<Entry<T>>>,
    shutdown: bool,

    total_created: u64,
    total_destroyed: u64,
    total_requests: u64,
    waiting: usize,
    average_wait_ms: f64,
    peak_connections: usize,
}

impl<T> PoolState<T> {
    fn record_wait(&mut self, waited: Duration) {
        let ms = waited.as_secs_f64() * 1000.0;
        self.average_wait_ms += WAIT_EWMA_ALPHA * (ms - self.average_wait_ms);
    }
}

struct PoolInner<T> {
    state: Mutex<PoolState<T>>,
    config: PoolConfig,
    drain_timeout: Duration,
}

/// Point-in-time metrics. `peak_connections` is a process-lifetime
/// high-water mark and is never reset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolMetrics {
    pub total_created: u64,
    pub total_destroyed: u64,
    pub active_connections: usize,
    pub idle_connections: usize,
    pub total_requests: u64,
    pub waiting_requests: usize,
    pub average_wait_time_ms: f64,
    pub peak_connections: usize,
}

enum AcquirePlan<T> {
    Reuse(Entry<T>),
    Create(u64),
    Wait(oneshot::Receiver<Entry<T>>),
}

/// Pool over values of type `T`.
pub struct ConnectionPool<T: Send + 'static> {
    inner: Arc<PoolInner<T>>,
    reaper: CancellationToken,
}

impl<T: Send + 'static> ConnectionPool<T> {
    pub fn new(config: PoolConfig) -> Self {
        Self::with_reap_interval(config, REAP_INTERVAL)
    }

    /// Custom reaper cadence; tests shrink it to watch idle eviction.
    pub fn with_reap_interval(config: PoolConfig, reap_interval: Duration) -> Self {
        Self::with_tuning(config, reap_interval, DRAIN_TIMEOUT)
    }

    /// Full tuning surface, for tests that exercise forced drains.
    pub fn with_tuning(
        config: PoolConfig,
        reap_interval: Duration,
        drain_timeout: Duration,
    ) -> Self {
        let inner = Arc::new(PoolInner {
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                active: 0,
                total: 0,
                next_entry_id: 0,
                waiters: VecDeque::new(),
                shutdown: false,
                total_created: 0,
                total_destroyed: 0,
                total_requests: 0,
                waiting: 0,
                average_wait_ms: 0.0,
                peak_connections: 0,
            }),
            config,
            drain_timeout,
        });

        let reaper = CancellationToken::new();
        {
            let inner = Arc::clone(&inner);
            let token = reaper.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(reap_interval);
                interval.tick().await; // immediate first tick
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = interval.tick() => Self::reap_idle(&inner),
                    }
                }
            });
        }

        Self { inner, reaper }
    }

    fn reap_idle(inner: &PoolInner<T>) {
        let mut state = inner.state.lock().expect("pool lock poisoned");
        let max_idle = inner.config.max_idle_time();
        let now = Instant::now();
        let before = state.idle.len();
        state
            .idle
            .retain(|entry| now.duration_since(entry.last_used_at) <= max_idle);
        let destroyed = before - state.idle.len();
        if destroyed > 0 {
            state.total -= destroyed;
            state.total_destroyed += destroyed as u64;
            tracing::debug!("Reaped {} idle connection(s)", destroyed);
        }
    }

    /// Acquire a connection, creating one with `factory` when the pool has
    /// room. Over-cap acquirers wait FIFO until a release or the acquire
    /// timeout.
    pub async fn acquire<F, Fut>(&self, factory: F) -> Result<PooledConnection<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();

        let plan = {
            let mut state = self.inner.state.lock().expect("pool lock poisoned");
            if state.shutdown {
                return Err(AgentError::Protocol(
                    "Connection pool is shut down".to_string(),
                ));
            }
            state.total_requests += 1;

            if let Some(entry) = state.idle.pop() {
                state.active += 1;
                AcquirePlan::Reuse(entry)
            } else if state.total < self.inner.config.max_connections {
                state.total += 1;
                state.active += 1;
                state.next_entry_id += 1;
                AcquirePlan::Create(state.next_entry_id)
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                state.waiting += 1;
                AcquirePlan::Wait(rx)
            }
        };

        match plan {
            AcquirePlan::Reuse(entry) => {
                self.inner
                    .state
                    .lock()
                    .expect("pool lock poisoned")
                    .record_wait(started.elapsed());
                Ok(PooledConnection {
                    entry: Some(entry),
                    inner: Arc::clone(&self.inner),
                })
            }
            AcquirePlan::Create(id) => match factory().await {
                Ok(conn) => {
                    let now = Instant::now();
                    {
                        let mut state = self.inner.state.lock().expect("pool lock poisoned");
                        state.total_created += 1;
                        state.peak_connections = state.peak_connections.max(state.total);
                        state.record_wait(started.elapsed());
                    }
                    Ok(PooledConnection {
                        entry: Some(Entry {
                            id,
                            conn,
                            created_at: now,
                            last_used_at: now,
                            request_count: 0,
                        }),
                        inner: Arc::clone(&self.inner),
                    })
                }
                Err(e) => {
                    let mut state = self.inner.state.lock().expect("pool lock poisoned");
                    state.total -= 1;
                    state.active -= 1;
                    Err(e)
                }
            },
            AcquirePlan::Wait(rx) => {
                let timeout = self.inner.config.acquire_timeout();
                let outcome = tokio::time::timeout(timeout, rx).await;
                let mut state = self.inner.state.lock().expect("pool lock poisoned");
                state.waiting = state.waiting.saturating_sub(1);
                match outcome {
                    Ok(Ok(entry)) => {
                        state.record_wait(started.elapsed());
                        drop(state);
                        Ok(PooledConnection {
                            entry: Some(entry),
                            inner: Arc::clone(&self.inner),
                        })
                    }
                    Ok(Err(_)) => Err(AgentError::Protocol(
                        "Connection pool is shut down".to_string(),
                    )),
                    Err(_) => Err(AgentError::Protocol(format!(
                        "Connection acquire timeout after {}ms",
                        timeout.as_millis()
                    ))),
                }
            }
        }
    }

    /// Wait for active connections to come home, up to the drain budget.
    pub async fn drain(&self) {
        let deadline = Instant::now() + self.inner.drain_timeout;
        loop {
            let active = self.inner.state.lock().expect("pool lock poisoned").active;
            if active == 0 {
                return;
            }
            if Instant::now() >= deadline {
                tracing::warn!("Pool drain timed out with {} connection(s) active", active);
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Stop the reaper, drain, destroy idle entries, and reject queued
    /// waiters. Connections still in callers' hands are destroyed as their
    /// guards drop.
    pub async fn shutdown(&self) {
        self.reaper.cancel();
        self.drain().await;

        let waiters = {
            let mut state = self.inner.state.lock().expect("pool lock poisoned");
            state.shutdown = true;
            let destroyed = state.idle.len();
            state.idle.clear();
            state.total -= destroyed;
            state.total_destroyed += destroyed as u64;
            std::mem::take(&mut state.waiters)
        };
        // Dropping the senders resolves every queued acquire as shut down.
        drop(waiters);
        tracing::info!("Connection pool shut down");
    }

    pub fn metrics(&self) -> PoolMetrics {
        let state = self.inner.state.lock().expect("pool lock poisoned");
        PoolMetrics {
            total_created: state.total_created,
            total_destroyed: state.total_destroyed,
            active_connections: state.active,
            idle_connections: state.idle.len(),
            total_requests: state.total_requests,
            waiting_requests: state.waiting,
            average_wait_time_ms: state.average_wait_ms,
            peak_connections: state.peak_connections,
        }
    }

    /// Current pool size: active plus idle.
    pub fn size(&self) -> usize {
        self.inner.state.lock().expect("pool lock poisoned").total
    }
}

impl<T: Send + 'static> Drop for ConnectionPool<T> {
    fn drop(&mut self) {
        self.reaper.cancel();
    }
}

/// An acquired connection. Dropping it returns the connection to the pool
/// (or destroys it after shutdown); the head waiter, if any, is served
/// directly.
pub struct PooledConnection<T: Send + 'static> {
    entry: Option<Entry<T>>,
    inner: Arc<PoolInner<T>>,
}

impl<T: Send + 'static> std::fmt::Debug for PooledConnection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.entry.as_ref().map(|e| e.id))
            .finish()
    }
}

impl<T: Send + 'static> PooledConnection<T> {
    pub fn id(&self) -> u64 {
        self.entry.as_ref().expect("entry taken").id
    }

    pub fn created_at(&self) -> Instant {
        self.entry.as_ref().expect("entry taken").created_at
    }

    pub fn request_count(&self) -> u64 {
        self.entry.as_ref().expect("entry taken").request_count
    }

    /// Explicit release; equivalent to dropping the guard.
    pub fn release(self) {}
}

impl<T: Send + 'static> Deref for PooledConnection<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.entry.as_ref().expect("entry taken").conn
    }
}

impl<T: Send + 'static> DerefMut for PooledConnection<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.entry.as_mut().expect("entry taken").conn
    }
}

impl<T: Send + 'static> Drop for PooledConnection<T> {
    fn drop(&mut self) {
        let Some(mut entry) = self.entry.take() else {
            return;
        };
        entry.last_used_at = Instant::now();
        entry.request_count += 1;

        let mut state = self.inner.state.lock().expect("pool lock poisoned");
        state.active -= 1;

        if state.shutdown {
            state.total -= 1;
            state.total_destroyed += 1;
            return;
        }

        // Hand the entry to the first waiter still listening.
        let mut entry = entry;
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(entry) {
                Ok(()) => {
                    state.active += 1;
                    return;
                }
                // Receiver timed out and went away; try the next one.
                Err(returned) => entry = returned,
            }
        }
        state.idle.push(entry);
    }
}
