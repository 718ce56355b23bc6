//! Bounded pool of persistent control-channel connections
//!
//! A semaphore caps how many connections can be on loan at once. Acquiring
//! waits for a permit, then reuses a live idle connection or opens a new one.
//! The permit travels with the [`PooledConnection`] guard and is released
//! when the guard is dropped or handed back with
//! [`ConnectionPool::return_connection`].
//!
//! Live connections (idle plus on loan) never exceed `pool_size`.

use crate::config::PoolConfig;
use crate::error::{Result, SandboxError};
use crate::transport::{Connection, Connector};
use parking_lot::Mutex;
use sandcastle_observability::SandcastleMetrics;
use serde::Serialize;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Point-in-time pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub idle: usize,
    pub in_flight: usize,
    pub created_total: u64,
    pub pool_size: usize,
}

struct PoolState<T> {
    idle: VecDeque<T>,
    in_flight: usize,
}

struct PoolInner<C: Connector> {
    connector: C,
    config: PoolConfig,
    semaphore: Arc<Semaphore>,
    state: Mutex<PoolState<C::Conn>>,
    created_total: AtomicU64,
    metrics: Option<Arc<SandcastleMetrics>>,
}

impl<C: Connector> PoolInner<C> {
    /// Take a connection back; returns it if it must be disconnected instead
    fn check_in(&self, conn: C::Conn) -> Option<C::Conn> {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);

        let verdict = if self.semaphore.is_closed() {
            Some("pool closed")
        } else if !conn.is_connected() {
            Some("connection lost")
        } else if state.idle.len() + state.in_flight >= self.config.pool_size {
            Some("pool full")
        } else {
            None
        };

        let discard = match verdict {
            Some(reason) => {
                tracing::debug!(endpoint = %self.connector.endpoint(), reason, "Discarding returned connection");
                Some(conn)
            }
            None => {
                state.idle.push_back(conn);
                None
            }
        };

        self.sync_metrics(&state);
        discard
    }

    fn sync_metrics(&self, state: &PoolState<C::Conn>) {
        if let Some(metrics) = &self.metrics {
            metrics.set_pool_connections(state.idle.len(), state.in_flight);
        }
    }
}

/// Pool of reusable connections to one sandbox endpoint
pub struct ConnectionPool<C: Connector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> std::fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("endpoint", &self.inner.connector.endpoint())
            .field("stats", &self.stats())
            .finish()
    }
}

impl<C: Connector> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Connector> ConnectionPool<C> {
    pub fn new(connector: C, config: PoolConfig) -> Self {
        Self::build(connector, config, None)
    }

    /// Create a pool that mirrors its occupancy into the metrics registry
    pub fn with_metrics(connector: C, config: PoolConfig, metrics: Arc<SandcastleMetrics>) -> Self {
        Self::build(connector, config, Some(metrics))
    }

    fn build(connector: C, config: PoolConfig, metrics: Option<Arc<SandcastleMetrics>>) -> Self {
        let pool_size = config.pool_size.max(1);
        Self {
            inner: Arc::new(PoolInner {
                connector,
                config: PoolConfig { pool_size, ..config },
                semaphore: Arc::new(Semaphore::new(pool_size)),
                state: Mutex::new(PoolState {
                    idle: VecDeque::with_capacity(pool_size),
                    in_flight: 0,
                }),
                created_total: AtomicU64::new(0),
                metrics,
            }),
        }
    }

    /// Borrow a connection, waiting while `pool_size` are already on loan
    ///
    /// Stale idle connections are disconnected and skipped.
    pub async fn get_connection(&self) -> Result<PooledConnection<C>> {
        let permit = self
            .inner
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SandboxError::PoolClosed)?;

        loop {
            let candidate = {
                let mut state = self.inner.state.lock();
                match state.idle.pop_front() {
                    Some(conn) if conn.is_connected() => {
                        state.in_flight += 1;
                        self.inner.sync_metrics(&state);
                        return Ok(PooledConnection::new(conn, permit, self.inner.clone()));
                    }
                    other => other,
                }
            };

            match candidate {
                Some(mut stale) => {
                    tracing::debug!(endpoint = %self.inner.connector.endpoint(), "Dropping stale idle connection");
                    stale.disconnect().await;
                }
                None => break,
            }
        }

        let timeout = self.inner.config.connect_timeout;
        let mut conn = self.inner.connector.create();
        if !conn.connect(timeout).await {
            let endpoint = self.inner.connector.endpoint();
            tracing::warn!(endpoint = %endpoint, ?timeout, "Failed to open pooled connection");
            return Err(SandboxError::ConnectFailed { endpoint, timeout });
        }

        let created = self.inner.created_total.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(endpoint = %self.inner.connector.endpoint(), created, "Opened pooled connection");

        let mut state = self.inner.state.lock();
        state.in_flight += 1;
        self.inner.sync_metrics(&state);
        drop(state);

        Ok(PooledConnection::new(conn, permit, self.inner.clone()))
    }

    /// Hand a connection back, disconnecting it if it cannot be pooled
    pub async fn return_connection(&self, mut conn: PooledConnection<C>) {
        if let Some((conn, _permit)) = conn.take() {
            if let Some(mut discard) = self.inner.check_in(conn) {
                discard.disconnect().await;
            }
        }
    }

    /// Disconnect every idle connection and reset the counters
    ///
    /// Connections on loan are untouched; use [`ConnectionPool::shutdown`] to
    /// have them discarded when they come back.
    pub async fn close_all(&self) {
        let drained: Vec<C::Conn> = {
            let mut state = self.inner.state.lock();
            let drained = state.idle.drain(..).collect();
            self.inner.sync_metrics(&state);
            drained
        };

        let count = drained.len();
        for mut conn in drained {
            conn.disconnect().await;
        }
        self.inner.created_total.store(0, Ordering::SeqCst);

        tracing::info!(endpoint = %self.inner.connector.endpoint(), closed = count, "Closed idle pool connections");
    }

    /// Refuse further acquisitions and close idle connections
    pub async fn shutdown(&self) {
        self.inner.semaphore.close();
        self.close_all().await;
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            idle: state.idle.len(),
            in_flight: state.in_flight,
            created_total: self.inner.created_total.load(Ordering::SeqCst),
            pool_size: self.inner.config.pool_size,
        }
    }

    pub fn endpoint(&self) -> String {
        self.inner.connector.endpoint()
    }
}

/// A connection on loan from a [`ConnectionPool`]
///
/// Returned to the pool when dropped.
pub struct PooledConnection<C: Connector> {
    conn: Option<C::Conn>,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<PoolInner<C>>,
}

impl<C: Connector> PooledConnection<C> {
    fn new(conn: C::Conn, permit: OwnedSemaphorePermit, pool: Arc<PoolInner<C>>) -> Self {
        Self {
            conn: Some(conn),
            permit: Some(permit),
            pool,
        }
    }

    fn take(&mut self) -> Option<(C::Conn, OwnedSemaphorePermit)> {
        self.conn.take().zip(self.permit.take())
    }
}

impl<C: Connector> std::fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection").finish_non_exhaustive()
    }
}

impl<C: Connector> Deref for PooledConnection<C> {
    type Target = C::Conn;

    fn deref(&self) -> &C::Conn {
        // Emptied only while the guard is being consumed
        self.conn
            .as_ref()
            .unwrap_or_else(|| unreachable!("pooled connection used after return"))
    }
}

impl<C: Connector> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut C::Conn {
        self.conn
            .as_mut()
            .unwrap_or_else(|| unreachable!("pooled connection used after return"))
    }
}

impl<C: Connector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        let Some((conn, permit)) = self.take() else {
            return;
        };

        if let Some(mut discard) = self.pool.check_in(conn) {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    discard.disconnect().await;
                });
            }
        }
        // Release the slot only after the connection is back in the idle queue
        drop(permit);
    }
}
