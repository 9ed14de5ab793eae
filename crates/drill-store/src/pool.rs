//! Bounded pool of SQLite connections.
//!
//! Checkout is gated by a semaphore sized to `max_connections`; a caller waits
//! up to `checkout_timeout` for a permit before failing with
//! [`StoreError::PoolTimeout`]. Idle connections older than `max_lifetime`, or
//! idle for longer than `max_idle`, are closed instead of being reused.
//! Dropping a [`PooledConnection`] returns it to the pool.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rusqlite::Connection;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::{StoreError, StoreResult};

/// Sizing and recycling limits for a [`ConnectionPool`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Connections opened eagerly when the pool is created.
    pub min_connections: usize,
    /// Upper bound on connections checked out at once.
    pub max_connections: usize,
    /// How long `acquire` waits for a free slot.
    pub checkout_timeout: Duration,
    /// Age after which a connection is closed rather than reused.
    pub max_lifetime: Duration,
    /// Idle time after which a connection is closed rather than reused.
    pub max_idle: Duration,
    /// SQLite busy timeout set on every connection.
    pub busy_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 10,
            checkout_timeout: Duration::from_secs(30),
            max_lifetime: Duration::from_secs(3600),
            max_idle: Duration::from_secs(600),
            busy_timeout: Duration::from_secs(30),
        }
    }
}

/// Point-in-time pool usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Open connections, idle or checked out.
    pub size: usize,
    /// Idle connections ready for checkout.
    pub available: usize,
    /// Configured upper bound.
    pub max_size: usize,
}

struct IdleConnection {
    connection: Connection,
    created_at: Instant,
    idle_since: Instant,
}

struct PoolInner {
    path: PathBuf,
    config: PoolConfig,
    idle: Mutex<Vec<IdleConnection>>,
    open: AtomicUsize,
}

impl PoolInner {
    fn is_expired(&self, created_at: Instant, idle_since: Instant, now: Instant) -> bool {
        now.saturating_duration_since(created_at) >= self.config.max_lifetime
            || now.saturating_duration_since(idle_since) >= self.config.max_idle
    }

    fn take_idle(&self) -> Option<(Connection, Instant)> {
        let now = Instant::now();
        let mut idle = self.idle.lock().ok()?;
        while let Some(entry) = idle.pop() {
            if self.is_expired(entry.created_at, entry.idle_since, now) {
                self.open.fetch_sub(1, Ordering::SeqCst);
                debug!(path = %self.path.display(), "Closing expired pooled connection");
                continue;
            }
            return Some((entry.connection, entry.created_at));
        }
        None
    }

    fn give_back(&self, connection: Connection, created_at: Instant) {
        let now = Instant::now();
        if now.saturating_duration_since(created_at) >= self.config.max_lifetime {
            self.open.fetch_sub(1, Ordering::SeqCst);
            return;
        }
        match self.idle.lock() {
            Ok(mut idle) => idle.push(IdleConnection {
                connection,
                created_at,
                idle_since: now,
            }),
            Err(_) => {
                self.open.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}

/// A bounded pool of connections to one SQLite database file.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
    permits: Arc<Semaphore>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("path", &self.inner.path)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    /// Creates the pool and opens `min_connections` connections.
    ///
    /// Blocking; call from `spawn_blocking` inside a runtime.
    pub fn open(path: impl AsRef<Path>, config: PoolConfig) -> StoreResult<Self> {
        if config.max_connections == 0 {
            return Err(StoreError::InvalidData(
                "pool max_connections must be at least 1".into(),
            ));
        }

        let path = path.as_ref().to_path_buf();
        let mut idle = Vec::with_capacity(config.max_connections);
        let now = Instant::now();
        for _ in 0..config.min_connections.min(config.max_connections) {
            idle.push(IdleConnection {
                connection: open_connection(&path, config.busy_timeout)?,
                created_at: now,
                idle_since: now,
            });
        }

        let permits = Arc::new(Semaphore::new(config.max_connections));
        let inner = Arc::new(PoolInner {
            open: AtomicUsize::new(idle.len()),
            idle: Mutex::new(idle),
            path,
            config,
        });
        Ok(Self { inner, permits })
    }

    /// Checks out a connection, waiting up to the checkout timeout.
    pub async fn acquire(&self) -> StoreResult<PooledConnection> {
        let waited = self.inner.config.checkout_timeout;
        let permit = tokio::time::timeout(waited, Arc::clone(&self.permits).acquire_owned())
            .await
            .map_err(|_| StoreError::PoolTimeout { waited })?
            .map_err(|e| StoreError::Task(format!("connection pool closed: {e}")))?;

        let (connection, created_at) = if let Some(reused) = self.inner.take_idle() {
            reused
        } else {
            let path = self.inner.path.clone();
            let busy_timeout = self.inner.config.busy_timeout;
            let connection =
                tokio::task::spawn_blocking(move || open_connection(&path, busy_timeout))
                    .await
                    .map_err(|e| StoreError::Task(e.to_string()))??;
            self.inner.open.fetch_add(1, Ordering::SeqCst);
            (connection, Instant::now())
        };

        Ok(PooledConnection {
            connection: Some(connection),
            created_at,
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Returns current usage figures.
    pub fn stats(&self) -> PoolStats {
        let available = self.inner.idle.lock().map_or(0, |idle| idle.len());
        PoolStats {
            size: self.inner.open.load(Ordering::SeqCst),
            available,
            max_size: self.inner.config.max_connections,
        }
    }
}

/// A connection checked out of a [`ConnectionPool`].
pub struct PooledConnection {
    connection: Option<Connection>,
    created_at: Instant,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Borrows the underlying connection.
    pub fn connection(&mut self) -> StoreResult<&mut Connection> {
        self.connection
            .as_mut()
            .ok_or_else(|| StoreError::Task("pooled connection already released".into()))
    }

    /// Returns a handle that can interrupt statements running on this
    /// connection from another thread.
    pub fn interrupt_handle(&self) -> Option<rusqlite::InterruptHandle> {
        self.connection
            .as_ref()
            .map(Connection::get_interrupt_handle)
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.give_back(connection, self.created_at);
        }
    }
}

fn open_connection(path: &Path, busy_timeout: Duration) -> StoreResult<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let connection = Connection::open(path)?;
    connection.busy_timeout(busy_timeout)?;
    connection.execute_batch(
        r"
        PRAGMA journal_mode = WAL;
        PRAGMA foreign_keys = ON;
        PRAGMA synchronous = NORMAL;
        ",
    )?;
    Ok(connection)
}
