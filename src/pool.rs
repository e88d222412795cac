//! Bounded backend connection pool.
//!
//! Borrowing pops an idle connection or dials a new one; a semaphore caps the
//! total. Connections idle for more than a second are probed with PING before
//! being handed out. A borrowed connection returns to the idle list when its
//! guard drops, unless it was poisoned by an I/O or protocol error.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::resp::{Command, Connection};

const PROBE_AFTER: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    network: String,
    addr: String,
    timeout: Duration,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<IdleConn>>,
}

struct IdleConn {
    conn: Connection,
    since: Instant,
}

impl Pool {
    pub fn new(config: &Config) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                network: config.network.clone(),
                addr: config.addr.clone(),
                timeout: config.timeout(),
                permits: Arc::new(Semaphore::new(config.max_conns.max(1))),
                idle: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Borrows a connection, suspending while the pool is exhausted.
    pub async fn get(&self) -> Result<PooledConn> {
        let permit = self
            .inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::backend("connection pool is closed"))?;

        loop {
            let idle = self.inner.idle.lock().pop();
            let Some(idle) = idle else { break };

            if idle.since.elapsed() < PROBE_AFTER {
                return Ok(PooledConn::live(idle.conn, self.inner.clone(), permit));
            }
            // stale connection: make sure it can still talk before reuse
            let mut conn = idle.conn;
            match conn.call(&Command::new("PING")).await {
                Ok(_) => return Ok(PooledConn::live(conn, self.inner.clone(), permit)),
                Err(err) => {
                    tracing::debug!(%err, "dropping dead pooled connection");
                }
            }
        }

        if self.inner.network != "tcp" {
            return Err(Error::backend(format!(
                "unsupported backend network: {}",
                self.inner.network
            )));
        }
        let conn = Connection::connect(&self.inner.addr, self.inner.timeout).await?;
        Ok(PooledConn::live(conn, self.inner.clone(), permit))
    }
}

/// A borrowed connection. Derefs to [`Connection`]; returns to the pool on
/// drop unless [`PooledConn::poison`] was called.
pub struct PooledConn {
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
    poisoned: bool,
}

impl PooledConn {
    fn live(conn: Connection, pool: Arc<PoolInner>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            conn: Some(conn),
            pool,
            _permit: permit,
            poisoned: false,
        }
    }

    /// Marks the connection as unusable; it will be closed instead of pooled.
    pub fn poison(&mut self) {
        self.poisoned = true;
    }
}

impl std::ops::Deref for PooledConn {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection taken")
    }
}

impl std::ops::DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection taken")
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if self.poisoned {
            return;
        }
        if let Some(conn) = self.conn.take() {
            self.pool.idle.lock().push(IdleConn {
                conn,
                since: Instant::now(),
            });
        }
    }
}
