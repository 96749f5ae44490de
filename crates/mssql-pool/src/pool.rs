//! Connection pool implementation.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::PoolConfig;
use crate::error::PoolError;

/// A connection pool for SQL Server.
///
/// The pool manages a set of database connections, providing automatic
/// connection reuse, health checking, and lifecycle management.
pub struct Pool {
    config: PoolConfig,
    // Placeholder for actual pool state
    // Real implementation would include:
    // - Connection queue
    // - Semaphore for max connections
    // - Background task handles
    // - Metrics
    inner: Arc<PoolInner>,
}

struct PoolInner {
    #[allow(dead_code)] // Will be used once pool implementation is complete
    config: PoolConfig,
    // Actual connection management would go here
    closed: Mutex<bool>,
}

impl Pool {
    /// Get a connection from the pool.
    ///
    /// This will either return an existing idle connection or create a new one
    /// if the pool is not at capacity. If all connections are in use and the
    /// pool is at capacity, this will wait until a connection becomes available
    /// or the timeout is reached.
    pub async fn get(&self) -> Result<PooledConnection, PoolError> {
        if *self.inner.closed.lock() {
            return Err(PoolError::PoolClosed);
        }

        tracing::trace!("acquiring connection from pool");

        // Placeholder: actual connection acquisition logic
        // Would involve:
        // 1. Try to get idle connection
        // 2. If none, try to create new (if under max)
        // 3. If at max, wait with timeout

        todo!("Pool::get() - connection acquisition not yet implemented")
    }

    /// Get the current pool status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            available: 0,
            in_use: 0,
            total: 0,
            max: self.config.max_connections,
        }
    }

    /// Close the pool, dropping all connections.
    pub async fn close(&self) {
        *self.inner.closed.lock() = true;
        tracing::info!("connection pool closed");
    }

    /// Check if the pool is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.inner.closed.lock()
    }

    /// Get the pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }
}

/// Status information about the pool.
#[derive(Debug, Clone, Copy)]
pub struct PoolStatus {
    /// Number of idle connections available.
    pub available: u32,
    /// Number of connections currently in use.
    pub in_use: u32,
    /// Total number of connections.
    pub total: u32,
    /// Maximum allowed connections.
    pub max: u32,
}

/// A connection retrieved from the pool.
///
/// When dropped, the connection is automatically returned to the pool.
pub struct PooledConnection {
    // Placeholder for actual connection
    // Would hold the underlying Client<Ready> and pool reference
    _private: (),
}

impl PooledConnection {
    /// Detach the connection from the pool.
    ///
    /// The connection will not be returned to the pool when dropped.
    pub fn detach(self) {
        // Prevent returning to pool
        std::mem::forget(self);
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        // Return connection to pool
        // Would involve:
        // 1. Run sp_reset_connection if configured
        // 2. Return to idle queue
        tracing::trace!("returning connection to pool");
    }
}
