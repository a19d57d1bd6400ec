/**
 * Copyright (c) 2024-2025 MAAS Developers.
 *
 * This file is part of MAAS Agent
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <http://www.gnu.org/licenses/>.
 */
use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

// a dial function producing a fresh connection on demand
pub type Factory<C> =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = io::Result<C>> + Send>> + Send + Sync>;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool capacity must be positive")]
    InvalidCapacity,
    #[error("pool is closed")]
    Closed,
    #[error(transparent)]
    Dial(#[from] io::Error),
}

// idle connections, None once the pool has been closed
struct PoolInner<C> {
    idle: Mutex<Option<VecDeque<C>>>,
    capacity: usize,
    factory: Factory<C>,
}

/// Fixed-capacity pool of idle connections.
///
/// `get` hands out an idle connection when one is available and dials a new
/// one otherwise. Returned connections go back to the pool on drop unless the
/// holder marked them unusable or the pool is already full or closed, in
/// which case the underlying connection is really closed.
pub struct ConnPool<C> {
    inner: Arc<PoolInner<C>>,
}

impl<C> Clone for ConnPool<C> {
    fn clone(&self) -> Self {
        ConnPool {
            inner: self.inner.clone(),
        }
    }
}

impl<C> std::fmt::Debug for ConnPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnPool").finish()
    }
}

impl<C: Send + 'static> ConnPool<C> {
    pub fn new<F, Fut>(capacity: usize, factory: F) -> Result<Self, PoolError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = io::Result<C>> + Send + 'static,
    {
        if capacity == 0 {
            return Err(PoolError::InvalidCapacity);
        }
        let factory: Factory<C> = Arc::new(move || Box::pin(factory()));
        Ok(ConnPool {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(Some(VecDeque::with_capacity(capacity))),
                capacity,
                factory,
            }),
        })
    }

    /// Picks up an idle connection, dialing a fresh one when none is parked.
    pub async fn get(&self) -> Result<PooledConn<C>, PoolError> {
        let idle = {
            let mut guard = self.inner.idle.lock();
            match guard.as_mut() {
                None => return Err(PoolError::Closed),
                Some(queue) => queue.pop_front(),
            }
        };
        let conn = match idle {
            Some(conn) => conn,
            None => (self.inner.factory)().await?,
        };
        Ok(PooledConn {
            conn: Some(conn),
            unusable: false,
            pool: self.inner.clone(),
        })
    }

    /// Closes every idle connection and refuses further `get` calls.
    /// Connections still out keep working and are really closed on return.
    pub fn close(&self) {
        let drained = self.inner.idle.lock().take();
        // dropping outside the lock closes the underlying connections
        drop(drained);
    }

    pub fn len(&self) -> usize {
        self.inner
            .idle
            .lock()
            .as_ref()
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A live connection checked out of a [`ConnPool`].
///
/// Dropping it is the logical close: the connection is parked back in the
/// pool, unless it was marked unusable.
pub struct PooledConn<C> {
    conn: Option<C>,
    unusable: bool,
    pool: Arc<PoolInner<C>>,
}

impl<C: std::fmt::Debug> std::fmt::Debug for PooledConn<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConn")
            .field("conn", &self.conn)
            .field("unusable", &self.unusable)
            .finish()
    }
}

impl<C> PooledConn<C> {
    /// Prevents this connection from ever going back to the pool; the
    /// underlying transport is closed on drop instead.
    pub fn mark_unusable(&mut self) {
        self.unusable = true;
    }
}

impl<C> Deref for PooledConn<C> {
    type Target = C;

    fn deref(&self) -> &C {
        // the option is only vacated in drop
        self.conn.as_ref().unwrap()
    }
}

impl<C> DerefMut for PooledConn<C> {
    fn deref_mut(&mut self) -> &mut C {
        self.conn.as_mut().unwrap()
    }
}

impl<C> Drop for PooledConn<C> {
    fn drop(&mut self) {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => return,
        };
        if self.unusable {
            return;
        }
        let mut guard = self.pool.idle.lock();
        if let Some(queue) = guard.as_mut() {
            if queue.len() < self.pool.capacity {
                queue.push_back(conn);
            }
            // full pool: fall through and close the connection
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // connections are plain counters in these tests, the pool is generic
    fn counting_pool(
        capacity: usize,
    ) -> (ConnPool<usize>, Arc<AtomicUsize>) {
        let dialed = Arc::new(AtomicUsize::new(0));
        let dialed2 = dialed.clone();
        let pool = ConnPool::new(capacity, move || {
            let n = dialed2.fetch_add(1, Ordering::SeqCst);
            async move { Ok(n) }
        })
        .unwrap();
        (pool, dialed)
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let err = ConnPool::<usize>::new(0, || async { Ok(0) }).unwrap_err();
        assert!(matches!(err, PoolError::InvalidCapacity));
    }

    #[tokio::test]
    async fn dials_when_empty_and_reuses_returned() {
        let (pool, dialed) = counting_pool(4);
        let conn = pool.get().await.unwrap();
        assert_eq!(*conn, 0);
        assert_eq!(dialed.load(Ordering::SeqCst), 1);
        drop(conn);
        assert_eq!(pool.len(), 1);
        // second get must pick up the parked connection, not dial
        let conn = pool.get().await.unwrap();
        assert_eq!(*conn, 0);
        assert_eq!(dialed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unusable_connections_are_not_returned() {
        let (pool, dialed) = counting_pool(4);
        let mut conn = pool.get().await.unwrap();
        conn.mark_unusable();
        drop(conn);
        assert_eq!(pool.len(), 0);
        let _ = pool.get().await.unwrap();
        assert_eq!(dialed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn idle_connections_are_capped_at_capacity() {
        let (pool, _) = counting_pool(2);
        let a = pool.get().await.unwrap();
        let b = pool.get().await.unwrap();
        let c = pool.get().await.unwrap();
        drop(a);
        drop(b);
        drop(c);
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test]
    async fn close_empties_pool_and_stops_gets() {
        let (pool, _) = counting_pool(2);
        let conn = pool.get().await.unwrap();
        drop(conn);
        assert_eq!(pool.len(), 1);
        pool.close();
        assert_eq!(pool.len(), 0);
        assert!(matches!(pool.get().await.unwrap_err(), PoolError::Closed));
    }

    #[tokio::test]
    async fn return_after_close_really_closes() {
        let (pool, _) = counting_pool(2);
        let conn = pool.get().await.unwrap();
        pool.close();
        drop(conn);
        assert_eq!(pool.len(), 0);
    }

    #[tokio::test]
    async fn dial_failure_surfaces() {
        let pool: ConnPool<usize> = ConnPool::new(1, || async {
            Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
        })
        .unwrap();
        assert!(matches!(pool.get().await.unwrap_err(), PoolError::Dial(_)));
    }
}
