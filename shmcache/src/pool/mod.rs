use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use log::debug;

use crate::core::Segment;
use crate::errors::IpcError;

struct PoolState {
    free: VecDeque<Segment>,
    shutting_down: bool,
}

/// The proxy-side collection of free segments.
///
/// Segments move out by value on `acquire` and back by value on `release`,
/// so a checkout can only be returned once. `available + checked_out ==
/// total` holds for the pool's whole lifetime; `drain_all` waits for that
/// sum to land entirely on the free list before teardown.
pub struct SegmentPool {
    state: Mutex<PoolState>,
    cond: Condvar,
    total: usize,
}

impl SegmentPool {
    /// Creates every segment eagerly. A mapping failure here is fatal to
    /// startup; no traffic is served from a partially built pool.
    pub fn new(prefix: &str, count: usize, capacity: usize) -> Result<SegmentPool, IpcError> {
        let mut free = VecDeque::with_capacity(count);
        for index in 0..count {
            free.push_back(Segment::create(prefix, index, capacity)?);
        }
        Ok(SegmentPool {
            state: Mutex::new(PoolState {
                free,
                shutting_down: false,
            }),
            cond: Condvar::new(),
            total: count,
        })
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn available(&self) -> Result<usize, IpcError> {
        Ok(self.state.lock()?.free.len())
    }

    /// Blocks until a segment is free or shutdown begins. An empty pool is
    /// backpressure, not an error; only shutdown produces `Err`.
    pub fn acquire(&self) -> Result<Segment, IpcError> {
        let mut state = self.state.lock()?;
        loop {
            if state.shutting_down {
                // Pass the wakeup along so a release aimed at us still
                // reaches the drainer or another waiter.
                self.cond.notify_one();
                return Err(IpcError::Shutdown);
            }
            if let Some(seg) = state.free.pop_front() {
                return Ok(seg);
            }
            state = self.cond.wait(state)?;
        }
    }

    /// Returns a checkout, re-arming the handshake events so the next
    /// request starts from the primed state, and wakes one waiter.
    pub fn release(&self, segment: Segment) -> Result<(), IpcError> {
        if let Err(e) = segment.rearm() {
            debug!("re-arm on release failed for {}: {}", segment.name(), e);
        }
        let mut state = self.state.lock()?;
        state.free.push_back(segment);
        self.cond.notify_one();
        Ok(())
    }

    /// Flips the shutdown flag and wakes every blocked `acquire`.
    pub fn shutdown(&self) -> Result<(), IpcError> {
        let mut state = self.state.lock()?;
        state.shutting_down = true;
        self.cond.notify_all();
        Ok(())
    }

    /// Blocks until all segments are home, then yields them for teardown.
    /// Dropping the returned segments unmaps and unlinks their os names.
    /// Only meaningful after `shutdown`; a request that never returns its
    /// segment stalls this wait until its handshake timeout fires.
    pub fn drain_all(&self) -> Result<Vec<Segment>, IpcError> {
        let mut state = self.state.lock()?;
        while state.free.len() < self.total {
            state = self.cond.wait(state)?;
        }
        Ok(state.free.drain(..).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tests::unique_prefix;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn conservation_through_checkout() {
        let pool = SegmentPool::new(&unique_prefix("pool"), 3, 1024).unwrap();
        assert_eq!(pool.available().unwrap(), 3);

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(pool.available().unwrap(), 1);
        assert_eq!(pool.total(), 3);

        pool.release(a).unwrap();
        pool.release(b).unwrap();
        assert_eq!(pool.available().unwrap(), 3);
    }

    #[test]
    fn acquire_blocks_until_release() {
        let pool = Arc::new(SegmentPool::new(&unique_prefix("blk"), 1, 1024).unwrap());
        let seg = pool.acquire().unwrap();

        let waited = Arc::new(AtomicUsize::new(0));
        let handle = {
            let pool = Arc::clone(&pool);
            let waited = Arc::clone(&waited);
            thread::spawn(move || {
                let seg = pool.acquire().unwrap();
                waited.store(1, Ordering::SeqCst);
                pool.release(seg).unwrap();
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert_eq!(waited.load(Ordering::SeqCst), 0);

        pool.release(seg).unwrap();
        handle.join().unwrap();
        assert_eq!(waited.load(Ordering::SeqCst), 1);
        assert_eq!(pool.available().unwrap(), 1);
    }

    #[test]
    fn shutdown_rejects_new_acquires_and_drains() {
        let pool = Arc::new(SegmentPool::new(&unique_prefix("drain"), 2, 1024).unwrap());
        let seg = pool.acquire().unwrap();

        pool.shutdown().unwrap();
        assert!(matches!(pool.acquire(), Err(IpcError::Shutdown)));

        let drainer = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.drain_all().unwrap())
        };

        thread::sleep(Duration::from_millis(50));
        pool.release(seg).unwrap();

        let drained = drainer.join().unwrap();
        assert_eq!(drained.len(), 2);
        assert_eq!(pool.available().unwrap(), 0);
    }

    #[test]
    fn shutdown_wakes_blocked_acquirers() {
        let pool = Arc::new(SegmentPool::new(&unique_prefix("wake"), 1, 1024).unwrap());
        let seg = pool.acquire().unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.acquire())
        };

        thread::sleep(Duration::from_millis(50));
        pool.shutdown().unwrap();
        assert!(matches!(waiter.join().unwrap(), Err(IpcError::Shutdown)));
        pool.release(seg).unwrap();
    }
}
