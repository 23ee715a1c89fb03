//! Load barrier: wait for background startup loads to finish.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Default)]
struct Inner {
    outstanding: Mutex<usize>,
    done: Condvar,
}

/// Counts outstanding loads. Clones share the same counter.
///
/// Waiting is opt-in: collections opened with `Entities::open_deferred` serve
/// requests immediately, with a partial view until their load completes.
#[derive(Clone, Default)]
pub struct LoadBarrier {
    inner: Arc<Inner>,
}

impl LoadBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one load. It completes when the returned ticket is dropped.
    pub fn register(&self) -> LoadTicket {
        *self.inner.outstanding.lock() += 1;
        LoadTicket {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn outstanding(&self) -> usize {
        *self.inner.outstanding.lock()
    }

    /// Block until no load is outstanding.
    pub fn wait(&self) {
        let mut outstanding = self.inner.outstanding.lock();
        while *outstanding > 0 {
            self.inner.done.wait(&mut outstanding);
        }
    }

    /// Block for at most `timeout`. Returns true if every load finished.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut outstanding = self.inner.outstanding.lock();
        while *outstanding > 0 {
            if self.inner.done.wait_until(&mut outstanding, deadline).timed_out() {
                return *outstanding == 0;
            }
        }
        true
    }
}

impl std::fmt::Debug for LoadBarrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBarrier").field("outstanding", &self.outstanding()).finish()
    }
}

/// One registered load. Dropping it marks the load finished.
#[must_use = "the load is marked finished as soon as the ticket is dropped"]
pub struct LoadTicket {
    inner: Arc<Inner>,
}

impl Drop for LoadTicket {
    fn drop(&mut self) {
        let mut outstanding = self.inner.outstanding.lock();
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.inner.done.notify_all();
        }
    }
}

impl std::fmt::Debug for LoadTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadTicket").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_counts_tickets() {
        let barrier = LoadBarrier::new();
        assert_eq!(barrier.outstanding(), 0);
        let first = barrier.register();
        let second = barrier.clone().register();
        assert_eq!(barrier.outstanding(), 2);
        drop(first);
        assert_eq!(barrier.outstanding(), 1);
        drop(second);
        assert_eq!(barrier.outstanding(), 0);
    }

    #[test]
    fn test_wait_returns_immediately_when_idle() {
        let barrier = LoadBarrier::new();
        barrier.wait();
        assert!(barrier.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn test_wait_blocks_until_tickets_drop() {
        let barrier = LoadBarrier::new();
        let tickets: Vec<_> = (0..3).map(|_| barrier.register()).collect();

        let workers: Vec<_> = tickets
            .into_iter()
            .enumerate()
            .map(|(i, ticket)| {
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(10 * (i as u64 + 1)));
                    drop(ticket);
                })
            })
            .collect();

        barrier.wait();
        assert_eq!(barrier.outstanding(), 0);
        for worker in workers {
            worker.join().unwrap();
        }
    }

    #[test]
    fn test_wait_timeout_expires() {
        let barrier = LoadBarrier::new();
        let ticket = barrier.register();
        assert!(!barrier.wait_timeout(Duration::from_millis(20)));
        drop(ticket);
        assert!(barrier.wait_timeout(Duration::from_millis(20)));
    }
}
