//! Reusable countdown latch.

use parking_lot::{Condvar, Mutex};

/// Blocks waiters until a remaining-count reaches zero.
///
/// Re-armed with [`set`](CountdownLatch::set) at the start of every epoch.
/// Calling `set` while a `wait` from the previous epoch is still outstanding
/// is not allowed; the network coordinator guarantees this by running one
/// pass at a time.
#[derive(Debug, Default)]
pub struct CountdownLatch {
    remaining: Mutex<usize>,
    cv: Condvar,
}

impl CountdownLatch {
    /// Create a latch with `count` outstanding completions.
    pub fn new(count: usize) -> Self {
        Self {
            remaining: Mutex::new(count),
            cv: Condvar::new(),
        }
    }

    /// Arm the latch for a new epoch. `set(0)` releases waiters immediately.
    pub fn set(&self, count: usize) {
        let mut remaining = self.remaining.lock();
        *remaining = count;
        if count == 0 {
            self.cv.notify_all();
        }
    }

    /// Record one completion, waking all waiters when the count hits zero.
    ///
    /// Panics if the latch is already at zero.
    pub fn count_down(&self) {
        let mut remaining = self.remaining.lock();
        assert!(*remaining > 0, "CountdownLatch::count_down called more times than armed");
        *remaining -= 1;
        if *remaining == 0 {
            self.cv.notify_all();
        }
    }

    /// Block until the count reaches zero.
    pub fn wait(&self) {
        let mut remaining = self.remaining.lock();
        while *remaining > 0 {
            self.cv.wait(&mut remaining);
        }
    }

    /// Completions still outstanding.
    pub fn remaining(&self) -> usize {
        *self.remaining.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_set_zero_returns_immediately() {
        let latch = CountdownLatch::new(3);
        latch.set(0);
        latch.wait();
        assert_eq!(latch.remaining(), 0);
    }

    #[test]
    fn test_count_down_releases_waiter() {
        let latch = Arc::new(CountdownLatch::default());
        latch.set(4);
        let released = Arc::new(AtomicBool::new(false));

        let waiter = {
            let latch = Arc::clone(&latch);
            let released = Arc::clone(&released);
            std::thread::spawn(move || {
                latch.wait();
                released.store(true, Ordering::SeqCst);
            })
        };

        for _ in 0..3 {
            latch.count_down();
        }
        std::thread::sleep(Duration::from_millis(20));
        assert!(!released.load(Ordering::SeqCst), "waiter released before final count_down");

        latch.count_down();
        waiter.join().unwrap();
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_concurrent_count_down() {
        let latch = Arc::new(CountdownLatch::new(64));
        std::thread::scope(|s| {
            for _ in 0..8 {
                let latch = Arc::clone(&latch);
                s.spawn(move || {
                    for _ in 0..8 {
                        latch.count_down();
                    }
                });
            }
            latch.wait();
        });
        assert_eq!(latch.remaining(), 0);
    }

    #[test]
    fn test_reuse_across_epochs() {
        let latch = CountdownLatch::new(1);
        latch.count_down();
        latch.wait();
        latch.set(2);
        assert_eq!(latch.remaining(), 2);
        latch.count_down();
        latch.count_down();
        latch.wait();
    }

    #[test]
    #[should_panic(expected = "more times than armed")]
    fn test_underflow_panics() {
        let latch = CountdownLatch::new(0);
        latch.count_down();
    }
}
