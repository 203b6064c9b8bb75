//! A one-shot count-down latch.

use parking_lot::{Condvar, Mutex};

/// Blocks waiters until the count reaches zero.
#[derive(Debug)]
pub struct CountDownLatch {
    count: Mutex<usize>,
    zero: Condvar,
}

impl CountDownLatch {
    pub fn new(count: usize) -> Self {
        CountDownLatch {
            count: Mutex::new(count),
            zero: Condvar::new(),
        }
    }

    pub fn count_down(&self) {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
            if *count == 0 {
                self.zero.notify_all();
            }
        }
    }

    pub fn count(&self) -> usize {
        *self.count.lock()
    }

    /// Wait until the count reaches zero.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.zero.wait(&mut count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_wait_released_by_other_thread() {
        let latch = Arc::new(CountDownLatch::new(1));
        let waiter = {
            let latch = Arc::clone(&latch);
            thread::spawn(move || {
                latch.wait();
                latch.count()
            })
        };
        latch.count_down();
        assert_eq!(waiter.join().unwrap(), 0);
        latch.count_down();
        assert_eq!(latch.count(), 0);
    }
}
