//! The store write latch.
//!
//! A single reentrant latch serializes all allocations and writes within
//! one process. Reentrancy matters because commit publication holds the
//! latch across nested area writes that also take it.

use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

#[derive(Default)]
struct LatchState {
    owner: Option<ThreadId>,
    count: u32,
}

/// Reentrant write latch.
pub(crate) struct WriteLatch {
    state: Mutex<LatchState>,
    cond: Condvar,
}

impl WriteLatch {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LatchState::default()),
            cond: Condvar::new(),
        }
    }

    /// Acquire the latch, blocking until it is free or already ours.
    pub fn lock(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.owner == Some(me) {
            state.count += 1;
            return;
        }
        while state.owner.is_some() {
            self.cond.wait(&mut state);
        }
        state.owner = Some(me);
        state.count = 1;
    }

    /// Release one level of the latch.
    ///
    /// # Panics
    /// Panics if the calling thread does not hold the latch.
    pub fn unlock(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        assert_eq!(state.owner, Some(me), "write latch released by non-owner");
        state.count -= 1;
        if state.count == 0 {
            state.owner = None;
            self.cond.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_latch_is_reentrant() {
        let latch = WriteLatch::new();
        latch.lock();
        latch.lock();
        latch.unlock();
        latch.unlock();
    }

    #[test]
    fn test_latch_excludes_other_threads() {
        let latch = Arc::new(WriteLatch::new());
        let shared = Arc::new(Mutex::new(0u32));

        latch.lock();
        let handle = {
            let latch = Arc::clone(&latch);
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || {
                latch.lock();
                *shared.lock() = 2;
                latch.unlock();
            })
        };

        // The spawned thread must not get past lock() until we release.
        std::thread::sleep(std::time::Duration::from_millis(50));
        *shared.lock() = 1;
        latch.unlock();
        handle.join().unwrap();
        assert_eq!(*shared.lock(), 2);
    }

    #[test]
    #[should_panic(expected = "non-owner")]
    fn test_unlock_without_lock_panics() {
        let latch = WriteLatch::new();
        latch.unlock();
    }
}
