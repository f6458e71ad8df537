//! Per-table session locking.
//!
//! A [`LockingQueue`] orders reader/writer access to one table between
//! sessions. The queue is strictly FIFO:
//!
//! - a READ lock proceeds when no WRITE lock is strictly ahead of it;
//! - a WRITE lock proceeds only at the head of the queue;
//! - every release wakes all waiters for re-evaluation.
//!
//! FIFO ordering prevents writer starvation: a writer at position `p`
//! proceeds after exactly the `p` locks ahead of it have released.
//! Acquisition returns an RAII [`LockHandle`] so release happens on
//! every exit path. Blocking waits accept a [`CancelToken`]; cancelling
//! removes the waiter from the queue and notifies the rest.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::common::{Error, Result};

/// Kind of table access a session requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy)]
struct LockRecord {
    id: u64,
    ty: LockType,
}

/// Cooperative cancellation signal for blocking waits.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Waiters notice on their next wakeup.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Fair FIFO queue of read/write locks for one table.
pub struct LockingQueue {
    queue: Mutex<VecDeque<LockRecord>>,
    cond: Condvar,
    next_id: AtomicU64,
}

impl LockingQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Acquire a READ lock, blocking until the access rule holds.
    pub fn lock_read(&self, cancel: Option<&CancelToken>) -> Result<LockHandle<'_>> {
        self.acquire(LockType::Read, cancel)
    }

    /// Acquire a WRITE lock, blocking until it reaches the queue head.
    pub fn lock_write(&self, cancel: Option<&CancelToken>) -> Result<LockHandle<'_>> {
        self.acquire(LockType::Write, cancel)
    }

    /// Number of queued locks (held and waiting).
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    fn acquire(&self, ty: LockType, cancel: Option<&CancelToken>) -> Result<LockHandle<'_>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut queue = self.queue.lock();
        queue.push_back(LockRecord { id, ty });

        loop {
            if Self::can_proceed(&queue, id) {
                return Ok(LockHandle { queue: self, id });
            }
            if let Some(token) = cancel {
                if token.is_cancelled() {
                    queue.retain(|r| r.id != id);
                    self.cond.notify_all();
                    return Err(Error::Cancelled);
                }
            }
            // Wake on release notifications; the short tick bounds the
            // latency of noticing a cancel issued while parked.
            self.cond
                .wait_for(&mut queue, Duration::from_millis(10));
        }
    }

    fn can_proceed(queue: &VecDeque<LockRecord>, id: u64) -> bool {
        let Some(position) = queue.iter().position(|r| r.id == id) else {
            return false;
        };
        let record = queue[position];
        match record.ty {
            LockType::Write => position == 0,
            LockType::Read => queue
                .iter()
                .take(position)
                .all(|r| r.ty != LockType::Write),
        }
    }

    fn release(&self, id: u64) {
        let mut queue = self.queue.lock();
        queue.retain(|r| r.id != id);
        self.cond.notify_all();
    }

    /// Release a lock detached with [`LockHandle::into_raw`].
    pub fn release_raw(&self, id: u64) {
        self.release(id);
    }
}

impl Default for LockingQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// A granted lock; releases (and wakes waiters) on drop.
pub struct LockHandle<'a> {
    queue: &'a LockingQueue,
    id: u64,
}

impl LockHandle<'_> {
    /// Detach the lock from this handle's lifetime. The caller owns the
    /// release via [`LockingQueue::release_raw`].
    pub fn into_raw(self) -> u64 {
        let id = self.id;
        std::mem::forget(self);
        id
    }
}

impl Drop for LockHandle<'_> {
    fn drop(&mut self) {
        self.queue.release(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn test_concurrent_reads_proceed() {
        let queue = LockingQueue::new();
        let a = queue.lock_read(None).unwrap();
        let b = queue.lock_read(None).unwrap();
        assert_eq!(queue.len(), 2);
        drop(a);
        drop(b);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_write_waits_for_earlier_reads() {
        let queue = Arc::new(LockingQueue::new());
        let read = queue.lock_read(None).unwrap();

        let (tx, rx) = mpsc::channel();
        let handle = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let write = queue.lock_write(None).unwrap();
                tx.send(()).unwrap();
                drop(write);
            })
        };

        // The writer is queued behind the held read.
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        drop(read);
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
        handle.join().unwrap();
    }

    #[test]
    fn test_read_waits_behind_queued_write() {
        let queue = Arc::new(LockingQueue::new());
        let read = queue.lock_read(None).unwrap();

        let (wtx, wrx) = mpsc::channel();
        let writer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let write = queue.lock_write(None).unwrap();
                wtx.send("write").unwrap();
                // Hold briefly so the late reader stays queued.
                thread::sleep(Duration::from_millis(50));
                drop(write);
            })
        };
        // Give the writer time to enter the queue.
        thread::sleep(Duration::from_millis(50));

        let (rtx, rrx) = mpsc::channel();
        let reader = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let late = queue.lock_read(None).unwrap();
                rtx.send("read").unwrap();
                drop(late);
            })
        };

        // FIFO: the late reader must not jump the queued writer.
        assert!(rrx.recv_timeout(Duration::from_millis(100)).is_err());
        drop(read);
        // The writer proceeds first, then the reader.
        assert_eq!(wrx.recv_timeout(Duration::from_secs(2)).unwrap(), "write");
        assert_eq!(rrx.recv_timeout(Duration::from_secs(2)).unwrap(), "read");
        writer.join().unwrap();
        reader.join().unwrap();
    }

    #[test]
    fn test_cancel_removes_waiter() {
        let queue = Arc::new(LockingQueue::new());
        let read = queue.lock_read(None).unwrap();

        let token = CancelToken::new();
        let (tx, rx) = mpsc::channel();
        let handle = {
            let queue = Arc::clone(&queue);
            let token = token.clone();
            thread::spawn(move || {
                let out = queue.lock_write(Some(&token));
                tx.send(out.is_err()).unwrap();
            })
        };

        thread::sleep(Duration::from_millis(30));
        token.cancel();
        assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap());
        handle.join().unwrap();
        // Only the held read remains queued.
        assert_eq!(queue.len(), 1);
        drop(read);
    }

    #[test]
    fn test_write_fairness_positional() {
        // A writer at position p proceeds after exactly the p locks
        // ahead of it release.
        let queue = Arc::new(LockingQueue::new());
        let r1 = queue.lock_read(None).unwrap();
        let r2 = queue.lock_read(None).unwrap();

        let (tx, rx) = mpsc::channel();
        let handle = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let write = queue.lock_write(None).unwrap();
                tx.send(()).unwrap();
                drop(write);
            })
        };

        thread::sleep(Duration::from_millis(30));
        drop(r1);
        // One of two is still held.
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        drop(r2);
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
        handle.join().unwrap();
    }
}
