//! The coupled reader/writer lock embedded in a cache's buffer range.
//!
//! Word 0 of every cache range is the lock state: `0` is free, `1` is write-locked, and any value
//! `n > 1` means `n - 1` readers currently hold the lock.  Both sides acquire with a
//! compare-exchange loop: a short spin first, then `thread::yield_now` so a stalled peer on the
//! same core can make progress.  The writer and the readers are usually on different worker
//! threads; the Acquire/Release pairing on this one word is what orders every other word in the
//! cache range.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::shared_buffer::SharedBuffer;

const FREE: u32 = 0;
const WRITE_LOCKED: u32 = 1;

/// How many times to spin on the lock word before starting to yield.
const SPIN_LIMIT: u32 = 64;

/// A lock living at one word of a [SharedBuffer].
///
/// Cheap to clone; every holder addresses the same word.  The lock itself carries no idea of what
/// data it protects, the cache layout built on top of it decides that.
#[derive(Clone)]
pub struct CoupledLock {
    buffer: Arc<SharedBuffer>,
    word: usize,
}

impl CoupledLock {
    pub fn new(buffer: Arc<SharedBuffer>, word: usize) -> CoupledLock {
        assert!(word < buffer.len(), "lock word out of buffer bounds");
        CoupledLock { buffer, word }
    }

    fn state(&self) -> &AtomicU32 {
        self.buffer.word(self.word)
    }

    /// Reset the lock word to free.  Used when (re)initializing a cache range whose contents are
    /// not yet shared with any reader.
    pub fn reset(&self) {
        self.state().store(FREE, Ordering::Release);
    }

    /// Number of readers currently holding the lock.  Test and diagnostics use only; the value is
    /// stale the moment it is returned.
    pub fn reader_count(&self) -> u32 {
        match self.state().load(Ordering::Relaxed) {
            FREE | WRITE_LOCKED => 0,
            n => n - 1,
        }
    }

    pub fn is_write_locked(&self) -> bool {
        self.state().load(Ordering::Relaxed) == WRITE_LOCKED
    }

    /// Acquire the exclusive write half, spinning then yielding until the word reads free.
    pub fn lock_write(&self) -> WriteGuard<'_> {
        let mut spins = 0u32;
        loop {
            match self.state().compare_exchange_weak(
                FREE,
                WRITE_LOCKED,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return WriteGuard { lock: self },
                Err(_) => backoff(&mut spins),
            }
        }
    }

    /// Try once to acquire the write half.
    pub fn try_lock_write(&self) -> Option<WriteGuard<'_>> {
        self.state()
            .compare_exchange(FREE, WRITE_LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| WriteGuard { lock: self })
    }

    /// Acquire a shared read half.  Readers stack: each acquisition bumps the count and read
    /// guards may be held on any number of threads simultaneously.
    pub fn lock_read(&self) -> ReadGuard<'_> {
        let mut spins = 0u32;
        loop {
            let current = self.state().load(Ordering::Relaxed);
            if current == WRITE_LOCKED {
                backoff(&mut spins);
                continue;
            }

            let next = if current == FREE { 2 } else { current + 1 };
            match self.state().compare_exchange_weak(
                current,
                next,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return ReadGuard { lock: self },
                Err(_) => backoff(&mut spins),
            }
        }
    }

    fn unlock_write(&self) {
        let prev = self.state().swap(FREE, Ordering::Release);
        debug_assert_eq!(prev, WRITE_LOCKED, "write unlock without write lock");
    }

    fn unlock_read(&self) {
        let mut spins = 0u32;
        loop {
            let current = self.state().load(Ordering::Relaxed);
            debug_assert!(current > WRITE_LOCKED, "read unlock without read lock");
            let next = if current == 2 { FREE } else { current - 1 };
            match self.state().compare_exchange_weak(
                current,
                next,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(_) => backoff(&mut spins),
            }
        }
    }
}

impl std::fmt::Debug for CoupledLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoupledLock").field("word", &self.word).finish()
    }
}

fn backoff(spins: &mut u32) {
    if *spins < SPIN_LIMIT {
        *spins += 1;
        std::hint::spin_loop();
    } else {
        std::thread::yield_now();
    }
}

/// Exclusive critical section over the cache range.
pub struct WriteGuard<'a> {
    lock: &'a CoupledLock,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock_write();
    }
}

/// Shared critical section over the cache range.
pub struct ReadGuard<'a> {
    lock: &'a CoupledLock,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock_read();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readers_stack_and_release() {
        let buf = Arc::new(SharedBuffer::new(4));
        let lock = CoupledLock::new(buf, 0);

        let a = lock.lock_read();
        let b = lock.lock_read();
        assert_eq!(lock.reader_count(), 2);
        assert!(lock.try_lock_write().is_none());
        drop(a);
        assert_eq!(lock.reader_count(), 1);
        drop(b);
        assert_eq!(lock.reader_count(), 0);
        assert!(lock.try_lock_write().is_some());
    }

    #[test]
    fn write_excludes_everything() {
        let buf = Arc::new(SharedBuffer::new(4));
        let lock = CoupledLock::new(buf, 0);

        let w = lock.lock_write();
        assert!(lock.is_write_locked());
        assert!(lock.try_lock_write().is_none());
        drop(w);
        assert!(!lock.is_write_locked());
    }

    /// A writer increments a counter word under the lock while readers confirm they never observe
    /// a torn pair of words.
    #[test]
    fn concurrent_readers_never_see_torn_state() {
        const ROUNDS: u32 = 2000;

        let buf = Arc::new(SharedBuffer::new(4));
        let lock = CoupledLock::new(buf.clone(), 0);

        let writer = {
            let lock = lock.clone();
            let buf = buf.clone();
            std::thread::spawn(move || {
                for i in 1..=ROUNDS {
                    let _g = lock.lock_write();
                    buf.store(1, i);
                    buf.store(2, i);
                }
            })
        };

        let readers: Vec<_> = (0..3)
            .map(|_| {
                let lock = lock.clone();
                let buf = buf.clone();
                std::thread::spawn(move || {
                    let mut last = 0;
                    while last < ROUNDS {
                        let _g = lock.lock_read();
                        let a = buf.load(1);
                        let b = buf.load(2);
                        assert_eq!(a, b, "observed a torn write");
                        last = a;
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
    }
}
