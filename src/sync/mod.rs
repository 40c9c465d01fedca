//! Locking layer.
//!
//! Everything here reduces to the kernel wait/wake primitive: suspend on a
//! 32-bit word while it still holds an expected value, wake up to N waiters.
//! Fairness and wakeup order are the kernel's problem by design.

pub mod mutex;
pub mod rwlock;

pub use self::mutex::{Mutex, MutexGuard};
pub use self::rwlock::{RawRwlock, RwLock, RwLockReadGuard, RwLockWriteGuard};

use core::ops::Deref;
use core::sync::atomic::AtomicU32;

use crate::error::{Error, Result};
use crate::platform;

/// Wait on `word` while it holds `expected`. Timeout and interruption are
/// surfaced; a value mismatch comes back as [`Error::WouldBlock`].
pub fn futex_wait(
    word: &AtomicU32,
    expected: u32,
    timeout_ns: Option<u64>,
    private: bool,
) -> Result<()> {
    unsafe { platform::kernel().wait(word.as_ptr(), expected, timeout_ns, private) }
}

/// Wake up to `count` waiters on `word`; returns the number woken.
pub fn futex_wake(word: &AtomicU32, count: u32, private: bool) -> u32 {
    unsafe {
        platform::kernel()
            .wake(word.as_ptr(), count, private)
            .unwrap_or(0)
    }
}

/// A 32-bit word with its wait/wake plumbing attached.
pub(crate) struct AtomicLock {
    atomic: AtomicU32,
    private: bool,
}

impl AtomicLock {
    pub const fn new(value: u32) -> Self {
        Self {
            atomic: AtomicU32::new(value),
            private: true,
        }
    }

    pub const fn new_shared(value: u32) -> Self {
        Self {
            atomic: AtomicU32::new(value),
            private: false,
        }
    }

    pub fn notify_one(&self) {
        futex_wake(&self.atomic, 1, self.private);
    }

    pub fn notify_all(&self) {
        futex_wake(&self.atomic, u32::MAX, self.private);
    }

    /// Block while the word holds `value`; spurious returns are the
    /// caller's loop to absorb.
    pub fn wait_if(&self, value: u32, timeout_ns: Option<u64>) -> Result<()> {
        futex_wait(&self.atomic, value, timeout_ns, self.private)
    }
}

impl Deref for AtomicLock {
    type Target = AtomicU32;

    fn deref(&self) -> &Self::Target {
        &self.atomic
    }
}
