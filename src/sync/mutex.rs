//! Spin-then-suspend mutex.
//!
//! The state word takes three values: 0 unlocked, 1 locked, 2 locked with
//! waiters. Acquisition spins on a 0->1 compare-and-swap a bounded number of
//! times, then exchanges the word with 2 and sleeps on it. Release stores 0
//! and wakes one waiter only when the old value said waiters exist.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::Ordering::SeqCst;

use super::AtomicLock;
use crate::error::{Error, Result};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const WAITING: u32 = 2;

/// Attempts before giving up the processor.
pub const DEFAULT_SPIN_COUNT: u32 = 100;

pub struct Mutex<T> {
    lock: AtomicLock,
    spin_count: u32,
    content: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// A process-local mutex; wait/wake uses the private flavor.
    pub const fn new(content: T) -> Self {
        Self {
            lock: AtomicLock::new(UNLOCKED),
            spin_count: DEFAULT_SPIN_COUNT,
            content: UnsafeCell::new(content),
        }
    }

    /// A mutex in memory visible to other processes.
    pub const fn new_shared(content: T) -> Self {
        Self {
            lock: AtomicLock::new_shared(UNLOCKED),
            spin_count: DEFAULT_SPIN_COUNT,
            content: UnsafeCell::new(content),
        }
    }

    pub const fn with_spin_count(content: T, spin_count: u32) -> Self {
        Self {
            lock: AtomicLock::new(UNLOCKED),
            spin_count,
            content: UnsafeCell::new(content),
        }
    }

    /// Lock without a guard; pairing with [`Mutex::manual_unlock`] is on
    /// the caller.
    pub unsafe fn manual_lock(&self) -> &mut T {
        for _ in 0..self.spin_count {
            if self
                .lock
                .compare_exchange_weak(UNLOCKED, LOCKED, SeqCst, SeqCst)
                .is_ok()
            {
                return &mut *self.content.get();
            }
            core::hint::spin_loop();
        }

        loop {
            if self.lock.swap(WAITING, SeqCst) == UNLOCKED {
                return &mut *self.content.get();
            }
            // Spurious wakeups and value races just come back around.
            let _ = self.lock.wait_if(WAITING, None);
        }
    }

    pub unsafe fn manual_try_lock(&self) -> Result<&mut T> {
        self.lock
            .compare_exchange(UNLOCKED, LOCKED, SeqCst, SeqCst)
            .map(|_| &mut *self.content.get())
            .map_err(|_| Error::Busy)
    }

    pub unsafe fn manual_unlock(&self) {
        if self.lock.swap(UNLOCKED, SeqCst) == WAITING {
            self.lock.notify_one();
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        MutexGuard {
            mutex: self,
            content: unsafe { self.manual_lock() },
        }
    }

    pub fn try_lock(&self) -> Result<MutexGuard<'_, T>> {
        unsafe {
            self.manual_try_lock().map(|content| MutexGuard {
                mutex: self,
                content,
            })
        }
    }

    /// Whether some thread is (or was just now) suspended on the word.
    pub fn is_contended(&self) -> bool {
        self.lock.load(SeqCst) == WAITING
    }
}

pub struct MutexGuard<'a, T: 'a> {
    mutex: &'a Mutex<T>,
    content: &'a mut T,
}

impl<'a, T> Deref for MutexGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.content
    }
}

impl<'a, T> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.content
    }
}

impl<'a, T> Drop for MutexGuard<'a, T> {
    fn drop(&mut self) {
        unsafe {
            self.mutex.manual_unlock();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncontended_lock_cycle() {
        crate::platform::host::install();
        let mutex = Mutex::new(7u32);
        {
            let mut guard = mutex.lock();
            *guard += 1;
        }
        assert_eq!(*mutex.lock(), 8);
        assert!(!mutex.is_contended());
    }

    #[test]
    fn try_lock_reports_busy() {
        crate::platform::host::install();
        let mutex = Mutex::new(());
        let guard = mutex.lock();
        assert_eq!(mutex.try_lock().err(), Some(Error::Busy));
        drop(guard);
        assert!(mutex.try_lock().is_ok());
    }
}
