//! Reader/writer lock.
//!
//! One 32-bit word: 0 unlocked, k readers for small positive k, all-ones
//! when write-locked. The owner's thread id and two pending-waiter counters
//! ride alongside for deadlock detection and precise wakes. Release on
//! transition to zero wakes everyone and lets the kernel arbitrate.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering::SeqCst};

use super::{futex_wait, futex_wake};
use crate::error::{Error, Result};
use crate::platform;

const UNLOCKED: u32 = 0;
const EXCLUSIVE: u32 = u32::MAX;

pub struct RawRwlock {
    state: AtomicU32,
    writer_tid: AtomicU32,
    pending_readers: AtomicU32,
    pending_writers: AtomicU32,
    /// When unset, wait/wake uses the private flavor.
    shared: bool,
}

impl RawRwlock {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(UNLOCKED),
            writer_tid: AtomicU32::new(0),
            pending_readers: AtomicU32::new(0),
            pending_writers: AtomicU32::new(0),
            shared: false,
        }
    }

    pub const fn new_shared() -> Self {
        Self {
            state: AtomicU32::new(UNLOCKED),
            writer_tid: AtomicU32::new(0),
            pending_readers: AtomicU32::new(0),
            pending_writers: AtomicU32::new(0),
            shared: true,
        }
    }

    fn private(&self) -> bool {
        !self.shared
    }

    fn current_tid(&self) -> u32 {
        platform::kernel().thread_id()
    }

    /// Shared acquisition. `timeout_ns` of `None` blocks forever.
    pub fn acquire_read(&self, timeout_ns: Option<u64>) -> Result<()> {
        if self.writer_tid.load(SeqCst) == self.current_tid() {
            return Err(Error::Deadlock);
        }
        loop {
            let state = self.state.load(SeqCst);
            if state != EXCLUSIVE {
                // Never let the count collide with the sentinel.
                if state + 1 == EXCLUSIVE {
                    return Err(Error::Busy);
                }
                if self
                    .state
                    .compare_exchange_weak(state, state + 1, SeqCst, SeqCst)
                    .is_ok()
                {
                    return Ok(());
                }
                core::hint::spin_loop();
                continue;
            }

            self.pending_readers.fetch_add(1, SeqCst);
            let waited = futex_wait(&self.state, state, timeout_ns, self.private());
            self.pending_readers.fetch_sub(1, SeqCst);
            if let Err(Error::TimedOut) = waited {
                return Err(Error::TimedOut);
            }
        }
    }

    pub fn try_acquire_read(&self) -> Result<()> {
        if self.writer_tid.load(SeqCst) == self.current_tid() {
            return Err(Error::Deadlock);
        }
        loop {
            let state = self.state.load(SeqCst);
            if state == EXCLUSIVE || state + 1 == EXCLUSIVE {
                return Err(Error::Busy);
            }
            if self
                .state
                .compare_exchange_weak(state, state + 1, SeqCst, SeqCst)
                .is_ok()
            {
                return Ok(());
            }
            core::hint::spin_loop();
        }
    }

    /// Exclusive acquisition.
    pub fn acquire_write(&self) -> Result<()> {
        let tid = self.current_tid();
        if self.writer_tid.load(SeqCst) == tid {
            return Err(Error::Deadlock);
        }
        loop {
            let state = self.state.load(SeqCst);
            if state == UNLOCKED {
                if self
                    .state
                    .compare_exchange_weak(UNLOCKED, EXCLUSIVE, SeqCst, SeqCst)
                    .is_ok()
                {
                    self.writer_tid.store(tid, SeqCst);
                    return Ok(());
                }
                core::hint::spin_loop();
                continue;
            }

            self.pending_writers.fetch_add(1, SeqCst);
            let _ = futex_wait(&self.state, state, None, self.private());
            self.pending_writers.fetch_sub(1, SeqCst);
        }
    }

    pub fn try_acquire_write(&self) -> Result<()> {
        let tid = self.current_tid();
        if self.writer_tid.load(SeqCst) == tid {
            return Err(Error::Deadlock);
        }
        match self
            .state
            .compare_exchange(UNLOCKED, EXCLUSIVE, SeqCst, SeqCst)
        {
            Ok(_) => {
                self.writer_tid.store(tid, SeqCst);
                Ok(())
            }
            Err(_) => Err(Error::Busy),
        }
    }

    pub fn unlock(&self) -> Result<()> {
        let state = self.state.load(SeqCst);
        if state == EXCLUSIVE {
            if self.writer_tid.load(SeqCst) != self.current_tid() {
                return Err(Error::PermissionDenied);
            }
            // Clear the owner before the state so a nonzero tid always
            // implies the sentinel.
            self.writer_tid.store(0, SeqCst);
            self.state.store(UNLOCKED, SeqCst);
            if self.pending_readers.load(SeqCst) > 0 || self.pending_writers.load(SeqCst) > 0 {
                futex_wake(&self.state, u32::MAX, self.private());
            }
            return Ok(());
        }

        loop {
            let state = self.state.load(SeqCst);
            if state == UNLOCKED || state == EXCLUSIVE {
                return Err(Error::PermissionDenied);
            }
            if self
                .state
                .compare_exchange_weak(state, state - 1, SeqCst, SeqCst)
                .is_ok()
            {
                if state - 1 == UNLOCKED
                    && (self.pending_readers.load(SeqCst) > 0
                        || self.pending_writers.load(SeqCst) > 0)
                {
                    futex_wake(&self.state, u32::MAX, self.private());
                }
                return Ok(());
            }
            core::hint::spin_loop();
        }
    }

    /// Current owner when write-locked, zero otherwise.
    pub fn writer_tid(&self) -> u32 {
        self.writer_tid.load(SeqCst)
    }

    pub fn is_write_locked(&self) -> bool {
        self.state.load(SeqCst) == EXCLUSIVE
    }

    pub fn reader_count(&self) -> u32 {
        match self.state.load(SeqCst) {
            EXCLUSIVE => 0,
            n => n,
        }
    }
}

impl Default for RawRwlock {
    fn default() -> Self {
        Self::new()
    }
}

/// Content-carrying wrapper over [`RawRwlock`], the shape the image list
/// wants.
pub struct RwLock<T> {
    raw: RawRwlock,
    content: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for RwLock<T> {}
unsafe impl<T: Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    pub const fn new(content: T) -> Self {
        Self {
            raw: RawRwlock::new(),
            content: UnsafeCell::new(content),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.raw
            .acquire_read(None)
            .expect("rwlock read acquisition failed");
        RwLockReadGuard { lock: self }
    }

    pub fn try_read(&self) -> Result<RwLockReadGuard<'_, T>> {
        self.raw.try_acquire_read()?;
        Ok(RwLockReadGuard { lock: self })
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.raw
            .acquire_write()
            .expect("rwlock write acquisition failed");
        RwLockWriteGuard { lock: self }
    }

    pub fn try_write(&self) -> Result<RwLockWriteGuard<'_, T>> {
        self.raw.try_acquire_write()?;
        Ok(RwLockWriteGuard { lock: self })
    }

    pub fn raw(&self) -> &RawRwlock {
        &self.raw
    }
}

pub struct RwLockReadGuard<'a, T: 'a> {
    lock: &'a RwLock<T>,
}

impl<'a, T> Deref for RwLockReadGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.content.get() }
    }
}

impl<'a, T> Drop for RwLockReadGuard<'a, T> {
    fn drop(&mut self) {
        let _ = self.lock.raw.unlock();
    }
}

pub struct RwLockWriteGuard<'a, T: 'a> {
    lock: &'a RwLock<T>,
}

impl<'a, T> Deref for RwLockWriteGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.content.get() }
    }
}

impl<'a, T> DerefMut for RwLockWriteGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.content.get() }
    }
}

impl<'a, T> Drop for RwLockWriteGuard<'a, T> {
    fn drop(&mut self) {
        let _ = self.lock.raw.unlock();
    }
}
