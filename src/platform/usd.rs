//! The user-shared data page.
//!
//! The kernel maps one read-only page into every process and keeps a handful
//! of monotonically updated fields in it. Composite values (system time, time
//! offset) can tear under a concurrent kernel update, so the page carries the
//! tick count twice: the kernel bumps `tick_count_a`, updates the payload,
//! then publishes `tick_count_b`. Readers sample A, the payload, then B, and
//! retry on mismatch. Every accessor here follows that protocol.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

bitflags::bitflags! {
    /// Architecture-defined processor feature bits the core cares about.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct CpuFeatures: u64 {
        /// The fast syscall trap is available.
        const FAST_GATE = 1 << 0;
        /// An invariant time counter is available.
        const INVARIANT_COUNTER = 1 << 1;
    }
}

/// Layout of the page. The fields are atomics purely so that racing kernel
/// updates are well-defined to observe; the core never writes.
#[repr(C)]
pub struct UserSharedData {
    pub tick_count_a: AtomicU64,
    pub time_counter: AtomicU64,
    pub counter_frequency: AtomicU64,
    pub processor_frequency: AtomicU64,
    pub system_time_secs: AtomicU64,
    pub system_time_nanos: AtomicU32,
    pub _pad0: u32,
    pub time_offset_secs: AtomicU64,
    pub time_offset_nanos: AtomicU32,
    pub _pad1: u32,
    /// Encoded major/minor/revision/release-level/debug-level.
    pub version: AtomicU32,
    pub version_serial: AtomicU32,
    pub build_time_secs: AtomicU64,
    pub cpu_features: AtomicU64,
    pub tick_count_b: AtomicU64,
}

/// A decoded system version.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SystemVersion {
    pub major: u8,
    pub minor: u8,
    pub revision: u8,
    pub release_level: u8,
    pub debug_level: u8,
}

impl SystemVersion {
    pub fn decode(word: u32) -> Self {
        Self {
            major: (word >> 24) as u8,
            minor: (word >> 16) as u8,
            revision: (word >> 8) as u8,
            release_level: ((word >> 4) & 0xf) as u8,
            debug_level: (word & 0xf) as u8,
        }
    }

    pub fn encode(self) -> u32 {
        (self.major as u32) << 24
            | (self.minor as u32) << 16
            | (self.revision as u32) << 8
            | ((self.release_level as u32) & 0xf) << 4
            | (self.debug_level as u32) & 0xf
    }
}

/// Read-side accessor over the page.
#[derive(Clone, Copy)]
pub struct UsdReader {
    page: *const UserSharedData,
}

unsafe impl Send for UsdReader {}
unsafe impl Sync for UsdReader {}

impl UsdReader {
    /// # Safety
    /// `page` must point at a live user-shared data page for the rest of the
    /// process lifetime.
    pub const unsafe fn new(page: *const UserSharedData) -> Self {
        Self { page }
    }

    fn page(&self) -> &UserSharedData {
        unsafe { &*self.page }
    }

    /// Torn-read protocol: tick A, payload, tick B, retry on mismatch.
    fn consistent<T>(&self, read: impl Fn(&UserSharedData) -> T) -> T {
        let page = self.page();
        loop {
            let a = page.tick_count_a.load(Ordering::Acquire);
            let value = read(page);
            let b = page.tick_count_b.load(Ordering::Acquire);
            if a == b {
                return value;
            }
            core::hint::spin_loop();
        }
    }

    /// Current tick count.
    pub fn tick_count(&self) -> u64 {
        self.consistent(|p| p.tick_count_a.load(Ordering::Relaxed))
    }

    /// Wall-clock system time as (seconds, nanoseconds).
    pub fn system_time(&self) -> (u64, u32) {
        self.consistent(|p| {
            (
                p.system_time_secs.load(Ordering::Relaxed),
                p.system_time_nanos.load(Ordering::Relaxed),
            )
        })
    }

    /// Offset between the time counter epoch and wall-clock time.
    pub fn time_offset(&self) -> (u64, u32) {
        self.consistent(|p| {
            (
                p.time_offset_secs.load(Ordering::Relaxed),
                p.time_offset_nanos.load(Ordering::Relaxed),
            )
        })
    }

    /// Raw time counter value.
    pub fn time_counter(&self) -> u64 {
        self.consistent(|p| p.time_counter.load(Ordering::Relaxed))
    }

    /// Time counter ticks per second.
    pub fn counter_frequency(&self) -> u64 {
        self.consistent(|p| p.counter_frequency.load(Ordering::Relaxed))
    }

    pub fn processor_frequency(&self) -> u64 {
        self.consistent(|p| p.processor_frequency.load(Ordering::Relaxed))
    }

    pub fn cpu_features(&self) -> CpuFeatures {
        self.consistent(|p| {
            CpuFeatures::from_bits_truncate(p.cpu_features.load(Ordering::Relaxed))
        })
    }

    pub fn version(&self) -> SystemVersion {
        self.consistent(|p| SystemVersion::decode(p.version.load(Ordering::Relaxed)))
    }

    pub fn version_serial(&self) -> u32 {
        self.consistent(|p| p.version_serial.load(Ordering::Relaxed))
    }

    pub fn build_time_secs(&self) -> u64 {
        self.consistent(|p| p.build_time_secs.load(Ordering::Relaxed))
    }
}

impl UserSharedData {
    /// A page with all fields zero. The host kernel owns one and mutates it
    /// through the seqlock protocol; the core itself never writes a page.
    pub fn new_zeroed() -> Self {
        Self {
            tick_count_a: AtomicU64::new(0),
            time_counter: AtomicU64::new(0),
            counter_frequency: AtomicU64::new(0),
            processor_frequency: AtomicU64::new(0),
            system_time_secs: AtomicU64::new(0),
            system_time_nanos: AtomicU32::new(0),
            _pad0: 0,
            time_offset_secs: AtomicU64::new(0),
            time_offset_nanos: AtomicU32::new(0),
            _pad1: 0,
            version: AtomicU32::new(0),
            version_serial: AtomicU32::new(0),
            build_time_secs: AtomicU64::new(0),
            cpu_features: AtomicU64::new(0),
            tick_count_b: AtomicU64::new(0),
        }
    }
}
