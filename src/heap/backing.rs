//! Backing storage for the heap.
//!
//! The heap never maps memory itself; it asks an implementor of
//! [`HeapBacking`] to grow, shrink, and to report corruption. The kernel
//! implementation maps anonymous memory through the gate and treats
//! corruption as terminal.

use core::fmt;
use core::ptr::NonNull;

use crate::platform;
use crate::platform::gate::{MapFlags, MapProt, DEBUG_KIND_MESSAGE};

/// Signal delivered to the current process when heap bookkeeping is
/// inconsistent.
pub const SIGNAL_ABORT: u32 = 6;

/// What exactly looked wrong.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CorruptionKind {
    BadArenaHeader,
    BadBlockHeader,
    BadFreeList,
    BadDirectHeader,
    SizeMismatch,
}

impl fmt::Display for CorruptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let desc = match self {
            CorruptionKind::BadArenaHeader => "bad arena header",
            CorruptionKind::BadBlockHeader => "bad block header",
            CorruptionKind::BadFreeList => "bad free list",
            CorruptionKind::BadDirectHeader => "bad direct-allocation header",
            CorruptionKind::SizeMismatch => "size chain mismatch",
        };
        write!(f, "{}", desc)
    }
}

pub trait HeapBacking: Sync {
    /// Map `size` bytes of readable, writable arena. `None` on failure; the
    /// heap propagates the failure, it never retries.
    fn expand(&self, size: usize) -> Option<NonNull<u8>>;

    /// Return a whole arena mapping. A `false` return leaves the arena with
    /// the heap; it must not panic.
    fn contract(&self, base: NonNull<u8>, size: usize) -> bool;

    /// Bookkeeping is inconsistent. Not expected to return, but the heap
    /// tolerates it by failing the current operation.
    fn corruption(&self, kind: CorruptionKind, area: Option<NonNull<u8>>);
}

/// The production backing: anonymous mappings through the kernel gate.
pub struct KernelBacking;

pub static KERNEL_BACKING: KernelBacking = KernelBacking;

impl HeapBacking for KernelBacking {
    fn expand(&self, size: usize) -> Option<NonNull<u8>> {
        let kernel = platform::kernel();
        unsafe {
            kernel
                .map(
                    0,
                    size,
                    MapProt::READ | MapProt::WRITE,
                    MapFlags::ANONYMOUS | MapFlags::PRIVATE,
                    -1,
                    0,
                )
                .ok()
                .and_then(|base| NonNull::new(base as *mut u8))
        }
    }

    fn contract(&self, base: NonNull<u8>, size: usize) -> bool {
        unsafe { platform::kernel().unmap(base.as_ptr() as usize, size).is_ok() }
    }

    fn corruption(&self, kind: CorruptionKind, area: Option<NonNull<u8>>) {
        let kernel = platform::kernel();
        let message = alloc::format!(
            "heap corruption: {} at {:p}",
            kind,
            area.map(|p| p.as_ptr()).unwrap_or(core::ptr::null_mut()),
        );
        kernel.debug_report(DEBUG_KIND_MESSAGE, message.as_bytes());
        let _ = kernel.send_signal(0, SIGNAL_ABORT);
    }
}
