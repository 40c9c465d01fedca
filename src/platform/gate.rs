//! The syscall bridge.
//!
//! The kernel exposes one entry point: a numeric opcode plus a pointer to a
//! fixed-layout parameter record, returning a signed machine word. The
//! records below are that ABI; they are shared with whatever implements the
//! gate (a real kernel stub, or the host emulation).
//!
//! Two entries exist. The *full* entry saves and restores every volatile
//! register and always works. On processors whose feature bitmap advertises
//! the fast trap, a *fast* entry is installed at init by atomic pointer swap.
//! Calls that must observe a consistent caller register snapshot (fork and
//! friends) are routed through the full entry regardless of selection.

use core::mem;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::platform::usd::CpuFeatures;

/// A gate entry point: `(opcode, *params) -> signed word`.
pub type GateFn = unsafe extern "C" fn(opcode: usize, args: *mut u8) -> isize;

/// Gate opcodes used by the core.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum Op {
    MapMemory = 0x01,
    UnmapMemory = 0x02,
    ProtectMemory = 0x03,
    FlushMemory = 0x04,
    FlushCache = 0x05,
    WaitWake = 0x10,
    SetThreadPointer = 0x20,
    GetThreadId = 0x21,
    SetThreadIdentity = 0x22,
    ExitThread = 0x23,
    Fork = 0x24,
    SetSignalHandler = 0x30,
    SendSignal = 0x31,
    ExitProcess = 0x32,
    DebugReport = 0x40,
    OpenFile = 0x50,
    CloseFile = 0x51,
    ReadFile = 0x52,
    WriteFile = 0x53,
    SeekFile = 0x54,
    StatFile = 0x55,
}

impl Op {
    /// Calls that need the caller's complete register state captured take
    /// the full entry even after the fast entry has been installed.
    pub fn requires_full_entry(self) -> bool {
        matches!(self, Op::Fork)
    }

    /// Decode the raw opcode word; the kernel side of the gate uses this.
    pub fn from_raw(raw: usize) -> Option<Self> {
        use self::Op::*;
        Some(match raw {
            0x01 => MapMemory,
            0x02 => UnmapMemory,
            0x03 => ProtectMemory,
            0x04 => FlushMemory,
            0x05 => FlushCache,
            0x10 => WaitWake,
            0x20 => SetThreadPointer,
            0x21 => GetThreadId,
            0x22 => SetThreadIdentity,
            0x23 => ExitThread,
            0x24 => Fork,
            0x30 => SetSignalHandler,
            0x31 => SendSignal,
            0x32 => ExitProcess,
            0x40 => DebugReport,
            0x50 => OpenFile,
            0x51 => CloseFile,
            0x52 => ReadFile,
            0x53 => WriteFile,
            0x54 => SeekFile,
            0x55 => StatFile,
            _ => return None,
        })
    }
}

bitflags::bitflags! {
    /// Protection bits for memory mapping opcodes.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MapProt: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

bitflags::bitflags! {
    /// Placement flags for [`Op::MapMemory`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        /// Zero-filled pages, no file backing.
        const ANONYMOUS = 1 << 0;
        const PRIVATE = 1 << 1;
        /// The address is a requirement, not a hint.
        const FIXED = 1 << 2;
    }
}

/// Wait/wake is a single opcode; the op and the private flavor live in one
/// flags word.
pub const WW_OP_WAKE: u32 = 1 << 0;
pub const WW_PRIVATE: u32 = 1 << 1;

/// Infinite timeout sentinel for [`WaitWakeArgs::timeout_ns`].
pub const WW_TIMEOUT_INFINITE: u64 = u64::MAX;

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct MapArgs {
    /// Hint, or requirement with [`MapFlags::FIXED`]. Zero for "anywhere".
    pub address: usize,
    pub size: usize,
    pub prot: u32,
    pub flags: u32,
    /// Backing file, ignored for anonymous mappings.
    pub fd: i32,
    pub _pad: u32,
    pub offset: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct RangeArgs {
    pub address: usize,
    pub size: usize,
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ProtectArgs {
    pub address: usize,
    pub size: usize,
    pub prot: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct WaitWakeArgs {
    /// Address of the 32-bit word.
    pub address: usize,
    pub op_flags: u32,
    /// Expected value for wait; wake count for wake.
    pub value: u32,
    /// Nanoseconds; [`WW_TIMEOUT_INFINITE`] blocks forever.
    pub timeout_ns: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ThreadPointerArgs {
    pub value: usize,
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ThreadIdentityArgs {
    pub thread_id: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct SignalHandlerArgs {
    pub signal: u32,
    pub handler: usize,
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct SendSignalArgs {
    /// Zero targets the current process.
    pub target: u32,
    pub signal: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ExitArgs {
    pub status: i32,
}

/// Record kinds for [`Op::DebugReport`].
pub const DEBUG_KIND_MESSAGE: u32 = 0;
pub const DEBUG_KIND_IMAGE_LOAD: u32 = 1;
pub const DEBUG_KIND_IMAGE_UNLOAD: u32 = 2;

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct DebugReportArgs {
    pub kind: u32,
    pub _pad: u32,
    pub data: *const u8,
    pub len: usize,
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct OpenArgs {
    pub path: *const u8,
    pub path_len: usize,
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct FdArgs {
    pub fd: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct IoArgs {
    pub fd: i32,
    pub _pad: u32,
    pub buffer: *mut u8,
    pub len: usize,
}

pub const SEEK_SET: u32 = 0;
pub const SEEK_CUR: u32 = 1;
pub const SEEK_END: u32 = 2;

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct SeekArgs {
    pub fd: i32,
    pub whence: u32,
    pub offset: i64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct StatArgs {
    pub fd: i32,
    pub _pad: u32,
    /// Filled by the kernel.
    pub device: u64,
    pub inode: u64,
    pub size: u64,
    pub mtime: i64,
}

/// The bridge itself: holds the full entry and the currently selected entry.
pub struct Bridge {
    full: GateFn,
    fast: Option<GateFn>,
    selected: AtomicPtr<()>,
}

impl Bridge {
    pub fn new(full: GateFn) -> Self {
        Self {
            full,
            fast: None,
            selected: AtomicPtr::new(full as usize as *mut ()),
        }
    }

    pub fn with_fast(full: GateFn, fast: GateFn) -> Self {
        Self {
            full,
            fast: Some(fast),
            selected: AtomicPtr::new(full as usize as *mut ()),
        }
    }

    /// One-time entry selection from the processor feature bitmap.
    pub fn select(&self, features: CpuFeatures) {
        if features.contains(CpuFeatures::FAST_GATE) {
            if let Some(fast) = self.fast {
                self.selected
                    .store(fast as usize as *mut (), Ordering::Release);
            }
        }
    }

    /// Issue a call through the selected entry; fork-class opcodes are
    /// forced onto the full entry.
    pub unsafe fn invoke(&self, op: Op, args: *mut u8) -> isize {
        if op.requires_full_entry() {
            return (self.full)(op as usize, args);
        }
        let entry: GateFn = mem::transmute(self.selected.load(Ordering::Acquire));
        entry(op as usize, args)
    }

    /// Issue a call through the full entry unconditionally.
    pub unsafe fn invoke_full(&self, op: Op, args: *mut u8) -> isize {
        (self.full)(op as usize, args)
    }
}
