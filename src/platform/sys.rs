//! `Sys`: the gate-backed kernel handle.
//!
//! Builds the fixed parameter records and pushes them through the bridge.
//! The only piece that is not a gate call is reading the thread register
//! back, which is an architectural register load.

use crate::error::{Error, Result};
use crate::platform::gate::{self, Bridge, GateFn, MapFlags, MapProt, Op};
use crate::platform::pal::{FileIdent, Pal, Seek};
use crate::platform::usd::{UsdReader, UserSharedData};

pub struct Sys {
    bridge: Bridge,
    usd: *const UserSharedData,
    page_size: usize,
}

unsafe impl Send for Sys {}
unsafe impl Sync for Sys {}

impl Sys {
    /// Wrap a gate with only the full entry.
    ///
    /// # Safety
    /// `full` must be a working gate entry and `usd` a live user-shared
    /// data page for the process lifetime.
    pub unsafe fn new(full: GateFn, usd: *const UserSharedData, page_size: usize) -> Self {
        Self {
            bridge: Bridge::new(full),
            usd,
            page_size,
        }
    }

    /// Wrap a gate that also offers the fast entry; selection happens in
    /// [`Sys::select_entry`] from the feature bitmap.
    pub unsafe fn with_fast(
        full: GateFn,
        fast: GateFn,
        usd: *const UserSharedData,
        page_size: usize,
    ) -> Self {
        Self {
            bridge: Bridge::with_fast(full, fast),
            usd,
            page_size,
        }
    }

    /// Read the processor feature bitmap and install the fast entry when
    /// the kernel advertises it. Called once during runtime init.
    pub fn select_entry(&self) {
        let reader = unsafe { UsdReader::new(self.usd) };
        self.bridge.select(reader.cpu_features());
    }

    unsafe fn call<T>(&self, op: Op, args: &mut T) -> Result<usize> {
        Error::demux(self.bridge.invoke(op, args as *mut T as *mut u8))
    }
}

impl Pal for Sys {
    unsafe fn map(
        &self,
        address: usize,
        size: usize,
        prot: MapProt,
        flags: MapFlags,
        fd: i32,
        offset: u64,
    ) -> Result<usize> {
        let mut args = gate::MapArgs {
            address,
            size,
            prot: prot.bits(),
            flags: flags.bits(),
            fd,
            _pad: 0,
            offset,
        };
        self.call(Op::MapMemory, &mut args)
    }

    unsafe fn unmap(&self, address: usize, size: usize) -> Result<()> {
        let mut args = gate::RangeArgs { address, size };
        self.call(Op::UnmapMemory, &mut args).map(|_| ())
    }

    unsafe fn protect(&self, address: usize, size: usize, prot: MapProt) -> Result<()> {
        let mut args = gate::ProtectArgs {
            address,
            size,
            prot: prot.bits(),
        };
        self.call(Op::ProtectMemory, &mut args).map(|_| ())
    }

    unsafe fn flush_memory(&self, address: usize, size: usize) -> Result<()> {
        let mut args = gate::RangeArgs { address, size };
        self.call(Op::FlushMemory, &mut args).map(|_| ())
    }

    unsafe fn flush_icache(&self, address: usize, size: usize) -> Result<()> {
        let mut args = gate::RangeArgs { address, size };
        self.call(Op::FlushCache, &mut args).map(|_| ())
    }

    unsafe fn wait(
        &self,
        word: *const u32,
        expected: u32,
        timeout_ns: Option<u64>,
        private: bool,
    ) -> Result<()> {
        let mut op_flags = 0;
        if private {
            op_flags |= gate::WW_PRIVATE;
        }
        let mut args = gate::WaitWakeArgs {
            address: word as usize,
            op_flags,
            value: expected,
            timeout_ns: timeout_ns.unwrap_or(gate::WW_TIMEOUT_INFINITE),
        };
        self.call(Op::WaitWake, &mut args).map(|_| ())
    }

    unsafe fn wake(&self, word: *const u32, count: u32, private: bool) -> Result<u32> {
        let mut op_flags = gate::WW_OP_WAKE;
        if private {
            op_flags |= gate::WW_PRIVATE;
        }
        let mut args = gate::WaitWakeArgs {
            address: word as usize,
            op_flags,
            value: count,
            timeout_ns: 0,
        };
        self.call(Op::WaitWake, &mut args).map(|woken| woken as u32)
    }

    fn thread_id(&self) -> u32 {
        unsafe {
            let mut args = gate::ThreadIdentityArgs { thread_id: 0 };
            self.call(Op::GetThreadId, &mut args)
                .map(|id| id as u32)
                .unwrap_or(0)
        }
    }

    unsafe fn set_thread_pointer(&self, value: usize) {
        let mut args = gate::ThreadPointerArgs { value };
        let _ = self.call(Op::SetThreadPointer, &mut args);
    }

    fn thread_pointer(&self) -> usize {
        // With the host backend compiled in, the thread register is the
        // host's per-thread cell; on a real kernel it is an architectural
        // register read (self pointer sits at offset 0 of the TCB).
        #[cfg(feature = "host")]
        {
            crate::platform::host::thread_pointer()
        }
        #[cfg(all(not(feature = "host"), target_arch = "x86_64"))]
        {
            let value: usize;
            unsafe {
                core::arch::asm!("mov {}, fs:[0]", out(reg) value, options(nostack, readonly));
            }
            value
        }
        #[cfg(all(not(feature = "host"), target_arch = "x86"))]
        {
            let value: usize;
            unsafe {
                core::arch::asm!("mov {}, gs:[0]", out(reg) value, options(nostack, readonly));
            }
            value
        }
        #[cfg(all(not(feature = "host"), target_arch = "aarch64"))]
        {
            let value: usize;
            unsafe {
                core::arch::asm!("mrs {}, tpidr_el0", out(reg) value, options(nostack, nomem));
            }
            value
        }
        #[cfg(all(
            not(feature = "host"),
            not(any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64"))
        ))]
        {
            unimplemented!("thread register read for this architecture")
        }
    }

    unsafe fn set_signal_handler(&self, signal: u32, handler: usize) -> Result<()> {
        let mut args = gate::SignalHandlerArgs { signal, handler };
        self.call(Op::SetSignalHandler, &mut args).map(|_| ())
    }

    fn send_signal(&self, target: u32, signal: u32) -> Result<()> {
        unsafe {
            let mut args = gate::SendSignalArgs { target, signal };
            self.call(Op::SendSignal, &mut args).map(|_| ())
        }
    }

    fn exit_thread(&self, status: i32) -> ! {
        unsafe {
            let mut args = gate::ExitArgs { status };
            let _ = self.call(Op::ExitThread, &mut args);
        }
        unreachable!("kernel returned from thread exit")
    }

    fn exit_process(&self, status: i32) -> ! {
        unsafe {
            let mut args = gate::ExitArgs { status };
            let _ = self.call(Op::ExitProcess, &mut args);
        }
        unreachable!("kernel returned from process exit")
    }

    fn debug_report(&self, kind: u32, data: &[u8]) {
        unsafe {
            let mut args = gate::DebugReportArgs {
                kind,
                _pad: 0,
                data: data.as_ptr(),
                len: data.len(),
            };
            let _ = self.call(Op::DebugReport, &mut args);
        }
    }

    fn open(&self, path: &str) -> Result<i32> {
        unsafe {
            let mut args = gate::OpenArgs {
                path: path.as_ptr(),
                path_len: path.len(),
            };
            self.call(Op::OpenFile, &mut args).map(|fd| fd as i32)
        }
    }

    fn close(&self, fd: i32) -> Result<()> {
        unsafe {
            let mut args = gate::FdArgs { fd };
            self.call(Op::CloseFile, &mut args).map(|_| ())
        }
    }

    fn read(&self, fd: i32, buf: &mut [u8]) -> Result<usize> {
        unsafe {
            let mut args = gate::IoArgs {
                fd,
                _pad: 0,
                buffer: buf.as_mut_ptr(),
                len: buf.len(),
            };
            self.call(Op::ReadFile, &mut args)
        }
    }

    fn write(&self, fd: i32, buf: &[u8]) -> Result<usize> {
        unsafe {
            let mut args = gate::IoArgs {
                fd,
                _pad: 0,
                buffer: buf.as_ptr() as *mut u8,
                len: buf.len(),
            };
            self.call(Op::WriteFile, &mut args)
        }
    }

    fn seek(&self, fd: i32, offset: i64, whence: Seek) -> Result<u64> {
        unsafe {
            let mut args = gate::SeekArgs {
                fd,
                whence: match whence {
                    Seek::Set => gate::SEEK_SET,
                    Seek::Current => gate::SEEK_CUR,
                    Seek::End => gate::SEEK_END,
                },
                offset,
            };
            self.call(Op::SeekFile, &mut args).map(|pos| pos as u64)
        }
    }

    fn stat(&self, fd: i32) -> Result<FileIdent> {
        unsafe {
            let mut args = gate::StatArgs {
                fd,
                ..Default::default()
            };
            self.call(Op::StatFile, &mut args)?;
            Ok(FileIdent {
                device: args.device,
                inode: args.inode,
                size: args.size,
                mtime: args.mtime,
            })
        }
    }

    fn usd_page(&self) -> *const UserSharedData {
        self.usd
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}
