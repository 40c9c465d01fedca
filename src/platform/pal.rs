//! The kernel surface the core consumes.
//!
//! Everything above the gate talks to the kernel through this trait, never
//! through raw opcodes. [`crate::platform::sys::Sys`] implements it over the
//! bridge; the host emulation implements the gate side of the same records.

use crate::error::Result;
use crate::platform::gate::{MapFlags, MapProt};
use crate::platform::usd::UserSharedData;

/// Identity of an open file, as reported by the kernel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileIdent {
    pub device: u64,
    pub inode: u64,
    pub size: u64,
    pub mtime: i64,
}

/// Seek origins for [`Pal::seek`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Seek {
    Set,
    Current,
    End,
}

pub trait Pal: Sync {
    /// Map `size` bytes; anonymous or file-backed per `flags`. Returns the
    /// chosen base address.
    unsafe fn map(
        &self,
        address: usize,
        size: usize,
        prot: MapProt,
        flags: MapFlags,
        fd: i32,
        offset: u64,
    ) -> Result<usize>;

    unsafe fn unmap(&self, address: usize, size: usize) -> Result<()>;

    unsafe fn protect(&self, address: usize, size: usize, prot: MapProt) -> Result<()>;

    unsafe fn flush_memory(&self, address: usize, size: usize) -> Result<()>;

    /// Invalidate the instruction cache over a range.
    unsafe fn flush_icache(&self, address: usize, size: usize) -> Result<()>;

    /// Suspend on a 32-bit word while it still holds `expected`.
    /// `timeout_ns` of `None` blocks forever. Distinguishes timeout,
    /// interruption and value mismatch through the error taxonomy.
    unsafe fn wait(
        &self,
        word: *const u32,
        expected: u32,
        timeout_ns: Option<u64>,
        private: bool,
    ) -> Result<()>;

    /// Wake up to `count` waiters; returns the number actually woken.
    unsafe fn wake(&self, word: *const u32, count: u32, private: bool) -> Result<u32>;

    fn thread_id(&self) -> u32;

    /// Point the architectural thread register at `value`.
    unsafe fn set_thread_pointer(&self, value: usize);

    /// Read back the architectural thread register.
    fn thread_pointer(&self) -> usize;

    unsafe fn set_signal_handler(&self, signal: u32, handler: usize) -> Result<()>;

    /// `target` zero addresses the current process.
    fn send_signal(&self, target: u32, signal: u32) -> Result<()>;

    fn exit_thread(&self, status: i32) -> !;

    fn exit_process(&self, status: i32) -> !;

    /// Ship a record to the kernel debug channel.
    fn debug_report(&self, kind: u32, data: &[u8]);

    fn open(&self, path: &str) -> Result<i32>;

    fn close(&self, fd: i32) -> Result<()>;

    fn read(&self, fd: i32, buf: &mut [u8]) -> Result<usize>;

    fn write(&self, fd: i32, buf: &[u8]) -> Result<usize>;

    fn seek(&self, fd: i32, offset: i64, whence: Seek) -> Result<u64>;

    fn stat(&self, fd: i32) -> Result<FileIdent>;

    /// The read-only user-shared data page.
    fn usd_page(&self) -> *const UserSharedData;

    fn page_size(&self) -> usize;
}
