//! Host kernel emulation.
//!
//! An in-process kernel behind the same gate ABI the real one speaks:
//! opcode plus parameter record in, signed word out. Memory comes from the
//! host allocator, wait/wake is built on condvars keyed by word address,
//! files live in an in-memory store, and the debug channel is captured for
//! inspection. This is what the test suite runs the entire runtime against,
//! and it doubles as a way to exercise the runtime unhosted.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::platform::gate::{self, Op};
use crate::platform::sys::Sys;
use crate::platform::usd::{CpuFeatures, SystemVersion, UserSharedData};

const HOST_PAGE_SIZE: usize = 4096;

struct Mapping {
    size: usize,
    layout: Layout,
}

struct FileEntry {
    bytes: Vec<u8>,
    inode: u64,
    mtime: i64,
}

struct OpenFd {
    path: String,
    pos: u64,
}

#[derive(Default)]
struct FutexState {
    tokens: u32,
    waiters: u32,
}

#[derive(Default)]
struct FutexQueue {
    state: Mutex<FutexState>,
    cond: Condvar,
}

pub struct HostKernel {
    mappings: Mutex<BTreeMap<usize, Mapping>>,
    files: Mutex<HashMap<String, FileEntry>>,
    fds: Mutex<HashMap<i32, OpenFd>>,
    next_fd: AtomicI32,
    next_inode: AtomicU64,
    futexes: Mutex<HashMap<usize, Arc<FutexQueue>>>,
    debug_records: Mutex<Vec<(u32, Vec<u8>)>>,
    signals: Mutex<Vec<(u32, u32)>>,
    handlers: Mutex<Vec<(u32, usize)>>,
    protections: Mutex<Vec<(usize, usize, u32)>>,
    usd: &'static UserSharedData,
    usd_writer: Mutex<()>,
    pub fast_calls: AtomicUsize,
    next_tid: AtomicU32,
}

static HOST: OnceLock<HostKernel> = OnceLock::new();
static SYS: OnceLock<Sys> = OnceLock::new();

std::thread_local! {
    static THREAD_ID: std::cell::Cell<u32> = const { std::cell::Cell::new(0) };
    static THREAD_POINTER: std::cell::Cell<usize> = const { std::cell::Cell::new(0) };
}

/// Install the host kernel and a gate-backed `Sys` over it as the process
/// kernel handle. Idempotent; every test binary funnels through here.
pub fn install() -> &'static HostKernel {
    let host = HOST.get_or_init(|| {
        let usd = Box::leak(Box::new(UserSharedData::new_zeroed()));
        seed_usd(usd);
        HostKernel {
            mappings: Mutex::new(BTreeMap::new()),
            files: Mutex::new(HashMap::new()),
            fds: Mutex::new(HashMap::new()),
            next_fd: AtomicI32::new(3),
            next_inode: AtomicU64::new(1),
            futexes: Mutex::new(HashMap::new()),
            debug_records: Mutex::new(Vec::new()),
            signals: Mutex::new(Vec::new()),
            handlers: Mutex::new(Vec::new()),
            protections: Mutex::new(Vec::new()),
            usd,
            usd_writer: Mutex::new(()),
            fast_calls: AtomicUsize::new(0),
            next_tid: AtomicU32::new(1),
        }
    });
    let sys = SYS.get_or_init(|| {
        let sys = unsafe { Sys::with_fast(host_full, host_fast, host.usd, HOST_PAGE_SIZE) };
        sys.select_entry();
        sys
    });
    crate::platform::init(sys);
    host
}

fn seed_usd(usd: &UserSharedData) {
    let features = CpuFeatures::FAST_GATE | CpuFeatures::INVARIANT_COUNTER;
    usd.cpu_features.store(features.bits(), Ordering::Relaxed);
    usd.counter_frequency.store(10_000_000, Ordering::Relaxed);
    usd.processor_frequency.store(2_400_000_000, Ordering::Relaxed);
    usd.time_counter.store(1, Ordering::Relaxed);
    usd.version.store(
        SystemVersion {
            major: 1,
            minor: 0,
            revision: 0,
            release_level: 0,
            debug_level: 1,
        }
        .encode(),
        Ordering::Relaxed,
    );
    usd.version_serial.store(1, Ordering::Relaxed);
}

impl HostKernel {
    /// Register an in-memory file.
    pub fn put_file(&self, path: &str, bytes: Vec<u8>) {
        let inode = self.next_inode.fetch_add(1, Ordering::Relaxed);
        self.files.lock().unwrap().insert(
            path.to_string(),
            FileEntry {
                bytes,
                inode,
                mtime: 1_700_000_000 + inode as i64,
            },
        );
    }

    pub fn file_exists(&self, path: &str) -> bool {
        self.files.lock().unwrap().contains_key(path)
    }

    /// Drain captured debug-channel records.
    pub fn take_debug_records(&self) -> Vec<(u32, Vec<u8>)> {
        std::mem::take(&mut *self.debug_records.lock().unwrap())
    }

    pub fn debug_records_of_kind(&self, kind: u32) -> Vec<Vec<u8>> {
        self.debug_records
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, d)| d.clone())
            .collect()
    }

    /// Signals delivered through the gate, as (target, signal) pairs.
    pub fn delivered_signals(&self) -> Vec<(u32, u32)> {
        self.signals.lock().unwrap().clone()
    }

    /// Protection changes applied through the gate.
    pub fn protection_log(&self) -> Vec<(usize, usize, u32)> {
        self.protections.lock().unwrap().clone()
    }

    /// Signal handler registrations, as (signal, handler) pairs.
    pub fn registered_handlers(&self) -> Vec<(u32, usize)> {
        self.handlers.lock().unwrap().clone()
    }

    pub fn mapping_count(&self) -> usize {
        self.mappings.lock().unwrap().len()
    }

    /// Mutate the user-shared page under the torn-read discipline: bump
    /// tick A, apply, publish tick B.
    pub fn usd_update(&self, apply: impl FnOnce(&UserSharedData)) {
        let _writer = self.usd_writer.lock().unwrap();
        let tick = self.usd.tick_count_a.load(Ordering::Relaxed) + 1;
        self.usd.tick_count_a.store(tick, Ordering::Release);
        apply(self.usd);
        self.usd.tick_count_b.store(tick, Ordering::Release);
    }

    /// Mutate the page with the A/B ticks deliberately out of step for a
    /// window, so readers must retry.
    pub fn usd_update_slowly(&self, apply: impl FnOnce(&UserSharedData), window: Duration) {
        let _writer = self.usd_writer.lock().unwrap();
        let tick = self.usd.tick_count_a.load(Ordering::Relaxed) + 1;
        self.usd.tick_count_a.store(tick, Ordering::Release);
        apply(self.usd);
        std::thread::sleep(window);
        self.usd.tick_count_b.store(tick, Ordering::Release);
    }

    fn mapping_covering(&self, address: usize, size: usize) -> bool {
        let mappings = self.mappings.lock().unwrap();
        mappings
            .range(..=address)
            .next_back()
            .map(|(base, m)| address + size <= base + m.size)
            .unwrap_or(false)
    }

    fn map(&self, args: &gate::MapArgs) -> Result<usize> {
        let flags = gate::MapFlags::from_bits_truncate(args.flags);
        if args.size == 0 {
            return Err(Error::InvalidParameter);
        }
        if flags.contains(gate::MapFlags::FIXED) {
            // Only refreshing a range inside an existing mapping is
            // supported; the runtime never plants fixed mappings elsewhere.
            if !self.mapping_covering(args.address, args.size) {
                return Err(Error::InvalidParameter);
            }
            if flags.contains(gate::MapFlags::ANONYMOUS) {
                unsafe { core::ptr::write_bytes(args.address as *mut u8, 0, args.size) };
            } else {
                self.copy_file_contents(args.fd, args.offset, args.address, args.size)?;
            }
            return Ok(args.address);
        }

        let layout = Layout::from_size_align(args.size, HOST_PAGE_SIZE)
            .map_err(|_| Error::InvalidParameter)?;
        let base = unsafe { alloc_zeroed(layout) };
        if base.is_null() {
            return Err(Error::OutOfMemory);
        }
        if !flags.contains(gate::MapFlags::ANONYMOUS) {
            self.copy_file_contents(args.fd, args.offset, base as usize, args.size)?;
        }
        self.mappings.lock().unwrap().insert(
            base as usize,
            Mapping {
                size: args.size,
                layout,
            },
        );
        Ok(base as usize)
    }

    fn copy_file_contents(&self, fd: i32, offset: u64, dest: usize, size: usize) -> Result<()> {
        let fds = self.fds.lock().unwrap();
        let open = fds.get(&fd).ok_or(Error::InvalidHandle)?;
        let files = self.files.lock().unwrap();
        let file = files.get(&open.path).ok_or(Error::InvalidHandle)?;
        let start = (offset as usize).min(file.bytes.len());
        let available = file.bytes.len() - start;
        let count = available.min(size);
        unsafe {
            core::ptr::copy_nonoverlapping(file.bytes.as_ptr().add(start), dest as *mut u8, count);
            core::ptr::write_bytes((dest + count) as *mut u8, 0, size - count);
        }
        Ok(())
    }

    fn unmap(&self, address: usize, size: usize) -> Result<()> {
        let mut mappings = self.mappings.lock().unwrap();
        match mappings.get(&address) {
            Some(m) if m.size == size => {
                let m = mappings.remove(&address).unwrap();
                unsafe { dealloc(address as *mut u8, m.layout) };
                Ok(())
            }
            Some(_) => Err(Error::InvalidParameter),
            None => Err(Error::InvalidHandle),
        }
    }

    fn protect(&self, args: &gate::ProtectArgs) -> Result<()> {
        if !self.mapping_covering(args.address, args.size) {
            return Err(Error::InvalidHandle);
        }
        self.protections
            .lock()
            .unwrap()
            .push((args.address, args.size, args.prot));
        Ok(())
    }

    fn futex_queue(&self, address: usize) -> Arc<FutexQueue> {
        self.futexes
            .lock()
            .unwrap()
            .entry(address)
            .or_default()
            .clone()
    }

    fn wait_wake(&self, args: &mut gate::WaitWakeArgs) -> Result<usize> {
        let queue = self.futex_queue(args.address);
        if args.op_flags & gate::WW_OP_WAKE != 0 {
            let mut state = queue.state.lock().unwrap();
            let woken = state.waiters.min(args.value);
            state.tokens += woken;
            queue.cond.notify_all();
            return Ok(woken as usize);
        }

        // Wait: test the word under the queue lock so a concurrent waker
        // (store word, then wake) cannot slip between test and sleep.
        let mut state = queue.state.lock().unwrap();
        let current = unsafe { (*(args.address as *const AtomicU32)).load(Ordering::SeqCst) };
        if current != args.value {
            return Err(Error::WouldBlock);
        }
        if args.timeout_ns == 0 {
            // Zero timeout never enters the wait queue.
            return Err(Error::TimedOut);
        }
        let deadline = if args.timeout_ns == gate::WW_TIMEOUT_INFINITE {
            None
        } else {
            Some(Instant::now() + Duration::from_nanos(args.timeout_ns))
        };
        state.waiters += 1;
        loop {
            if state.tokens > 0 {
                state.tokens -= 1;
                state.waiters -= 1;
                return Ok(0);
            }
            match deadline {
                None => {
                    state = queue.cond.wait(state).unwrap();
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        state.waiters -= 1;
                        return Err(Error::TimedOut);
                    }
                    let (next, _) = queue.cond.wait_timeout(state, deadline - now).unwrap();
                    state = next;
                }
            }
        }
    }

    fn open(&self, args: &gate::OpenArgs) -> Result<usize> {
        let path = unsafe { core::slice::from_raw_parts(args.path, args.path_len) };
        let path = core::str::from_utf8(path).map_err(|_| Error::InvalidParameter)?;
        if !self.files.lock().unwrap().contains_key(path) {
            return Err(Error::NotFound);
        }
        let fd = self.next_fd.fetch_add(1, Ordering::Relaxed);
        self.fds.lock().unwrap().insert(
            fd,
            OpenFd {
                path: path.to_string(),
                pos: 0,
            },
        );
        Ok(fd as usize)
    }

    fn read(&self, args: &mut gate::IoArgs) -> Result<usize> {
        let mut fds = self.fds.lock().unwrap();
        let open = fds.get_mut(&args.fd).ok_or(Error::InvalidHandle)?;
        let files = self.files.lock().unwrap();
        let file = files.get(&open.path).ok_or(Error::InvalidHandle)?;
        let start = (open.pos as usize).min(file.bytes.len());
        let count = (file.bytes.len() - start).min(args.len);
        unsafe {
            core::ptr::copy_nonoverlapping(file.bytes.as_ptr().add(start), args.buffer, count);
        }
        open.pos += count as u64;
        Ok(count)
    }

    fn write(&self, args: &gate::IoArgs) -> Result<usize> {
        let mut fds = self.fds.lock().unwrap();
        let open = fds.get_mut(&args.fd).ok_or(Error::InvalidHandle)?;
        let mut files = self.files.lock().unwrap();
        let file = files.get_mut(&open.path).ok_or(Error::InvalidHandle)?;
        let data = unsafe { core::slice::from_raw_parts(args.buffer, args.len) };
        let end = open.pos as usize + data.len();
        if file.bytes.len() < end {
            file.bytes.resize(end, 0);
        }
        file.bytes[open.pos as usize..end].copy_from_slice(data);
        open.pos = end as u64;
        Ok(data.len())
    }

    fn seek(&self, args: &gate::SeekArgs) -> Result<usize> {
        let mut fds = self.fds.lock().unwrap();
        let open = fds.get_mut(&args.fd).ok_or(Error::InvalidHandle)?;
        let files = self.files.lock().unwrap();
        let file = files.get(&open.path).ok_or(Error::InvalidHandle)?;
        let base = match args.whence {
            gate::SEEK_SET => 0i64,
            gate::SEEK_CUR => open.pos as i64,
            gate::SEEK_END => file.bytes.len() as i64,
            _ => return Err(Error::InvalidParameter),
        };
        let pos = base + args.offset;
        if pos < 0 {
            return Err(Error::InvalidParameter);
        }
        open.pos = pos as u64;
        Ok(pos as usize)
    }

    fn stat(&self, args: &mut gate::StatArgs) -> Result<usize> {
        let fds = self.fds.lock().unwrap();
        let open = fds.get(&args.fd).ok_or(Error::InvalidHandle)?;
        let files = self.files.lock().unwrap();
        let file = files.get(&open.path).ok_or(Error::InvalidHandle)?;
        args.device = 1;
        args.inode = file.inode;
        args.size = file.bytes.len() as u64;
        args.mtime = file.mtime;
        Ok(0)
    }

    fn dispatch(&self, op: Op, args: *mut u8) -> Result<usize> {
        unsafe {
            match op {
                Op::MapMemory => self.map(&*(args as *const gate::MapArgs)),
                Op::UnmapMemory => {
                    let range = &*(args as *const gate::RangeArgs);
                    self.unmap(range.address, range.size).map(|_| 0)
                }
                Op::ProtectMemory => self
                    .protect(&*(args as *const gate::ProtectArgs))
                    .map(|_| 0),
                Op::FlushMemory | Op::FlushCache => Ok(0),
                Op::WaitWake => self.wait_wake(&mut *(args as *mut gate::WaitWakeArgs)),
                Op::SetThreadPointer => {
                    let tp = &*(args as *const gate::ThreadPointerArgs);
                    THREAD_POINTER.with(|cell| cell.set(tp.value));
                    Ok(0)
                }
                Op::GetThreadId => Ok(self.current_tid() as usize),
                Op::SetThreadIdentity => {
                    let id = &*(args as *const gate::ThreadIdentityArgs);
                    THREAD_ID.with(|cell| cell.set(id.thread_id));
                    Ok(0)
                }
                Op::ExitThread | Op::ExitProcess => {
                    let exit = &*(args as *const gate::ExitArgs);
                    panic!("host kernel asked to exit with status {}", exit.status);
                }
                Op::Fork => Err(Error::PermissionDenied),
                Op::SetSignalHandler => {
                    let h = &*(args as *const gate::SignalHandlerArgs);
                    self.handlers.lock().unwrap().push((h.signal, h.handler));
                    Ok(0)
                }
                Op::SendSignal => {
                    let s = &*(args as *const gate::SendSignalArgs);
                    self.signals.lock().unwrap().push((s.target, s.signal));
                    Ok(0)
                }
                Op::DebugReport => {
                    let r = &*(args as *const gate::DebugReportArgs);
                    let data = core::slice::from_raw_parts(r.data, r.len).to_vec();
                    self.debug_records.lock().unwrap().push((r.kind, data));
                    Ok(0)
                }
                Op::OpenFile => self.open(&*(args as *const gate::OpenArgs)),
                Op::CloseFile => {
                    let fd = &*(args as *const gate::FdArgs);
                    self.fds
                        .lock()
                        .unwrap()
                        .remove(&fd.fd)
                        .map(|_| 0)
                        .ok_or(Error::InvalidHandle)
                }
                Op::ReadFile => self.read(&mut *(args as *mut gate::IoArgs)),
                Op::WriteFile => self.write(&*(args as *const gate::IoArgs)),
                Op::SeekFile => self.seek(&*(args as *const gate::SeekArgs)),
                Op::StatFile => self.stat(&mut *(args as *mut gate::StatArgs)),
            }
        }
    }

    fn current_tid(&self) -> u32 {
        THREAD_ID.with(|cell| {
            let mut tid = cell.get();
            if tid == 0 {
                tid = self.next_tid.fetch_add(1, Ordering::Relaxed);
                cell.set(tid);
            }
            tid
        })
    }
}

fn gate_entry(raw_op: usize, args: *mut u8) -> isize {
    let host = HOST.get().expect("host kernel not installed");
    let Some(op) = Op::from_raw(raw_op) else {
        return Error::InvalidParameter.to_word();
    };
    match host.dispatch(op, args) {
        Ok(value) => value as isize,
        Err(err) => err.to_word(),
    }
}

unsafe extern "C" fn host_full(op: usize, args: *mut u8) -> isize {
    gate_entry(op, args)
}

unsafe extern "C" fn host_fast(op: usize, args: *mut u8) -> isize {
    if let Some(host) = HOST.get() {
        host.fast_calls.fetch_add(1, Ordering::Relaxed);
    }
    gate_entry(op, args)
}

/// Host-side read of the per-thread pointer cell; `Sys::thread_pointer`
/// reads the architectural register on a real kernel, the host keeps the
/// value here instead.
pub fn thread_pointer() -> usize {
    THREAD_POINTER.with(|cell| cell.get())
}
