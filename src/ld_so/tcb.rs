//! Thread control blocks and TLS.
//!
//! Each thread owns one mapping laid out as
//!
//! ```text
//! [ static TLS blocks, highest-numbered module first ]
//! [ thread control block                             ]
//! [ initial TLS vector                               ]
//! ```
//!
//! padded to a page. The thread pointer holds the TCB address; compiler
//! output relies on the self pointer sitting at offset 0 and the stack
//! guard at 0x14/0x28, so those offsets are load-bearing ABI. The mapping
//! comes straight from the kernel, not the heap: fork may be taken with
//! the heap lock held.
//!
//! Modules outside static TLS get their blocks lazily, on first access
//! through [`get_tls_address`], from the heap. The word just below each
//! dynamic payload remembers the original allocation address so teardown
//! can free what was actually allocated.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem;
use core::ptr;

use crate::error::{Error, Result};
use crate::heap;
use crate::heap::config::{align_up, BLOCK_ALIGN};
use crate::platform;
use crate::platform::gate::{MapFlags, MapProt};
use crate::sync::Mutex;

use super::image::{Image, LoadFlags};
use super::linker::linker;

/// Tag on per-module dynamic TLS blocks.
pub const TLS_BLOCK_TAG: u32 = 0x544c_5342;
/// Tag on migrated TLS vectors.
pub const TLS_VECTOR_TAG: u32 = 0x544c_5356;

#[repr(C)]
#[derive(Debug)]
pub struct Tcb {
    /// Always the TCB's own address while the thread lives; the ABI wants
    /// it first so the thread register finds it at offset 0.
    pub self_ptr: *mut Tcb,
    /// TLS vector; element 0 holds the highest module number the vector
    /// was sized for, element k the thread's block for module k.
    pub vector: *mut usize,
    /// Entries in the vector.
    pub module_count: usize,
    /// Base of the whole thread mapping.
    pub alloc_base: *mut u8,
    pub alloc_size: usize,
    /// Referenced by compiler output at a fixed offset.
    pub stack_guard: usize,
    list_next: *mut Tcb,
    list_prev: *mut Tcb,
}

#[cfg(target_pointer_width = "64")]
const _: () = assert!(mem::offset_of!(Tcb, self_ptr) == 0);
#[cfg(target_pointer_width = "64")]
const _: () = assert!(mem::offset_of!(Tcb, stack_guard) == 0x28);
#[cfg(target_pointer_width = "32")]
const _: () = assert!(mem::offset_of!(Tcb, self_ptr) == 0);
#[cfg(target_pointer_width = "32")]
const _: () = assert!(mem::offset_of!(Tcb, stack_guard) == 0x14);

struct ThreadList {
    head: *mut Tcb,
}

unsafe impl Send for ThreadList {}

/// All live TCBs. Held briefly, and never around user callbacks.
static THREADS: Mutex<ThreadList> = Mutex::new(ThreadList {
    head: ptr::null_mut(),
});

const WORD: usize = mem::size_of::<usize>();

impl Tcb {
    /// Build the calling thread's TCB from the current image list, set the
    /// thread pointer at it, and register it. Called at process start for
    /// the first thread and by thread creation for the rest.
    pub unsafe fn create() -> Result<&'static mut Tcb> {
        let kernel = platform::kernel();
        let page = kernel.page_size();

        struct Placement {
            module: usize,
            offset: usize,
            image: Arc<Image>,
        }

        let (module_count, static_size, placements) = {
            let guard = linker().read();
            let module_count = guard.modules().module_count();

            let mut eligible: Vec<(usize, Arc<Image>)> = guard
                .images()
                .iter()
                .filter(|image| {
                    image.tls.is_some()
                        && image
                            .flags
                            .intersects(LoadFlags::STATIC_TLS | LoadFlags::PRIMARY)
                })
                .map(|image| (image.module_id(), image.clone()))
                .collect();
            eligible.sort_by_key(|(module, _)| *module);

            let mut cursor = 0usize;
            let mut placements = Vec::with_capacity(eligible.len());
            for (module, image) in eligible {
                let desc = image.tls.as_ref().unwrap();
                let align = desc.align.clamp(1, page);
                let offset = align_up(cursor + desc.mem_size, align);
                // One-shot: later threads reuse the first assignment.
                let offset = desc.assign_static_offset(offset);
                cursor = cursor.max(offset);
                placements.push(Placement {
                    module,
                    offset,
                    image,
                });
            }
            (module_count, cursor, placements)
        };

        let max_align = placements
            .iter()
            .map(|p| p.image.tls.as_ref().unwrap().align.clamp(1, page))
            .max()
            .unwrap_or(BLOCK_ALIGN)
            .max(BLOCK_ALIGN);
        let tcb_offset = align_up(static_size, max_align);
        let alloc_size = align_up(
            tcb_offset + mem::size_of::<Tcb>() + module_count * WORD,
            page,
        );

        let base = kernel.map(
            0,
            alloc_size,
            MapProt::READ | MapProt::WRITE,
            MapFlags::ANONYMOUS | MapFlags::PRIVATE,
            -1,
            0,
        )? as *mut u8;

        let tcb = (base as usize + tcb_offset) as *mut Tcb;
        let vector = (tcb as usize + mem::size_of::<Tcb>()) as *mut usize;
        ptr::write(
            tcb,
            Tcb {
                self_ptr: tcb,
                vector,
                module_count,
                alloc_base: base,
                alloc_size,
                stack_guard: platform::stack_guard(),
                list_next: ptr::null_mut(),
                list_prev: ptr::null_mut(),
            },
        );
        vector.write(module_count - 1);

        for placement in &placements {
            let desc = placement.image.tls.as_ref().unwrap();
            let slot = tcb as usize - placement.offset;
            vector.add(placement.module).write(slot);
            ptr::copy_nonoverlapping(desc.init_addr as *const u8, slot as *mut u8, desc.init_size);
        }

        kernel.set_thread_pointer(tcb as usize);
        register(tcb);
        Ok(&mut *tcb)
    }

    /// The calling thread's TCB, through the thread register.
    pub unsafe fn current() -> Option<&'static mut Tcb> {
        let tp = platform::kernel().thread_pointer();
        if tp == 0 {
            return None;
        }
        let tcb = tp as *mut Tcb;
        if (*tcb).self_ptr != tcb {
            return None;
        }
        Some(&mut *tcb)
    }

    /// Highest module number this thread's vector covers.
    pub fn vector_generation(&self) -> usize {
        unsafe { self.vector.read() }
    }

    pub fn slot(&self, module: usize) -> usize {
        if module == 0 || module >= self.module_count {
            return 0;
        }
        unsafe { self.vector.add(module).read() }
    }

    fn owns(&self, addr: usize) -> bool {
        let base = self.alloc_base as usize;
        addr >= base && addr < base + self.alloc_size
    }

    /// Whether the vector has left the initial reservation for the heap.
    pub fn vector_is_migrated(&self) -> bool {
        !self.owns(self.vector as usize)
    }

    /// Tear the calling thread's TCB down: free dynamic TLS blocks and a
    /// migrated vector, drop off the thread list, clear the self pointer,
    /// unmap.
    pub unsafe fn destroy(tcb: *mut Tcb) {
        let kernel = platform::kernel();
        let this = &mut *tcb;
        let base = this.alloc_base as usize;
        let size = this.alloc_size;

        if let Some(heap) = heap::try_global() {
            for module in 1..this.module_count {
                let slot = this.vector.add(module).read();
                if slot != 0 && !this.owns(slot) {
                    let raw = ((slot - WORD) as *const usize).read();
                    let _ = heap.free(raw as *mut u8);
                }
            }
            let vector_addr = this.vector as usize;
            if !this.owns(vector_addr) {
                let _ = heap.free(vector_addr as *mut u8);
            }
        }

        unregister(tcb);
        this.self_ptr = ptr::null_mut();
        kernel.set_thread_pointer(0);
        let _ = kernel.unmap(base, size);
    }
}

fn register(tcb: *mut Tcb) {
    let mut list = THREADS.lock();
    unsafe {
        (*tcb).list_next = list.head;
        (*tcb).list_prev = ptr::null_mut();
        if !list.head.is_null() {
            (*list.head).list_prev = tcb;
        }
    }
    list.head = tcb;
}

fn unregister(tcb: *mut Tcb) {
    let mut list = THREADS.lock();
    unsafe {
        let next = (*tcb).list_next;
        let prev = (*tcb).list_prev;
        if !next.is_null() {
            (*next).list_prev = prev;
        }
        if !prev.is_null() {
            (*prev).list_next = next;
        } else {
            list.head = next;
        }
    }
}

/// The compiler-emitted TLS entry: address of `module`'s block for the
/// calling thread, plus `offset`.
pub unsafe fn get_tls_address(module: usize, offset: usize) -> Result<*mut u8> {
    let tcb = Tcb::current().ok_or(Error::InvalidHandle)?;
    get_tls_address_in(tcb, module, offset)
}

/// Same, against an explicit TCB. Growth is always the owning thread's
/// own; no cross-thread resize exists.
pub unsafe fn get_tls_address_in(tcb: &mut Tcb, module: usize, offset: usize) -> Result<*mut u8> {
    if module == 0 {
        return Err(Error::InvalidParameter);
    }
    if tcb.vector_generation() < module {
        grow_vector(tcb, module)?;
    }

    let slot_ptr = tcb.vector.add(module);
    if slot_ptr.read() == 0 {
        let guard = linker().read();
        let image = guard.find_by_module(module).ok_or(Error::NotFound)?;
        let desc = image.tls.as_ref().ok_or(Error::UnexpectedType)?;

        let heap = heap::global();
        let align = desc.align.max(WORD);
        let total = desc.mem_size + align + WORD;
        let raw = heap
            .allocate(total, TLS_BLOCK_TAG)
            .ok_or(Error::OutOfMemory)?;
        let payload = align_up(raw.as_ptr() as usize + WORD, align);
        // The word below the payload recovers the allocation on teardown.
        ((payload - WORD) as *mut usize).write(raw.as_ptr() as usize);
        ptr::copy_nonoverlapping(
            desc.init_addr as *const u8,
            payload as *mut u8,
            desc.init_size,
        );
        ptr::write_bytes(
            (payload + desc.init_size) as *mut u8,
            0,
            desc.mem_size - desc.init_size,
        );
        slot_ptr.write(payload);
    }

    Ok((slot_ptr.read() + offset) as *mut u8)
}

/// Make the vector cover `module`. In place while the initial reservation
/// has room, otherwise migrated to the heap.
unsafe fn grow_vector(tcb: &mut Tcb, module: usize) -> Result<()> {
    let new_count = module + 1;
    let vector_addr = tcb.vector as usize;
    let in_initial = tcb.owns(vector_addr);
    let fits = vector_addr + new_count * WORD
        <= tcb.alloc_base as usize + tcb.alloc_size;

    if in_initial && fits {
        for index in tcb.module_count..new_count {
            tcb.vector.add(index).write(0);
        }
    } else {
        let heap = heap::global();
        let raw = heap
            .allocate(new_count * WORD, TLS_VECTOR_TAG)
            .ok_or(Error::OutOfMemory)?;
        let new_vector = raw.as_ptr() as *mut usize;
        ptr::copy_nonoverlapping(tcb.vector, new_vector, tcb.module_count);
        for index in tcb.module_count..new_count {
            new_vector.add(index).write(0);
        }
        if !in_initial {
            let _ = heap.free(tcb.vector as *mut u8);
        }
        tcb.vector = new_vector;
    }

    tcb.module_count = new_count;
    tcb.vector.write(new_count - 1);
    Ok(())
}

/// Module-unload sweep: free every thread's block for `module` and clear
/// the slot. The caller holds the image lock exclusively, so no thread is
/// concurrently inside this module's lazy-allocation path.
pub unsafe fn module_unloaded(module: usize) {
    let Some(heap) = heap::try_global() else {
        return;
    };
    let list = THREADS.lock();
    let mut cursor = list.head;
    while !cursor.is_null() {
        let tcb = &mut *cursor;
        if module != 0 && module < tcb.module_count {
            let slot_ptr = tcb.vector.add(module);
            let slot = slot_ptr.read();
            if slot != 0 && !tcb.owns(slot) {
                let raw = ((slot - WORD) as *const usize).read();
                let _ = heap.free(raw as *mut u8);
            }
            slot_ptr.write(0);
        }
        cursor = tcb.list_next;
    }
}

/// Number of live TCBs, for diagnostics.
pub fn thread_count() -> usize {
    let list = THREADS.lock();
    let mut n = 0;
    let mut cursor = list.head;
    while !cursor.is_null() {
        n += 1;
        cursor = unsafe { (*cursor).list_next };
    }
    n
}
