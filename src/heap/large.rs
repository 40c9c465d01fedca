//! Direct-mapped allocations.
//!
//! Requests at or above the direct threshold skip the arenas entirely: each
//! gets its own mapping with an in-band header at the mapping base and the
//! payload aligned past it. The headers form a doubly linked list so free
//! and validate can recognize direct payloads without magic-probing.

use core::ptr;

use super::config::{align_up, BLOCK_ALIGN, DIRECT_MAGIC};

#[repr(C)]
pub struct DirectHeader {
    pub magic: u32,
    pub tag: u32,
    /// Whole mapping size.
    pub map_size: usize,
    /// Requested payload size.
    pub size: usize,
    pub payload: *mut u8,
    pub next: *mut DirectHeader,
    pub prev: *mut DirectHeader,
}

/// Worst-case bytes between the mapping base and the payload.
pub fn direct_overhead(align: usize) -> usize {
    core::mem::size_of::<DirectHeader>() + align.max(BLOCK_ALIGN)
}

pub struct DirectList {
    pub head: *mut DirectHeader,
}

unsafe impl Send for DirectList {}

impl DirectList {
    pub const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
        }
    }

    /// Lay a header over a fresh mapping and link it in. The payload lands
    /// past the header at the first address satisfying `align`.
    pub unsafe fn adopt(
        &mut self,
        base: *mut u8,
        map_size: usize,
        size: usize,
        align: usize,
        tag: u32,
    ) -> *mut u8 {
        let header = base as *mut DirectHeader;
        let payload = align_up(
            base as usize + core::mem::size_of::<DirectHeader>(),
            align.max(BLOCK_ALIGN),
        ) as *mut u8;
        ptr::write(
            header,
            DirectHeader {
                magic: DIRECT_MAGIC,
                tag,
                map_size,
                size,
                payload,
                next: self.head,
                prev: ptr::null_mut(),
            },
        );
        if !self.head.is_null() {
            (*self.head).prev = header;
        }
        self.head = header;
        payload
    }

    /// The direct entry owning `payload`, when there is one.
    pub unsafe fn find(&self, payload: *mut u8) -> Option<*mut DirectHeader> {
        let mut cursor = self.head;
        while !cursor.is_null() {
            if (*cursor).payload == payload {
                return Some(cursor);
            }
            cursor = (*cursor).next;
        }
        None
    }

    pub unsafe fn unlink(&mut self, header: *mut DirectHeader) {
        let next = (*header).next;
        let prev = (*header).prev;
        if !next.is_null() {
            (*next).prev = prev;
        }
        if !prev.is_null() {
            (*prev).next = next;
        } else {
            self.head = next;
        }
    }

    pub unsafe fn validate(&self) -> Result<(), usize> {
        let mut cursor = self.head;
        while !cursor.is_null() {
            if (*cursor).magic != DIRECT_MAGIC {
                return Err(cursor as usize);
            }
            cursor = (*cursor).next;
        }
        Ok(())
    }

    pub unsafe fn count(&self) -> usize {
        let mut n = 0;
        let mut cursor = self.head;
        while !cursor.is_null() {
            n += 1;
            cursor = (*cursor).next;
        }
        n
    }
}
