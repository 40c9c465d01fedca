//! Arena bookkeeping: boundary-tag blocks on a first-fit free list.
//!
//! An arena is one backing mapping. Blocks inside it are contiguous; each
//! carries its own size and the size of its physical predecessor, so frees
//! coalesce in both directions without searching. Free blocks thread their
//! payload through a doubly linked list. A fully free arena is handed back
//! to the backing whole; partial returns are rejected by configuration.

use core::ptr;

use super::backing::CorruptionKind;
use super::config::{
    align_up, ARENA_MAGIC, BLOCK_ALIGN, BLOCK_MAGIC, HEADER_SIZE, MIN_BLOCK,
};

pub const FLAG_USED: u16 = 1 << 0;
/// Physically last block of its arena.
pub const FLAG_LAST: u16 = 1 << 1;

#[repr(C)]
pub struct ArenaHeader {
    pub magic: u32,
    pub _pad: u32,
    /// Total mapping size, including this header.
    pub size: usize,
    pub next: *mut ArenaHeader,
    pub prev: *mut ArenaHeader,
}

/// Offset of the first block inside an arena.
pub fn arena_first_block_offset() -> usize {
    align_up(core::mem::size_of::<ArenaHeader>(), BLOCK_ALIGN)
}

#[repr(C)]
pub struct BlockHeader {
    /// Total block bytes including this header; multiple of 16.
    pub size: u32,
    /// Total bytes of the physically preceding block; 0 for the first.
    pub prev_size: u32,
    pub tag: u32,
    pub magic: u16,
    pub flags: u16,
}

const _: () = assert!(core::mem::size_of::<BlockHeader>() == HEADER_SIZE);
const _: () = assert!(core::mem::size_of::<ArenaHeader>() % core::mem::align_of::<ArenaHeader>() == 0);

/// Free-list links, stored in the payload of free blocks.
#[repr(C)]
pub struct FreeLinks {
    pub next: *mut BlockHeader,
    pub prev: *mut BlockHeader,
}

impl BlockHeader {
    pub fn payload(&self) -> *mut u8 {
        (self as *const BlockHeader as usize + HEADER_SIZE) as *mut u8
    }

    pub fn payload_size(&self) -> usize {
        self.size as usize - HEADER_SIZE
    }

    pub fn is_used(&self) -> bool {
        self.flags & FLAG_USED != 0
    }

    pub fn is_last(&self) -> bool {
        self.flags & FLAG_LAST != 0
    }

    /// Physically next block; `None` past the arena end.
    pub unsafe fn next_physical(&self) -> Option<*mut BlockHeader> {
        if self.is_last() {
            None
        } else {
            Some((self as *const BlockHeader as usize + self.size as usize) as *mut BlockHeader)
        }
    }

    pub unsafe fn prev_physical(&self) -> Option<*mut BlockHeader> {
        if self.prev_size == 0 {
            None
        } else {
            Some((self as *const BlockHeader as usize - self.prev_size as usize) as *mut BlockHeader)
        }
    }

    pub unsafe fn links(&mut self) -> *mut FreeLinks {
        self.payload() as *mut FreeLinks
    }
}

/// Block header owning a given payload pointer.
pub unsafe fn header_of(payload: *mut u8) -> *mut BlockHeader {
    (payload as usize - HEADER_SIZE) as *mut BlockHeader
}

/// The arena side of the heap state. Pointer-heavy by nature; the owning
/// heap serializes access under its mutex.
pub struct ArenaList {
    pub arenas: *mut ArenaHeader,
    pub free_head: *mut BlockHeader,
}

unsafe impl Send for ArenaList {}

impl ArenaList {
    pub const fn new() -> Self {
        Self {
            arenas: ptr::null_mut(),
            free_head: ptr::null_mut(),
        }
    }

    /// Adopt a fresh backing mapping as an arena holding one free block.
    /// Returns that block.
    pub unsafe fn adopt(&mut self, base: *mut u8, size: usize) -> *mut BlockHeader {
        let arena = base as *mut ArenaHeader;
        ptr::write(
            arena,
            ArenaHeader {
                magic: ARENA_MAGIC,
                _pad: 0,
                size,
                next: self.arenas,
                prev: ptr::null_mut(),
            },
        );
        if !self.arenas.is_null() {
            (*self.arenas).prev = arena;
        }
        self.arenas = arena;

        let offset = arena_first_block_offset();
        let block = (base as usize + offset) as *mut BlockHeader;
        ptr::write(
            block,
            BlockHeader {
                size: (size - offset) as u32,
                prev_size: 0,
                tag: 0,
                magic: BLOCK_MAGIC,
                flags: FLAG_LAST,
            },
        );
        self.insert_free(block);
        block
    }

    pub unsafe fn unlink_arena(&mut self, arena: *mut ArenaHeader) {
        let next = (*arena).next;
        let prev = (*arena).prev;
        if !next.is_null() {
            (*next).prev = prev;
        }
        if !prev.is_null() {
            (*prev).next = next;
        } else {
            self.arenas = next;
        }
    }

    /// Arena owning `block`, found by scanning the arena list ranges.
    pub unsafe fn arena_of(&self, block: *mut BlockHeader) -> Option<*mut ArenaHeader> {
        let addr = block as usize;
        let mut arena = self.arenas;
        while !arena.is_null() {
            let base = arena as usize;
            if addr > base && addr < base + (*arena).size {
                return Some(arena);
            }
            arena = (*arena).next;
        }
        None
    }

    pub unsafe fn insert_free(&mut self, block: *mut BlockHeader) {
        (*block).flags &= !FLAG_USED;
        let links = (*block).links();
        (*links).next = self.free_head;
        (*links).prev = ptr::null_mut();
        if !self.free_head.is_null() {
            (*(*self.free_head).links()).prev = block;
        }
        self.free_head = block;
    }

    pub unsafe fn remove_free(&mut self, block: *mut BlockHeader) {
        let links = (*block).links();
        let next = (*links).next;
        let prev = (*links).prev;
        if !next.is_null() {
            (*(*next).links()).prev = prev;
        }
        if !prev.is_null() {
            (*(*prev).links()).next = next;
        } else {
            self.free_head = next;
        }
    }

    /// First-fit search.
    pub unsafe fn find_fit(&self, block_size: usize) -> Option<*mut BlockHeader> {
        let mut cursor = self.free_head;
        while !cursor.is_null() {
            if (*cursor).size as usize >= block_size {
                return Some(cursor);
            }
            cursor = (*(*cursor).links()).next;
        }
        None
    }

    /// Carve `block_size` bytes from free `block`, splitting off a free
    /// remainder when it is worth a header.
    pub unsafe fn split(&mut self, block: *mut BlockHeader, block_size: usize) {
        let total = (*block).size as usize;
        if total - block_size >= MIN_BLOCK {
            let remainder = (block as usize + block_size) as *mut BlockHeader;
            ptr::write(
                remainder,
                BlockHeader {
                    size: (total - block_size) as u32,
                    prev_size: block_size as u32,
                    tag: 0,
                    magic: BLOCK_MAGIC,
                    flags: (*block).flags & FLAG_LAST,
                },
            );
            (*block).size = block_size as u32;
            (*block).flags &= !FLAG_LAST;
            if let Some(after) = (*remainder).next_physical() {
                (*after).prev_size = (*remainder).size;
            }
            self.insert_free(remainder);
        }
    }

    /// Coalesce a just-freed block with free physical neighbors. Returns
    /// the merged block and the payload bytes of absorbed free neighbors,
    /// so the owner can keep its free-byte count honest.
    pub unsafe fn coalesce(
        &mut self,
        mut block: *mut BlockHeader,
    ) -> Result<(*mut BlockHeader, usize), CorruptionKind> {
        let mut absorbed = 0;
        if let Some(next) = (*block).next_physical() {
            if (*next).magic != BLOCK_MAGIC {
                return Err(CorruptionKind::BadBlockHeader);
            }
            if !(*next).is_used() {
                self.remove_free(next);
                absorbed += (*next).payload_size();
                (*block).size += (*next).size;
                (*block).flags |= (*next).flags & FLAG_LAST;
                if let Some(after) = (*block).next_physical() {
                    (*after).prev_size = (*block).size;
                }
            }
        }
        if let Some(prev) = (*block).prev_physical() {
            if (*prev).magic != BLOCK_MAGIC {
                return Err(CorruptionKind::BadBlockHeader);
            }
            if !(*prev).is_used() {
                self.remove_free(prev);
                absorbed += (*prev).payload_size();
                (*prev).size += (*block).size;
                (*prev).flags |= (*block).flags & FLAG_LAST;
                if let Some(after) = (*prev).next_physical() {
                    (*after).prev_size = (*prev).size;
                }
                block = prev;
            }
        }
        Ok((block, absorbed))
    }

    /// Whether `block` alone spans its whole arena.
    pub unsafe fn spans_arena(&self, block: *mut BlockHeader) -> bool {
        (*block).prev_size == 0 && (*block).is_last()
    }

    /// Walk every arena checking the block chains. Returns the first
    /// inconsistency found.
    pub unsafe fn validate(&self) -> Result<(), (CorruptionKind, usize)> {
        let mut arena = self.arenas;
        while !arena.is_null() {
            if (*arena).magic != ARENA_MAGIC {
                return Err((CorruptionKind::BadArenaHeader, arena as usize));
            }
            let base = arena as usize;
            let end = base + (*arena).size;
            let mut cursor = (base + arena_first_block_offset()) as *mut BlockHeader;
            let mut prev_size = 0u32;
            loop {
                let addr = cursor as usize;
                if addr + HEADER_SIZE > end {
                    return Err((CorruptionKind::SizeMismatch, addr));
                }
                if (*cursor).magic != BLOCK_MAGIC {
                    return Err((CorruptionKind::BadBlockHeader, addr));
                }
                if (*cursor).prev_size != prev_size {
                    return Err((CorruptionKind::SizeMismatch, addr));
                }
                let size = (*cursor).size as usize;
                if size < MIN_BLOCK || size % BLOCK_ALIGN != 0 || addr + size > end {
                    return Err((CorruptionKind::SizeMismatch, addr));
                }
                if (*cursor).is_last() {
                    if addr + size != end {
                        return Err((CorruptionKind::SizeMismatch, addr));
                    }
                    break;
                }
                prev_size = (*cursor).size;
                cursor = (addr + size) as *mut BlockHeader;
            }
            arena = (*arena).next;
        }

        // The free list must only hold unused blocks with intact headers.
        let mut cursor = self.free_head;
        while !cursor.is_null() {
            if (*cursor).magic != BLOCK_MAGIC || (*cursor).is_used() {
                return Err((CorruptionKind::BadFreeList, cursor as usize));
            }
            cursor = (*(*cursor).links()).next;
        }
        Ok(())
    }
}
