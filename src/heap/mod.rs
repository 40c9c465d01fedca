//! The process heap.
//!
//! A pool allocator over arenas obtained from a [`backing::HeapBacking`].
//! Small requests come off a first-fit free list with boundary-tag
//! coalescing; requests at or above the direct threshold get their own
//! mapping. Every allocation carries a four-byte tag for crash forensics.
//! One mutex serializes every externally visible operation. Corruption
//! routes through the backing's reporter and poisons the heap; the only
//! recovery is process exit.

pub mod backing;
pub mod config;
mod freelist;
mod large;

pub use self::backing::{
    CorruptionKind, HeapBacking, KernelBacking, KERNEL_BACKING, SIGNAL_ABORT,
};
pub use self::config::{DIRECT_THRESHOLD, MIN_EXPAND_PAGES};

use core::ptr::NonNull;

use spin::Once;

use self::config::{align_up, BLOCK_ALIGN, BLOCK_MAGIC, HEADER_SIZE, MIN_BLOCK};
use self::freelist::{header_of, ArenaList, BlockHeader, FLAG_USED};
use self::large::{direct_overhead, DirectList};
use crate::error::{Error, Result};
use crate::sync::Mutex;

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct HeapOptions: u32 {
        /// Arenas go back to the backing whole or not at all.
        const REJECT_PARTIAL_ARENA_FREE = 1 << 0;
    }
}

#[derive(Clone, Copy, Debug)]
pub struct HeapConfig {
    pub page_size: usize,
    pub min_expand_pages: usize,
    pub direct_threshold: usize,
    pub options: HeapOptions,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            min_expand_pages: MIN_EXPAND_PAGES,
            direct_threshold: DIRECT_THRESHOLD,
            options: HeapOptions::REJECT_PARTIAL_ARENA_FREE,
        }
    }
}

/// Counters kept under the heap lock.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub mapped_bytes: usize,
    pub live_bytes: usize,
    pub free_bytes: usize,
    pub peak_live_bytes: usize,
    pub total_allocs: u64,
    pub total_frees: u64,
    pub arena_count: usize,
    pub direct_count: usize,
}

/// Marker word identifying an alignment stub; the high half can never be a
/// valid flags field, so it cannot collide with a block header.
const STUB_WORD: usize = usize::MAX ^ (BLOCK_MAGIC as usize);

struct HeapInner {
    arenas: ArenaList,
    directs: DirectList,
    stats: HeapStats,
    poisoned: bool,
    config: HeapConfig,
}

enum Owner {
    Arena(*mut BlockHeader),
    Direct(*mut large::DirectHeader),
}

pub struct Heap {
    inner: Mutex<HeapInner>,
    backing: &'static dyn HeapBacking,
}

impl Heap {
    pub fn new(backing: &'static dyn HeapBacking, mut config: HeapConfig) -> Self {
        // Whole-arena return is the only supported shrink policy.
        config
            .options
            .insert(HeapOptions::REJECT_PARTIAL_ARENA_FREE);
        Self {
            inner: Mutex::new(HeapInner {
                arenas: ArenaList::new(),
                directs: DirectList::new(),
                stats: HeapStats::default(),
                poisoned: false,
                config,
            }),
            backing,
        }
    }

    /// Allocate `size` bytes tagged `tag`. Zero-size requests return a
    /// distinct minimal allocation. NULL only on exhaustion or poisoning.
    pub fn allocate(&self, size: usize, tag: u32) -> Option<NonNull<u8>> {
        let mut inner = self.inner.lock();
        if inner.poisoned {
            return None;
        }
        if size >= inner.config.direct_threshold {
            return unsafe { self.allocate_direct(&mut inner, size, BLOCK_ALIGN, tag) };
        }
        unsafe { self.allocate_block(&mut inner, size, tag) }
    }

    /// Allocate with payload alignment `alignment` (a power of two).
    pub fn aligned_allocate(
        &self,
        alignment: usize,
        size: usize,
        tag: u32,
    ) -> Option<NonNull<u8>> {
        if alignment <= BLOCK_ALIGN {
            return self.allocate(size, tag);
        }
        if !alignment.is_power_of_two() {
            return None;
        }
        let padded = size.checked_add(alignment)?.checked_add(HEADER_SIZE)?;
        let mut inner = self.inner.lock();
        if inner.poisoned {
            return None;
        }
        if padded >= inner.config.direct_threshold {
            return unsafe { self.allocate_direct(&mut inner, size, alignment, tag) };
        }
        unsafe {
            let raw = self.allocate_block(&mut inner, padded, tag)?;
            let aligned = align_up(raw.as_ptr() as usize + HEADER_SIZE, alignment);
            let stub = (aligned - HEADER_SIZE) as *mut usize;
            stub.write(header_of(raw.as_ptr()) as usize);
            stub.add(1).write(STUB_WORD);
            NonNull::new(aligned as *mut u8)
        }
    }

    /// Release an allocation. Unknown pointers report corruption and fail.
    pub unsafe fn free(&self, ptr: *mut u8) -> Result<()> {
        if ptr.is_null() {
            return Err(Error::InvalidParameter);
        }
        let mut inner = self.inner.lock();
        if inner.poisoned {
            return Err(Error::InvalidHandle);
        }
        match self.resolve(&mut inner, ptr) {
            Some(Owner::Direct(header)) => {
                self.free_direct(&mut inner, header);
                Ok(())
            }
            Some(Owner::Arena(block)) => self.free_block(&mut inner, block),
            None => {
                self.report(&mut inner, CorruptionKind::BadBlockHeader, Some(ptr));
                Err(Error::InvalidHandle)
            }
        }
    }

    /// Resize an allocation, preserving contents up to the smaller size.
    pub unsafe fn reallocate(
        &self,
        ptr: *mut u8,
        new_size: usize,
        tag: u32,
    ) -> Option<NonNull<u8>> {
        if ptr.is_null() {
            return self.allocate(new_size, tag);
        }
        let old_usable = {
            let mut inner = self.inner.lock();
            if inner.poisoned {
                return None;
            }
            match self.resolve(&mut inner, ptr) {
                Some(Owner::Direct(header)) => {
                    let base = header as usize;
                    let usable = base + (*header).map_size - ptr as usize;
                    if new_size <= usable && new_size >= inner.config.direct_threshold {
                        inner.stats.live_bytes =
                            inner.stats.live_bytes - (*header).size + new_size;
                        (*header).size = new_size;
                        (*header).tag = tag;
                        return NonNull::new(ptr);
                    }
                    (*header).size
                }
                Some(Owner::Arena(block)) => {
                    let usable = block as usize + (*block).size as usize - ptr as usize;
                    if new_size <= usable && new_size < inner.config.direct_threshold {
                        (*block).tag = tag;
                        return NonNull::new(ptr);
                    }
                    usable
                }
                None => {
                    self.report(&mut inner, CorruptionKind::BadBlockHeader, Some(ptr));
                    return None;
                }
            }
        };

        let new = self.allocate(new_size, tag)?;
        core::ptr::copy_nonoverlapping(ptr, new.as_ptr(), old_usable.min(new_size));
        let _ = self.free(ptr);
        Some(new)
    }

    /// Walk all bookkeeping; report and poison on the first inconsistency.
    pub fn validate(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.poisoned {
            return Err(Error::InvalidHandle);
        }
        if let Err((kind, addr)) = unsafe { inner.arenas.validate() } {
            self.report(&mut inner, kind, Some(addr as *mut u8));
            return Err(Error::InvalidHandle);
        }
        if let Err(addr) = unsafe { inner.directs.validate() } {
            self.report(&mut inner, CorruptionKind::BadDirectHeader, Some(addr as *mut u8));
            return Err(Error::InvalidHandle);
        }
        Ok(())
    }

    pub fn stats(&self) -> HeapStats {
        self.inner.lock().stats
    }

    /// Allocation tag recorded for a live payload, for diagnostics.
    pub unsafe fn tag_of(&self, ptr: *mut u8) -> Option<u32> {
        let mut inner = self.inner.lock();
        match self.resolve(&mut inner, ptr)? {
            Owner::Direct(header) => Some((*header).tag),
            Owner::Arena(block) => Some((*block).tag),
        }
    }

    unsafe fn allocate_block(
        &self,
        inner: &mut HeapInner,
        size: usize,
        tag: u32,
    ) -> Option<NonNull<u8>> {
        let req = size.max(1);
        let block_size = align_up(req.checked_add(HEADER_SIZE)?, BLOCK_ALIGN).max(MIN_BLOCK);
        if block_size > u32::MAX as usize {
            // The block header carries sizes in 32 bits; anything this big
            // belongs on the direct path.
            return None;
        }

        let block = match inner.arenas.find_fit(block_size) {
            Some(block) => block,
            None => self.expand_arena(inner, block_size)?,
        };

        inner.arenas.remove_free(block);
        inner.stats.free_bytes -= (*block).payload_size();

        let before = (*block).size as usize;
        inner.arenas.split(block, block_size);
        let after = (*block).size as usize;
        if after != before {
            inner.stats.free_bytes += before - after - HEADER_SIZE;
        }

        (*block).flags |= FLAG_USED;
        (*block).tag = tag;
        inner.stats.live_bytes += (*block).payload_size();
        inner.stats.total_allocs += 1;
        if inner.stats.live_bytes > inner.stats.peak_live_bytes {
            inner.stats.peak_live_bytes = inner.stats.live_bytes;
        }
        NonNull::new((*block).payload())
    }

    unsafe fn expand_arena(
        &self,
        inner: &mut HeapInner,
        block_size: usize,
    ) -> Option<*mut BlockHeader> {
        let overhead = freelist::arena_first_block_offset();
        let needed = block_size.checked_add(overhead)?;
        let floor = inner.config.min_expand_pages * inner.config.page_size;
        let arena_size = align_up(needed, inner.config.page_size).max(floor);
        let base = self.backing.expand(arena_size)?;
        let block = inner.arenas.adopt(base.as_ptr(), arena_size);
        inner.stats.mapped_bytes += arena_size;
        inner.stats.free_bytes += (*block).payload_size();
        inner.stats.arena_count += 1;
        Some(block)
    }

    unsafe fn free_block(&self, inner: &mut HeapInner, block: *mut BlockHeader) -> Result<()> {
        if (*block).magic != BLOCK_MAGIC || !(*block).is_used() {
            self.report(
                &mut *inner,
                CorruptionKind::BadBlockHeader,
                Some(block as *mut u8),
            );
            return Err(Error::InvalidHandle);
        }
        inner.stats.live_bytes -= (*block).payload_size();
        inner.stats.total_frees += 1;
        (*block).flags &= !FLAG_USED;

        let (merged, absorbed) = match inner.arenas.coalesce(block) {
            Ok(pair) => pair,
            Err(kind) => {
                self.report(&mut *inner, kind, Some(block as *mut u8));
                return Err(Error::InvalidHandle);
            }
        };
        inner.stats.free_bytes -= absorbed;

        if inner.arenas.spans_arena(merged) {
            let Some(arena) = inner.arenas.arena_of(merged) else {
                self.report(
                    &mut *inner,
                    CorruptionKind::BadArenaHeader,
                    Some(merged as *mut u8),
                );
                return Err(Error::InvalidHandle);
            };
            let size = (*arena).size;
            inner.arenas.unlink_arena(arena);
            if self
                .backing
                .contract(NonNull::new_unchecked(arena as *mut u8), size)
            {
                inner.stats.mapped_bytes -= size;
                inner.stats.arena_count -= 1;
                return Ok(());
            }
            // Failed shrink: keep the arena and carry on.
            inner.arenas.adopt(arena as *mut u8, size);
            inner.stats.free_bytes += size - freelist::arena_first_block_offset() - HEADER_SIZE;
            return Ok(());
        }

        inner.stats.free_bytes += (*merged).payload_size();
        inner.arenas.insert_free(merged);
        Ok(())
    }

    unsafe fn allocate_direct(
        &self,
        inner: &mut HeapInner,
        size: usize,
        align: usize,
        tag: u32,
    ) -> Option<NonNull<u8>> {
        let map_size = align_up(
            direct_overhead(align).checked_add(size)?,
            inner.config.page_size,
        );
        let base = self.backing.expand(map_size)?;
        let payload = inner.directs.adopt(base.as_ptr(), map_size, size, align, tag);
        inner.stats.mapped_bytes += map_size;
        inner.stats.live_bytes += size;
        inner.stats.total_allocs += 1;
        inner.stats.direct_count += 1;
        if inner.stats.live_bytes > inner.stats.peak_live_bytes {
            inner.stats.peak_live_bytes = inner.stats.live_bytes;
        }
        NonNull::new(payload)
    }

    unsafe fn free_direct(&self, inner: &mut HeapInner, header: *mut large::DirectHeader) {
        let map_size = (*header).map_size;
        let size = (*header).size;
        inner.directs.unlink(header);
        inner.stats.live_bytes -= size;
        inner.stats.total_frees += 1;
        inner.stats.direct_count -= 1;
        if self
            .backing
            .contract(NonNull::new_unchecked(header as *mut u8), map_size)
        {
            inner.stats.mapped_bytes -= map_size;
        }
    }

    /// Classify a payload pointer: direct mapping, alignment stub, or plain
    /// block. `None` when nothing sane owns it.
    unsafe fn resolve(&self, inner: &mut HeapInner, ptr: *mut u8) -> Option<Owner> {
        if let Some(direct) = inner.directs.find(ptr) {
            return Some(Owner::Direct(direct));
        }
        let marker = (ptr as usize - HEADER_SIZE + core::mem::size_of::<usize>()) as *const usize;
        if marker.read() == STUB_WORD {
            let real = ((ptr as usize - HEADER_SIZE) as *const usize).read() as *mut BlockHeader;
            if (*real).magic == BLOCK_MAGIC && (*real).is_used() {
                return Some(Owner::Arena(real));
            }
            return None;
        }
        let block = header_of(ptr);
        if (*block).magic == BLOCK_MAGIC && (*block).is_used() {
            return Some(Owner::Arena(block));
        }
        None
    }

    fn report(&self, inner: &mut HeapInner, kind: CorruptionKind, area: Option<*mut u8>) {
        inner.poisoned = true;
        self.backing.corruption(kind, area.and_then(NonNull::new));
    }
}

static HEAP: Once<Heap> = Once::new();

/// Install the process heap over the kernel backing. First caller wins.
pub fn init(config: HeapConfig) -> &'static Heap {
    HEAP.call_once(|| Heap::new(&KERNEL_BACKING, config))
}

/// The process heap.
pub fn global() -> &'static Heap {
    HEAP.get().expect("heap used before runtime init")
}

pub fn try_global() -> Option<&'static Heap> {
    HEAP.get()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{alloc_zeroed, dealloc, Layout};
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    /// Backing over the host allocator, with corruption capture.
    struct TestBacking {
        maps: StdMutex<HashMap<usize, Layout>>,
        corruptions: StdMutex<Vec<CorruptionKind>>,
        fail_expand: StdMutex<bool>,
    }

    impl TestBacking {
        fn new() -> &'static Self {
            Box::leak(Box::new(Self {
                maps: StdMutex::new(HashMap::new()),
                corruptions: StdMutex::new(Vec::new()),
                fail_expand: StdMutex::new(false),
            }))
        }
    }

    impl HeapBacking for TestBacking {
        fn expand(&self, size: usize) -> Option<NonNull<u8>> {
            if *self.fail_expand.lock().unwrap() {
                return None;
            }
            let layout = Layout::from_size_align(size, 4096).ok()?;
            let base = unsafe { alloc_zeroed(layout) };
            let base = NonNull::new(base)?;
            self.maps.lock().unwrap().insert(base.as_ptr() as usize, layout);
            Some(base)
        }

        fn contract(&self, base: NonNull<u8>, _size: usize) -> bool {
            match self.maps.lock().unwrap().remove(&(base.as_ptr() as usize)) {
                Some(layout) => {
                    unsafe { dealloc(base.as_ptr(), layout) };
                    true
                }
                None => false,
            }
        }

        fn corruption(&self, kind: CorruptionKind, _area: Option<NonNull<u8>>) {
            self.corruptions.lock().unwrap().push(kind);
        }
    }

    fn test_heap(page_size: usize) -> (&'static Heap, &'static TestBacking) {
        let backing = TestBacking::new();
        let heap = Box::leak(Box::new(Heap::new(
            backing,
            HeapConfig {
                page_size,
                ..Default::default()
            },
        )));
        (heap, backing)
    }

    #[test]
    fn allocate_then_free_restores_free_bytes() {
        let (heap, _) = test_heap(4096);
        // Prime an arena so the law is observed within one mapping.
        let keep = heap.allocate(64, 0x4b454550).unwrap();
        let before = heap.stats();
        let p = heap.allocate(1000, 0x54455354).unwrap();
        unsafe { heap.free(p.as_ptr()).unwrap() };
        let after = heap.stats();
        assert_eq!(before.free_bytes, after.free_bytes);
        assert_eq!(before.mapped_bytes, after.mapped_bytes);
        unsafe { heap.free(keep.as_ptr()).unwrap() };
    }

    #[test]
    fn disjoint_allocations() {
        let (heap, _) = test_heap(4096);
        let a = heap.allocate(100, 1).unwrap().as_ptr() as usize;
        let b = heap.allocate(100, 2).unwrap().as_ptr() as usize;
        let c = heap.allocate(100, 3).unwrap().as_ptr() as usize;
        let mut spans = [(a, 100), (b, 100), (c, 100)];
        spans.sort();
        assert!(spans[0].0 + spans[0].1 <= spans[1].0);
        assert!(spans[1].0 + spans[1].1 <= spans[2].0);
    }

    #[test]
    fn zero_size_is_stable_and_distinct() {
        let (heap, _) = test_heap(4096);
        let a = heap.allocate(0, 0).unwrap();
        let b = heap.allocate(0, 0).unwrap();
        assert_ne!(a.as_ptr(), b.as_ptr());
        unsafe {
            heap.free(a.as_ptr()).unwrap();
            heap.free(b.as_ptr()).unwrap();
        }
    }

    #[test]
    fn aligned_allocate_honors_alignment() {
        let (heap, _) = test_heap(4096);
        for align in [32usize, 64, 256, 4096] {
            let p = heap.aligned_allocate(align, 200, 0x414c4e31).unwrap();
            assert_eq!(p.as_ptr() as usize % align, 0);
            unsafe { heap.free(p.as_ptr()).unwrap() };
        }
        heap.validate().unwrap();
    }

    #[test]
    fn tags_are_recorded() {
        let (heap, _) = test_heap(4096);
        let p = heap.allocate(128, 0x41414141).unwrap();
        assert_eq!(unsafe { heap.tag_of(p.as_ptr()) }, Some(0x41414141));
        unsafe { heap.free(p.as_ptr()).unwrap() };
    }

    #[test]
    fn arena_contract_returns_mapping() {
        let (heap, _) = test_heap(4096);
        let p = heap.allocate(1024 * 1024, 0x41414141).unwrap();
        assert!(heap.stats().mapped_bytes >= 1024 * 1024);
        unsafe { heap.free(p.as_ptr()).unwrap() };
        assert_eq!(heap.stats().mapped_bytes, 0);
        assert_eq!(heap.stats().arena_count, 0);
    }

    #[test]
    fn failed_expand_returns_null() {
        let (heap, backing) = test_heap(4096);
        *backing.fail_expand.lock().unwrap() = true;
        assert!(heap.allocate(64, 0).is_none());
    }

    #[test]
    fn reallocate_preserves_contents() {
        let (heap, _) = test_heap(4096);
        let p = heap.allocate(64, 7).unwrap();
        unsafe {
            for i in 0..64 {
                p.as_ptr().add(i).write(i as u8);
            }
            let q = heap.reallocate(p.as_ptr(), 4096, 7).unwrap();
            for i in 0..64 {
                assert_eq!(q.as_ptr().add(i).read(), i as u8);
            }
            heap.free(q.as_ptr()).unwrap();
        }
    }

    #[test]
    fn corruption_poisons_the_heap() {
        let (heap, backing) = test_heap(4096);
        let p = heap.allocate(64, 0).unwrap();
        unsafe {
            // Smash the header magic.
            let header = header_of(p.as_ptr());
            (*header).magic = 0xdead;
            assert_eq!(heap.free(p.as_ptr()), Err(Error::InvalidHandle));
        }
        assert!(!backing.corruptions.lock().unwrap().is_empty());
        assert!(heap.allocate(64, 0).is_none());
    }

    #[test]
    fn validate_walks_clean_heap() {
        let (heap, _) = test_heap(4096);
        let mut ptrs = Vec::new();
        for i in 0..32 {
            ptrs.push(heap.allocate(24 * (i + 1), i as u32).unwrap());
        }
        heap.validate().unwrap();
        for p in ptrs {
            unsafe { heap.free(p.as_ptr()).unwrap() };
        }
        heap.validate().unwrap();
    }
}
