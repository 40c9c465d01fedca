//! The loaded-image entity.

use alloc::string::String;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::parser::{ImageInfo, MappedImage, StaticFunctions};
use crate::platform::pal::FileIdent;

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct LoadFlags: u32 {
        /// Loaded at runtime rather than at process start.
        const DLOPENED = 1 << 0;
        /// Participates in static TLS layout.
        const STATIC_TLS = 1 << 1;
        /// The primary executable.
        const PRIMARY = 1 << 2;
        /// Mapped by the kernel before the runtime ran; never unmapped.
        const PRELOADED = 1 << 3;
        /// Pre-resolve every lazy-binding entry at load.
        const BIND_NOW = 1 << 4;
        /// Map and record only; relocation and protection finalization
        /// happen later (interpreter mode renumbers modules first).
        const DEFER_RELOC = 1 << 5;
    }
}

/// Static-TLS offset not assigned yet.
pub const TLS_OFFSET_UNASSIGNED: usize = usize::MAX;

/// Per-image TLS descriptor. The static offset is assigned once, by the
/// first thread that lays out static TLS with this image present.
#[derive(Debug)]
pub struct TlsDescriptor {
    /// Runtime address of the initialization image.
    pub init_addr: usize,
    /// Bytes of init image; the rest of the block is zero-filled.
    pub init_size: usize,
    /// Total per-thread block size.
    pub mem_size: usize,
    pub align: usize,
    static_offset: AtomicUsize,
}

impl TlsDescriptor {
    pub fn new(init_addr: usize, init_size: usize, mem_size: usize, align: usize) -> Self {
        Self {
            init_addr,
            init_size,
            mem_size,
            align: align.max(1),
            static_offset: AtomicUsize::new(TLS_OFFSET_UNASSIGNED),
        }
    }

    pub fn static_offset(&self) -> Option<usize> {
        match self.static_offset.load(Ordering::Acquire) {
            TLS_OFFSET_UNASSIGNED => None,
            offset => Some(offset),
        }
    }

    /// One-shot assignment; the winning offset is returned either way.
    pub fn assign_static_offset(&self, offset: usize) -> usize {
        match self.static_offset.compare_exchange(
            TLS_OFFSET_UNASSIGNED,
            offset,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => offset,
            Err(existing) => existing,
        }
    }
}

/// One loaded image. Owned by the image list; queries hand out clones of
/// the `Arc` holding it.
#[derive(Debug)]
pub struct Image {
    pub name: String,
    pub path: String,
    pub ident: FileIdent,
    /// Reservation base; rebase delta is `base - info.preferred_base`.
    pub base: usize,
    pub reservation_size: usize,
    pub flags: LoadFlags,
    /// Parser-produced geometry, including the segment array.
    pub info: ImageInfo,
    pub statics: StaticFunctions,
    pub entry: Option<usize>,
    pub tls: Option<TlsDescriptor>,
    module_id: AtomicUsize,
    initialized: AtomicBool,
    refs: AtomicUsize,
}

impl Image {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        path: String,
        ident: FileIdent,
        base: usize,
        reservation_size: usize,
        flags: LoadFlags,
        info: ImageInfo,
        statics: StaticFunctions,
        entry: Option<usize>,
        tls: Option<TlsDescriptor>,
        module_id: usize,
    ) -> Self {
        Self {
            name,
            path,
            ident,
            base,
            reservation_size,
            flags,
            info,
            statics,
            entry,
            tls,
            module_id: AtomicUsize::new(module_id),
            initialized: AtomicBool::new(false),
            refs: AtomicUsize::new(1),
        }
    }

    pub fn module_id(&self) -> usize {
        self.module_id.load(Ordering::Acquire)
    }

    /// Interpreter-mode renumbering only; caller holds the image write
    /// lock.
    pub fn set_module_id(&self, id: usize) {
        self.module_id.store(id, Ordering::Release);
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
    }

    pub fn clear_initialized(&self) {
        self.initialized.store(false, Ordering::Release);
    }

    pub fn add_ref(&self) -> usize {
        self.refs.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn release_ref(&self) -> usize {
        self.refs.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    pub fn mapped(&self) -> MappedImage<'_> {
        MappedImage {
            base: self.base,
            info: &self.info,
        }
    }

    pub fn covers(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.reservation_size
    }
}
