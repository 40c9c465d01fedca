//! The image-parser boundary.
//!
//! The loader does not decode executable files; an external parser does,
//! reached through [`ImageParser`]. The loader hands it file access
//! ([`ImageFile`]) and a symbol scope, and gets back plain data: segment
//! geometry, the TLS template, dependency names, init/fini addresses. The
//! parser also owns relocation and lazy-binding patching, since both need
//! format knowledge.

use alloc::string::String;
use alloc::vec::Vec;

use crate::error::{Error, Result};
use crate::platform;
use crate::platform::pal::{FileIdent, Seek};

bitflags::bitflags! {
    /// Protection requested by a segment.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SegmentProt: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

/// One loadable segment, in link-time terms.
#[derive(Clone, Debug)]
pub struct SegmentDescriptor {
    /// Link-time virtual address.
    pub vaddr: usize,
    pub mem_size: usize,
    pub file_offset: usize,
    pub file_size: usize,
    pub prot: SegmentProt,
}

/// TLS geometry of an image, in link-time terms.
#[derive(Clone, Copy, Debug)]
pub struct TlsTemplate {
    /// Link-time address of the initialization image.
    pub image_vaddr: usize,
    /// Bytes backed by the file; the remainder is zero.
    pub file_size: usize,
    /// Total per-thread bytes.
    pub mem_size: usize,
    pub align: usize,
}

/// Everything the loader needs to place one image.
#[derive(Clone, Debug, Default)]
pub struct ImageInfo {
    pub preferred_base: usize,
    /// Reservation span, from `preferred_base`.
    pub image_size: usize,
    pub segments: Vec<SegmentDescriptor>,
    /// Import list, in link order.
    pub needed: Vec<String>,
    pub tls: Option<TlsTemplate>,
    /// Link-time address of the lazy-binding anchor slot, if the image has
    /// a linkage table.
    pub lazy_anchor: Option<usize>,
    /// Number of lazy-binding entries.
    pub lazy_entries: usize,
}

impl Default for TlsTemplate {
    fn default() -> Self {
        Self {
            image_vaddr: 0,
            file_size: 0,
            mem_size: 0,
            align: 1,
        }
    }
}

/// Pre-init/init/fini addresses, absolute after mapping.
#[derive(Clone, Debug, Default)]
pub struct StaticFunctions {
    pub preinit_array: Vec<usize>,
    pub init: Option<usize>,
    pub init_array: Vec<usize>,
    pub fini: Option<usize>,
    pub fini_array: Vec<usize>,
}

/// A parsed image placed in memory: base plus its geometry.
#[derive(Clone, Copy)]
pub struct MappedImage<'a> {
    pub base: usize,
    pub info: &'a ImageInfo,
}

impl<'a> MappedImage<'a> {
    /// Rebase delta the parser applies during relocation.
    pub fn delta(&self) -> usize {
        self.base.wrapping_sub(self.info.preferred_base)
    }

    /// Runtime address of a link-time one.
    pub fn rebase(&self, vaddr: usize) -> usize {
        vaddr.wrapping_add(self.delta())
    }

    pub fn covers(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.info.image_size
    }
}

/// Symbol resolution scope the loader provides during relocation and lazy
/// binding: global lookup across the image list, leaves first.
pub trait SymbolScope {
    fn resolve(&self, name: &str) -> Option<usize>;
}

pub trait ImageParser: Sync {
    /// Decode an on-disk image through the provided file services.
    fn parse_file(&self, file: &mut ImageFile) -> Result<ImageInfo>;

    /// Describe an image the kernel already placed in memory (process
    /// start). `preferred_base` of the result equals `base`.
    fn parse_loaded(&self, base: usize) -> Result<ImageInfo>;

    /// Init/fini addresses of a mapped image, already rebased.
    fn static_functions(&self, image: &MappedImage<'_>) -> Result<StaticFunctions>;

    /// Entry point of a mapped image, when it has one.
    fn entry_point(&self, image: &MappedImage<'_>) -> Option<usize>;

    /// Apply relocations. The image is mapped readable and writable; the
    /// loader finalizes protections afterwards.
    fn relocate(&self, image: &MappedImage<'_>, scope: &dyn SymbolScope) -> Result<()>;

    /// Resolve one lazy-binding entry, patching the linkage table so later
    /// calls bypass the loader. Returns the target address.
    fn resolve_lazy(
        &self,
        image: &MappedImage<'_>,
        index: usize,
        scope: &dyn SymbolScope,
    ) -> Result<usize>;

    /// Look up an exported symbol in one image.
    fn lookup(&self, image: &MappedImage<'_>, name: &str) -> Option<usize>;

    /// Name of the colon-separated library search path variable; fixed by
    /// the parser, overridable by `--library-path` in interpreter mode.
    fn library_path_variable(&self) -> &'static str {
        "LD_LIBRARY_PATH"
    }
}

/// File services the loader lends to the parser: open by path, positioned
/// reads, identity. Closes on drop.
pub struct ImageFile {
    pub path: String,
    pub fd: i32,
}

impl ImageFile {
    pub fn open(path: &str) -> Result<Self> {
        let fd = platform::kernel().open(path)?;
        Ok(Self {
            path: String::from(path),
            fd,
        })
    }

    pub fn ident(&self) -> Result<FileIdent> {
        platform::kernel().stat(self.fd)
    }

    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let kernel = platform::kernel();
        kernel.seek(self.fd, offset as i64, Seek::Set)?;
        kernel.read(self.fd, buf)
    }

    /// Load the whole file into a buffer.
    pub fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let ident = self.ident()?;
        let mut buf = alloc::vec![0u8; ident.size as usize];
        let n = self.read_at(0, &mut buf)?;
        if n != buf.len() {
            return Err(Error::EndOfFile);
        }
        Ok(buf)
    }
}

impl Drop for ImageFile {
    fn drop(&mut self) {
        let _ = platform::kernel().close(self.fd);
    }
}
