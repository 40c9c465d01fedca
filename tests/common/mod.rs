//! Shared fixtures: the fake image parser and image builders.
//!
//! Images here are synthetic: a flat file of bytes, one read-write
//! segment spanning the whole image, optional TLS init data at a fixed
//! offset, an optional lazy-binding table. The parser hands the loader
//! link-time geometry exactly the way a real format decoder would, and
//! records every relocation and lazy resolution for assertions.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use basert::error::{Error, Result};
use basert::ld_so::parser::{
    ImageFile, ImageInfo, ImageParser, MappedImage, SegmentDescriptor, SegmentProt,
    StaticFunctions, SymbolScope, TlsTemplate,
};
use basert::platform::host::{self, HostKernel};

/// File offset where TLS init data lives inside a synthetic image.
pub const TLS_DATA_OFFSET: usize = 0x100;
/// File offset of the lazy-binding table.
pub const LAZY_TABLE_OFFSET: usize = 0x200;

pub struct TestImage {
    pub info: ImageInfo,
    pub symbols: HashMap<String, usize>,
    pub statics: StaticFunctions,
    pub entry: Option<usize>,
    pub lazy_targets: Vec<usize>,
}

#[derive(Default)]
pub struct FakeParser {
    by_path: Mutex<HashMap<String, String>>,
    by_pref: Mutex<HashMap<usize, String>>,
    images: Mutex<HashMap<String, TestImage>>,
    pub relocations: Mutex<Vec<String>>,
    pub resolved: Mutex<Vec<(String, usize)>>,
}

impl FakeParser {
    pub fn register(&self, key: &str, path: &str, image: TestImage) {
        self.by_path
            .lock()
            .unwrap()
            .insert(path.to_string(), key.to_string());
        self.by_pref
            .lock()
            .unwrap()
            .insert(image.info.preferred_base, key.to_string());
        self.images.lock().unwrap().insert(key.to_string(), image);
    }

    fn key_of(&self, image: &MappedImage<'_>) -> Result<String> {
        self.by_pref
            .lock()
            .unwrap()
            .get(&image.info.preferred_base)
            .cloned()
            .ok_or(Error::UnexpectedType)
    }

    pub fn relocation_log(&self) -> Vec<String> {
        self.relocations.lock().unwrap().clone()
    }

    pub fn resolved_entries(&self, key: &str) -> Vec<usize> {
        self.resolved
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, index)| *index)
            .collect()
    }
}

impl ImageParser for FakeParser {
    fn parse_file(&self, file: &mut ImageFile) -> Result<ImageInfo> {
        let keys = self.by_path.lock().unwrap();
        let key = keys.get(&file.path).ok_or(Error::UnexpectedType)?;
        let images = self.images.lock().unwrap();
        Ok(images[key].info.clone())
    }

    fn parse_loaded(&self, base: usize) -> Result<ImageInfo> {
        let prefs = self.by_pref.lock().unwrap();
        let key = prefs.get(&base).ok_or(Error::UnexpectedType)?;
        let images = self.images.lock().unwrap();
        Ok(images[key].info.clone())
    }

    fn static_functions(&self, image: &MappedImage<'_>) -> Result<StaticFunctions> {
        let key = self.key_of(image)?;
        let images = self.images.lock().unwrap();
        Ok(images[&key].statics.clone())
    }

    fn entry_point(&self, image: &MappedImage<'_>) -> Option<usize> {
        let key = self.key_of(image).ok()?;
        let images = self.images.lock().unwrap();
        images[&key].entry
    }

    fn relocate(&self, image: &MappedImage<'_>, _scope: &dyn SymbolScope) -> Result<()> {
        let key = self.key_of(image)?;
        self.relocations.lock().unwrap().push(key);
        Ok(())
    }

    fn resolve_lazy(
        &self,
        image: &MappedImage<'_>,
        index: usize,
        _scope: &dyn SymbolScope,
    ) -> Result<usize> {
        let key = self.key_of(image)?;
        let target = {
            let images = self.images.lock().unwrap();
            *images[&key]
                .lazy_targets
                .get(index)
                .ok_or(Error::InvalidParameter)?
        };
        // Patch the linkage table so later calls bypass the loader.
        if let Some(anchor) = image.info.lazy_anchor {
            let slot = image.rebase(anchor) + index * core::mem::size_of::<usize>();
            unsafe { (slot as *mut usize).write(target) };
        }
        self.resolved.lock().unwrap().push((key, index));
        Ok(target)
    }

    fn lookup(&self, image: &MappedImage<'_>, name: &str) -> Option<usize> {
        let key = self.key_of(image).ok()?;
        let images = self.images.lock().unwrap();
        images[&key].symbols.get(name).copied()
    }
}

static NEXT_PREFERRED: AtomicUsize = AtomicUsize::new(0x0100_0000);

pub struct ImageBuilder {
    key: String,
    path: String,
    size: usize,
    needed: Vec<String>,
    tls: Option<(Vec<u8>, usize, usize)>,
    symbols: Vec<(String, usize)>,
    statics: StaticFunctions,
    entry: Option<usize>,
    lazy_targets: Vec<usize>,
    preferred_base: Option<usize>,
}

impl ImageBuilder {
    pub fn new(key: &str, path: &str) -> Self {
        Self {
            key: key.to_string(),
            path: path.to_string(),
            size: 0x1000,
            needed: Vec::new(),
            tls: None,
            symbols: Vec::new(),
            statics: StaticFunctions::default(),
            entry: None,
            lazy_targets: Vec::new(),
            preferred_base: None,
        }
    }

    pub fn needs(mut self, name: &str) -> Self {
        self.needed.push(name.to_string());
        self
    }

    /// TLS block whose first word initializes to `value`.
    pub fn tls_u32(mut self, value: u32, mem_size: usize) -> Self {
        self.tls = Some((value.to_ne_bytes().to_vec(), mem_size, 16));
        self
    }

    pub fn symbol(mut self, name: &str, addr: usize) -> Self {
        self.symbols.push((name.to_string(), addr));
        self
    }

    pub fn init_array(mut self, fns: &[usize]) -> Self {
        self.statics.init_array = fns.to_vec();
        self
    }

    pub fn fini_array(mut self, fns: &[usize]) -> Self {
        self.statics.fini_array = fns.to_vec();
        self
    }

    pub fn preinit_array(mut self, fns: &[usize]) -> Self {
        self.statics.preinit_array = fns.to_vec();
        self
    }

    pub fn entry(mut self, addr: usize) -> Self {
        self.entry = Some(addr);
        self
    }

    pub fn lazy(mut self, targets: &[usize]) -> Self {
        self.lazy_targets = targets.to_vec();
        self
    }

    /// Fix the preferred base (for preloaded images it must equal the
    /// actual base).
    pub fn at_base(mut self, base: usize) -> Self {
        self.preferred_base = Some(base);
        self
    }

    /// Serialize the file, hand it to the host, register with the parser.
    pub fn install(self, host: &HostKernel, parser: &FakeParser) -> usize {
        let preferred = self.preferred_base.unwrap_or_else(|| {
            NEXT_PREFERRED.fetch_add(0x0010_0000, Ordering::Relaxed)
        });

        let mut data = vec![0u8; self.size];
        // Recognizable payload so zero-fill bugs show up.
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        let tls = self.tls.map(|(init, mem_size, align)| {
            data[TLS_DATA_OFFSET..TLS_DATA_OFFSET + init.len()].copy_from_slice(&init);
            // The rest of the template's file portion is zero.
            let file_size = init.len();
            TlsTemplate {
                image_vaddr: preferred + TLS_DATA_OFFSET,
                file_size,
                mem_size,
                align,
            }
        });
        let lazy_anchor = if self.lazy_targets.is_empty() {
            None
        } else {
            for b in data
                .iter_mut()
                .skip(LAZY_TABLE_OFFSET)
                .take(self.lazy_targets.len() * core::mem::size_of::<usize>())
            {
                *b = 0;
            }
            Some(preferred + LAZY_TABLE_OFFSET)
        };

        let info = ImageInfo {
            preferred_base: preferred,
            image_size: self.size,
            segments: vec![SegmentDescriptor {
                vaddr: preferred,
                mem_size: self.size,
                file_offset: 0,
                file_size: self.size,
                prot: SegmentProt::READ | SegmentProt::WRITE,
            }],
            needed: self.needed,
            tls,
            lazy_anchor,
            lazy_entries: self.lazy_targets.len(),
        };

        host.put_file(&self.path, data);
        parser.register(
            &self.key,
            &self.path,
            TestImage {
                info,
                symbols: self.symbols.into_iter().collect(),
                statics: self.statics,
                entry: self.entry,
                lazy_targets: self.lazy_targets,
            },
        );
        preferred
    }
}

/// Install the host kernel and the process-wide parser; every test binary
/// starts here. One parser per process, because the loader binds to the
/// first one it is initialized with.
pub fn setup() -> (&'static HostKernel, &'static FakeParser) {
    static PARSER: std::sync::OnceLock<&'static FakeParser> = std::sync::OnceLock::new();
    let host = host::install();
    let parser = *PARSER.get_or_init(|| Box::leak(Box::new(FakeParser::default())));
    (host, parser)
}

/// Host, parser, loader state and heap, ready for load_library calls.
pub fn setup_loader(library_path: &str) -> (&'static HostKernel, &'static FakeParser) {
    let (host, parser) = setup();
    basert::ld_so::init(parser, library_path, false);
    basert::heap::init(basert::heap::HeapConfig::default());
    (host, parser)
}
