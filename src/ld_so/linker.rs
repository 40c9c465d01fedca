//! The image list and the operations over it.
//!
//! The list is ordered leaves-first: dependencies load before their
//! dependents, so initializer order falls out of list order and finalizer
//! order out of its reverse. A global reader/writer lock guards the list;
//! mutations take it exclusively, queries take it shared, and user
//! callbacks (initializers, finalizers) always run with it released.

use alloc::format;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Once;

use crate::error::{Error, Result};
use crate::platform::{self, pal::FileIdent};
use crate::sync::rwlock::RwLock;

use super::debug;
use super::image::{Image, LoadFlags, TlsDescriptor};
use super::modules::ModuleBitmap;
use super::parser::{ImageFile, ImageParser, MappedImage, SymbolScope};
use super::segments::{self, Reservation};
use super::tcb;

pub const PATH_SEP: char = ':';

type InitFn = unsafe extern "C" fn();

unsafe fn call_image_fn(addr: usize) {
    let f: InitFn = core::mem::transmute(addr);
    f();
}

pub struct Linker {
    parser: &'static dyn ImageParser,
    images: Vec<Arc<Image>>,
    modules: ModuleBitmap,
    library_path: String,
    bind_now: bool,
    loader_base: usize,
}

/// Global symbol scope: the image list searched leaves-first.
struct ListScope<'a> {
    parser: &'static dyn ImageParser,
    images: &'a [Arc<Image>],
}

impl SymbolScope for ListScope<'_> {
    fn resolve(&self, name: &str) -> Option<usize> {
        for image in self.images {
            if let Some(addr) = self.parser.lookup(&image.mapped(), name) {
                return Some(addr);
            }
        }
        None
    }
}

impl Linker {
    pub fn new(parser: &'static dyn ImageParser, library_path: &str, bind_now: bool) -> Self {
        Self {
            parser,
            images: Vec::new(),
            modules: ModuleBitmap::new(),
            library_path: library_path.to_string(),
            bind_now,
            loader_base: 0,
        }
    }

    pub fn parser(&self) -> &'static dyn ImageParser {
        self.parser
    }

    pub fn images(&self) -> &[Arc<Image>] {
        &self.images
    }

    pub fn modules(&self) -> &ModuleBitmap {
        &self.modules
    }

    pub(crate) fn modules_mut(&mut self) -> &mut ModuleBitmap {
        &mut self.modules
    }

    pub fn loader_base(&self) -> usize {
        self.loader_base
    }

    pub fn library_path(&self) -> &str {
        &self.library_path
    }

    pub fn set_library_path(&mut self, path: &str) {
        self.library_path = path.to_string();
    }

    pub fn set_loader_base(&mut self, base: usize) {
        self.loader_base = base;
    }

    pub fn find_by_module(&self, module: usize) -> Option<Arc<Image>> {
        self.images
            .iter()
            .find(|image| image.module_id() == module)
            .cloned()
    }

    pub fn find_by_name(&self, name: &str) -> Option<Arc<Image>> {
        self.images
            .iter()
            .find(|image| image.name == name || image.path == name)
            .cloned()
    }

    fn find_by_ident(&self, ident: &FileIdent) -> Option<Arc<Image>> {
        self.images
            .iter()
            .find(|image| image.ident == *ident)
            .cloned()
    }

    pub fn find_by_address(&self, addr: usize) -> Option<Arc<Image>> {
        self.images.iter().find(|image| image.covers(addr)).cloned()
    }

    pub fn lookup_symbol(&self, name: &str) -> Option<usize> {
        ListScope {
            parser: self.parser,
            images: &self.images,
        }
        .resolve(name)
    }

    /// Adopt an image the kernel already mapped (process start). No file,
    /// no reservation of our own.
    pub fn adopt_loaded(&mut self, name: &str, base: usize, flags: LoadFlags) -> Result<Arc<Image>> {
        let info = self.parser.parse_loaded(base)?;
        let mapped = MappedImage { base, info: &info };
        let statics = self.parser.static_functions(&mapped)?;
        let entry = self.parser.entry_point(&mapped);
        let tls = info.tls.map(|template| {
            TlsDescriptor::new(
                mapped.rebase(template.image_vaddr),
                template.file_size,
                template.mem_size,
                template.align,
            )
        });
        let module = self.modules.allocate();
        let reservation_size = info.image_size;
        let image = Arc::new(Image::new(
            name.to_string(),
            name.to_string(),
            FileIdent::default(),
            base,
            reservation_size,
            flags | LoadFlags::PRELOADED,
            info,
            statics,
            entry,
            tls,
            module,
        ));
        self.images.push(image.clone());
        debug::notify_load(platform::kernel(), self.loader_base, &image);
        Ok(image)
    }

    /// Load `name` and everything it needs. Returns the image and the list
    /// of images actually loaded by this call, leaves-first.
    pub fn load_by_name(
        &mut self,
        name: &str,
        flags: LoadFlags,
    ) -> Result<(Arc<Image>, Vec<Arc<Image>>)> {
        let mut newly = Vec::new();
        match self.load_inner(name, flags, &mut newly) {
            Ok(image) => Ok((image, newly)),
            Err(err) => {
                self.rollback(newly);
                Err(err)
            }
        }
    }

    fn load_inner(
        &mut self,
        name: &str,
        flags: LoadFlags,
        newly: &mut Vec<Arc<Image>>,
    ) -> Result<Arc<Image>> {
        if let Some(existing) = self.find_by_name(name) {
            existing.add_ref();
            return Ok(existing);
        }

        let path = self.resolve_path(name)?;
        let mut file = ImageFile::open(&path)?;
        let ident = file.ident()?;
        if let Some(existing) = self.find_by_ident(&ident) {
            existing.add_ref();
            return Ok(existing);
        }

        log::trace!("load {}: {}", name, path);
        let info = self.parser.parse_file(&mut file)?;

        // Dependencies first, so the list stays leaves-first.
        for dep in info.needed.clone() {
            self.load_inner(&dep, flags & !LoadFlags::PRIMARY, newly)?;
        }

        let kernel = platform::kernel();
        let reservation = unsafe { segments::reserve_image(kernel, &file, &info)? };
        if let Err(err) = unsafe { segments::map_segments(kernel, &mut file, &info, reservation) }
        {
            unsafe { segments::release_reservation(kernel, reservation) };
            return Err(err);
        }

        let mapped = MappedImage {
            base: reservation.base,
            info: &info,
        };
        let statics = match self.parser.static_functions(&mapped) {
            Ok(statics) => statics,
            Err(err) => {
                unsafe { segments::release_reservation(kernel, reservation) };
                return Err(err);
            }
        };
        let entry = self.parser.entry_point(&mapped);
        let tls = info.tls.map(|template| {
            TlsDescriptor::new(
                mapped.rebase(template.image_vaddr),
                template.file_size,
                template.mem_size,
                template.align,
            )
        });

        let module = self.modules.allocate();
        let image = Arc::new(Image::new(
            name.to_string(),
            path,
            ident,
            reservation.base,
            reservation.size,
            flags,
            info,
            statics,
            entry,
            tls,
            module,
        ));
        self.images.push(image.clone());
        newly.push(image.clone());

        if flags.contains(LoadFlags::DEFER_RELOC) {
            debug::notify_load(kernel, self.loader_base, &image);
        } else if let Err(err) = self.relocate_image(&image) {
            return Err(err);
        } else {
            debug::notify_load(kernel, self.loader_base, &image);
        }

        Ok(image)
    }

    /// Relocate, pre-bind when asked, and apply final protections.
    pub fn relocate_image(&self, image: &Arc<Image>) -> Result<()> {
        let kernel = platform::kernel();
        let scope = ListScope {
            parser: self.parser,
            images: &self.images,
        };
        let mapped = image.mapped();
        self.parser.relocate(&mapped, &scope)?;
        if self.bind_now || image.flags.contains(LoadFlags::BIND_NOW) {
            for index in 0..image.info.lazy_entries {
                self.parser.resolve_lazy(&mapped, index, &scope)?;
            }
        }
        unsafe {
            segments::finalize_protections(
                kernel,
                &image.info,
                Reservation {
                    base: image.base,
                    size: image.reservation_size,
                },
            )?;
        }
        Ok(())
    }

    /// Resolve one lazy-binding entry under the shared lock.
    pub fn resolve_lazy(&self, module: usize, index: usize) -> Result<usize> {
        let image = self.find_by_module(module).ok_or(Error::InvalidHandle)?;
        let scope = ListScope {
            parser: self.parser,
            images: &self.images,
        };
        self.parser.resolve_lazy(&image.mapped(), index, &scope)
    }

    /// Failed load: discard everything this call mapped and the reference
    /// bumps it handed to pre-existing dependencies.
    fn rollback(&mut self, newly: Vec<Arc<Image>>) {
        let kernel = platform::kernel();
        for image in newly.iter().rev() {
            for dep in &image.info.needed {
                if let Some(existing) = self.find_by_name(dep) {
                    if !newly.iter().any(|n| Arc::ptr_eq(n, &existing)) {
                        existing.release_ref();
                    }
                }
            }
            self.images.retain(|i| !Arc::ptr_eq(i, image));
            self.modules.release(image.module_id());
            unsafe {
                segments::release_reservation(
                    kernel,
                    Reservation {
                        base: image.base,
                        size: image.reservation_size,
                    },
                )
            };
        }
    }

    /// Drop one reference; at zero, detach the image and every dependency
    /// that reaches zero with it. Returns the detached images leaves-first.
    pub fn begin_unload(&mut self, module: usize) -> Result<Vec<Arc<Image>>> {
        let image = self.find_by_module(module).ok_or(Error::NotFound)?;
        let mut dead = Vec::new();
        self.release_image(&image, &mut dead);
        Ok(dead)
    }

    fn release_image(&mut self, image: &Arc<Image>, dead: &mut Vec<Arc<Image>>) {
        if image.release_ref() > 0 {
            return;
        }
        self.images.retain(|i| !Arc::ptr_eq(i, image));
        for dep in image.info.needed.clone() {
            if let Some(dep_image) = self.find_by_name(&dep) {
                self.release_image(&dep_image, dead);
            }
        }
        // Dependencies land first, dependents last: leaves-first.
        dead.push(image.clone());
    }

    /// Interpreter mode: the real executable takes the first module slot,
    /// everything else renumbers after it in list order.
    pub fn renumber_for_exec(&mut self) -> Result<()> {
        let primary = self
            .images
            .iter()
            .find(|image| image.flags.contains(LoadFlags::PRIMARY))
            .cloned()
            .ok_or(Error::NotFound)?;
        let mut fresh = ModuleBitmap::new();
        fresh.advance_to(self.modules.generation());
        primary.set_module_id(fresh.allocate());
        for image in &self.images {
            if !image.flags.contains(LoadFlags::PRIMARY) {
                image.set_module_id(fresh.allocate());
            }
        }
        self.modules = fresh;
        Ok(())
    }

    fn resolve_path(&self, name: &str) -> Result<String> {
        if name.contains('/') {
            return Ok(name.to_string());
        }
        for part in self.library_path.split(PATH_SEP) {
            let candidate = if part.is_empty() {
                format!("./{}", name)
            } else {
                format!("{}/{}", part, name)
            };
            if ImageFile::open(&candidate).is_ok() {
                return Ok(candidate);
            }
        }
        log::debug!("failed to locate '{}'", name);
        Err(Error::NotFound)
    }
}

static LINKER: Once<RwLock<Linker>> = Once::new();

/// Install the loader state. First caller wins.
pub fn init(parser: &'static dyn ImageParser, library_path: &str, bind_now: bool) {
    LINKER.call_once(|| RwLock::new(Linker::new(parser, library_path, bind_now)));
}

pub(crate) fn linker() -> &'static RwLock<Linker> {
    LINKER.get().expect("loader used before runtime init")
}

/// Load a shared object (and its dependencies), returning its module
/// number. Initializers of everything newly loaded run before return, with
/// the image lock released.
pub fn load_library(name: &str) -> Result<usize> {
    let (module, newly) = {
        let mut guard = linker().write();
        let (image, newly) = guard.load_by_name(name, LoadFlags::DLOPENED)?;
        (image.module_id(), newly)
    };
    for image in &newly {
        run_image_initializers(image)?;
    }
    Ok(module)
}

/// Drop a reference to a loaded image; the last drop tears it down.
pub fn free_library(module: usize) -> Result<()> {
    let dead = { linker().write().begin_unload(module)? };
    if dead.is_empty() {
        return Ok(());
    }

    // Destructors run with the image lock released so user code cannot
    // deadlock against it.
    for image in dead.iter().rev() {
        run_image_finalizers(image);
    }

    {
        let mut guard = linker().write();
        let kernel = platform::kernel();
        for image in &dead {
            // The sweep requires the image lock held; no thread can be
            // inside this module's TLS growth path concurrently.
            let id = image.module_id();
            unsafe { tcb::module_unloaded(id) };
            guard.modules_mut().release(id);
            debug::notify_unload(kernel, guard.loader_base(), image);
        }
    }

    let kernel = platform::kernel();
    for image in &dead {
        if !image.flags.contains(LoadFlags::PRELOADED) {
            unsafe {
                segments::release_reservation(
                    kernel,
                    Reservation {
                        base: image.base,
                        size: image.reservation_size,
                    },
                )
            };
        }
    }
    Ok(())
}

/// Search every image for an exported symbol, leaves-first.
pub fn get_symbol_address(name: &str) -> Result<usize> {
    linker().read().lookup_symbol(name).ok_or(Error::NotFound)
}

/// Symbol lookup restricted to one module.
pub fn get_symbol_in(module: usize, name: &str) -> Result<usize> {
    let guard = linker().read();
    let image = guard.find_by_module(module).ok_or(Error::InvalidHandle)?;
    guard
        .parser()
        .lookup(&image.mapped(), name)
        .ok_or(Error::NotFound)
}

/// Snapshot describing the image covering an address.
#[derive(Clone, Debug)]
pub struct ImageQuery {
    pub module: usize,
    pub name: String,
    pub base: usize,
    pub size: usize,
}

pub fn get_image_for_address(addr: usize) -> Result<ImageQuery> {
    let guard = linker().read();
    let image = guard.find_by_address(addr).ok_or(Error::NotFound)?;
    Ok(ImageQuery {
        module: image.module_id(),
        name: image.name.clone(),
        base: image.base,
        size: image.reservation_size,
    })
}

/// Visit every image under the shared lock.
pub fn iterate_images(mut f: impl FnMut(&Image)) {
    let guard = linker().read();
    for image in guard.images() {
        f(image);
    }
}

/// First-call target resolution for a lazy-bound entry; the architecture
/// stub jumps here, and a failure is terminal for the caller.
pub fn resolve_plt_entry(module: usize, index: usize) -> Result<usize> {
    linker().read().resolve_lazy(module, index)
}

/// Current module-number generation counter.
pub fn module_generation() -> u64 {
    linker().read().modules().generation()
}

/// Run pending initializers for every image, leaves-first. The primary
/// executable only gets its pre-init array; its own initialization is its
/// entry point's business.
pub fn run_initializers() -> Result<()> {
    let images: Vec<Arc<Image>> = linker().read().images().to_vec();
    for image in &images {
        run_image_initializers(image)?;
    }
    Ok(())
}

fn run_image_initializers(image: &Arc<Image>) -> Result<()> {
    if image.is_initialized() {
        return Ok(());
    }
    unsafe {
        if image.flags.contains(LoadFlags::PRIMARY) {
            for &addr in &image.statics.preinit_array {
                call_image_fn(addr);
            }
            image.mark_initialized();
            return Ok(());
        }
        if let Some(init) = image.statics.init {
            call_image_fn(init);
        }
        for &addr in &image.statics.init_array {
            call_image_fn(addr);
        }
    }
    image.mark_initialized();
    Ok(())
}

fn run_image_finalizers(image: &Arc<Image>) {
    if !image.is_initialized() {
        return;
    }
    unsafe {
        for &addr in image.statics.fini_array.iter().rev() {
            call_image_fn(addr);
        }
        if let Some(fini) = image.statics.fini {
            call_image_fn(fini);
        }
    }
    image.clear_initialized();
}

/// Reverse-order finalizers for process teardown.
pub fn run_finalizers() {
    let images: Vec<Arc<Image>> = linker().read().images().to_vec();
    for image in images.iter().rev() {
        run_image_finalizers(image);
    }
}
