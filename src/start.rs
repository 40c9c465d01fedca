//! Process-start adapter.
//!
//! The parent hands the child one environment block: image path, argument
//! and environment vectors, and a start-data record carrying the bases the
//! kernel mapped before the runtime ran. From that this module rebuilds
//! the image list, brings up the heap and logger, lays out the first
//! thread's TLS, relocates, runs initializers, and hands back the entry
//! point. When the loader itself is the invoked program it instead acts as
//! an interpreter: load the real executable, renumber modules so it owns
//! the first slot, and run it.

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::error::{Error, Result};
use crate::heap::{self, HeapConfig};
use crate::ld_so::image::LoadFlags;
use crate::ld_so::linker::{self, linker};
use crate::ld_so::tcb::Tcb;
use crate::platform::{self, logger, pal::Pal};
use crate::ld_so::parser::ImageParser;

/// Signal slot reserved for the architecture's signal trampoline; the
/// per-architecture shim installs the real address.
pub const TRAMPOLINE_SLOT: u32 = 0;

/// Kernel-provided bases, fixed for the process lifetime.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct StartData {
    pub executable_base: usize,
    pub interpreter_base: usize,
    pub base_library_base: usize,
    pub page_size: usize,
}

/// The block the parent builds for the child. Immutable after start except
/// for argument/environment replacement during exec.
#[derive(Clone, Debug)]
pub struct ProcessEnvironment {
    pub image_path: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub start_data: StartData,
}

impl ProcessEnvironment {
    pub fn get_env(&self, name: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Whether the loader was invoked as the program itself.
pub fn is_standalone(start_data: &StartData) -> bool {
    start_data.executable_base == start_data.base_library_base
}

/// Bring the runtime up for a normally started process and return the
/// primary executable's entry point. The caller jumps there; a failure
/// here is reported and the process should exit with a failing status.
///
/// # Safety
/// Must run once, on the first thread, before any other runtime use.
pub unsafe fn initialize(
    kernel: &'static dyn Pal,
    image_parser: &'static dyn ImageParser,
    env: &ProcessEnvironment,
) -> Result<usize> {
    let kernel = platform::init(kernel);
    logger::init(env.get_env("BASERT_LOG_LEVEL"));
    heap::init(HeapConfig {
        page_size: env.start_data.page_size,
        ..HeapConfig::default()
    });
    // Reserve the trampoline slot; the architecture shim fills it in.
    kernel.set_signal_handler(TRAMPOLINE_SLOT, 0)?;

    let library_path = env
        .get_env(image_parser.library_path_variable())
        .unwrap_or("/lib");
    let bind_now = env.get_env("LD_BIND_NOW").is_some_and(|v| !v.is_empty());
    linker::init(image_parser, library_path, bind_now);

    build_initial_images(env)?;

    // First thread's TLS before relocation: TLS-relative relocations need
    // the static offsets assigned.
    Tcb::create()?;

    relocate_initial_images()?;

    linker::run_initializers()?;

    let entry = {
        let guard = linker().read();
        let primary = guard
            .images()
            .iter()
            .find(|image| image.flags.contains(LoadFlags::PRIMARY))
            .cloned()
            .ok_or(Error::NotFound)?;
        primary.entry.ok_or(Error::UnexpectedType)?
    };
    Ok(entry)
}

/// The image list starts as base library, interpreter when distinct, then
/// the executable — leaves first.
fn build_initial_images(env: &ProcessEnvironment) -> Result<()> {
    let data = &env.start_data;
    let mut guard = linker().write();
    guard.set_loader_base(data.interpreter_base);

    guard.adopt_loaded("base-library", data.base_library_base, LoadFlags::STATIC_TLS)?;
    if data.interpreter_base != data.base_library_base
        && data.interpreter_base != data.executable_base
        && data.interpreter_base != 0
    {
        guard.adopt_loaded("interpreter", data.interpreter_base, LoadFlags::STATIC_TLS)?;
    }
    guard.adopt_loaded(
        &env.image_path,
        data.executable_base,
        LoadFlags::STATIC_TLS | LoadFlags::PRIMARY,
    )?;
    Ok(())
}

fn relocate_initial_images() -> Result<()> {
    let guard = linker().write();
    for image in guard.images() {
        if let Err(err) = guard.relocate_image(image) {
            log::error!("relocation of '{}' failed: {}", image.name, err);
            return Err(err);
        }
    }
    Ok(())
}

/// Standalone interpreter mode: `[--library-path <path>] <program> ...`.
/// Loads the program, renumbers modules so it owns the first slot, builds
/// TLS, relocates, runs initializers and calls the entry point. The entry
/// point returning at all is an error; its status is propagated.
///
/// # Safety
/// Same contract as [`initialize`].
pub unsafe fn interpreter_main(
    kernel: &'static dyn Pal,
    image_parser: &'static dyn ImageParser,
    env: &ProcessEnvironment,
) -> Result<i32> {
    if !is_standalone(&env.start_data) {
        return Err(Error::InvalidParameter);
    }
    let kernel = platform::init(kernel);
    logger::init(env.get_env("BASERT_LOG_LEVEL"));
    heap::init(HeapConfig {
        page_size: env.start_data.page_size,
        ..HeapConfig::default()
    });
    kernel.set_signal_handler(TRAMPOLINE_SLOT, 0)?;

    let mut library_path = env
        .get_env(image_parser.library_path_variable())
        .unwrap_or("/lib")
        .to_string();

    // Option scan stops at the first non-option: the program itself.
    let mut args = env.args.iter().skip(1).peekable();
    while let Some(arg) = args.peek() {
        match arg.as_str() {
            "--library-path" => {
                args.next();
                library_path = args
                    .next()
                    .ok_or(Error::InvalidParameter)?
                    .to_string();
            }
            _ => break,
        }
    }
    let program = args.next().ok_or(Error::InvalidParameter)?.clone();

    let bind_now = env.get_env("LD_BIND_NOW").is_some_and(|v| !v.is_empty());
    linker::init(image_parser, &library_path, bind_now);

    {
        let mut guard = linker().write();
        guard.set_loader_base(env.start_data.base_library_base);
        // The search-path override sticks for the whole session.
        guard.set_library_path(&library_path);
        guard.load_by_name(
            &program,
            LoadFlags::PRIMARY | LoadFlags::STATIC_TLS | LoadFlags::DEFER_RELOC,
        )?;
        guard.renumber_for_exec()?;
    }

    Tcb::create()?;

    {
        let guard = linker().write();
        for image in guard.images() {
            guard.relocate_image(image)?;
        }
    }

    linker::run_initializers()?;

    let entry = {
        let guard = linker().read();
        let primary = guard
            .images()
            .iter()
            .find(|image| image.flags.contains(LoadFlags::PRIMARY))
            .cloned()
            .ok_or(Error::NotFound)?;
        primary.entry.ok_or(Error::UnexpectedType)?
    };

    let entry_fn: unsafe extern "C" fn() -> i32 = core::mem::transmute(entry);
    let status = entry_fn();
    // The entry point must not return; propagate whatever it said.
    log::error!("program entry returned {}", status);
    Ok(status)
}
