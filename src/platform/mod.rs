//! Kernel boundary: the syscall bridge, the `Pal` trait, the installed
//! kernel handle, and the user-shared data accessor.

pub mod gate;
pub mod logger;
pub mod pal;
pub mod sys;
pub mod usd;

#[cfg(feature = "host")]
pub mod host;

use spin::Once;

use crate::platform::pal::Pal;
use crate::platform::usd::UsdReader;

pub use self::pal::{FileIdent, Seek};
pub use self::sys::Sys;

static KERNEL: Once<&'static dyn Pal> = Once::new();

/// Install the kernel handle. First caller wins; later calls are ignored,
/// which keeps reinstallation during exec idempotent.
pub fn init(kernel: &'static dyn Pal) -> &'static dyn Pal {
    *KERNEL.call_once(|| kernel)
}

/// The installed kernel handle.
///
/// Panics when the runtime has not been initialized; nothing in the core is
/// usable before process start installs the gate.
pub fn kernel() -> &'static dyn Pal {
    *KERNEL
        .get()
        .expect("runtime used before kernel gate was installed")
}

pub fn try_kernel() -> Option<&'static dyn Pal> {
    KERNEL.get().copied()
}

/// System page size, from the installed kernel.
pub fn page_size() -> usize {
    kernel().page_size()
}

/// Accessor over the kernel-exported read-only page.
pub fn usd() -> UsdReader {
    unsafe { UsdReader::new(kernel().usd_page()) }
}

/// Stack guard word for new thread control blocks, derived once from the
/// time counter so every process run differs.
pub fn stack_guard() -> usize {
    static GUARD: Once<usize> = Once::new();
    *GUARD.call_once(|| {
        let counter = usd().time_counter();
        // Mix the counter so a zero counter still yields a nonzero guard.
        (counter as usize).rotate_left(17) ^ 0x5bd1_e995
    })
}
