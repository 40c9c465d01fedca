//! The dynamic image loader.
//!
//! Driven by an external image parser through [`parser::ImageParser`]; the
//! loader owns address-space reservations, segment placement, module
//! numbers, the image list and its lock, initializer/finalizer ordering,
//! lazy binding, and debugger notifications. TLS lives in [`tcb`], layered
//! on top of the image list.

pub mod debug;
pub mod image;
pub mod linker;
pub mod modules;
pub mod parser;
pub mod segments;
pub mod tcb;

pub use self::image::{Image, LoadFlags};
pub use self::linker::{
    free_library, get_image_for_address, get_symbol_address, get_symbol_in, init, iterate_images,
    load_library, module_generation, resolve_plt_entry, run_finalizers, run_initializers,
    ImageQuery, PATH_SEP,
};
pub use self::tcb::{get_tls_address, Tcb};
