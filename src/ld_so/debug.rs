//! Debugger notifications.
//!
//! Every image-list mutation ships a small record to the kernel debug
//! channel so an attached debugger can maintain its module list.

use crate::platform::gate::{DEBUG_KIND_IMAGE_LOAD, DEBUG_KIND_IMAGE_UNLOAD};
use crate::platform::pal::Pal;

use super::image::Image;

pub const EVENT_LOAD: u32 = 1;
pub const EVENT_UNLOAD: u32 = 2;

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ImageNotification {
    /// Base of the loader itself, so the debugger can find the list.
    pub loader_base: usize,
    pub event: u32,
    pub _pad: u32,
    /// The image's reservation base.
    pub image: usize,
    pub name_len: usize,
}

fn send(kernel: &dyn Pal, kind: u32, record: ImageNotification) {
    let bytes = unsafe {
        core::slice::from_raw_parts(
            &record as *const ImageNotification as *const u8,
            core::mem::size_of::<ImageNotification>(),
        )
    };
    kernel.debug_report(kind, bytes);
}

pub fn notify_load(kernel: &dyn Pal, loader_base: usize, image: &Image) {
    send(
        kernel,
        DEBUG_KIND_IMAGE_LOAD,
        ImageNotification {
            loader_base,
            event: EVENT_LOAD,
            _pad: 0,
            image: image.base,
            name_len: image.name.len(),
        },
    );
}

pub fn notify_unload(kernel: &dyn Pal, loader_base: usize, image: &Image) {
    send(
        kernel,
        DEBUG_KIND_IMAGE_UNLOAD,
        ImageNotification {
            loader_base,
            event: EVENT_UNLOAD,
            _pad: 0,
            image: image.base,
            name_len: image.name.len(),
        },
    );
}
