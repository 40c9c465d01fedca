//! Loader operations: dependency order, queries, lazy binding,
//! initializer/finalizer ordering, unload round trip.

mod common;

use std::sync::Mutex;

use basert::error::Error;
use basert::ld_so::{
    free_library, get_image_for_address, get_symbol_address, get_symbol_in, iterate_images,
    load_library, resolve_plt_entry,
};
use basert::platform::gate::{DEBUG_KIND_IMAGE_LOAD, DEBUG_KIND_IMAGE_UNLOAD};
use common::ImageBuilder;

static EVENTS: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

// Both tests mutate the shared image list; keep them apart.
static SERIAL: Mutex<()> = Mutex::new(());

extern "C" fn dep_init() {
    EVENTS.lock().unwrap().push("dep_init");
}
extern "C" fn dep_fini() {
    EVENTS.lock().unwrap().push("dep_fini");
}
extern "C" fn top_init() {
    EVENTS.lock().unwrap().push("top_init");
}
extern "C" fn top_fini() {
    EVENTS.lock().unwrap().push("top_fini");
}

extern "C" fn lazy_target_a() {}
extern "C" fn lazy_target_b() {}

#[test]
fn load_unload_lifecycle() {
    let _serial = SERIAL.lock().unwrap();
    let (host, parser) = common::setup_loader("/lib");

    ImageBuilder::new("dep", "/lib/libdep.so")
        .symbol("dep_sym", 0xD0_0D00)
        .init_array(&[dep_init as usize])
        .fini_array(&[dep_fini as usize])
        .install(host, parser);
    ImageBuilder::new("top", "/lib/libtop.so")
        .needs("libdep.so")
        .symbol("top_sym", 0x70_0700)
        .init_array(&[top_init as usize])
        .fini_array(&[top_fini as usize])
        .lazy(&[lazy_target_a as usize, lazy_target_b as usize])
        .install(host, parser);

    let before_len = {
        let mut n = 0;
        iterate_images(|_| n += 1);
        n
    };
    let relocs_before = parser.relocation_log().len();

    let top = load_library("libtop.so").unwrap();

    // Dependency precedes dependent: leaves-first list, leaves-first init.
    assert_eq!(
        EVENTS.lock().unwrap().as_slice(),
        &["dep_init", "top_init"]
    );
    assert_eq!(
        parser.relocation_log()[relocs_before..].to_vec(),
        vec!["dep", "top"]
    );

    // Queries under the shared lock.
    assert_eq!(get_symbol_address("dep_sym").unwrap(), 0xD0_0D00);
    assert_eq!(get_symbol_in(top, "top_sym").unwrap(), 0x70_0700);
    assert_eq!(
        get_symbol_in(top, "missing").unwrap_err(),
        Error::NotFound
    );

    let mut top_base = 0;
    iterate_images(|image| {
        if image.name == "libtop.so" {
            top_base = image.base;
        }
    });
    assert_ne!(top_base, 0);
    let query = get_image_for_address(top_base + 0x10).unwrap();
    assert_eq!(query.module, top);
    assert_eq!(
        get_image_for_address(1).unwrap_err(),
        Error::NotFound
    );

    // Lazy binding resolves and patches the linkage table.
    let target = resolve_plt_entry(top, 1).unwrap();
    assert_eq!(target, lazy_target_b as usize);
    assert_eq!(parser.resolved_entries("top"), vec![1]);
    let slot = top_base + common::LAZY_TABLE_OFFSET + core::mem::size_of::<usize>();
    assert_eq!(unsafe { (slot as *const usize).read() }, target);

    // Debugger heard about both loads.
    assert!(host.debug_records_of_kind(DEBUG_KIND_IMAGE_LOAD).len() >= 2);

    // Unload restores list length; finalizers run dependents-first.
    free_library(top).unwrap();
    let after_len = {
        let mut n = 0;
        iterate_images(|_| n += 1);
        n
    };
    assert_eq!(after_len, before_len);
    assert_eq!(
        EVENTS.lock().unwrap().as_slice(),
        &["dep_init", "top_init", "top_fini", "dep_fini"]
    );
    assert!(host.debug_records_of_kind(DEBUG_KIND_IMAGE_UNLOAD).len() >= 2);

    // Loading by a path that does not exist surfaces cleanly.
    assert_eq!(load_library("libnone.so").unwrap_err(), Error::NotFound);
}

#[test]
fn segments_sharing_one_page_load_intact() {
    use basert::ld_so::parser::{ImageInfo, SegmentDescriptor, SegmentProt, StaticFunctions};

    let _serial = SERIAL.lock().unwrap();
    let (host, parser) = common::setup_loader("/lib");

    // Two segments inside the reservation's first page: the second starts
    // where the first one's page continues, driving the overlap-fill path.
    let preferred = 0x0900_0000;
    let mut data = vec![0u8; 0x400];
    for (i, byte) in data.iter_mut().enumerate() {
        *byte = (i % 199) as u8;
    }
    let info = ImageInfo {
        preferred_base: preferred,
        image_size: 0x1000,
        segments: vec![
            SegmentDescriptor {
                vaddr: preferred,
                mem_size: 0x80,
                file_offset: 0,
                file_size: 0x80,
                prot: SegmentProt::READ,
            },
            SegmentDescriptor {
                vaddr: preferred + 0x100,
                mem_size: 0x100,
                file_offset: 0x100,
                file_size: 0x100,
                prot: SegmentProt::READ | SegmentProt::WRITE,
            },
        ],
        needed: Vec::new(),
        tls: None,
        lazy_anchor: None,
        lazy_entries: 0,
    };
    host.put_file("/lib/libtiny.so", data.clone());
    parser.register(
        "tiny",
        "/lib/libtiny.so",
        common::TestImage {
            info,
            symbols: std::collections::HashMap::new(),
            statics: StaticFunctions::default(),
            entry: None,
            lazy_targets: Vec::new(),
        },
    );

    let module = load_library("libtiny.so").unwrap();
    let mut base = 0;
    iterate_images(|image| {
        if image.module_id() == module {
            base = image.base;
        }
    });
    assert_ne!(base, 0);

    // Both segment bodies carry their file bytes, including the stretch
    // between them that the overlap pass refilled.
    for offset in [0usize, 0x7f, 0x80, 0xff, 0x100, 0x1ff] {
        let got = unsafe { ((base + offset) as *const u8).read() };
        assert_eq!(got, data[offset], "byte {:#x} corrupted by mapping", offset);
    }

    // The finalize pass demoted the read-only segment after relocation.
    assert!(host
        .protection_log()
        .iter()
        .any(|&(addr, _, prot)| addr == base && prot == 1));

    free_library(module).unwrap();
}

#[test]
fn repeated_load_is_reference_counted() {
    let _serial = SERIAL.lock().unwrap();
    let (host, parser) = common::setup_loader("/lib");

    ImageBuilder::new("rc", "/lib/librc.so").install(host, parser);

    let first = load_library("librc.so").unwrap();
    let second = load_library("librc.so").unwrap();
    assert_eq!(first, second);

    // One unload keeps it; the second tears it down.
    free_library(first).unwrap();
    let mut still = false;
    iterate_images(|image| still |= image.name == "librc.so");
    assert!(still);

    free_library(first).unwrap();
    let mut gone = true;
    iterate_images(|image| gone &= image.name != "librc.so");
    assert!(gone);
}
