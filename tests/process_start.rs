//! Full process-start flow: initial image list, first-thread TLS,
//! relocation, initializer ordering, entry discovery.

mod common;

use std::sync::Mutex;

use basert::ld_so::tcb::Tcb;
use basert::ld_so::iterate_images;
use basert::platform;
use basert::platform::gate::{MapFlags, MapProt};
use basert::start::{initialize, ProcessEnvironment, StartData};
use common::ImageBuilder;

static EVENTS: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

extern "C" fn base_init() {
    EVENTS.lock().unwrap().push("base_init");
}
extern "C" fn exe_preinit() {
    EVENTS.lock().unwrap().push("exe_preinit");
}
extern "C" fn exe_init() {
    // Must not run: the primary handles its own init sequence.
    EVENTS.lock().unwrap().push("exe_init");
}
extern "C" fn exe_entry() -> i32 {
    0
}

#[test]
fn initialize_builds_the_runtime() {
    let (host, parser) = common::setup();
    let kernel = platform::kernel();

    // The kernel "premapped" the base library and the executable.
    let base_library = unsafe {
        kernel
            .map(
                0,
                0x2000,
                MapProt::READ | MapProt::WRITE,
                MapFlags::ANONYMOUS | MapFlags::PRIVATE,
                -1,
                0,
            )
            .unwrap()
    };
    let executable = unsafe {
        kernel
            .map(
                0,
                0x2000,
                MapProt::READ | MapProt::WRITE,
                MapFlags::ANONYMOUS | MapFlags::PRIVATE,
                -1,
                0,
            )
            .unwrap()
    };

    ImageBuilder::new("base-library", "/premapped/base")
        .at_base(base_library)
        .init_array(&[base_init as usize])
        .tls_u32(0xFEED_F00D, 32)
        .install(host, parser);
    // The kernel would have placed the file contents; the TLS init image
    // has to be present in the premapped region.
    unsafe {
        ((base_library + common::TLS_DATA_OFFSET) as *mut u32).write(0xFEED_F00D);
    }
    ImageBuilder::new("exe", "/premapped/exe")
        .at_base(executable)
        .preinit_array(&[exe_preinit as usize])
        .init_array(&[exe_init as usize])
        .entry(exe_entry as usize)
        .install(host, parser);

    let env = ProcessEnvironment {
        image_path: "/premapped/exe".to_string(),
        args: vec!["/premapped/exe".to_string()],
        env: vec![("LD_LIBRARY_PATH".to_string(), "/lib".to_string())],
        start_data: StartData {
            executable_base: executable,
            interpreter_base: base_library,
            base_library_base: base_library,
            page_size: 4096,
        },
    };

    let entry = unsafe { initialize(kernel, parser, &env) }.unwrap();
    assert_eq!(entry, exe_entry as usize);

    // Base library first, executable after: modules 1 and 2, leaves-first.
    let mut modules = Vec::new();
    iterate_images(|image| modules.push((image.name.clone(), image.module_id())));
    assert_eq!(modules[0].1, 1);
    assert_eq!(
        modules.last().unwrap(),
        &("/premapped/exe".to_string(), 2)
    );

    // Relocation covered every initial image.
    assert_eq!(parser.relocation_log(), vec!["base-library", "exe"]);

    // Initializers: library init ran, primary got only its pre-init.
    assert_eq!(
        EVENTS.lock().unwrap().as_slice(),
        &["base_init", "exe_preinit"]
    );

    // The first thread's TCB is live, with the base library's TLS block
    // at its recorded distance below the thread pointer.
    let tcb = unsafe { Tcb::current() }.expect("first thread TCB missing");
    let tp = tcb.self_ptr as usize;
    let mut checked = false;
    iterate_images(|image| {
        if let Some(tls) = image.tls.as_ref() {
            let offset = tls.static_offset().expect("static offset unassigned");
            let slot = tcb.slot(image.module_id());
            assert_eq!(tp - slot, offset);
            let value = unsafe { (slot as *const u32).read() };
            assert_eq!(value, 0xFEED_F00D);
            checked = true;
        }
    });
    assert!(checked, "no static TLS image was verified");

    // Stack guard landed at its ABI offset with a nonzero value.
    assert_ne!(tcb.stack_guard, 0);
}
