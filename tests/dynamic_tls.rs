//! Dynamic TLS: late-loaded modules, vector growth, per-thread init.

mod common;

use basert::ld_so::tcb::{get_tls_address_in, Tcb};
use basert::ld_so::load_library;
use common::ImageBuilder;

#[test]
fn late_loaded_module_tls_per_thread() {
    let (host, parser) = common::setup_loader("/lib");

    // Thread T exists before the library.
    let tcb = unsafe { Tcb::create().unwrap() };
    let generation_before = tcb.vector_generation();

    ImageBuilder::new("tls-lib", "/lib/libtls.so")
        .tls_u32(0xCAFE_BABE, 64)
        .install(host, parser);
    let module = load_library("libtls.so").unwrap();
    assert!(module > generation_before);

    // First access grows the vector and materializes the block.
    let addr = unsafe { get_tls_address_in(tcb, module, 0).unwrap() };
    assert!(tcb.vector_generation() >= module);
    let value = unsafe { (addr as *const u32).read() };
    assert_eq!(value, 0xCAFE_BABE);

    // Writes stick, and repeat access lands on the same block.
    unsafe { (addr as *mut u32).write(0x1234_5678) };
    let again = unsafe { get_tls_address_in(tcb, module, 0).unwrap() };
    assert_eq!(again, addr);
    assert_eq!(unsafe { (again as *const u32).read() }, 0x1234_5678);

    // Trailing bytes of the block come up zero.
    let tail = unsafe { get_tls_address_in(tcb, module, 32).unwrap() };
    assert_eq!(unsafe { (tail as *const u32).read() }, 0);

    // A thread created after the load sees the init value, not T's write.
    let fresh = std::thread::spawn(move || {
        let tcb = unsafe { Tcb::create().unwrap() };
        let addr = unsafe { get_tls_address_in(tcb, module, 0).unwrap() };
        let value = unsafe { (addr as *const u32).read() };
        unsafe { Tcb::destroy(tcb) };
        value
    })
    .join()
    .unwrap();
    assert_eq!(fresh, 0xCAFE_BABE);

    unsafe { Tcb::destroy(tcb) };
}

#[test]
fn vector_migrates_to_heap_past_initial_capacity() {
    let (host, parser) = common::setup_loader("/lib");

    ImageBuilder::new("mig", "/lib/libmig.so")
        .tls_u32(0x0BAD_F00D, 32)
        .install(host, parser);
    let module = load_library("libmig.so").unwrap();

    let tcb = unsafe { Tcb::create().unwrap() };
    assert!(!tcb.vector_is_migrated());

    // Force growth far past what the page-padded reservation can hold.
    let far = module + 4096;
    let err = unsafe { get_tls_address_in(tcb, far, 0) };
    assert!(err.is_err());
    assert!(tcb.vector_is_migrated());
    assert!(tcb.vector_generation() >= far);

    // The migrated vector still serves the real module.
    let addr = unsafe { get_tls_address_in(tcb, module, 0).unwrap() };
    assert_eq!(unsafe { (addr as *const u32).read() }, 0x0BAD_F00D);

    unsafe { Tcb::destroy(tcb) };
}

#[test]
fn thread_blocks_are_private() {
    let (host, parser) = common::setup_loader("/lib");

    ImageBuilder::new("static-tls", "/lib/libstatic.so")
        .tls_u32(0x5757_5757, 48)
        .install(host, parser);
    let module = load_library("libstatic.so").unwrap();

    // Loaded before these threads, so each thread materializes its own
    // block; distance bookkeeping must agree between threads.
    let main_tcb = unsafe { Tcb::create().unwrap() };
    let a = unsafe { get_tls_address_in(main_tcb, module, 0).unwrap() };

    let b = std::thread::spawn(move || {
        let tcb = unsafe { Tcb::create().unwrap() };
        let addr = unsafe { get_tls_address_in(tcb, module, 0).unwrap() };
        let value = unsafe { (addr as *const u32).read() };
        unsafe { Tcb::destroy(tcb) };
        (addr as usize, value)
    })
    .join()
    .unwrap();

    assert_ne!(a as usize, b.0, "threads must not share TLS blocks");
    assert_eq!(b.1, 0x5757_5757);

    unsafe { Tcb::destroy(main_tcb) };
}
