//! Heap behavior over the kernel backing.

mod common;

use std::sync::Mutex;

use basert::heap::{Heap, HeapConfig, KERNEL_BACKING, SIGNAL_ABORT};

// The host signal log is shared; keep tests that inspect it apart.
static SERIAL: Mutex<()> = Mutex::new(());

fn kernel_heap(page_size: usize) -> &'static Heap {
    Box::leak(Box::new(Heap::new(
        &KERNEL_BACKING,
        HeapConfig {
            page_size,
            ..HeapConfig::default()
        },
    )))
}

#[test]
fn grows_then_shrinks() {
    let _serial = SERIAL.lock().unwrap();
    let (host, _) = common::setup();
    let heap = kernel_heap(64 * 1024);
    let signals_before = host.delivered_signals().len();

    let big = heap.allocate(1024 * 1024, 0x4141_4141).unwrap();
    let small = heap.allocate(1024, 0x4242_4242).unwrap();
    assert_eq!(unsafe { heap.tag_of(big.as_ptr()) }, Some(0x4141_4141));
    assert_eq!(unsafe { heap.tag_of(small.as_ptr()) }, Some(0x4242_4242));

    unsafe { heap.free(big.as_ptr()).unwrap() };
    heap.validate().unwrap();
    assert_eq!(
        host.delivered_signals().len(),
        signals_before,
        "corruption was reported on a healthy heap"
    );

    // Not necessarily the same pointer, but a pointer.
    let again = heap.allocate(1024 * 1024, 0x4141_4141).unwrap();
    unsafe {
        heap.free(again.as_ptr()).unwrap();
        heap.free(small.as_ptr()).unwrap();
    }
    heap.validate().unwrap();
}

#[test]
fn expansion_respects_minimum() {
    let _serial = SERIAL.lock().unwrap();
    common::setup();
    let heap = kernel_heap(4096);

    let p = heap.allocate(8, 0).unwrap();
    // 16-page floor even for a tiny request.
    assert!(heap.stats().mapped_bytes >= 16 * 4096);
    unsafe { heap.free(p.as_ptr()).unwrap() };
    assert_eq!(heap.stats().mapped_bytes, 0);
}

#[test]
fn corruption_reports_through_the_gate() {
    let _serial = SERIAL.lock().unwrap();
    let (host, _) = common::setup();
    let heap = kernel_heap(4096);

    let p = heap.allocate(64, 0x4641_4b45).unwrap();
    unsafe {
        // Smash the header.
        p.as_ptr().sub(16).write_bytes(0xdb, 16);
        assert!(heap.free(p.as_ptr()).is_err());
    }
    assert!(host
        .delivered_signals()
        .iter()
        .any(|&(target, sig)| target == 0 && sig == SIGNAL_ABORT));
    // Poisoned: nothing more comes out.
    assert!(heap.allocate(64, 0).is_none());
}

#[test]
fn aligned_allocations_free_cleanly() {
    let _serial = SERIAL.lock().unwrap();
    common::setup();
    let heap = kernel_heap(4096);

    let a = heap.aligned_allocate(1 << 12, 500, 0x414c_4e32).unwrap();
    assert_eq!(a.as_ptr() as usize % (1 << 12), 0);
    let b = heap.allocate(100, 1).unwrap();
    unsafe {
        heap.free(a.as_ptr()).unwrap();
        heap.free(b.as_ptr()).unwrap();
    }
    heap.validate().unwrap();
    assert_eq!(heap.stats().live_bytes, 0);
}
