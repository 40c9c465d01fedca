//! Standalone interpreter mode.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};

use basert::error::Error;
use basert::ld_so::iterate_images;
use basert::platform;
use basert::start::{interpreter_main, is_standalone, ProcessEnvironment, StartData};
use common::ImageBuilder;

static ENTRY_CALLS: AtomicUsize = AtomicUsize::new(0);

extern "C" fn program_entry() -> i32 {
    ENTRY_CALLS.fetch_add(1, Ordering::SeqCst);
    7
}

fn standalone_env(args: &[&str], env: &[(&str, &str)]) -> ProcessEnvironment {
    let start_data = StartData {
        executable_base: 0x4000_0000,
        interpreter_base: 0x4000_0000,
        base_library_base: 0x4000_0000,
        page_size: 4096,
    };
    assert!(is_standalone(&start_data));
    ProcessEnvironment {
        image_path: args[0].to_string(),
        args: args.iter().map(|s| s.to_string()).collect(),
        env: env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        start_data,
    }
}

#[test]
fn loads_renumbers_and_runs_the_program() {
    let (host, parser) = common::setup();

    ImageBuilder::new("runtime-dep", "/opt/libruntime.so").install(host, parser);
    ImageBuilder::new("program", "/opt/prog")
        .needs("libruntime.so")
        .lazy(&[program_entry as usize])
        .entry(program_entry as usize)
        .install(host, parser);

    let env = standalone_env(
        &["ld-basert", "--library-path", "/opt", "/opt/prog"],
        &[("LD_BIND_NOW", "1")],
    );

    let kernel = platform::kernel();
    let status = unsafe { interpreter_main(kernel, parser, &env) }.unwrap();

    // The entry ran exactly once and its (error) return propagated.
    assert_eq!(ENTRY_CALLS.load(Ordering::SeqCst), 1);
    assert_eq!(status, 7);

    // Renumbered: the program owns module 1, its dependency follows.
    let mut modules = Vec::new();
    iterate_images(|image| modules.push((image.name.clone(), image.module_id())));
    let program = modules
        .iter()
        .find(|(name, _)| name.as_str() == "/opt/prog")
        .unwrap();
    let dep = modules
        .iter()
        .find(|(name, _)| name.as_str() == "libruntime.so")
        .unwrap();
    assert_eq!(program.1, 1);
    assert_eq!(dep.1, 2);

    // LD_BIND_NOW pre-resolved the lazy table during load.
    assert_eq!(parser.resolved_entries("program"), vec![0]);

    // Relocation happened after renumbering, one pass per image.
    assert_eq!(parser.relocation_log().len(), 2);
}

#[test]
fn missing_program_argument_is_rejected() {
    let (_, parser) = common::setup();
    let env = standalone_env(&["ld-basert", "--library-path", "/opt"], &[]);
    let kernel = platform::kernel();
    let result = unsafe { interpreter_main(kernel, parser, &env) };
    assert_eq!(result.unwrap_err(), Error::InvalidParameter);
}
