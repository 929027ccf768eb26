use clap::Parser;
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use verifier::{verify_file, verify_string, Counting, GcPolicy, Heap, Host, Linked};

#[derive(Parser, Debug)]
#[command(
    name = "host-demo",
    about = "Verify a WebAssembly module through the GC host boundary."
)]
struct Args {
    /// Path to the .wasm module
    path: PathBuf,

    /// Read the file in the host and verify the bytes instead of the path
    #[arg(long)]
    bytes: bool,

    /// Repeat the call this many times (at least once)
    #[arg(long, default_value_t = NonZeroUsize::MIN)]
    repeat: NonZeroUsize,

    /// Collect on every host allocation
    #[arg(long, env = "VERIFIER_GC_STRESS")]
    gc_stress: bool,

    /// Maximum number of live host objects
    #[arg(long, value_name = "OBJECTS", env = "VERIFIER_HEAP_LIMIT")]
    heap_limit: Option<usize>,
}

/// What a run observed across all repeats.
#[derive(Debug, Default, PartialEq, Eq)]
struct Report {
    diagnostic: Option<String>,
    calls: usize,
    allocated: usize,
    released: usize,
    collections: usize,
}

fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let report = run(&args)?;

    match &report.diagnostic {
        Some(text) => println!("❌ invalid: {} ({})", args.path.display(), text),
        None => println!("✅ valid: {}", args.path.display()),
    }
    println!(
        "calls={} native_allocated={} native_released={} collections={}",
        report.calls, report.allocated, report.released, report.collections
    );

    Ok(if report.diagnostic.is_some() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn policy(args: &Args) -> GcPolicy {
    let policy = if args.gc_stress {
        GcPolicy::stress()
    } else {
        GcPolicy::default()
    };
    match args.heap_limit {
        Some(limit) => policy.with_limit(limit),
        None => policy,
    }
}

/// Raw path bytes as the host string holds them.
#[cfg(unix)]
fn path_bytes(path: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    path.as_os_str().as_bytes().to_vec()
}

#[cfg(not(unix))]
fn path_bytes(path: &Path) -> Vec<u8> {
    path.to_string_lossy().into_owned().into_bytes()
}

fn run(args: &Args) -> Result<Report, Box<dyn std::error::Error>> {
    let mut heap = Heap::with_policy(policy(args));
    let native = Counting::new(Linked);
    let input = if args.bytes {
        fs::read(&args.path)?
    } else {
        path_bytes(&args.path)
    };

    let mut report = Report::default();
    for _ in 0..args.repeat.get() {
        let value = heap.alloc_string(&input)?;
        let out = if args.bytes {
            verify_string(&mut heap, &native, value)?
        } else {
            verify_file(&mut heap, &native, value)?
        };
        report.diagnostic = heap
            .read_optional_string(out)?
            .map(|text| String::from_utf8_lossy(text).into_owned());
        report.calls += 1;
    }
    log::debug!("heap stats: {:?}", heap.stats());

    report.allocated = native.allocated();
    report.released = native.released();
    report.collections = heap.stats().collections;
    Ok(report)
}
