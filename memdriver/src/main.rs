//! # memdriver — the CS:APP-style malloc lab driver
//!
//! Replays a directory of trace files against the libc pass-through, the
//! segregated allocator, and (with `-b`) the deliberately broken allocator,
//! then prints a blended space-utilization/throughput performance index.
//! Grounded on `mdriver.c`/`fsecs.c`, reshaped as an ordinary Rust CLI: no
//! argument-parsing crate, no terminal-styling crate, matching this
//! workspace's own CLI's habit of hand-rolling both.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use memalloc::SegregatedAllocator;
use memalloc_bad::BadAllocator;
use memalloc_libc::LibcAllocator;
use memheap::SimHeap;
use memiface::MallocImpl;
use memtrace::{Trace, TraceOp};

const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const RESET: &str = "\x1b[0m";

const UTIL_WEIGHT: f64 = 0.50;
const LIBC_MULTIPLIER: f64 = 1.10;
const MAX_BASE_THROUGHPUT: f64 = 64_000_000.0;
const MEM_ALLOWANCE: i64 = 40 * 1024;
/// `mem_op`'s xor constant in the original timing harness.
const XOR_CONSTANT: u8 = 0x7B;

struct Args {
    single_file: Option<PathBuf>,
    trace_dir: PathBuf,
    run_bad: bool,
    check_heap: bool,
    verbose: u8,
    autograder: bool,
}

fn parse_args() -> Args {
    let mut args = Args {
        single_file: None,
        trace_dir: PathBuf::from("./traces/"),
        run_bad: false,
        check_heap: false,
        verbose: 0,
        autograder: false,
    };

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "-f" => {
                let path = it.next().unwrap_or_else(|| usage_error("-f requires a file path"));
                args.single_file = Some(PathBuf::from(path));
            }
            "-t" => {
                let dir = it.next().unwrap_or_else(|| usage_error("-t requires a directory path"));
                args.trace_dir = PathBuf::from(dir);
            }
            "-b" => args.run_bad = true,
            "-c" => args.check_heap = true,
            "-v" => args.verbose = args.verbose.max(1),
            "-V" => args.verbose = 2,
            "-g" => args.autograder = true,
            "-h" | "--help" => {
                print_usage();
                std::process::exit(0);
            }
            other => usage_error(&format!("unknown argument {other:?}")),
        }
    }
    args
}

fn usage_error(msg: &str) -> ! {
    eprintln!("{RED}error:{RESET} {msg}");
    print_usage();
    std::process::exit(1);
}

fn print_usage() {
    println!("{BOLD}memdriver{RESET} — replay allocator traces and score the result\n");
    println!("Usage: memdriver [options]\n");
    println!("Options:");
    println!("  {BOLD}-f FILE{RESET}   replay only this trace file");
    println!("  {BOLD}-t DIR{RESET}    directory of trace files (default ./traces/)");
    println!("  {BOLD}-b{RESET}        also run the deliberately broken allocator");
    println!("  {BOLD}-c{RESET}       run the invariant checker after every op");
    println!("  {BOLD}-v{RESET}       print a per-trace table");
    println!("  {BOLD}-V{RESET}       print a per-trace table plus progress narration");
    println!("  {BOLD}-g{RESET}       print an autograder-style summary line");
    println!("  {BOLD}-h{RESET}       show this message");
}

fn discover_trace_files(args: &Args) -> Vec<PathBuf> {
    if let Some(single) = &args.single_file {
        return vec![single.clone()];
    }
    let mut files: Vec<PathBuf> = match fs::read_dir(&args.trace_dir) {
        Ok(entries) => entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .filter(|p| !p.file_name().map(|n| n.to_string_lossy().starts_with('.')).unwrap_or(true))
            .collect(),
        Err(e) => {
            eprintln!("{RED}error:{RESET} cannot read trace directory {:?}: {e}", args.trace_dir);
            std::process::exit(1);
        }
    };
    // `readdir` order is filesystem-dependent; sorting makes every run
    // (and every `-v` table) reproducible. A deliberate departure from the
    // original C driver rather than an oversight.
    files.sort();
    files
}

fn load_trace(path: &Path) -> Trace {
    let contents = fs::read_to_string(path).unwrap_or_else(|e| {
        eprintln!("{RED}error:{RESET} cannot read {path:?}: {e}");
        std::process::exit(1);
    });
    memtrace::parse(&contents).unwrap_or_else(|e| {
        eprintln!("{RED}error:{RESET} malformed trace {path:?}: {e}");
        std::process::exit(1);
    })
}

/// Per-trace, per-allocator results. `util` is only meaningful for the
/// allocator under test.
#[derive(Default, Clone, Copy)]
struct Stats {
    ops: usize,
    valid: bool,
    checked: Option<bool>,
    secs: f64,
    util: f64,
}

/// Replay `trace` against `impl_`, measuring wall-clock time for the whole
/// replay. Used both as the timing pass and (via its `Write` handling) to
/// simulate the read/compute/write memory traffic `mem_op` exercised in the
/// original harness. Returns `None` if the allocator under test failed an
/// op it wasn't expected to.
fn replay_timed(impl_: &mut dyn MallocImpl, trace: &Trace) -> Option<Duration> {
    impl_.reset();
    impl_.init();
    let mut slots: Vec<Option<(usize, usize)>> = vec![None; trace.num_ids];
    let start = Instant::now();
    for op in &trace.ops {
        apply_op(impl_, &mut slots, op)?;
    }
    Some(start.elapsed())
}

/// Replay `trace`, tracking the high-water mark of live payload bytes, to
/// compute space utilization. Grounded on `eval_mm_util`.
fn replay_util(impl_: &mut dyn MallocImpl, trace: &Trace) -> Option<f64> {
    impl_.reset();
    impl_.init();
    let mut slots: Vec<Option<(usize, usize)>> = vec![None; trace.num_ids];
    let mut total_size: i64 = 0;
    let mut max_total_size: i64 = 0;

    for op in &trace.ops {
        match *op {
            TraceOp::Alloc { size, .. } | TraceOp::Realloc { size, .. } => {
                let old_size = match *op {
                    TraceOp::Realloc { id, .. } => slots[id].map_or(0, |(_, s)| s as i64),
                    _ => 0,
                };
                apply_op(impl_, &mut slots, op)?;
                total_size += size as i64 - old_size;
                max_total_size = max_total_size.max(total_size);
            }
            TraceOp::Free { id } => {
                if let Some((_, size)) = slots[id] {
                    total_size -= size as i64;
                }
                apply_op(impl_, &mut slots, op)?;
            }
            TraceOp::Write { .. } => {
                apply_op(impl_, &mut slots, op)?;
            }
        }
    }

    let max_total_size = max_total_size.max(MEM_ALLOWANCE);
    let heap_size = impl_.heap_high().map_or(0, |h| h as i64 + 1).max(MEM_ALLOWANCE);
    Some(max_total_size as f64 / heap_size as f64)
}

fn apply_op(impl_: &mut dyn MallocImpl, slots: &mut [Option<(usize, usize)>], op: &TraceOp) -> Option<()> {
    match *op {
        TraceOp::Alloc { id, size } => {
            let ptr = impl_.allocate(size)?;
            slots[id] = Some((ptr, size));
        }
        TraceOp::Realloc { id, size } => {
            let old_ptr = slots[id].map(|(p, _)| p);
            let ptr = impl_.reallocate(old_ptr, size)?;
            slots[id] = Some((ptr, size));
        }
        TraceOp::Free { id } => {
            if let Some((ptr, _)) = slots[id].take() {
                impl_.free(ptr);
            }
        }
        TraceOp::Write { id, size } => {
            if let Some((ptr, cap)) = slots[id] {
                let n = size.min(cap);
                if n > 1 {
                    let mut buf = vec![0u8; n];
                    impl_.read_bytes(ptr, &mut buf);
                    for i in 1..n {
                        buf[i] = buf[i - 1] ^ XOR_CONSTANT;
                    }
                    impl_.write_bytes(ptr, &buf);
                }
            }
        }
    }
    Some(())
}

/// Run the full correctness/check/timing/(optionally)utilization pipeline
/// for one allocator against one trace.
fn eval_one(impl_: &mut dyn MallocImpl, trace: &Trace, check_heap: bool, want_util: bool) -> Stats {
    let mut stats = Stats {
        ops: trace.ops.len(),
        ..Default::default()
    };

    stats.valid = memvalidate::eval_valid(impl_, trace, check_heap).is_ok();
    if check_heap {
        stats.checked = Some(stats.valid);
    }
    if stats.valid {
        if let Some(d) = replay_timed(impl_, trace) {
            stats.secs = d.as_secs_f64().max(f64::EPSILON);
        } else {
            stats.valid = false;
        }
        if stats.valid && want_util {
            stats.util = replay_util(impl_, trace).unwrap_or(0.0);
        }
    }
    stats
}

fn print_results_table(label: &str, files: &[PathBuf], stats: &[Stats]) {
    println!("\n{BOLD}Results for {label}:{RESET}");
    for (f, s) in files.iter().zip(stats) {
        let status = if s.valid { format!("{GREEN}ok{RESET}") } else { format!("{RED}FAIL{RESET}") };
        let checked = match s.checked {
            Some(true) => format!(" {GREEN}check=ok{RESET}"),
            Some(false) => format!(" {RED}check=FAIL{RESET}"),
            None => String::new(),
        };
        println!(
            "  {DIM}{:<28}{RESET} {status}{checked}  ops={:<6} secs={:.4}",
            f.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
            s.ops,
            s.secs,
        );
    }
}

fn main() {
    let args = parse_args();
    let files = discover_trace_files(&args);
    if files.is_empty() {
        eprintln!("{YELLOW}warning:{RESET} no trace files found");
    }
    let traces: Vec<Trace> = files.iter().map(|f| load_trace(f)).collect();

    if args.verbose > 1 {
        println!("Replaying {} trace file(s)", files.len());
    }

    let libc_stats: Vec<Stats> = traces
        .iter()
        .map(|t| eval_one(&mut LibcAllocator::new(), t, args.check_heap, false))
        .collect();
    if args.verbose > 0 {
        print_results_table("libc malloc", &files, &libc_stats);
    }

    let bad_stats: Option<Vec<Stats>> = args.run_bad.then(|| {
        traces
            .iter()
            .map(|t| {
                let mut a = BadAllocator::new(SimHeap::new());
                eval_one(&mut a, t, args.check_heap, false)
            })
            .collect()
    });
    if let (true, Some(stats)) = (args.verbose > 0, &bad_stats) {
        print_results_table("the deliberately broken allocator", &files, stats);
    }

    let mm_stats: Vec<Stats> = traces
        .iter()
        .map(|t| {
            let mut a = SegregatedAllocator::new(SimHeap::new());
            eval_one(&mut a, t, args.check_heap, true)
        })
        .collect();
    if args.verbose > 0 {
        print_results_table("the segregated allocator", &files, &mm_stats);
    }

    let mut total_util = 0.0;
    let mut total_throughput = 0.0;
    let mut num_correct = 0usize;

    if args.verbose > 0 {
        println!(
            "\n{BOLD}{:<28}{:>8}{:>8}{:>8}{:>7}{:>7}{RESET}",
            "filename", "libc", "base", "mine", "tput%", "util%"
        );
    }

    for i in 0..traces.len() {
        if !mm_stats[i].valid {
            continue;
        }
        num_correct += 1;
        total_util += mm_stats[i].util;

        let my_throughput = mm_stats[i].ops as f64 / mm_stats[i].secs;
        let libc_throughput = libc_stats[i].ops as f64 / libc_stats[i].secs.max(f64::EPSILON);
        let base_throughput = (LIBC_MULTIPLIER * libc_throughput).min(MAX_BASE_THROUGHPUT);
        let ratio = (my_throughput / base_throughput).min(1.0);
        total_throughput += ratio;

        if args.verbose > 0 {
            println!(
                "{DIM}{:<28}{RESET}{:>8.0}{:>8.0}{:>8.0}{:>6.0}%{:>6.0}%",
                files[i].file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
                libc_throughput / 1000.0,
                base_throughput / 1000.0,
                my_throughput / 1000.0,
                ratio * 100.0,
                mm_stats[i].util * 100.0,
            );
        }
    }

    let trace_count = traces.len().max(1) as f64;
    let average_throughput = total_throughput / trace_count;
    let average_util = total_util / trace_count;

    let p1 = 100.0 * UTIL_WEIGHT * average_util;
    let p2 = 100.0 * (1.0 - UTIL_WEIGHT) * average_throughput;
    let perfindex = p1 + p2;

    let color = if perfindex >= 80.0 {
        GREEN
    } else if perfindex >= 50.0 {
        YELLOW
    } else {
        RED
    };
    println!(
        "\n{BOLD}#{RESET} {p1:.2} (util)  +  {p2:.2} (tput)  =  {color}{perfindex:.2}{RESET}"
    );

    if args.autograder {
        println!("correct:{num_correct}");
        println!("perfidx:{perfindex:.6}");
    }

    let any_bad_passed_validation = bad_stats.as_ref().is_some_and(|s| s.iter().any(|st| st.valid));
    if any_bad_passed_validation {
        eprintln!("{YELLOW}warning:{RESET} the deliberately broken allocator passed validation — the validator may be too weak");
    }

    if num_correct < traces.len() {
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_op_tracks_slot_state_through_a_full_lifecycle() {
        let mut a = SegregatedAllocator::new(SimHeap::with_capacity(1 << 16));
        a.init();
        let mut slots = vec![None; 1];

        apply_op(&mut a, &mut slots, &TraceOp::Alloc { id: 0, size: 64 }).unwrap();
        assert!(slots[0].is_some());

        apply_op(&mut a, &mut slots, &TraceOp::Write { id: 0, size: 32 }).unwrap();
        apply_op(&mut a, &mut slots, &TraceOp::Realloc { id: 0, size: 128 }).unwrap();
        assert_eq!(slots[0].unwrap().1, 128);

        apply_op(&mut a, &mut slots, &TraceOp::Free { id: 0 }).unwrap();
        assert!(slots[0].is_none());
    }

    #[test]
    fn replay_util_reports_a_ratio_in_zero_one_range() {
        let trace = memtrace::parse("1000 1 2 0\na 0 4096\nf 0\n").unwrap();
        let mut a = SegregatedAllocator::new(SimHeap::with_capacity(1 << 20));
        let util = replay_util(&mut a, &trace).unwrap();
        assert!(util > 0.0 && util <= 1.0);
    }

    #[test]
    fn eval_one_reports_valid_for_a_well_formed_trace() {
        let trace = memtrace::parse("1000 2 3 0\na 0 16\na 1 16\nf 0\n").unwrap();
        let mut a = SegregatedAllocator::new(SimHeap::with_capacity(1 << 16));
        let stats = eval_one(&mut a, &trace, true, true);
        assert!(stats.valid);
        assert_eq!(stats.checked, Some(true));
    }

    #[test]
    fn eval_one_reports_invalid_for_the_broken_allocator_on_a_realloc_heavy_trace() {
        let trace = memtrace::parse("1000 1 2 0\na 0 64\nr 0 128\n").unwrap();
        let mut a = BadAllocator::new(SimHeap::with_capacity(1 << 16));
        // write-then-check would require markers; eval_valid itself already
        // fills markers and checks them across the realloc, so this alone
        // is enough to catch the bad allocator's missing copy.
        let stats = eval_one(&mut a, &trace, false, false);
        assert!(!stats.valid);
    }
}
