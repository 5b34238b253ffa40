//! Replays allocation traces against the boundary-tag allocator and reports
//! correctness and space utilization.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

use std::{
    fs,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    process,
};

use argh::FromArgs;
use log::LevelFilter;
use snafu::{ResultExt as _, Whatever};
use tagalloc::{Config, DEFAULT_CHUNK_SIZE};

use self::{
    replay::{ReplayOptions, ReplayStats},
    trace::Trace,
};

mod logger;
mod replay;
mod trace;

const DEFAULT_CAPACITY: usize = 20 << 20;

/// Replay malloc-lab allocation traces.
#[derive(Debug, FromArgs)]
struct Args {
    /// trace files to replay
    #[argh(positional)]
    traces: Vec<PathBuf>,
    /// run the heap checker after every operation
    #[argh(switch, short = 'c')]
    check: bool,
    /// log every block on each heap check (implies --check)
    #[argh(switch, short = 'v')]
    verbose: bool,
    /// minimum number of bytes the heap grows by
    #[argh(option, default = "DEFAULT_CHUNK_SIZE")]
    chunk_size: usize,
    /// skip the fit search once the same size is requested more than this
    /// many times in a row
    #[argh(option)]
    repeat_threshold: Option<NonZeroUsize>,
    /// bytes reserved for the simulated address space
    #[argh(option, default = "DEFAULT_CAPACITY")]
    capacity: usize,
    /// log level: off, error, warn, info, debug or trace
    #[argh(option, default = "LevelFilter::Warn")]
    log_level: LevelFilter,
}

fn main() {
    let args: Args = argh::from_env();

    if let Err(err) = run(&args) {
        let report = snafu::Report::from_error(err);
        eprintln!("{report}");
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Whatever> {
    let level = if args.verbose {
        args.log_level.max(LevelFilter::Debug)
    } else {
        args.log_level
    };
    logger::init(level).whatever_context("failed to install logger")?;

    let options = ReplayOptions {
        config: Config::new()
            .with_chunk_size(args.chunk_size)
            .with_repeat_threshold(args.repeat_threshold),
        capacity: args.capacity,
        check: args.check || args.verbose,
        verbose: args.verbose,
    };

    println!(
        "{:<24} {:>8} {:>8} {:>12} {:>12} {:>6}",
        "trace", "weight", "ops", "peak", "heap", "util"
    );
    let mut total_weight = 0.0;
    let mut weighted_util = 0.0;
    for path in &args.traces {
        let (trace, stats) = replay_file(path, &options).with_whatever_context(|_| {
            format!("failed to replay trace, path={}", path.display())
        })?;
        let name = path
            .file_name()
            .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
        println!(
            "{name:<24} {:>8} {:>8} {:>12} {:>12} {:>5.1}%",
            trace.weight,
            stats.ops,
            stats.peak_payload,
            stats.heap_size,
            stats.utilization() * 100.0
        );
        total_weight += f64::from(trace.weight);
        weighted_util += f64::from(trace.weight) * stats.utilization();
    }

    if total_weight > 0.0 {
        println!(
            "weighted utilization: {:.1}%",
            weighted_util / total_weight * 100.0
        );
    }
    Ok(())
}

fn replay_file(path: &Path, options: &ReplayOptions) -> Result<(Trace, ReplayStats), Whatever> {
    let text = fs::read_to_string(path).whatever_context("failed to read trace file")?;
    let trace = text
        .parse::<Trace>()
        .whatever_context("failed to parse trace file")?;
    let stats = replay::replay(&trace, options).whatever_context("trace replay failed")?;
    Ok((trace, stats))
}
