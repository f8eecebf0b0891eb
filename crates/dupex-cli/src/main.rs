use std::io;
use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;

use dupex::pathstore::PathStore;
use dupex::pipeline::{Config, Context};
use dupex::stats::Stats;
use dupex::storage::{GroupStore, MemoryStore, SpillStore};

/// Offline block-level deduplicator for btrfs filesystems.
///
/// Scans the given files and directory trees, groups candidate regions
/// by physical offset and first-block hash, and asks the kernel to
/// replace byte-identical regions with shared extents.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Files and directory trees to scan.
    #[arg(required = true)]
    roots: Vec<PathBuf>,

    /// Scan and report only; do not submit anything to the kernel.
    #[arg(long)]
    noact: bool,

    /// Spill scan state to temporary files instead of keeping it in
    /// memory; for trees whose metadata does not fit in RAM.
    #[arg(long)]
    lowmem: bool,

    /// Log progress lines instead of drawing a progress meter.
    #[arg(long)]
    nopb: bool,

    /// Skip paths starting with this prefix (repeatable).
    #[arg(long, value_name = "PREFIX")]
    exclude: Vec<String>,

    /// Defragment badly fragmented deduplication sources first.
    #[arg(long)]
    defrag: bool,

    /// Defragmentation threshold in blocks per fragment.
    #[arg(long, value_name = "N", default_value_t = 1024)]
    bpf: u64,

    /// Minimum file size in 4096-byte blocks.
    #[arg(long, value_name = "BLOCKS", default_value_t = 1)]
    minsize: u64,

    /// Write a CPU profile flamegraph to this path on exit.
    #[cfg(feature = "profiling")]
    #[arg(long, value_name = "PATH")]
    cpuprofile: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .init()
        .context("failed to initialise logging")?;

    #[cfg(feature = "profiling")]
    let profiler = match &args.cpuprofile {
        Some(_) => Some(
            pprof::ProfilerGuard::new(100).context("failed to start the CPU profiler")?,
        ),
        None => None,
    };

    raise_open_file_limit();

    let stats = Stats::spawn(!args.nopb);
    let paths = PathStore::new();
    let mut store: Box<dyn GroupStore> = if args.lowmem {
        Box::new(SpillStore::new())
    } else {
        Box::new(MemoryStore::new())
    };
    let mut ctx = Context {
        paths: &paths,
        stats: stats.handle(),
        store: store.as_mut(),
        config: Config {
            act: !args.noact,
            min_blocks: args.minsize,
            exclude: args.exclude.clone(),
            defrag: args.defrag,
            blocks_per_fragment: args.bpf,
        },
    };

    let summary = dupex::run(&mut ctx, &args.roots).context("deduplication failed")?;
    stats.stop();

    log::info!(
        "scanned {} files, considered {} groups, issued {} kernel calls, {} bytes deduplicated",
        summary.files_scanned,
        summary.groups_considered,
        summary.calls_issued,
        summary.bytes_deduped
    );

    #[cfg(feature = "profiling")]
    if let (Some(path), Some(profiler)) = (&args.cpuprofile, &profiler) {
        let report = profiler
            .report()
            .build()
            .context("failed to build the CPU profile")?;
        let file = std::fs::File::create(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        report
            .flamegraph(file)
            .context("failed to write the flamegraph")?;
        log::info!("wrote CPU profile to {}", path.display());
    }

    Ok(())
}

/// Large pass-3 batches hold one descriptor per member; start with the
/// hard limit instead of failing halfway through a batch.
fn raise_open_file_limit() {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } != 0 {
        log::warn!(
            "failed to query the open file limit: {}",
            io::Error::last_os_error()
        );
        return;
    }
    if limit.rlim_cur >= limit.rlim_max {
        return;
    }
    let soft = limit.rlim_cur;
    limit.rlim_cur = limit.rlim_max;
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &limit) } != 0 {
        log::warn!(
            "failed to raise the open file limit: {}",
            io::Error::last_os_error()
        );
    } else {
        log::debug!("raised the open file limit from {soft} to {}", limit.rlim_max);
    }
}
