//! `fsforge-check`: the checker CLI surface, a `clap`
//! derive shape that resolves a positional device argument through a
//! loader before handing off to the library crate that does the real
//! work.

use clap::{Parser, ValueEnum};
use fsforge_check::{CheckConfig, CheckMode as LibCheckMode, ClearSpaceCache as LibClearSpaceCache, Orchestrator, RunOutcome};
use std::io::Write;
use std::time::Duration;

/// Whole-tree structural checker for an unmounted filesystem image.
#[derive(Parser)]
#[command(name = "fsforge-check")]
#[command(about = "Check (and optionally repair) a filesystem image", long_about = None)]
struct Cli {
    /// Path to the run manifest standing in for the on-disk device (a
    /// pre-decoded snapshot of the forest; see `fsforge_cli::Manifest`).
    device: String,

    /// Select superblock copy N (N < BTRFS_SUPER_MIRROR_MAX).
    #[arg(short = 's', long = "super")]
    superblock_mirror: Option<u8>,

    /// Use the first valid backup root.
    #[arg(short = 'b')]
    use_backup_root: bool,

    /// Root tree bytenr override.
    #[arg(short = 'r')]
    root_bytenr: Option<u64>,

    #[arg(long = "chunk-root")]
    chunk_root_bytenr: Option<u64>,

    #[arg(long)]
    readonly: bool,

    #[arg(long)]
    repair: bool,

    #[arg(long)]
    force: bool,

    #[arg(long, value_enum, default_value_t = CheckMode::Original)]
    mode: CheckMode,

    #[arg(long)]
    init_csum_tree: bool,

    #[arg(long)]
    init_extent_tree: bool,

    #[arg(long)]
    check_data_csum: bool,

    #[arg(long, value_enum)]
    clear_space_cache: Option<ClearSpaceCache>,

    #[arg(long)]
    clear_ino_cache: bool,

    #[arg(short = 'Q', long)]
    qgroup_report: bool,

    #[arg(short = 'E')]
    subvolid: Option<u64>,

    #[arg(short = 'p', long)]
    progress: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum CheckMode {
    Original,
    Lowmem,
}

#[derive(Clone, Copy, ValueEnum)]
enum ClearSpaceCache {
    V1,
    V2,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let config = CheckConfig {
        superblock_mirror: cli.superblock_mirror,
        use_backup_root: cli.use_backup_root,
        root_bytenr: cli.root_bytenr,
        chunk_root_bytenr: cli.chunk_root_bytenr,
        readonly: cli.readonly,
        repair: cli.repair,
        force: cli.force,
        mode: match cli.mode {
            CheckMode::Original => LibCheckMode::Original,
            CheckMode::Lowmem => LibCheckMode::Lowmem,
        },
        init_csum_tree: cli.init_csum_tree,
        init_extent_tree: cli.init_extent_tree,
        check_data_csum: cli.check_data_csum,
        clear_space_cache: cli.clear_space_cache.map(|m| match m {
            ClearSpaceCache::V1 => LibClearSpaceCache::V1,
            ClearSpaceCache::V2 => LibClearSpaceCache::V2,
        }),
        clear_ino_cache: cli.clear_ino_cache,
        qgroup_report: cli.qgroup_report,
        subvolid: cli.subvolid,
        progress: cli.progress,
    };
    config.validate()?;

    if config.repair && !config.force {
        print_repair_countdown();
    }

    let manifest = fsforge_cli::load_manifest(&cli.device)?;
    let store = fsforge_cli::build_store(&manifest)?;
    let ctx = fsforge_cli::build_context(&manifest, config.repair, config.readonly, config.force, config.check_data_csum);

    let orchestrator = Orchestrator::new(&ctx, &store, config.clone());

    let chunk_map;
    let io;
    let outcome = if config.check_data_csum {
        chunk_map = fsforge_cli::build_chunk_map(&manifest);
        io = fsforge_cli::open_devices(&manifest, config.readonly)?;
        orchestrator.with_data_csum_check(&chunk_map, &io).run()?
    } else {
        orchestrator.run()?
    };

    match &outcome {
        RunOutcome::Cleared => println!("cache cleared"),
        RunOutcome::QuotaOnly(report) | RunOutcome::Checked(report) => {
            for finding in &report.findings {
                println!("{finding}");
            }
            println!("{}", report.summary_line());
        }
    }

    std::process::exit(outcome.exit_code());
}

/// "`--repair` prints a 10-second countdown prompt unless
/// `--force`".
fn print_repair_countdown() {
    print!("starting repair in ");
    std::io::stdout().flush().ok();
    for remaining in (1..=10).rev() {
        print!("{remaining}... ");
        std::io::stdout().flush().ok();
        std::thread::sleep(Duration::from_secs(1));
    }
    println!();
}
