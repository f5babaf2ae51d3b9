#![forbid(unsafe_code)]
//! `fbs` — the FrankenBees crawler daemon.
//!
//! Runs the subvolume crawl against a mounted btrfs filesystem. The
//! bundled scan context only enumerates candidate ranges; the content
//! hashing and dedupe stages plug in behind `ScanContext`.

use anyhow::{Context as _, Result, bail};
use clap::{Parser, Subcommand};
use fbs_btrfs::kernel::KernelFs;
use fbs_btrfs::{Fd, FileOps, MetaSearch};
use fbs_crawl::context::ScanContext;
use fbs_crawl::counters::Counters;
use fbs_crawl::store::{CrawlStateStore, DirtyGen};
use fbs_crawl::{Config, Roots, ScanModeKind};
use fbs_task::TaskPool;
use fbs_types::{FileId, FileRange};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "fbs", about = "FrankenBees — btrfs dedupe crawler daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Crawl a mounted filesystem and enumerate dedupe candidates.
    Run {
        /// Mountpoint of the filesystem to crawl.
        root: PathBuf,
        /// State directory (default: <root>/.beeshome).
        #[arg(long, env = "BEESHOME")]
        home: Option<PathBuf>,
        /// Extent ordering policy.
        #[arg(long, env = "SCAN_MODE", default_value = "independent")]
        scan_mode: ScanModeKind,
        /// Hide read-only subvolumes from the scanner.
        #[arg(long, env = "WORKAROUND_BTRFS_SEND")]
        workaround_btrfs_send: bool,
        /// Floor on the transid polling period, in seconds.
        #[arg(long, env = "BEES_TRANSID_POLL_INTERVAL", default_value_t = 30)]
        transid_poll_interval: u64,
        /// Crawl state flush period, in seconds.
        #[arg(long, env = "BEES_WRITEBACK_INTERVAL", default_value_t = 900)]
        writeback_interval: u64,
        /// Worker threads (0 = one per CPU).
        #[arg(long, default_value_t = 0)]
        threads: usize,
    },
    /// Parse a crawl state file and print it as JSON.
    CheckState {
        /// State directory containing beescrawl.dat.
        home: PathBuf,
    },
}

// ── Dry-run scan context ────────────────────────────────────────────────────

/// Logs every candidate range instead of deduplicating it.
struct EnumerateContext {
    counters: Arc<Counters>,
}

impl ScanContext for EnumerateContext {
    fn scan_forward(&self, range: &FileRange) -> fbs_error::Result<bool> {
        info!(%range, length = range.len(), "dedupe candidate");
        self.counters.bump("scan_candidate");
        Ok(false)
    }

    fn is_blacklisted(&self, _fid: FileId) -> bool {
        false
    }
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match Cli::parse().command {
        Command::Run {
            root,
            home,
            scan_mode,
            workaround_btrfs_send,
            transid_poll_interval,
            writeback_interval,
            threads,
        } => run_daemon(
            &root,
            home,
            Config {
                scan_mode,
                workaround_btrfs_send,
                transid_poll_interval: Duration::from_secs(transid_poll_interval.max(1)),
                writeback_interval: Duration::from_secs(writeback_interval.max(1)),
                task_threads: threads,
            },
        ),
        Command::CheckState { home } => check_state(&home),
    }
}

fn run_daemon(root: &PathBuf, home: Option<PathBuf>, mut config: Config) -> Result<()> {
    if !root.is_dir() {
        bail!("{} is not a directory", root.display());
    }
    if config.task_threads == 0 {
        config.task_threads = Config::default().task_threads;
    }
    let home = home.unwrap_or_else(|| root.join(".beeshome"));
    std::fs::create_dir_all(&home)
        .with_context(|| format!("creating state directory {}", home.display()))?;

    let root_file = std::fs::File::open(root)
        .with_context(|| format!("opening filesystem root {}", root.display()))?;
    let kernel = Arc::new(
        KernelFs::new(Fd::from(root_file)).context("probing filesystem root")?,
    );

    let counters = Arc::new(Counters::new());
    let pool = Arc::new(TaskPool::new(config.task_threads));
    let ctx = Arc::new(EnumerateContext {
        counters: Arc::clone(&counters),
    });

    info!(
        root = %root.display(),
        home = %home.display(),
        mode = %config.scan_mode,
        threads = config.task_threads,
        "starting crawl"
    );

    let roots = Roots::new(
        &config,
        Arc::clone(&kernel) as Arc<dyn MetaSearch>,
        kernel as Arc<dyn FileOps>,
        ctx,
        Arc::clone(&counters),
        Arc::clone(&pool),
        kernel_root_fd(root)?,
        home,
    );
    roots.start();

    let stop = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&stop))
            .context("registering signal handler")?;
    }
    while !stop.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(200));
    }

    info!("signal received, shutting down");
    roots.stop_request();
    roots.stop_wait();
    pool.shutdown();

    println!(
        "{}",
        serde_json::to_string_pretty(&counters.snapshot()).context("serializing counters")?
    );
    Ok(())
}

/// A second independent FD on the root directory, for the resolver.
fn kernel_root_fd(root: &PathBuf) -> Result<Fd> {
    let file = std::fs::File::open(root)
        .with_context(|| format!("opening filesystem root {}", root.display()))?;
    Ok(Fd::from(file))
}

fn check_state(home: &PathBuf) -> Result<()> {
    let counters = Arc::new(Counters::new());
    let store = CrawlStateStore::new(home.clone(), Arc::new(DirtyGen::new()), counters);
    let states = store.load().context("loading crawl state")?;
    println!(
        "{}",
        serde_json::to_string_pretty(&states).context("serializing crawl state")?
    );
    Ok(())
}
