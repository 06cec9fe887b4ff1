mod cli;
mod commands;

use std::num::NonZeroU32;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::debug;

use crate::cli::{ConflictMode, SidecarMode};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// URL to download
    #[arg(index = 1)]
    url: String,

    /// Directory to save the downloaded file
    #[arg(short = 'd', long = "download-dir", default_value = "downloads")]
    download_dir: PathBuf,

    /// Segment size in bytes
    #[arg(short = 's', long = "segment-size", default_value_t = segdl::config::DEFAULT_SEGMENT_SIZE)]
    segment_size: u64,

    /// Maximum number of segments fetched at once (defaults to number of logical CPUs)
    #[arg(short = 'c', long)]
    concurrency: Option<usize>,

    /// Maximum number of download attempts
    #[arg(short = 'm', long = "max-attempts", default_value_t = segdl::config::DEFAULT_MAX_ATTEMPTS)]
    max_attempts: u32,

    /// Seconds to wait between attempts
    #[arg(long = "retry-delay", default_value_t = 1)]
    retry_delay: u64,

    /// Global rate limit in bytes per second (e.g., 1048576 for 1MB/s)
    #[arg(short = 'r', long)]
    rate_limit: Option<NonZeroU32>,

    /// Overall timeout for each request, in seconds
    #[arg(long = "request-timeout")]
    request_timeout: Option<u64>,

    /// Do not show progress
    #[arg(long = "no-progress")]
    no_progress: bool,

    /// Keep or remove the resume sidecar once the download completes
    #[arg(long = "sidecar", value_enum, default_value = "remove")]
    sidecar: SidecarMode,

    /// Which plan wins when a stored sidecar used a different segment size
    #[arg(long = "on-conflict", value_enum, default_value = "stored")]
    on_conflict: ConflictMode,

    /// Print the state of an existing sidecar for this URL and exit
    #[arg(long)]
    status: bool,

    /// More logging (-v debug, -vv trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short = 'q', long)]
    quiet: bool,
}

fn main() -> Result<()> {
    let mut args = Args::parse();

    // RUST_LOG wins over -q / -v.
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // Output dir might not exist yet, so we resolve it relative to current dir
    if args.download_dir.is_relative() {
        if let Ok(cwd) = std::env::current_dir() {
            args.download_dir = cwd.join(&args.download_dir);
        }
    }
    debug!(?args, "CLI arguments parsed");

    let rt = tokio::runtime::Runtime::new()?;
    if args.status {
        return rt.block_on(commands::show_status(&args.download_dir, &args.url));
    }

    let config = segdl::Config::default()
        .with_segment_size(args.segment_size)
        .with_concurrency(args.concurrency.unwrap_or_else(num_cpus::get))
        .with_max_attempts(args.max_attempts)
        .with_stats(!args.no_progress)
        .with_retry_delay(std::time::Duration::from_secs(args.retry_delay))
        .with_rate_limit(args.rate_limit)
        .with_reconcile(args.on_conflict.into())
        .with_sidecar(args.sidecar.into());
    let config = segdl::Config {
        request_timeout: args.request_timeout.map(std::time::Duration::from_secs),
        ..config
    };

    rt.block_on(commands::run_single_download(args.url, args.download_dir, config))
}
