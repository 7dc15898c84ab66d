//! CLI argument parsing using clap
//!
//! Options left unset fall back to the config file, then to defaults.

use clap::Parser;
use std::path::PathBuf;

/// fanread - parallel read dispatch benchmark
#[derive(Parser, Debug)]
#[command(name = "fanread")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// File to read
    #[arg(value_name = "PATH")]
    pub path: PathBuf,

    /// TOML configuration file
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    // === Dispatch Options ===
    /// Number of worker threads (sub-reads per request)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Requests in flight before callers block
    #[arg(long)]
    pub max_in_flight: Option<usize>,

    /// CPU cores to pin workers to (e.g., "0-3", "0,2,4")
    #[arg(long)]
    pub cpu_cores: Option<String>,

    /// Per-read deadline (e.g., "500ms", "2s")
    #[arg(long)]
    pub timeout: Option<String>,

    // === Workload Options ===
    /// Bytes per read (e.g., 4k, 1M)
    #[arg(short = 'b', long)]
    pub block_size: Option<String>,

    /// Total bytes to read (e.g., 10G); defaults to the file size
    #[arg(long)]
    pub total_bytes: Option<String>,

    /// Use random block-aligned offsets instead of sequential
    #[arg(long)]
    pub random: bool,

    /// Seed for random offsets
    #[arg(long)]
    pub seed: Option<u64>,

    /// Threads issuing reads concurrently
    #[arg(long)]
    pub callers: Option<usize>,

    /// Verify every block against a plain pread
    #[arg(long)]
    pub verify: bool,

    /// Open the file with O_DIRECT
    #[arg(long)]
    pub direct: bool,

    // === Output Options ===
    /// Print the summary as JSON
    #[arg(long)]
    pub json: bool,

    /// Log filter (trace, debug, info, warn, error)
    #[arg(long, env = "FANREAD_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Directory for the trace log file
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Reject values that are wrong regardless of the config file
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.workers == Some(0) {
            anyhow::bail!("--workers must be at least 1");
        }
        if self.max_in_flight == Some(0) {
            anyhow::bail!("--max-in-flight must be at least 1");
        }
        if self.callers == Some(0) {
            anyhow::bail!("--callers must be at least 1");
        }
        Ok(())
    }
}
