//! Configuration module
//!
//! Handles CLI argument parsing, TOML configuration files, and validation.
//!
//! A configuration has three sections: `[dispatch]` sizes the worker pool
//! and the completion tracker, `[logging]` controls the subscriber, and
//! `[bench]` describes the read workload of the `fanread` binary. Every
//! field has a default, so an empty file is a valid configuration.
//!
//! ```toml
//! [dispatch]
//! workers = 4
//! max_in_flight = 64
//! cpu_cores = [0, 1, 2, 3]
//! read_timeout_ms = 5000
//!
//! [logging]
//! level = "info"
//! log_dir = "/var/log/fanread"
//!
//! [bench]
//! block_size = 1048576
//! random = true
//! ```

pub mod cli;
pub mod cli_convert;
pub mod toml;
pub mod validator;

use crate::logging::LogConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Complete configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub logging: LogConfig,
    #[serde(default)]
    pub bench: BenchConfig,
}

/// Worker pool and tracker sizing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Number of worker threads, and of sub-reads per request
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Requests that may be in flight at once before callers block
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// CPU cores to pin workers to, cycled when shorter than `workers`
    #[serde(default)]
    pub cpu_cores: Option<Vec<usize>>,
    /// Default per-read deadline in milliseconds
    #[serde(default)]
    pub read_timeout_ms: Option<u64>,
}

fn default_workers() -> usize {
    2
}

fn default_max_in_flight() -> usize {
    64
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_in_flight: default_max_in_flight(),
            cpu_cores: None,
            read_timeout_ms: None,
        }
    }
}

impl DispatchConfig {
    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_ms.map(Duration::from_millis)
    }
}

/// Read workload driven by the `fanread` binary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenchConfig {
    /// Bytes per dispatched read
    #[serde(default = "default_block_size")]
    pub block_size: u64,
    /// Bytes to read in total; the file size when unset
    #[serde(default)]
    pub total_bytes: Option<u64>,
    /// Block-aligned random offsets instead of a sequential sweep
    #[serde(default)]
    pub random: bool,
    /// Seed for random offsets
    #[serde(default)]
    pub seed: Option<u64>,
    /// Threads issuing reads concurrently through the same dispatcher
    #[serde(default = "default_callers")]
    pub callers: usize,
    /// Compare every block with a plain single-threaded read
    #[serde(default)]
    pub verify: bool,
    /// Open with O_DIRECT and use aligned buffers
    #[serde(default)]
    pub direct: bool,
    /// Print the summary as JSON
    #[serde(default)]
    pub json: bool,
}

fn default_block_size() -> u64 {
    1024 * 1024
}

fn default_callers() -> usize {
    1
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            total_bytes: None,
            random: false,
            seed: None,
            callers: default_callers(),
            verify: false,
            direct: false,
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.dispatch.workers, 2);
        assert_eq!(config.dispatch.max_in_flight, 64);
        assert_eq!(config.dispatch.read_timeout(), None);
        assert_eq!(config.bench.block_size, 1024 * 1024);
        assert_eq!(config.bench.callers, 1);
    }

    #[test]
    fn test_read_timeout() {
        let dispatch = DispatchConfig {
            read_timeout_ms: Some(250),
            ..Default::default()
        };
        assert_eq!(dispatch.read_timeout(), Some(Duration::from_millis(250)));
    }
}
