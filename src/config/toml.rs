//! TOML configuration file parsing

use super::cli::Cli;
use super::cli_convert::{parse_duration, parse_size};
use super::Config;
use crate::worker::affinity::parse_cpu_list;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Parse TOML configuration file
pub fn parse_toml_file(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_toml_string(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Parse TOML configuration from string
pub fn parse_toml_string(contents: &str) -> Result<Config> {
    let config: Config =
        ::toml::from_str(contents).context("Failed to parse TOML configuration")?;

    Ok(config)
}

/// Build the effective configuration: file (if any), then CLI overrides
pub fn load_config(cli: &Cli) -> Result<Config> {
    let config = match &cli.config {
        Some(path) => parse_toml_file(path)?,
        None => Config::default(),
    };
    merge_cli_with_config(cli, config)
}

/// Merge CLI arguments with TOML configuration (CLI takes precedence)
pub fn merge_cli_with_config(cli: &Cli, mut config: Config) -> Result<Config> {
    // Dispatch
    if let Some(workers) = cli.workers {
        config.dispatch.workers = workers;
    }
    if let Some(max_in_flight) = cli.max_in_flight {
        config.dispatch.max_in_flight = max_in_flight;
    }
    if let Some(cores) = &cli.cpu_cores {
        config.dispatch.cpu_cores =
            Some(parse_cpu_list(cores).context("Invalid --cpu-cores")?);
    }
    if let Some(timeout) = &cli.timeout {
        let timeout = parse_duration(timeout).context("Invalid --timeout")?;
        config.dispatch.read_timeout_ms = Some(timeout.as_millis().max(1) as u64);
    }

    // Workload
    if let Some(block_size) = &cli.block_size {
        config.bench.block_size = parse_size(block_size).context("Invalid --block-size")?;
    }
    if let Some(total) = &cli.total_bytes {
        config.bench.total_bytes = Some(parse_size(total).context("Invalid --total-bytes")?);
    }
    if let Some(callers) = cli.callers {
        config.bench.callers = callers;
    }
    if cli.seed.is_some() {
        config.bench.seed = cli.seed;
    }
    if cli.random {
        config.bench.random = true;
    }
    if cli.verify {
        config.bench.verify = true;
    }
    if cli.direct {
        config.bench.direct = true;
    }
    if cli.json {
        config.bench.json = true;
    }

    // Logging
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if let Some(dir) = &cli.log_dir {
        config.logging.log_dir = Some(dir.clone());
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_parse_empty_config() {
        assert_eq!(parse_toml_string("").unwrap(), Config::default());
    }

    #[test]
    fn test_parse_full_config() {
        let config = parse_toml_string(
            r#"
            [dispatch]
            workers = 8
            max_in_flight = 16
            cpu_cores = [0, 2]
            read_timeout_ms = 1500

            [logging]
            level = "debug"

            [bench]
            block_size = 65536
            random = true
            callers = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.dispatch.workers, 8);
        assert_eq!(config.dispatch.max_in_flight, 16);
        assert_eq!(config.dispatch.cpu_cores, Some(vec![0, 2]));
        assert_eq!(config.dispatch.read_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.bench.block_size, 65536);
        assert!(config.bench.random);
        assert_eq!(config.bench.callers, 3);
    }

    #[test]
    fn test_parse_rejects_unknown_types() {
        assert!(parse_toml_string("[dispatch]\nworkers = \"many\"").is_err());
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[dispatch]\nworkers = 8\nmax_in_flight = 16\n[bench]\nblock_size = 4096").unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let cli = Cli::try_parse_from([
            "fanread", "-c", path.as_str(), "-w", "3", "-b", "8k", "--timeout", "2s", "--cpu-cores", "1-2",
            "/tmp/data",
        ])
        .unwrap();
        let config = load_config(&cli).unwrap();

        assert_eq!(config.dispatch.workers, 3);
        assert_eq!(config.dispatch.max_in_flight, 16);
        assert_eq!(config.dispatch.cpu_cores, Some(vec![1, 2]));
        assert_eq!(config.dispatch.read_timeout_ms, Some(2000));
        assert_eq!(config.bench.block_size, 8192);
    }

    #[test]
    fn test_missing_config_file() {
        let cli = Cli::try_parse_from(["fanread", "-c", "/nonexistent/fanread.toml", "/tmp/data"])
            .unwrap();
        let err = load_config(&cli).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to read config file"));
    }
}
