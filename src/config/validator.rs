//! Configuration validation

use super::*;
use crate::util::buffer::DIRECT_ALIGNMENT;
use crate::worker::affinity;
use anyhow::Result;

/// Validate complete configuration
pub fn validate_config(config: &Config) -> Result<()> {
    validate_dispatch(&config.dispatch)?;
    validate_bench(&config.bench, &config.dispatch)?;
    Ok(())
}

/// Validate worker pool and tracker sizing
pub fn validate_dispatch(dispatch: &DispatchConfig) -> Result<()> {
    if dispatch.workers == 0 {
        anyhow::bail!("dispatch.workers must be at least 1");
    }
    if dispatch.max_in_flight == 0 {
        anyhow::bail!("dispatch.max_in_flight must be at least 1");
    }
    if dispatch.read_timeout_ms == Some(0) {
        anyhow::bail!("dispatch.read_timeout_ms must be greater than 0");
    }

    if let Some(cores) = &dispatch.cpu_cores {
        if cores.is_empty() {
            anyhow::bail!("dispatch.cpu_cores cannot be empty");
        }
        let available = affinity::num_cpus();
        if let Some(&core) = cores.iter().find(|&&c| c >= available) {
            anyhow::bail!(
                "dispatch.cpu_cores contains core {} but only {} CPUs are available",
                core,
                available
            );
        }
    }

    // Warn if thread count is very high
    if dispatch.workers > 1024 {
        tracing::warn!(
            workers = dispatch.workers,
            "very high worker count; every read is split this many ways"
        );
    }
    affinity::warn_if_oversubscribed(dispatch.workers);

    Ok(())
}

/// Validate the benchmark workload against the pool it runs on
pub fn validate_bench(bench: &BenchConfig, dispatch: &DispatchConfig) -> Result<()> {
    if bench.block_size == 0 {
        anyhow::bail!("bench.block_size must be greater than 0");
    }
    if usize::try_from(bench.block_size).is_err() {
        anyhow::bail!("bench.block_size {} does not fit in memory", bench.block_size);
    }
    if bench.callers == 0 {
        anyhow::bail!("bench.callers must be at least 1");
    }

    if bench.direct {
        // Every partition must start and end on an aligned boundary
        let granule = (DIRECT_ALIGNMENT * dispatch.workers) as u64;
        if bench.block_size % granule != 0 {
            anyhow::bail!(
                "direct IO needs block_size to be a multiple of {} ({} workers x {} bytes), got {}",
                granule,
                dispatch.workers,
                DIRECT_ALIGNMENT,
                bench.block_size
            );
        }
    }

    if bench.block_size < dispatch.workers as u64 {
        tracing::warn!(
            block_size = bench.block_size,
            workers = dispatch.workers,
            "block size below worker count; some sub-reads will be empty"
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        validate_config(&Config::default()).unwrap();
    }

    #[test]
    fn test_zero_values_rejected() {
        let mut config = Config::default();
        config.dispatch.workers = 0;
        assert!(validate_config(&config).is_err());

        let mut config = Config::default();
        config.dispatch.max_in_flight = 0;
        assert!(validate_config(&config).is_err());

        let mut config = Config::default();
        config.bench.block_size = 0;
        assert!(validate_config(&config).is_err());

        let mut config = Config::default();
        config.dispatch.read_timeout_ms = Some(0);
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_cpu_cores_checked() {
        let mut config = Config::default();
        config.dispatch.cpu_cores = Some(vec![]);
        assert!(validate_config(&config).is_err());

        config.dispatch.cpu_cores = Some(vec![affinity::num_cpus() + 8]);
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("CPUs are available"));

        config.dispatch.cpu_cores = Some(vec![0]);
        validate_config(&config).unwrap();
    }

    #[test]
    fn test_direct_alignment() {
        let mut config = Config::default();
        config.bench.direct = true;
        config.dispatch.workers = 4;

        config.bench.block_size = 4 * 4096;
        validate_config(&config).unwrap();

        config.bench.block_size = 4096;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("multiple of 16384"));
    }
}
