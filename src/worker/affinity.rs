//! CPU affinity for read workers
//!
//! Pinning each worker to its own core keeps a sub-read's page-cache copy on
//! one CPU and stops the scheduler from migrating workers mid-request.
//!
//! # Platform Support
//!
//! CPU affinity is supported on Linux via `sched_setaffinity`. On other
//! platforms pinning returns an error and the worker runs unpinned.
//!
//! # Example
//!
//! ```no_run
//! use fanread::worker::affinity::{core_for_worker, parse_cpu_list, set_cpu_affinity};
//!
//! let cores = parse_cpu_list("0,2-4")?;
//! let core = core_for_worker(&cores, 1).unwrap();
//! set_cpu_affinity(&[core])?;
//! # Ok::<(), anyhow::Error>(())
//! ```

use crate::Result;
use anyhow::Context;

/// Set CPU affinity for the current thread
///
/// # Errors
///
/// Returns an error if the list is empty, a core ID is 1024 or above, or the
/// syscall fails (for example a core outside the process cpuset).
#[cfg(target_os = "linux")]
pub fn set_cpu_affinity(cores: &[usize]) -> Result<()> {
    use libc::{cpu_set_t, sched_setaffinity, CPU_SET, CPU_ZERO};
    use std::mem;

    if cores.is_empty() {
        anyhow::bail!("CPU core list cannot be empty");
    }

    unsafe {
        let mut cpu_set: cpu_set_t = mem::zeroed();
        CPU_ZERO(&mut cpu_set);

        for &core in cores {
            if core >= 1024 {
                anyhow::bail!("CPU core ID {} is too large (max 1023)", core);
            }
            CPU_SET(core, &mut cpu_set);
        }

        // 0 = current thread
        let result = sched_setaffinity(0, mem::size_of::<cpu_set_t>(), &cpu_set);

        if result != 0 {
            let err = std::io::Error::last_os_error();
            return Err(err).context(format!("Failed to set CPU affinity to cores {:?}", cores));
        }
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn set_cpu_affinity(_cores: &[usize]) -> Result<()> {
    anyhow::bail!("CPU affinity is only supported on Linux")
}

/// Cores the current thread is allowed to run on
#[cfg(target_os = "linux")]
pub fn current_cpu_affinity() -> Result<Vec<usize>> {
    use libc::{cpu_set_t, sched_getaffinity, CPU_ISSET, CPU_SETSIZE};
    use std::mem;

    unsafe {
        let mut cpu_set: cpu_set_t = mem::zeroed();
        if sched_getaffinity(0, mem::size_of::<cpu_set_t>(), &mut cpu_set) != 0 {
            let err = std::io::Error::last_os_error();
            return Err(err).context("Failed to read CPU affinity");
        }
        Ok((0..CPU_SETSIZE as usize)
            .filter(|&core| CPU_ISSET(core, &cpu_set))
            .collect())
    }
}

#[cfg(not(target_os = "linux"))]
pub fn current_cpu_affinity() -> Result<Vec<usize>> {
    anyhow::bail!("CPU affinity is only supported on Linux")
}

/// Pick the core for worker `worker_id`, cycling through `cores`
pub fn core_for_worker(cores: &[usize], worker_id: usize) -> Option<usize> {
    if cores.is_empty() {
        None
    } else {
        Some(cores[worker_id % cores.len()])
    }
}

/// Parse a comma-separated list of CPU cores or ranges
///
/// Supports formats like:
/// - "0,1,2,3" - Individual cores
/// - "0-3" - Range of cores
/// - "0,2-4,7" - Mixed individual and ranges
///
/// The result is sorted and deduplicated.
///
/// # Example
///
/// ```
/// use fanread::worker::affinity::parse_cpu_list;
///
/// let cores = parse_cpu_list("0,2-4,7").unwrap();
/// assert_eq!(cores, vec![0, 2, 3, 4, 7]);
/// ```
pub fn parse_cpu_list(list: &str) -> Result<Vec<usize>> {
    let mut cores = Vec::new();

    for part in list.split(',') {
        let part = part.trim();

        if part.contains('-') {
            let range_parts: Vec<&str> = part.split('-').collect();
            if range_parts.len() != 2 {
                anyhow::bail!("Invalid CPU range format: {}", part);
            }

            let start: usize = range_parts[0]
                .trim()
                .parse()
                .with_context(|| format!("Invalid CPU core number: {}", range_parts[0]))?;
            let end: usize = range_parts[1]
                .trim()
                .parse()
                .with_context(|| format!("Invalid CPU core number: {}", range_parts[1]))?;

            if start > end {
                anyhow::bail!("Invalid CPU range: start ({}) > end ({})", start, end);
            }

            cores.extend(start..=end);
        } else {
            let core: usize = part
                .parse()
                .with_context(|| format!("Invalid CPU core number: {}", part))?;
            cores.push(core);
        }
    }

    if cores.is_empty() {
        anyhow::bail!("CPU core list cannot be empty");
    }

    cores.sort_unstable();
    cores.dedup();

    Ok(cores)
}

/// Get the number of available CPU cores
pub fn num_cpus() -> usize {
    num_cpus::get()
}

/// Warn when more workers are configured than there are CPU cores
///
/// Returns true if the worker count exceeds the CPU count.
pub fn warn_if_oversubscribed(worker_count: usize) -> bool {
    let cpu_count = num_cpus();
    if worker_count > cpu_count {
        tracing::warn!(
            workers = worker_count,
            cpus = cpu_count,
            "worker count exceeds CPU count; sub-reads will contend for cores"
        );
        true
    } else {
        false
    }
}
