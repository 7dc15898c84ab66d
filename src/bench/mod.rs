//! Read benchmark
//!
//! Drives a [`PassthroughFs`] with block-sized reads of one file from one or
//! more caller threads and collects what the `fanread` binary reports:
//! request and byte counts, short reads, errors, end-to-end latency
//! percentiles and the dispatcher's own counters.
//!
//! Offsets are block-aligned. A sequential run sweeps the file from the
//! start and wraps around; a random run picks blocks uniformly. Either way
//! the run stops once `total_bytes` worth of requests have been issued.
//!
//! With `verify` set, every block is read a second time with a plain
//! single-threaded `pread` and the two results are compared byte for byte.

use crate::config::BenchConfig;
use crate::engine::sync::SyncEngine;
use crate::engine::ReadEngine;
use crate::fs::PassthroughFs;
use crate::stats::histogram::{LatencyHistogram, LatencySummary};
use crate::stats::DispatchSnapshot;
use crate::util::buffer::{AlignedBuffer, DIRECT_ALIGNMENT};
use crate::Result;
use anyhow::Context;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::io;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Instant;

/// Outcome of a benchmark run
#[derive(Debug, Clone, Serialize)]
pub struct BenchReport {
    pub path: PathBuf,
    pub file_size: u64,
    pub workers: usize,
    pub callers: usize,
    pub block_size: u64,
    pub random: bool,
    pub direct: bool,
    pub requests: u64,
    pub bytes_read: u64,
    pub short_reads: u64,
    pub errors: u64,
    /// First error seen, as an OS error code
    pub first_errno: Option<i32>,
    pub verified: u64,
    pub verify_failures: u64,
    pub elapsed_secs: f64,
    pub iops: f64,
    pub throughput_bytes_per_sec: f64,
    pub latency: LatencySummary,
    pub dispatch: DispatchSnapshot,
}

/// Shared state of one run
struct Run<'a> {
    fs: &'a PassthroughFs,
    path: &'a Path,
    fd: RawFd,
    config: &'a BenchConfig,
    block: usize,
    total: u64,
    /// Blocks covering the file, the last one possibly partial
    blocks_in_file: u64,
    issued: AtomicU64,
    cursor: AtomicU64,
}

/// Per-caller tallies, merged at the end
struct CallerTally {
    requests: u64,
    bytes_read: u64,
    short_reads: u64,
    errors: u64,
    first_errno: Option<i32>,
    verified: u64,
    verify_failures: u64,
    latency: LatencyHistogram,
}

impl CallerTally {
    fn new() -> Result<Self> {
        Ok(Self {
            requests: 0,
            bytes_read: 0,
            short_reads: 0,
            errors: 0,
            first_errno: None,
            verified: 0,
            verify_failures: 0,
            latency: LatencyHistogram::new()?,
        })
    }

    fn merge(&mut self, other: CallerTally) -> Result<()> {
        self.requests += other.requests;
        self.bytes_read += other.bytes_read;
        self.short_reads += other.short_reads;
        self.errors += other.errors;
        self.first_errno = self.first_errno.or(other.first_errno);
        self.verified += other.verified;
        self.verify_failures += other.verify_failures;
        self.latency.merge(&other.latency)
    }
}

/// Closes the benchmark's file handle on every exit path
struct Handle<'a> {
    fs: &'a PassthroughFs,
    fd: RawFd,
}

impl Drop for Handle<'_> {
    fn drop(&mut self) {
        let rc = self.fs.release(self.fd);
        if rc < 0 {
            tracing::warn!(fd = self.fd, errno = -rc, "failed to close benchmark file");
        }
    }
}

/// Run the benchmark described by `config` against `path`
pub fn run(fs: &PassthroughFs, path: &Path, config: &BenchConfig) -> Result<BenchReport> {
    let file_size = std::fs::metadata(path)
        .with_context(|| format!("Failed to stat {}", path.display()))?
        .len();
    let total = config.total_bytes.unwrap_or(file_size);
    anyhow::ensure!(file_size > 0, "{} is empty, nothing to read", path.display());
    anyhow::ensure!(total > 0, "total_bytes must be greater than 0");

    let block = usize::try_from(config.block_size).context("block_size does not fit in memory")?;
    let mut flags = libc::O_RDONLY;
    if config.direct {
        flags |= libc::O_DIRECT;
    }
    let fh = fs.open(path, flags);
    if fh < 0 {
        return Err(io::Error::from_raw_os_error(-fh as i32))
            .with_context(|| format!("Failed to open {}", path.display()));
    }
    let handle = Handle { fs, fd: fh as RawFd };

    let run = Run {
        fs,
        path,
        fd: handle.fd,
        config,
        block,
        total,
        blocks_in_file: file_size.div_ceil(config.block_size),
        issued: AtomicU64::new(0),
        cursor: AtomicU64::new(0),
    };

    tracing::info!(
        path = %path.display(),
        file_size,
        total,
        block_size = config.block_size,
        callers = config.callers,
        random = config.random,
        "benchmark started"
    );

    let start = Instant::now();
    let tallies: Vec<Result<CallerTally>> = thread::scope(|s| {
        let handles: Vec<_> = (0..config.callers)
            .map(|caller| {
                let run = &run;
                thread::Builder::new()
                    .name(format!("fanread-caller-{}", caller))
                    .spawn_scoped(s, move || run.caller(caller))
            })
            .collect();

        handles
            .into_iter()
            .map(|spawned| -> Result<CallerTally> {
                let handle = spawned.context("Failed to spawn caller thread")?;
                handle
                    .join()
                    .map_err(|_| anyhow::anyhow!("caller thread panicked"))?
            })
            .collect()
    });
    let elapsed = start.elapsed();
    drop(handle);

    let mut tally = CallerTally::new()?;
    for caller in tallies {
        tally.merge(caller?)?;
    }

    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    let report = BenchReport {
        path: path.to_path_buf(),
        file_size,
        workers: fs.dispatcher().worker_count(),
        callers: config.callers,
        block_size: config.block_size,
        random: config.random,
        direct: config.direct,
        requests: tally.requests,
        bytes_read: tally.bytes_read,
        short_reads: tally.short_reads,
        errors: tally.errors,
        first_errno: tally.first_errno,
        verified: tally.verified,
        verify_failures: tally.verify_failures,
        elapsed_secs: elapsed.as_secs_f64(),
        iops: tally.requests as f64 / secs,
        throughput_bytes_per_sec: tally.bytes_read as f64 / secs,
        latency: tally.latency.summary(),
        dispatch: fs.dispatcher().stats(),
    };

    tracing::info!(
        requests = report.requests,
        bytes_read = report.bytes_read,
        errors = report.errors,
        elapsed_ms = elapsed.as_millis() as u64,
        "benchmark finished"
    );
    Ok(report)
}

impl Run<'_> {
    /// Claim the next request, or None once the byte budget is used up
    fn next_offset(&self, rng: &mut StdRng) -> Option<u64> {
        let block = self.block as u64;
        if self.issued.fetch_add(block, Ordering::Relaxed) >= self.total {
            return None;
        }
        let index = if self.config.random {
            rng.gen_range(0..self.blocks_in_file)
        } else {
            self.cursor.fetch_add(1, Ordering::Relaxed) % self.blocks_in_file
        };
        Some(index * block)
    }

    fn caller(&self, caller: usize) -> Result<CallerTally> {
        let mut buf = AlignedBuffer::new(self.block, DIRECT_ALIGNMENT)?;
        let mut expected = if self.config.verify {
            Some(AlignedBuffer::new(self.block, DIRECT_ALIGNMENT)?)
        } else {
            None
        };
        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(caller as u64)),
            None => StdRng::from_entropy(),
        };
        let mut tally = CallerTally::new()?;

        while let Some(offset) = self.next_offset(&mut rng) {
            let started = Instant::now();
            let n = self.fs.read(self.path, Some(self.fd), buf.as_mut_slice(), offset as i64);
            tally.latency.record(started.elapsed());
            tally.requests += 1;

            if n < 0 {
                let errno = -n as i32;
                tally.errors += 1;
                tally.first_errno.get_or_insert(errno);
                tracing::warn!(caller, offset, errno, "benchmark read failed");
                continue;
            }

            let n = n as usize;
            tally.bytes_read += n as u64;
            if n < self.block {
                tally.short_reads += 1;
            }

            if let Some(expected) = expected.as_mut() {
                tally.verified += 1;
                if !self.matches_plain_read(&buf.as_slice()[..n], expected, offset) {
                    tally.verify_failures += 1;
                    tracing::warn!(caller, offset, len = n, "block differs from plain read");
                }
            }
        }

        Ok(tally)
    }

    fn matches_plain_read(&self, got: &[u8], expected: &mut AlignedBuffer, offset: u64) -> bool {
        match SyncEngine::new().read_at(self.fd, expected.as_mut_slice(), offset) {
            Ok(n) => n == got.len() && &expected.as_slice()[..n] == got,
            Err(e) => {
                tracing::warn!(offset, error = %e, "verification read failed");
                false
            }
        }
    }
}
