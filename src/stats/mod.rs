//! Statistics collection
//!
//! Lock-free dispatcher counters and latency histograms.
//!
//! Workers and callers update [`DispatchStats`] concurrently without taking
//! any lock: every counter is an atomic on its own cache line, so a worker
//! bumping `sub_tasks` never invalidates the line a caller is bumping
//! `requests` on. Reading the counters produces a [`DispatchSnapshot`] that
//! can be printed or serialized.

pub mod histogram;

use crate::dispatch::{DispatchError, ReadOutcome};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Cache-line aligned atomic counter to prevent false sharing
///
/// ```text
/// [value: 8 bytes][padding: 56 bytes] = 64 bytes total
/// ```
#[repr(align(64))]
#[derive(Debug)]
pub struct AlignedCounter {
    value: AtomicU64,
    _padding: [u8; 56],
}

impl AlignedCounter {
    /// Create a new counter with initial value 0
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
            _padding: [0; 56],
        }
    }

    /// Increment the counter
    ///
    /// Relaxed: no ordering is needed between different counters.
    #[inline]
    pub fn add(&self, val: u64) {
        self.value.fetch_add(val, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Default for AlignedCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters shared by a dispatcher and its workers
#[derive(Debug, Default)]
pub struct DispatchStats {
    // Per request, updated by callers
    pub requests: AlignedCounter,
    pub bytes_requested: AlignedCounter,
    pub bytes_read: AlignedCounter,
    pub short_reads: AlignedCounter,
    pub errors: AlignedCounter,
    pub cancellations: AlignedCounter,
    pub timeouts: AlignedCounter,

    // Per sub-task, updated by workers
    pub sub_tasks: AlignedCounter,
    pub sub_tasks_skipped: AlignedCounter,
    pub sub_task_errors: AlignedCounter,
}

/// Point-in-time copy of [`DispatchStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSnapshot {
    pub requests: u64,
    pub bytes_requested: u64,
    pub bytes_read: u64,
    pub short_reads: u64,
    pub errors: u64,
    pub cancellations: u64,
    pub timeouts: u64,
    pub sub_tasks: u64,
    pub skipped_sub_tasks: u64,
    pub sub_task_errors: u64,
    /// Requests holding a tracker slot right now
    pub in_flight: usize,
}

impl DispatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for the final result of one request
    pub fn record_result(&self, result: &Result<ReadOutcome, DispatchError>) {
        match result {
            Ok(outcome) => {
                self.bytes_read.add(outcome.bytes_read as u64);
                if outcome.is_short() {
                    self.short_reads.add(1);
                }
            }
            Err(DispatchError::Cancelled) => self.cancellations.add(1),
            Err(DispatchError::TimedOut) => self.timeouts.add(1),
            Err(_) => self.errors.add(1),
        }
    }

    pub fn snapshot(&self, in_flight: usize) -> DispatchSnapshot {
        DispatchSnapshot {
            requests: self.requests.get(),
            bytes_requested: self.bytes_requested.get(),
            bytes_read: self.bytes_read.get(),
            short_reads: self.short_reads.get(),
            errors: self.errors.get(),
            cancellations: self.cancellations.get(),
            timeouts: self.timeouts.get(),
            sub_tasks: self.sub_tasks.get(),
            skipped_sub_tasks: self.sub_tasks_skipped.get(),
            sub_task_errors: self.sub_task_errors.get(),
            in_flight,
        }
    }
}
