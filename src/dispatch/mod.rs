//! Parallel read dispatch
//!
//! The [`Dispatcher`] turns one positioned read into N contiguous sub-reads,
//! one per worker, and blocks the calling thread until every sub-read has
//! reported. The caller sees a single result: the number of valid bytes at
//! the front of its buffer, or the error of the lowest-indexed failing
//! sub-read.
//!
//! # Flow
//!
//! 1. [`partition`](partition::partition) cuts the request into N ranges
//! 2. the [`CompletionTracker`] hands out a generation for the request
//! 3. one [`SubTask`](task::SubTask) per range goes to the matching worker
//! 4. the caller sleeps until the generation has N completions
//! 5. completions are folded into a [`ReadOutcome`] or a [`DispatchError`]
//!
//! # Example
//!
//! ```no_run
//! use fanread::config::DispatchConfig;
//! use fanread::dispatch::Dispatcher;
//! use fanread::engine::sync::SyncEngine;
//! use std::os::unix::io::AsRawFd;
//! use std::sync::Arc;
//!
//! let config = DispatchConfig { workers: 4, ..Default::default() };
//! let dispatcher = Dispatcher::new(config, Arc::new(SyncEngine::new()))?;
//!
//! let file = std::fs::File::open("/var/tmp/data.bin")?;
//! let mut buf = vec![0u8; 1 << 20];
//! let outcome = dispatcher.dispatch(file.as_raw_fd(), &mut buf, 0)?;
//! println!("read {} of {} bytes", outcome.bytes_read, outcome.requested);
//! # Ok::<(), anyhow::Error>(())
//! ```

mod error;
pub mod partition;
pub mod task;
pub mod tracker;

pub use error::{CancelReason, DispatchError};
pub use tracker::{CompletionTracker, Generation, GenerationReport, SubTaskStatus};

use crate::config::DispatchConfig;
use crate::engine::ReadEngine;
use crate::stats::{DispatchSnapshot, DispatchStats};
use crate::worker::affinity;
use crate::worker::Worker;
use crossbeam::channel::{bounded, SendError, Sender};
use partition::Partition;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use task::SubTask;
use tracker::lock;

/// Result of a successful dispatched read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Bytes asked for (the destination length)
    pub requested: usize,
    /// Valid bytes at the front of the destination
    pub bytes_read: usize,
}

impl ReadOutcome {
    /// Whether the read stopped early, typically at end-of-file
    pub fn is_short(&self) -> bool {
        self.bytes_read < self.requested
    }
}

/// Per-call options for [`Dispatcher::dispatch_with`]
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    deadline: Option<Instant>,
    timeout: Option<Duration>,
    cancel: Option<CancelToken>,
}

impl ReadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Give up waiting at `deadline`
    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Give up waiting `timeout` after the call starts
    ///
    /// Ignored when an absolute deadline is also set.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Abort the read when `token` is cancelled
    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn effective_deadline(&self, start: Instant, fallback: Option<Duration>) -> Option<Instant> {
        self.deadline
            .or_else(|| self.timeout.or(fallback).map(|t| start + t))
    }
}

/// Handle for cancelling reads from another thread
///
/// Clones share state. Once cancelled a token stays cancelled: every read
/// waiting on it and every later read using it fails with
/// [`DispatchError::Cancelled`].
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

#[derive(Default)]
struct TokenInner {
    cancelled: AtomicBool,
    next_watch: AtomicU64,
    watchers: Mutex<Vec<Watcher>>,
}

/// A read using a token: still waiting for a slot, or holding `generation`
struct Watcher {
    id: u64,
    tracker: Weak<CompletionTracker>,
    generation: Option<Generation>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel every read using this token
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let watchers = lock(&self.inner.watchers);
        for watcher in watchers.iter() {
            let Some(tracker) = watcher.tracker.upgrade() else {
                continue;
            };
            match watcher.generation {
                Some(generation) => {
                    tracker.cancel(generation, CancelReason::Requested);
                }
                None => tracker.wake_waiters(),
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Register a read that is about to claim a slot on `tracker`
    fn watch(&self, tracker: &Arc<CompletionTracker>) -> TokenWatch<'_> {
        let id = self.inner.next_watch.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.watchers).push(Watcher {
            id,
            tracker: Arc::downgrade(tracker),
            generation: None,
        });
        TokenWatch { token: self, id }
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Registration of one read with a token, removed on drop
struct TokenWatch<'a> {
    token: &'a CancelToken,
    id: u64,
}

impl TokenWatch<'_> {
    /// Point the registration at the generation the read was given
    fn attach(&self, tracker: &CompletionTracker, generation: Generation) {
        {
            let mut watchers = lock(&self.token.inner.watchers);
            if let Some(watcher) = watchers.iter_mut().find(|w| w.id == self.id) {
                watcher.generation = Some(generation);
            }
        }
        // A cancel racing with the update either sees the generation or we see the flag
        if self.token.is_cancelled() {
            tracker.cancel(generation, CancelReason::Requested);
        }
    }
}

impl Drop for TokenWatch<'_> {
    fn drop(&mut self) {
        lock(&self.token.inner.watchers).retain(|w| w.id != self.id);
    }
}

/// A generation whose sub-tasks may still reference the caller's buffer
///
/// Dropping it without [`wait`](Self::wait) (a panic between submit and
/// await) cancels the generation and still waits, so the buffer borrow
/// never ends while a worker can write to it.
struct PendingGeneration<'a> {
    tracker: &'a CompletionTracker,
    generation: Generation,
    armed: bool,
}

impl PendingGeneration<'_> {
    fn wait(mut self, deadline: Option<Instant>) -> Option<GenerationReport> {
        self.armed = false;
        self.tracker.await_completion(self.generation, deadline)
    }
}

impl Drop for PendingGeneration<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.tracker.cancel(self.generation, CancelReason::Requested);
            self.tracker.await_completion(self.generation, None);
        }
    }
}

/// Fan-out / fan-in read dispatcher over a fixed pool of workers
pub struct Dispatcher {
    config: DispatchConfig,
    /// One queue per worker; empty once shut down
    senders: RwLock<Vec<Sender<SubTask>>>,
    tracker: Arc<CompletionTracker>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<DispatchStats>,
}

impl Dispatcher {
    /// Start `config.workers` worker threads reading through `engine`
    pub fn new(config: DispatchConfig, engine: Arc<dyn ReadEngine>) -> crate::Result<Self> {
        anyhow::ensure!(config.workers > 0, "worker count must be at least 1");
        anyhow::ensure!(config.max_in_flight > 0, "max_in_flight must be at least 1");

        let tracker = Arc::new(CompletionTracker::new(config.max_in_flight));
        let stats = Arc::new(DispatchStats::new());
        let cores = config.cpu_cores.clone().unwrap_or_default();

        let mut senders = Vec::with_capacity(config.workers);
        let mut handles = Vec::with_capacity(config.workers);
        for id in 0..config.workers {
            // Never more than one task per in-flight generation per queue
            let (sender, receiver) = bounded(config.max_in_flight);
            let worker = Worker::new(id, receiver, Arc::clone(&engine), Arc::clone(&stats))
                .with_cpu_core(affinity::core_for_worker(&cores, id));
            match worker.spawn() {
                Ok(handle) => {
                    senders.push(sender);
                    handles.push(handle);
                }
                Err(e) => {
                    drop(senders);
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(e);
                }
            }
        }

        tracing::info!(
            workers = config.workers,
            max_in_flight = config.max_in_flight,
            engine = engine.name(),
            pinned = !cores.is_empty(),
            "read dispatcher started"
        );

        Ok(Self {
            config,
            senders: RwLock::new(senders),
            tracker,
            workers: Mutex::new(handles),
            stats,
        })
    }

    /// Number of workers, which is also the number of sub-reads per request
    pub fn worker_count(&self) -> usize {
        self.config.workers
    }

    /// Snapshot of the dispatcher counters
    pub fn stats(&self) -> DispatchSnapshot {
        self.stats.snapshot(self.tracker.in_flight())
    }

    /// Read `destination.len()` bytes from `fd` at `offset`
    ///
    /// Uses the configured default timeout, if any.
    pub fn dispatch(
        &self,
        fd: RawFd,
        destination: &mut [u8],
        offset: u64,
    ) -> Result<ReadOutcome, DispatchError> {
        self.dispatch_with(fd, destination, offset, &ReadOptions::default())
    }

    /// Read with a deadline and/or a cancellation token
    ///
    /// On deadline or cancellation the sub-reads still queued are skipped,
    /// but the call returns only after the ones already running finish.
    pub fn dispatch_with(
        &self,
        fd: RawFd,
        destination: &mut [u8],
        offset: u64,
        options: &ReadOptions,
    ) -> Result<ReadOutcome, DispatchError> {
        let requested = destination.len();
        check_range(offset, requested)?;
        if requested == 0 {
            return Ok(ReadOutcome {
                requested,
                bytes_read: 0,
            });
        }

        let start = Instant::now();
        self.stats.requests.add(1);
        self.stats.bytes_requested.add(requested as u64);

        let result = self.fan_out(fd, destination, offset, options, start);
        self.stats.record_result(&result);

        match &result {
            Ok(outcome) => tracing::debug!(
                fd,
                offset,
                requested,
                bytes_read = outcome.bytes_read,
                elapsed_us = start.elapsed().as_micros() as u64,
                "dispatched read complete"
            ),
            Err(e) => tracing::debug!(fd, offset, requested, error = %e, "dispatched read failed"),
        }
        result
    }

    fn fan_out(
        &self,
        fd: RawFd,
        destination: &mut [u8],
        offset: u64,
        options: &ReadOptions,
        start: Instant,
    ) -> Result<ReadOutcome, DispatchError> {
        let requested = destination.len();
        let deadline = options.effective_deadline(start, self.config.read_timeout());
        if options.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            return Err(DispatchError::Cancelled);
        }

        let senders = self.senders.read().unwrap_or_else(PoisonError::into_inner);
        if senders.is_empty() {
            return Err(DispatchError::Shutdown);
        }
        let parts = partition::partition(requested, offset, senders.len());

        // Registered before claiming a slot so a cancel can wake a full-arena wait
        let watch = options
            .cancel
            .as_ref()
            .map(|token| token.watch(&self.tracker));
        let generation = self.tracker.begin_cancellable(parts.len(), deadline, &|| {
            options.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
        })?;
        let pending = PendingGeneration {
            tracker: &self.tracker,
            generation,
            armed: true,
        };
        if let Some(watch) = &watch {
            watch.attach(&self.tracker, generation);
        }

        let base = destination.as_mut_ptr();
        for (part, sender) in parts.iter().zip(senders.iter()) {
            // SAFETY: partitions are disjoint and inside `destination`, which
            // stays mutably borrowed until `pending` has been awaited.
            let task = unsafe {
                SubTask::new(
                    fd,
                    part.offset,
                    part.index,
                    generation,
                    base.add(part.buffer_start),
                    part.len,
                    Arc::clone(&self.tracker),
                )
            };
            if let Err(SendError(task)) = sender.send(task) {
                // Worker gone; the dropped task reports itself cancelled
                tracing::warn!(%generation, index = part.index, "worker queue closed");
                drop(task);
            }
        }
        drop(senders);

        let report = pending.wait(deadline);
        drop(watch);

        match report {
            Some(report) => aggregate(report, &parts),
            None => Err(DispatchError::Shutdown),
        }
    }

    /// Stop all workers
    ///
    /// Outstanding reads are cancelled and fail with
    /// [`DispatchError::Shutdown`] once their running sub-reads finish.
    /// Later calls to `dispatch` fail the same way. Idempotent.
    pub fn shutdown(&self) {
        // Close first so a caller blocked on a full arena lets go of the queues
        self.tracker.close();
        let cancelled = self.tracker.cancel_all(CancelReason::Shutdown);

        let senders = std::mem::take(
            &mut *self.senders.write().unwrap_or_else(PoisonError::into_inner),
        );
        if senders.is_empty() {
            return;
        }
        drop(senders);

        let handles: Vec<_> = lock(&self.workers).drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("read worker exited with a panic");
            }
        }
        tracing::info!(cancelled, "read dispatcher stopped");
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("workers", &self.config.workers)
            .field("max_in_flight", &self.config.max_in_flight)
            .field("in_flight", &self.tracker.in_flight())
            .finish()
    }
}

/// Reject requests whose byte range cannot be expressed as a file offset
fn check_range(offset: u64, length: usize) -> Result<(), DispatchError> {
    let end = offset.checked_add(length as u64).ok_or_else(|| {
        DispatchError::InvalidRequest(format!("offset {} + length {} overflows", offset, length))
    })?;
    if end > i64::MAX as u64 {
        return Err(DispatchError::InvalidRequest(format!(
            "range end {} exceeds the largest file offset",
            end
        )));
    }
    Ok(())
}

/// Fold per-partition statuses into one result
///
/// A failed sub-read wins over everything, lowest index first; a sub-read
/// lost to a panic counts as failed. Otherwise a cancelled generation
/// reports why it was cancelled, and a sub-task dropped with its closed
/// queue means the dispatcher is shutting down. Otherwise the valid
/// prefix is summed in index order up to and including the first short
/// partition.
fn aggregate(report: GenerationReport, parts: &[Partition]) -> Result<ReadOutcome, DispatchError> {
    let requested = parts.iter().map(|p| p.len).sum();
    let mut bytes_read = 0usize;
    let mut prefix_ended = false;
    let mut skipped = false;

    for (index, status) in report.statuses.into_iter().enumerate() {
        match status {
            SubTaskStatus::Failed(source) => {
                return Err(DispatchError::Io {
                    index,
                    offset: parts[index].offset,
                    source,
                });
            }
            SubTaskStatus::Cancelled => skipped = true,
            SubTaskStatus::Complete(n) if !prefix_ended => bytes_read += n,
            SubTaskStatus::Short(n) if !prefix_ended => {
                bytes_read += n;
                prefix_ended = true;
            }
            SubTaskStatus::Complete(_) | SubTaskStatus::Short(_) => {}
        }
    }

    if let Some(reason) = report.cancelled {
        return Err(DispatchError::from_cancel(reason));
    }
    if skipped {
        // Dropped without a cancel request: the worker went away
        return Err(DispatchError::Shutdown);
    }

    Ok(ReadOutcome {
        requested,
        bytes_read,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockEngine;
    use crate::engine::sync::SyncEngine;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::thread;
    use tempfile::NamedTempFile;

    fn config(workers: usize) -> DispatchConfig {
        DispatchConfig {
            workers,
            ..Default::default()
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn temp_file(data: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(data).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_reads_whole_file_with_remainder() {
        let data = pattern(10_007);
        let file = temp_file(&data);
        let dispatcher = Dispatcher::new(config(3), Arc::new(SyncEngine::new())).unwrap();

        let mut buf = vec![0u8; data.len()];
        let outcome = dispatcher.dispatch(file.as_file().as_raw_fd(), &mut buf, 0).unwrap();

        assert_eq!(outcome.bytes_read, data.len());
        assert!(!outcome.is_short());
        assert_eq!(buf, data);
    }

    #[test]
    fn test_coverage_across_lengths_and_offsets() {
        let data = pattern(64 * 1024);
        let engine = MockEngine::with_data(data.clone());
        for workers in [1usize, 2, 3, 4, 7] {
            let dispatcher = Dispatcher::new(config(workers), Arc::new(engine.clone())).unwrap();
            for &length in &[1usize, 2, 5, 63, 4096, 4099, 10_000] {
                for &offset in &[0u64, 1, 777, 4096] {
                    let mut buf = vec![0xAAu8; length];
                    let outcome = dispatcher.dispatch(9, &mut buf, offset).unwrap();
                    let start = offset as usize;
                    assert_eq!(outcome.bytes_read, length);
                    assert_eq!(&buf[..], &data[start..start + length]);
                }
            }
        }
    }

    #[test]
    fn test_one_sub_read_per_worker() {
        let engine = MockEngine::with_data(pattern(8192));
        let dispatcher = Dispatcher::new(config(4), Arc::new(engine.clone())).unwrap();

        let mut buf = vec![0u8; 4099];
        dispatcher.dispatch(5, &mut buf, 100).unwrap();

        let mut ops = engine.submitted_operations();
        ops.sort_by_key(|op| op.offset);
        let shape: Vec<(u64, usize)> = ops.iter().map(|op| (op.offset, op.length)).collect();
        assert_eq!(shape, vec![(100, 1024), (1124, 1024), (2148, 1024), (3172, 1027)]);
    }

    #[test]
    fn test_short_read_at_end_of_file() {
        let data = pattern(2048);
        let file = temp_file(&data);
        for workers in [1usize, 2, 3, 4] {
            let dispatcher = Dispatcher::new(config(workers), Arc::new(SyncEngine::new())).unwrap();
            let mut buf = vec![0u8; 4096];
            let outcome = dispatcher.dispatch(file.as_file().as_raw_fd(), &mut buf, 0).unwrap();

            assert_eq!(outcome.bytes_read, 2048);
            assert!(outcome.is_short());
            assert_eq!(&buf[..2048], &data[..]);
        }
    }

    #[test]
    fn test_read_entirely_past_end() {
        let engine = MockEngine::with_data(pattern(100));
        let dispatcher = Dispatcher::new(config(2), Arc::new(engine)).unwrap();
        let mut buf = vec![0u8; 64];
        let outcome = dispatcher.dispatch(1, &mut buf, 1000).unwrap();
        assert_eq!(outcome.bytes_read, 0);
        assert_eq!(outcome.requested, 64);
    }

    #[test]
    fn test_zero_length_skips_workers() {
        let engine = MockEngine::with_data(pattern(100));
        let dispatcher = Dispatcher::new(config(2), Arc::new(engine.clone())).unwrap();
        let outcome = dispatcher.dispatch(1, &mut [], 10).unwrap();
        assert_eq!(outcome, ReadOutcome { requested: 0, bytes_read: 0 });
        assert_eq!(engine.submitted_count(), 0);
    }

    #[test]
    fn test_length_smaller_than_worker_count() {
        let engine = MockEngine::with_data(pattern(100));
        let dispatcher = Dispatcher::new(config(4), Arc::new(engine.clone())).unwrap();
        let mut buf = vec![0u8; 3];
        let outcome = dispatcher.dispatch(1, &mut buf, 10).unwrap();
        assert_eq!(outcome.bytes_read, 3);
        assert_eq!(buf, vec![10, 11, 12]);
        // Empty partitions never reach the engine
        assert_eq!(engine.submitted_count(), 1);
    }

    #[test]
    fn test_offset_overflow_rejected() {
        let engine = MockEngine::with_data(pattern(100));
        let dispatcher = Dispatcher::new(config(2), Arc::new(engine)).unwrap();
        let mut buf = vec![0u8; 16];

        let err = dispatcher.dispatch(1, &mut buf, u64::MAX - 4).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidRequest(_)));
        let err = dispatcher.dispatch(1, &mut buf, i64::MAX as u64).unwrap_err();
        assert_eq!(err.errno(), libc::EINVAL);
    }

    #[test]
    fn test_lowest_index_error_wins() {
        let engine = MockEngine::with_data(pattern(4096));
        // Partition 1 fails slowly, partition 3 fails fast
        engine.fail_range(1024..2048, libc::EIO);
        engine.delay_range(1024..2048, Duration::from_millis(50));
        engine.fail_range(3072..4096, libc::EBADF);
        let dispatcher = Dispatcher::new(config(4), Arc::new(engine.clone())).unwrap();

        let mut buf = vec![0u8; 4096];
        let err = dispatcher.dispatch(1, &mut buf, 0).unwrap_err();
        match err {
            DispatchError::Io { index, offset, source } => {
                assert_eq!(index, 1);
                assert_eq!(offset, 1024);
                assert_eq!(source.raw_os_error(), Some(libc::EIO));
            }
            other => panic!("expected Io error, got {:?}", other),
        }
        // Reported only after every sub-read ran
        assert_eq!(engine.submitted_count(), 4);
        assert_eq!(dispatcher.stats().errors, 1);
    }

    #[test]
    fn test_many_sequential_dispatches() {
        let data = pattern(16 * 1024);
        let engine = MockEngine::with_data(data.clone());
        let dispatcher = Dispatcher::new(config(4), Arc::new(engine)).unwrap();

        let mut buf = vec![0u8; 1000];
        for i in 0..10_000u64 {
            let offset = (i * 37) % 15_000;
            let outcome = dispatcher.dispatch(1, &mut buf, offset).unwrap();
            assert_eq!(outcome.bytes_read, 1000);
            assert_eq!(buf[0], data[offset as usize]);
        }

        let stats = dispatcher.stats();
        assert_eq!(stats.requests, 10_000);
        assert_eq!(stats.in_flight, 0);
    }

    #[test]
    fn test_concurrent_requests_stay_isolated() {
        let data = pattern(256 * 1024);
        let engine = MockEngine::with_data(data.clone());
        let dispatcher = Dispatcher::new(
            DispatchConfig {
                workers: 4,
                max_in_flight: 4,
                ..Default::default()
            },
            Arc::new(engine),
        )
        .unwrap();

        thread::scope(|s| {
            for caller in 0..8u64 {
                let dispatcher = &dispatcher;
                let data = &data;
                s.spawn(move || {
                    let mut buf = vec![0u8; 4099];
                    for round in 0..500u64 {
                        let offset = ((caller * 7919 + round * 104_729) % 250_000) as u64;
                        let outcome = dispatcher.dispatch(1, &mut buf, offset).unwrap();
                        assert_eq!(outcome.bytes_read, buf.len());
                        let start = offset as usize;
                        assert_eq!(&buf[..], &data[start..start + buf.len()]);
                    }
                });
            }
        });

        assert_eq!(dispatcher.stats().in_flight, 0);
    }

    #[test]
    fn test_sub_reads_run_in_parallel() {
        let engine = MockEngine::with_data(pattern(4096));
        engine.set_delay(Some(Duration::from_millis(50)));
        let dispatcher = Dispatcher::new(config(4), Arc::new(engine.clone())).unwrap();

        let mut buf = vec![0u8; 4096];
        dispatcher.dispatch(1, &mut buf, 0).unwrap();
        assert!(engine.peak_concurrency() >= 2);
    }

    #[test]
    fn test_timeout_waits_for_running_sub_reads() {
        let engine = MockEngine::with_data(pattern(4096));
        engine.set_delay(Some(Duration::from_millis(200)));
        let dispatcher = Dispatcher::new(config(2), Arc::new(engine.clone())).unwrap();

        let mut buf = vec![0u8; 4096];
        let start = Instant::now();
        let options = ReadOptions::new().timeout(Duration::from_millis(20));
        let err = dispatcher.dispatch_with(1, &mut buf, 0, &options).unwrap_err();

        assert!(matches!(err, DispatchError::TimedOut));
        assert!(start.elapsed() >= Duration::from_millis(150));
        assert_eq!(engine.submitted_count(), 2);
        assert_eq!(dispatcher.stats().timeouts, 1);

        engine.set_delay(None);
        assert_eq!(dispatcher.dispatch(1, &mut buf, 0).unwrap().bytes_read, 4096);
    }

    #[test]
    fn test_timeout_skips_queued_sub_reads() {
        let engine = MockEngine::with_data(pattern(4096));
        engine.delay_range(0..16, Duration::from_millis(200));
        let dispatcher = Dispatcher::new(config(1), Arc::new(engine.clone())).unwrap();

        thread::scope(|s| {
            let slow = s.spawn(|| {
                let mut buf = vec![0u8; 16];
                dispatcher.dispatch(1, &mut buf, 0)
            });
            while engine.submitted_count() == 0 {
                thread::yield_now();
            }

            let mut buf = vec![0u8; 16];
            let options = ReadOptions::new().timeout(Duration::from_millis(20));
            let err = dispatcher.dispatch_with(1, &mut buf, 1024, &options).unwrap_err();
            assert!(matches!(err, DispatchError::TimedOut));
            assert!(slow.join().unwrap().is_ok());
        });

        // The queued sub-read was skipped, not executed
        assert_eq!(engine.submitted_count(), 1);
        assert_eq!(dispatcher.stats().skipped_sub_tasks, 1);
    }

    #[test]
    fn test_configured_default_timeout() {
        let engine = MockEngine::with_data(pattern(64));
        engine.set_delay(Some(Duration::from_millis(100)));
        let dispatcher = Dispatcher::new(
            DispatchConfig {
                workers: 2,
                read_timeout_ms: Some(10),
                ..Default::default()
            },
            Arc::new(engine),
        )
        .unwrap();

        let mut buf = vec![0u8; 64];
        let err = dispatcher.dispatch(1, &mut buf, 0).unwrap_err();
        assert_eq!(err.errno(), libc::ETIMEDOUT);
    }

    #[test]
    fn test_cancel_token_before_dispatch() {
        let engine = MockEngine::with_data(pattern(64));
        let dispatcher = Dispatcher::new(config(2), Arc::new(engine.clone())).unwrap();

        let token = CancelToken::new();
        token.cancel();
        let mut buf = vec![0u8; 64];
        let options = ReadOptions::new().cancel_token(token);
        let err = dispatcher.dispatch_with(1, &mut buf, 0, &options).unwrap_err();

        assert!(matches!(err, DispatchError::Cancelled));
        assert_eq!(engine.submitted_count(), 0);
    }

    #[test]
    fn test_cancel_token_during_dispatch() {
        let engine = MockEngine::with_data(pattern(64));
        engine.set_delay(Some(Duration::from_millis(150)));
        let dispatcher = Dispatcher::new(config(2), Arc::new(engine)).unwrap();

        let token = CancelToken::new();
        let options = ReadOptions::new().cancel_token(token.clone());
        let mut buf = vec![0u8; 64];

        thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(30));
                token.cancel();
            });
            let err = dispatcher.dispatch_with(1, &mut buf, 0, &options).unwrap_err();
            assert_eq!(err.errno(), libc::EINTR);
        });

        assert!(token.is_cancelled());
        assert!(lock(&token.inner.watchers).is_empty());
        assert_eq!(dispatcher.stats().cancellations, 1);
    }

    #[test]
    fn test_cancel_releases_caller_waiting_for_slot() {
        let engine = MockEngine::with_data(pattern(64));
        engine.set_delay(Some(Duration::from_millis(400)));
        let config = DispatchConfig {
            workers: 2,
            max_in_flight: 1,
            ..Default::default()
        };
        let dispatcher = Dispatcher::new(config, Arc::new(engine)).unwrap();

        let token = CancelToken::new();
        let options = ReadOptions::new().cancel_token(token.clone());

        thread::scope(|s| {
            let holder = s.spawn(|| {
                let mut buf = vec![0u8; 64];
                dispatcher.dispatch(1, &mut buf, 0)
            });
            thread::sleep(Duration::from_millis(30));
            s.spawn(|| {
                thread::sleep(Duration::from_millis(50));
                token.cancel();
            });

            let start = Instant::now();
            let mut buf = vec![0u8; 64];
            let err = dispatcher.dispatch_with(1, &mut buf, 0, &options).unwrap_err();
            assert!(matches!(err, DispatchError::Cancelled));
            assert!(
                start.elapsed() < Duration::from_millis(300),
                "cancelled caller waited {:?} for a slot",
                start.elapsed()
            );

            let outcome = holder.join().unwrap().unwrap();
            assert_eq!(outcome.bytes_read, 64);
        });

        assert!(lock(&token.inner.watchers).is_empty());
        assert_eq!(dispatcher.stats().in_flight, 0);
    }

    struct PanickingEngine;

    impl ReadEngine for PanickingEngine {
        fn read_at(&self, _fd: RawFd, dest: &mut [u8], offset: u64) -> std::io::Result<usize> {
            if offset == 0 {
                panic!("engine bug");
            }
            dest.fill(7);
            Ok(dest.len())
        }

        fn name(&self) -> &'static str {
            "panicking"
        }
    }

    #[test]
    fn test_engine_panic_surfaces_as_io_error() {
        let dispatcher = Dispatcher::new(config(2), Arc::new(PanickingEngine)).unwrap();

        let mut buf = vec![0u8; 64];
        let err = dispatcher.dispatch(1, &mut buf, 0).unwrap_err();
        assert!(matches!(err, DispatchError::Io { index: 0, .. }));
        assert_eq!(err.errno(), libc::EIO);

        // The dispatcher keeps serving reads
        let outcome = dispatcher.dispatch(1, &mut buf, 64).unwrap();
        assert_eq!(outcome.bytes_read, 64);
        assert_eq!(buf, vec![7u8; 64]);
    }

    #[test]
    fn test_dispatch_after_shutdown() {
        let engine = MockEngine::with_data(pattern(64));
        let dispatcher = Dispatcher::new(config(2), Arc::new(engine)).unwrap();
        dispatcher.shutdown();
        dispatcher.shutdown();

        let mut buf = vec![0u8; 64];
        let err = dispatcher.dispatch(1, &mut buf, 0).unwrap_err();
        assert!(matches!(err, DispatchError::Shutdown));
    }

    #[test]
    fn test_shutdown_releases_blocked_caller() {
        let engine = MockEngine::with_data(pattern(64));
        engine.set_delay(Some(Duration::from_millis(150)));
        let dispatcher = Dispatcher::new(config(2), Arc::new(engine)).unwrap();

        thread::scope(|s| {
            let caller = s.spawn(|| {
                let mut buf = vec![0u8; 64];
                dispatcher.dispatch(1, &mut buf, 0)
            });
            thread::sleep(Duration::from_millis(30));
            dispatcher.shutdown();
            let err = caller.join().unwrap().unwrap_err();
            assert!(matches!(err, DispatchError::Shutdown));
        });
    }

    #[test]
    fn test_zero_workers_rejected() {
        let err = Dispatcher::new(config(0), Arc::new(MockEngine::new())).unwrap_err();
        assert!(err.to_string().contains("worker count"));
    }

    #[test]
    fn test_aggregate_prefix_stops_at_first_short() {
        let tracker = CompletionTracker::new(1);
        let generation = tracker.begin(3, None).unwrap();
        tracker.record(generation, 0, SubTaskStatus::Complete(10));
        tracker.record(generation, 1, SubTaskStatus::Short(4));
        tracker.record(generation, 2, SubTaskStatus::Complete(10));
        let report = tracker.await_completion(generation, None).unwrap();

        let parts = partition::partition(30, 0, 3);
        let outcome = aggregate(report, &parts).unwrap();
        assert_eq!(outcome, ReadOutcome { requested: 30, bytes_read: 14 });
    }
}
