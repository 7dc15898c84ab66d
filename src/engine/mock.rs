//! Mock read engine for testing
//!
//! Serves reads from an in-memory file image instead of a descriptor, which
//! makes dispatcher tests fast and deterministic.
//!
//! # Features
//!
//! - Configurable file image (short reads happen naturally at its end)
//! - Errors injected per byte range with a chosen OS error code
//! - Latency injected globally or per byte range
//! - Tracks every call and the peak number of concurrent reads
//!
//! # Example
//!
//! ```
//! use fanread::engine::{ReadEngine, mock::MockEngine};
//!
//! let engine = MockEngine::with_data(b"0123456789".to_vec());
//! engine.fail_range(8..10, libc::EIO);
//!
//! let mut buf = [0u8; 4];
//! assert_eq!(engine.read_at(3, &mut buf, 2).unwrap(), 4);
//! assert_eq!(&buf, b"2345");
//! assert!(engine.read_at(3, &mut buf, 6).is_err());
//! ```

use super::ReadEngine;
use crate::dispatch::tracker::lock;
use std::io;
use std::ops::Range;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Record of a read call for test verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationRecord {
    pub fd: RawFd,
    pub offset: u64,
    pub length: usize,
}

#[derive(Debug, Clone)]
struct InjectedFailure {
    range: Range<u64>,
    errno: i32,
}

#[derive(Debug, Clone)]
struct InjectedDelay {
    range: Range<u64>,
    delay: Duration,
}

/// Mock engine backed by an in-memory file image
///
/// Cloning shares all state, so a test can keep a handle for assertions
/// after moving a clone into a dispatcher.
#[derive(Clone, Default)]
pub struct MockEngine {
    data: Arc<Vec<u8>>,
    failures: Arc<Mutex<Vec<InjectedFailure>>>,
    delays: Arc<Mutex<Vec<InjectedDelay>>>,
    default_delay: Arc<Mutex<Option<Duration>>>,
    submitted_ops: Arc<Mutex<Vec<OperationRecord>>>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
}

impl MockEngine {
    /// Create a mock engine with an empty file image
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock engine serving `data` for every descriptor
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(data),
            ..Self::default()
        }
    }

    /// Fail every read that touches `range` with `errno`
    pub fn fail_range(&self, range: Range<u64>, errno: i32) {
        lock(&self.failures).push(InjectedFailure { range, errno });
    }

    /// Sleep for `delay` before serving any read that touches `range`
    pub fn delay_range(&self, range: Range<u64>, delay: Duration) {
        lock(&self.delays).push(InjectedDelay { range, delay });
    }

    /// Sleep for `delay` before serving every read
    pub fn set_delay(&self, delay: Option<Duration>) {
        *lock(&self.default_delay) = delay;
    }

    /// Get a copy of all read calls for verification
    pub fn submitted_operations(&self) -> Vec<OperationRecord> {
        lock(&self.submitted_ops).clone()
    }

    /// Get the number of read calls
    pub fn submitted_count(&self) -> usize {
        lock(&self.submitted_ops).len()
    }

    /// Clear the call history
    pub fn clear_submitted_operations(&self) {
        lock(&self.submitted_ops).clear();
    }

    /// Highest number of reads that were executing at the same time
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn overlaps(range: &Range<u64>, offset: u64, length: usize) -> bool {
        let end = offset.saturating_add(length as u64);
        length > 0 && offset < range.end && range.start < end
    }

    fn delay_for(&self, offset: u64, length: usize) -> Option<Duration> {
        let ranged = lock(&self.delays)
            .iter()
            .filter(|d| Self::overlaps(&d.range, offset, length))
            .map(|d| d.delay)
            .max();
        ranged.or(*lock(&self.default_delay))
    }

    fn failure_for(&self, offset: u64, length: usize) -> Option<i32> {
        lock(&self.failures)
            .iter()
            .find(|f| Self::overlaps(&f.range, offset, length))
            .map(|f| f.errno)
    }
}

impl ReadEngine for MockEngine {
    fn read_at(&self, fd: RawFd, dest: &mut [u8], offset: u64) -> io::Result<usize> {
        lock(&self.submitted_ops).push(OperationRecord {
            fd,
            offset,
            length: dest.len(),
        });

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.delay_for(offset, dest.len()) {
            std::thread::sleep(delay);
        }

        let result = match self.failure_for(offset, dest.len()) {
            Some(errno) => Err(io::Error::from_raw_os_error(errno)),
            None => {
                let start = (offset.min(self.data.len() as u64)) as usize;
                let end = (start + dest.len()).min(self.data.len());
                let n = end - start;
                dest[..n].copy_from_slice(&self.data[start..end]);
                Ok(n)
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_engine_basic() {
        let engine = MockEngine::with_data((0u8..64).collect());
        let mut buf = vec![0u8; 16];

        let n = engine.read_at(1, &mut buf, 8).unwrap();
        assert_eq!(n, 16);
        assert_eq!(buf, (8u8..24).collect::<Vec<_>>());
    }

    #[test]
    fn test_mock_engine_short_read_at_end() {
        let engine = MockEngine::with_data(vec![7u8; 10]);
        let mut buf = vec![0u8; 8];

        assert_eq!(engine.read_at(1, &mut buf, 6).unwrap(), 4);
        assert_eq!(engine.read_at(1, &mut buf, 10).unwrap(), 0);
        assert_eq!(engine.read_at(1, &mut buf, 500).unwrap(), 0);
    }

    #[test]
    fn test_mock_engine_failure() {
        let engine = MockEngine::with_data(vec![0u8; 100]);
        engine.fail_range(50..60, libc::EIO);

        let mut buf = vec![0u8; 10];
        assert!(engine.read_at(1, &mut buf, 0).is_ok());
        assert!(engine.read_at(1, &mut buf, 60).is_ok());

        let err = engine.read_at(1, &mut buf, 45).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EIO));
    }

    #[test]
    fn test_mock_engine_zero_length_never_fails() {
        let engine = MockEngine::with_data(vec![0u8; 100]);
        engine.fail_range(0..100, libc::EIO);

        let mut buf = [0u8; 0];
        assert_eq!(engine.read_at(1, &mut buf, 10).unwrap(), 0);
    }

    #[test]
    fn test_mock_engine_operation_tracking() {
        let engine = MockEngine::with_data(vec![0u8; 100]);
        let mut buf = vec![0u8; 10];

        engine.read_at(4, &mut buf, 0).unwrap();
        engine.read_at(5, &mut buf, 20).unwrap();

        let submitted = engine.submitted_operations();
        assert_eq!(submitted.len(), 2);
        assert_eq!(submitted[0].fd, 4);
        assert_eq!(submitted[0].offset, 0);
        assert_eq!(submitted[1].fd, 5);
        assert_eq!(submitted[1].offset, 20);
        assert_eq!(submitted[1].length, 10);

        engine.clear_submitted_operations();
        assert_eq!(engine.submitted_count(), 0);
    }

    #[test]
    fn test_mock_engine_peak_concurrency() {
        let engine = MockEngine::with_data(vec![0u8; 1024]);
        engine.set_delay(Some(Duration::from_millis(50)));

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let engine = engine.clone();
                std::thread::spawn(move || {
                    let mut buf = vec![0u8; 16];
                    engine.read_at(1, &mut buf, i * 16).unwrap()
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), 16);
        }

        assert!(engine.peak_concurrency() >= 2);
        assert_eq!(engine.submitted_count(), 4);
    }
}
