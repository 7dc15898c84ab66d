//! Sub-tasks handed from the dispatcher to workers
//!
//! A [`SubTask`] carries one partition of a read request: the descriptor,
//! the file offset and an exclusive view of its slice of the caller's
//! buffer. It also owns the duty to report back to the tracker: finishing a
//! task consumes it. A task dropped because its queue closed before
//! delivery reports itself as cancelled, and one dropped while a panic
//! unwinds through the read reports an `EIO` failure. Either way the
//! generation always reaches its expected completion count.

use super::tracker::{CompletionTracker, Generation, SubTaskStatus};
use std::io;
use std::os::unix::io::RawFd;
use std::ptr::NonNull;
use std::sync::Arc;

/// Exclusive view of a region of a caller's buffer
struct TaskBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the region is written by exactly one thread at a time (whoever
// holds the owning SubTask), and the dispatcher keeps the underlying buffer
// borrowed until the task has reported.
unsafe impl Send for TaskBuffer {}

/// One partition of a read request
pub struct SubTask {
    fd: RawFd,
    offset: u64,
    index: usize,
    generation: Generation,
    buffer: TaskBuffer,
    tracker: Option<Arc<CompletionTracker>>,
}

impl SubTask {
    /// Create a sub-task over `len` bytes starting at `ptr`
    ///
    /// # Safety
    ///
    /// - `ptr..ptr+len` must be valid for writes and must not be accessed by
    ///   anyone else until this task reports to the tracker.
    /// - The memory must stay alive until `generation` has been awaited.
    pub(crate) unsafe fn new(
        fd: RawFd,
        offset: u64,
        index: usize,
        generation: Generation,
        ptr: *mut u8,
        len: usize,
        tracker: Arc<CompletionTracker>,
    ) -> Self {
        let ptr = NonNull::new(ptr).unwrap_or(NonNull::dangling());
        Self {
            fd,
            offset,
            index,
            generation,
            buffer: TaskBuffer { ptr, len },
            tracker: Some(tracker),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.buffer.len
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.len == 0
    }

    /// Whether the owning request stopped waiting for queued work
    pub fn is_cancelled(&self) -> bool {
        match &self.tracker {
            Some(tracker) => tracker.is_cancelled(self.generation),
            None => true,
        }
    }

    /// The destination slice this task fills
    pub fn destination(&mut self) -> &mut [u8] {
        // SAFETY: guaranteed valid and exclusive by the contract of `new`;
        // the `&mut self` borrow stops two views existing at once.
        unsafe { std::slice::from_raw_parts_mut(self.buffer.ptr.as_ptr(), self.buffer.len) }
    }

    /// Report the outcome and give up the buffer region
    pub fn finish(mut self, status: SubTaskStatus) {
        self.report(status);
    }

    fn report(&mut self, status: SubTaskStatus) {
        if let Some(tracker) = self.tracker.take() {
            tracker.record(self.generation, self.index, status);
        }
    }
}

impl Drop for SubTask {
    fn drop(&mut self) {
        if self.tracker.is_none() {
            return;
        }
        if std::thread::panicking() {
            // The read itself blew up; the dispatcher is still alive
            tracing::warn!(
                generation = %self.generation,
                index = self.index,
                "sub-task lost to a panic"
            );
            self.report(SubTaskStatus::Failed(io::Error::from_raw_os_error(libc::EIO)));
        } else {
            tracing::debug!(
                generation = %self.generation,
                index = self.index,
                "sub-task dropped before running"
            );
            self.report(SubTaskStatus::Cancelled);
        }
    }
}

impl std::fmt::Debug for SubTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubTask")
            .field("fd", &self.fd)
            .field("offset", &self.offset)
            .field("len", &self.buffer.len)
            .field("index", &self.index)
            .field("generation", &self.generation)
            .finish()
    }
}
