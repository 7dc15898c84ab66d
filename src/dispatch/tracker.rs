//! Generation-scoped completion tracking
//!
//! The tracker owns a fixed arena of slots, one per read request that may be
//! in flight at the same time. A request claims a slot in [`begin`], its
//! sub-tasks report into that slot through [`record`], and the dispatcher
//! blocks in [`await_completion`] until all of them have reported. The slot
//! then returns to the free list, so memory stays bounded no matter how many
//! requests pass through, and a full arena blocks new requests instead of
//! growing.
//!
//! Every slot has its own mutex and condition variable, so workers reporting
//! for different requests never contend with each other. A generation is the
//! pair of slot index and a 64-bit sequence number; the sequence counter
//! wraps instead of overflowing, and a record whose sequence no longer
//! matches the slot is discarded as stale.
//!
//! [`begin`]: CompletionTracker::begin
//! [`record`]: CompletionTracker::record
//! [`await_completion`]: CompletionTracker::await_completion

use super::error::{CancelReason, DispatchError};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// Lock a mutex, recovering the data if a panicking thread poisoned it
///
/// Slot state stays consistent across a panic because every mutation is a
/// single assignment under the lock.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Identifier tying a batch of sub-tasks to one read request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Generation {
    slot: usize,
    seq: u64,
}

impl Generation {
    /// Arena slot holding this generation's state
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Monotonic sequence number
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}@{}", self.seq, self.slot)
    }
}

/// Outcome of one sub-task
#[derive(Debug)]
pub enum SubTaskStatus {
    /// The whole range was read
    Complete(usize),
    /// End-of-file inside the range; carries the bytes that were read
    Short(usize),
    /// The positioned read failed
    Failed(io::Error),
    /// The sub-task never ran
    Cancelled,
}

impl SubTaskStatus {
    /// Build the status of a finished read of `requested` bytes
    pub fn from_read(requested: usize, result: io::Result<usize>) -> Self {
        match result {
            Ok(n) if n >= requested => SubTaskStatus::Complete(n),
            Ok(n) => SubTaskStatus::Short(n),
            Err(e) => SubTaskStatus::Failed(e),
        }
    }

    /// Bytes placed in the destination by this sub-task
    pub fn bytes(&self) -> usize {
        match self {
            SubTaskStatus::Complete(n) | SubTaskStatus::Short(n) => *n,
            SubTaskStatus::Failed(_) | SubTaskStatus::Cancelled => 0,
        }
    }
}

/// Everything recorded for one generation, handed out exactly once
#[derive(Debug)]
pub struct GenerationReport {
    pub generation: Generation,
    /// One status per sub-task, in sub-task index order
    pub statuses: Vec<SubTaskStatus>,
    /// Set when the generation was cancelled before it completed
    pub cancelled: Option<CancelReason>,
}

#[derive(Debug, Default)]
struct SlotState {
    /// Sequence number of the generation occupying the slot
    active: Option<u64>,
    expected: usize,
    completed: usize,
    statuses: Vec<Option<SubTaskStatus>>,
    cancelled: Option<CancelReason>,
}

impl SlotState {
    fn is_complete(&self) -> bool {
        self.completed >= self.expected
    }
}

#[derive(Debug, Default)]
struct Slot {
    state: Mutex<SlotState>,
    done: Condvar,
}

#[derive(Debug)]
struct FreeList {
    slots: Vec<usize>,
    closed: bool,
}

/// Bounded arena of generation slots
#[derive(Debug)]
pub struct CompletionTracker {
    slots: Box<[Slot]>,
    free: Mutex<FreeList>,
    slot_freed: Condvar,
    next_seq: AtomicU64,
}

impl CompletionTracker {
    /// Create a tracker allowing `capacity` generations in flight
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        Self::with_first_seq(capacity, 0)
    }

    fn with_first_seq(capacity: usize, first_seq: u64) -> Self {
        assert!(capacity > 0, "tracker capacity must be at least 1");
        Self {
            slots: (0..capacity).map(|_| Slot::default()).collect(),
            // Pop from the back hands out slot 0 first
            free: Mutex::new(FreeList {
                slots: (0..capacity).rev().collect(),
                closed: false,
            }),
            slot_freed: Condvar::new(),
            next_seq: AtomicU64::new(first_seq),
        }
    }

    /// Maximum number of generations in flight
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of generations currently holding a slot
    pub fn in_flight(&self) -> usize {
        self.capacity() - lock(&self.free).slots.len()
    }

    /// Claim a slot for a new generation expecting `expected` completions
    ///
    /// Blocks while every slot is taken. Fails with `TimedOut` if `deadline`
    /// passes first, or with `Shutdown` once the tracker is closed.
    pub fn begin(
        &self,
        expected: usize,
        deadline: Option<Instant>,
    ) -> Result<Generation, DispatchError> {
        self.begin_cancellable(expected, deadline, &|| false)
    }

    /// Like [`begin`](Self::begin), but gives up with `Cancelled` once
    /// `cancelled` returns true
    ///
    /// `cancelled` is polled under the free-list lock each time a waiter
    /// wakes, so whoever flips it must call
    /// [`wake_waiters`](Self::wake_waiters) afterwards.
    pub fn begin_cancellable(
        &self,
        expected: usize,
        deadline: Option<Instant>,
        cancelled: &dyn Fn() -> bool,
    ) -> Result<Generation, DispatchError> {
        let mut free = lock(&self.free);
        let slot = loop {
            if free.closed {
                return Err(DispatchError::Shutdown);
            }
            if cancelled() {
                return Err(DispatchError::Cancelled);
            }
            if let Some(slot) = free.slots.pop() {
                break slot;
            }
            free = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(DispatchError::TimedOut);
                    }
                    self.slot_freed
                        .wait_timeout(free, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self.slot_freed.wait(free).unwrap_or_else(PoisonError::into_inner),
            };
        };
        drop(free);

        // fetch_add wraps on overflow
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);

        let mut state = lock(&self.slots[slot].state);
        state.active = Some(seq);
        state.expected = expected;
        state.completed = 0;
        state.statuses.clear();
        state.statuses.resize_with(expected, || None);
        state.cancelled = None;

        Ok(Generation { slot, seq })
    }

    /// Record the outcome of sub-task `index` of `generation`
    ///
    /// Returns false when the record was discarded: the generation is no
    /// longer outstanding, the index is out of range, or the sub-task has
    /// already reported.
    pub fn record(&self, generation: Generation, index: usize, status: SubTaskStatus) -> bool {
        let Some(slot) = self.slots.get(generation.slot) else {
            return false;
        };
        let mut state = lock(&slot.state);

        if state.active != Some(generation.seq) {
            tracing::debug!(%generation, index, "discarding record for stale generation");
            return false;
        }
        let Some(entry) = state.statuses.get_mut(index) else {
            tracing::warn!(%generation, index, "sub-task index out of range");
            return false;
        };
        if entry.is_some() {
            tracing::warn!(%generation, index, "duplicate completion ignored");
            return false;
        }

        *entry = Some(status);
        state.completed += 1;
        if state.is_complete() {
            slot.done.notify_all();
        }
        true
    }

    /// Mark `generation` cancelled so its queued sub-tasks are skipped
    ///
    /// Sub-tasks already reading are left to finish. Returns false if the
    /// generation is not outstanding or has already completed.
    pub fn cancel(&self, generation: Generation, reason: CancelReason) -> bool {
        let Some(slot) = self.slots.get(generation.slot) else {
            return false;
        };
        let mut state = lock(&slot.state);
        if state.active != Some(generation.seq) || state.is_complete() {
            return false;
        }
        state.cancelled.get_or_insert(reason);
        slot.done.notify_all();
        true
    }

    /// Cancel every outstanding generation, returning how many were hit
    pub fn cancel_all(&self, reason: CancelReason) -> usize {
        let mut count = 0;
        for slot in self.slots.iter() {
            let mut state = lock(&slot.state);
            if state.active.is_some() && !state.is_complete() {
                state.cancelled.get_or_insert(reason);
                slot.done.notify_all();
                count += 1;
            }
        }
        count
    }

    /// Whether sub-tasks of `generation` should be skipped
    ///
    /// Stale generations count as cancelled: nobody is waiting for them.
    pub fn is_cancelled(&self, generation: Generation) -> bool {
        match self.slots.get(generation.slot) {
            Some(slot) => {
                let state = lock(&slot.state);
                state.active != Some(generation.seq) || state.cancelled.is_some()
            }
            None => true,
        }
    }

    /// Block until every sub-task of `generation` has reported
    ///
    /// When `deadline` passes first, the generation is cancelled and the
    /// call keeps waiting for the sub-tasks that are already running; queued
    /// ones report as skipped right away. The slot is released before
    /// returning. Returns `None` if `generation` is not outstanding.
    pub fn await_completion(
        &self,
        generation: Generation,
        deadline: Option<Instant>,
    ) -> Option<GenerationReport> {
        let slot = self.slots.get(generation.slot)?;
        let mut state = lock(&slot.state);
        if state.active != Some(generation.seq) {
            return None;
        }

        while !state.is_complete() {
            state = match deadline {
                Some(deadline) if state.cancelled.is_none() => {
                    let now = Instant::now();
                    if now >= deadline {
                        state.cancelled = Some(CancelReason::DeadlineExpired);
                        continue;
                    }
                    slot.done
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                _ => slot.done.wait(state).unwrap_or_else(PoisonError::into_inner),
            };
        }

        let statuses = state
            .statuses
            .drain(..)
            .map(|status| status.unwrap_or(SubTaskStatus::Cancelled))
            .collect();
        let cancelled = state.cancelled.take();
        state.active = None;
        state.expected = 0;
        state.completed = 0;
        drop(state);

        self.release(generation.slot);

        Some(GenerationReport {
            generation,
            statuses,
            cancelled,
        })
    }

    /// Refuse new generations and wake everyone waiting for a slot
    pub fn close(&self) {
        let mut free = lock(&self.free);
        free.closed = true;
        self.slot_freed.notify_all();
    }

    /// Wake callers blocked in `begin` so they re-check their cancel condition
    pub fn wake_waiters(&self) {
        let _free = lock(&self.free);
        self.slot_freed.notify_all();
    }

    fn release(&self, slot: usize) {
        let mut free = lock(&self.free);
        free.slots.push(slot);
        self.slot_freed.notify_one();
    }
}
