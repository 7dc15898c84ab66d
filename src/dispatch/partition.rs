//! Request partitioning
//!
//! A read of `length` bytes at `offset` is cut into one contiguous range per
//! worker. Every range gets `length / parts` bytes and the last one also
//! takes the remainder, so the ranges tile `[offset, offset + length)` with
//! no gap, no overlap and no truncation.

/// One worker's share of a read request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    /// Sub-task index, equal to the worker index it is sent to
    pub index: usize,
    /// File offset of the first byte
    pub offset: u64,
    /// Position of the first byte inside the destination buffer
    pub buffer_start: usize,
    /// Number of bytes
    pub len: usize,
}

impl Partition {
    /// Exclusive end position inside the destination buffer
    pub fn buffer_end(&self) -> usize {
        self.buffer_start + self.len
    }
}

/// Split `length` bytes starting at `offset` into `parts` contiguous ranges
///
/// Ranges are returned in index order by increasing offset. When `length`
/// is smaller than `parts`, the leading ranges are empty and the last one
/// carries the whole request.
///
/// # Panics
///
/// Panics if `parts` is zero.
///
/// # Example
///
/// ```
/// use fanread::dispatch::partition::partition;
///
/// let parts = partition(10, 100, 3);
/// let lens: Vec<usize> = parts.iter().map(|p| p.len).collect();
/// assert_eq!(lens, vec![3, 3, 4]);
/// assert_eq!(parts[2].offset, 106);
/// ```
pub fn partition(length: usize, offset: u64, parts: usize) -> Vec<Partition> {
    assert!(parts > 0, "partition count must be at least 1");

    let base = length / parts;
    let remainder = length % parts;

    (0..parts)
        .map(|index| {
            let buffer_start = base * index;
            let len = if index + 1 == parts { base + remainder } else { base };
            Partition {
                index,
                offset: offset + buffer_start as u64,
                buffer_start,
                len,
            }
        })
        .collect()
}
