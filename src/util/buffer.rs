//! Aligned read buffers
//!
//! `O_DIRECT` reads need the destination, the file offset and the length all
//! aligned to the device block size. The dispatcher hands each worker a
//! sub-slice starting at a multiple of the partition size, so an aligned
//! buffer plus a partition size that is a multiple of [`DIRECT_ALIGNMENT`]
//! keeps every sub-read aligned as well.

use crate::Result;
use anyhow::Context;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

/// Alignment used for direct IO buffers, offsets and partition sizes
pub const DIRECT_ALIGNMENT: usize = 4096;

/// Zero-initialized heap buffer with a guaranteed start alignment
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

impl AlignedBuffer {
    /// Allocate `len` zeroed bytes aligned to `alignment`
    ///
    /// Fails if `len` is zero, `alignment` is not a power of two, or the
    /// allocation fails.
    pub fn new(len: usize, alignment: usize) -> Result<Self> {
        anyhow::ensure!(len > 0, "buffer size must be greater than 0");
        let layout = Layout::from_size_align(len, alignment)
            .with_context(|| format!("Invalid buffer layout: {} bytes aligned to {}", len, alignment))?;

        // SAFETY: layout has a non-zero size
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr)
            .with_context(|| format!("Failed to allocate {} byte aligned buffer", len))?;

        Ok(Self { ptr, len, layout })
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr owns len initialized bytes
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees exclusivity
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn alignment(&self) -> usize {
        self.layout.align()
    }

    pub fn is_aligned(&self) -> bool {
        (self.ptr.as_ptr() as usize) % self.layout.align() == 0
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this exact layout
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

// Owns its memory outright
unsafe impl Send for AlignedBuffer {}

impl std::fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("len", &self.len)
            .field("alignment", &self.layout.align())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aligned_buffer_creation() {
        let buffer = AlignedBuffer::new(8192, DIRECT_ALIGNMENT).unwrap();
        assert_eq!(buffer.len(), 8192);
        assert_eq!(buffer.alignment(), 4096);
        assert!(buffer.is_aligned());
        assert!(buffer.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_odd_length_still_aligned() {
        let mut buffer = AlignedBuffer::new(1000, 512).unwrap();
        assert!(buffer.is_aligned());
        buffer.as_mut_slice()[999] = 7;
        assert_eq!(buffer.as_slice()[999], 7);
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(AlignedBuffer::new(4096, 513).is_err());
        assert!(AlignedBuffer::new(0, 4096).is_err());
    }

    #[test]
    fn test_sub_slices_keep_alignment() {
        let buffer = AlignedBuffer::new(4 * DIRECT_ALIGNMENT, DIRECT_ALIGNMENT).unwrap();
        let base = buffer.as_slice().as_ptr() as usize;
        for part in 0..4 {
            assert_eq!((base + part * DIRECT_ALIGNMENT) % DIRECT_ALIGNMENT, 0);
        }
    }
}
