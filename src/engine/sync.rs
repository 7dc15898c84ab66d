//! Synchronous positioned-IO engine
//!
//! Uses blocking `pread`/`pwrite` syscalls. Positioned IO never moves the
//! file offset, so any number of workers may read the same descriptor
//! concurrently without coordinating.
//!
//! # Partial transfers
//!
//! A `pread` that returns fewer bytes than asked for is continued from where
//! it stopped until the range is full or the kernel reports end-of-file. A
//! failing syscall is reported immediately and never retried.

use super::{to_off_t, ReadEngine};
use std::io;
use std::os::unix::io::RawFd;

/// Synchronous engine using pread/pwrite
#[derive(Debug, Default, Clone, Copy)]
pub struct SyncEngine;

impl SyncEngine {
    /// Create a new synchronous engine
    pub fn new() -> Self {
        Self
    }

    /// Write the whole of `src` to `fd` at `offset`
    ///
    /// This is the direct single-threaded write forward used by the
    /// filesystem boundary. Returns the number of bytes written, which is
    /// only smaller than `src.len()` if the kernel accepted zero bytes.
    pub fn write_at(&self, fd: RawFd, src: &[u8], offset: u64) -> io::Result<usize> {
        let mut total_written = 0;

        while total_written < src.len() {
            let remaining = &src[total_written..];
            let current_offset = to_off_t(offset + total_written as u64)?;

            // SAFETY: `remaining` is a live slice; the kernel reads at most
            // `remaining.len()` bytes from it.
            let result = unsafe {
                libc::pwrite(
                    fd,
                    remaining.as_ptr() as *const libc::c_void,
                    remaining.len(),
                    current_offset,
                )
            };

            if result < 0 {
                return Err(io::Error::last_os_error());
            }
            if result == 0 {
                break;
            }
            total_written += result as usize;
        }

        Ok(total_written)
    }
}

impl ReadEngine for SyncEngine {
    #[inline]
    fn read_at(&self, fd: RawFd, dest: &mut [u8], offset: u64) -> io::Result<usize> {
        let mut total_read = 0;

        while total_read < dest.len() {
            let remaining = &mut dest[total_read..];
            let current_offset = to_off_t(offset + total_read as u64)?;

            // SAFETY: `remaining` is an exclusively borrowed slice; the kernel
            // writes at most `remaining.len()` bytes into it.
            let result = unsafe {
                libc::pread(
                    fd,
                    remaining.as_mut_ptr() as *mut libc::c_void,
                    remaining.len(),
                    current_offset,
                )
            };

            if result < 0 {
                return Err(io::Error::last_os_error());
            }
            if result == 0 {
                // EOF
                break;
            }
            total_read += result as usize;
        }

        Ok(total_read)
    }

    fn name(&self) -> &'static str {
        "sync"
    }
}
