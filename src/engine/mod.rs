//! Positioned-read engine abstraction
//!
//! A read engine is the syscall boundary of the dispatcher: it performs one
//! blocking positioned read of a byte range into a destination slice. Worker
//! threads are agnostic to the mechanism behind it, so the same worker loop
//! runs against the real `pread(2)` engine and against the scripted mock used
//! by the tests.
//!
//! # Engine Types
//!
//! - **Synchronous**: blocking `pread` (the production engine)
//! - **Mock**: in-memory file image with injectable errors and latency
//!
//! # Example
//!
//! ```no_run
//! use fanread::engine::{ReadEngine, sync::SyncEngine};
//! use std::os::unix::io::AsRawFd;
//!
//! let file = std::fs::File::open("/etc/hostname")?;
//! let engine = SyncEngine::new();
//! let mut buffer = vec![0u8; 4096];
//! let n = engine.read_at(file.as_raw_fd(), &mut buffer, 0)?;
//! println!("read {} bytes", n);
//! # Ok::<(), std::io::Error>(())
//! ```

use std::io;
use std::os::unix::io::RawFd;

/// Positioned-read backend shared by all worker threads
///
/// # Thread Safety
///
/// Unlike a per-worker engine instance, one engine is shared by every worker
/// of a dispatcher, so implementations must be `Send + Sync` and must not keep
/// per-call state behind `&mut self`.
///
/// # Error Handling
///
/// Errors are returned as `std::io::Error` so that the OS error code survives
/// all the way back to the filesystem boundary.
pub trait ReadEngine: Send + Sync {
    /// Read up to `dest.len()` bytes from `fd` starting at `offset`
    ///
    /// Returns the number of bytes placed at the front of `dest`. A value
    /// smaller than `dest.len()` means end-of-file was reached inside the
    /// range. Implementations must not retry a failed read.
    fn read_at(&self, fd: RawFd, dest: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Short engine name used in logs
    fn name(&self) -> &'static str;
}

/// Convert a byte offset to the signed type the syscalls expect
pub(crate) fn to_off_t(offset: u64) -> io::Result<libc::off_t> {
    libc::off_t::try_from(offset).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("offset {} does not fit in off_t", offset),
        )
    })
}

pub mod mock;
pub mod sync;
