//! Passthrough filesystem boundary
//!
//! [`PassthroughFs`] exposes the data-path entry points of a passthrough
//! filesystem in the calling convention filesystem callbacks use: a
//! non-negative result on success and a negated OS error code on failure.
//! Reads go through the parallel [`Dispatcher`]; writes are forwarded to a
//! single positioned write on the calling thread.
//!
//! Callers that hold an open handle pass its descriptor. Without one the
//! path is opened for the duration of the call and closed again, read-only
//! for reads and write-only for writes.
//!
//! # Example
//!
//! ```no_run
//! use fanread::config::DispatchConfig;
//! use fanread::fs::PassthroughFs;
//! use std::path::Path;
//!
//! let fs = PassthroughFs::new(DispatchConfig::default())?;
//! let path = Path::new("/var/tmp/data.bin");
//!
//! let fh = fs.open(path, libc::O_RDONLY);
//! assert!(fh >= 0);
//!
//! let mut buf = vec![0u8; 1 << 20];
//! let n = fs.read(path, Some(fh as i32), &mut buf, 0);
//! fs.release(fh as i32);
//! # Ok::<(), anyhow::Error>(())
//! ```

use crate::config::DispatchConfig;
use crate::dispatch::{DispatchError, Dispatcher};
use crate::engine::sync::SyncEngine;
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::Arc;

/// Data-path operations of a passthrough filesystem
pub struct PassthroughFs {
    dispatcher: Dispatcher,
    engine: SyncEngine,
}

fn neg_errno(err: &io::Error) -> i32 {
    -err.raw_os_error().unwrap_or(libc::EIO)
}

impl PassthroughFs {
    /// Start a dispatcher over `pread` with the given pool settings
    pub fn new(config: DispatchConfig) -> crate::Result<Self> {
        let engine = SyncEngine::new();
        let dispatcher = Dispatcher::new(config, Arc::new(engine))?;
        Ok(Self { dispatcher, engine })
    }

    /// Wrap an existing dispatcher
    pub fn with_dispatcher(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            engine: SyncEngine::new(),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Open `path` with `flags`, returning the descriptor or a negated errno
    pub fn open(&self, path: &Path, flags: i32) -> i64 {
        self.open_raw(path, flags, 0)
    }

    /// Create and open `path` with `flags | O_CREAT` and permission `mode`
    pub fn create(&self, path: &Path, flags: i32, mode: u32) -> i64 {
        self.open_raw(path, flags | libc::O_CREAT, mode)
    }

    fn open_raw(&self, path: &Path, flags: i32, mode: u32) -> i64 {
        let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
            return -(libc::EINVAL as i64);
        };
        // SAFETY: c_path is a valid NUL-terminated string
        let fd = unsafe { libc::open(c_path.as_ptr(), flags | libc::O_CLOEXEC, mode as libc::c_uint) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            tracing::debug!(path = %path.display(), flags, error = %err, "open failed");
            return neg_errno(&err) as i64;
        }
        tracing::trace!(path = %path.display(), fd, "opened");
        fd as i64
    }

    /// Read into `buf` at `offset` through the parallel dispatcher
    ///
    /// Returns the number of bytes read, which is less than `buf.len()` at
    /// end-of-file, or a negated errno.
    pub fn read(&self, path: &Path, fh: Option<RawFd>, buf: &mut [u8], offset: i64) -> isize {
        let Ok(offset) = u64::try_from(offset) else {
            return -(libc::EINVAL as isize);
        };

        let opened;
        let fd = match fh {
            Some(fd) => fd,
            None => {
                tracing::debug!(path = %path.display(), "read without handle; opening read-only");
                opened = match File::open(path) {
                    Ok(file) => file,
                    Err(e) => return neg_errno(&e) as isize,
                };
                opened.as_raw_fd()
            }
        };

        match self.dispatcher.dispatch(fd, buf, offset) {
            Ok(outcome) => outcome.bytes_read as isize,
            Err(e) => {
                log_read_error(path, offset, buf.len(), &e);
                -(e.errno() as isize)
            }
        }
    }

    /// Write `buf` at `offset` with a positioned write on the calling thread
    pub fn write(&self, path: &Path, fh: Option<RawFd>, buf: &[u8], offset: i64) -> isize {
        let Ok(offset) = u64::try_from(offset) else {
            return -(libc::EINVAL as isize);
        };

        let opened;
        let fd = match fh {
            Some(fd) => fd,
            None => {
                opened = match OpenOptions::new().write(true).open(path) {
                    Ok(file) => file,
                    Err(e) => return neg_errno(&e) as isize,
                };
                opened.as_raw_fd()
            }
        };

        match self.engine.write_at(fd, buf, offset) {
            Ok(n) => n as isize,
            Err(e) => {
                tracing::warn!(path = %path.display(), offset, len = buf.len(), error = %e, "write failed");
                neg_errno(&e) as isize
            }
        }
    }

    /// Close a descriptor returned by `open` or `create`
    pub fn release(&self, fh: RawFd) -> i32 {
        // SAFETY: the caller gives up fh; closing an invalid fd only fails
        let rc = unsafe { libc::close(fh) };
        if rc < 0 {
            return neg_errno(&io::Error::last_os_error());
        }
        0
    }

    /// Stop the read workers; later reads fail with `-ESHUTDOWN`
    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
    }
}

fn log_read_error(path: &Path, offset: u64, len: usize, err: &DispatchError) {
    match err {
        DispatchError::Io { .. } => {
            tracing::warn!(path = %path.display(), offset, len, error = %err, "read failed")
        }
        _ => tracing::debug!(path = %path.display(), offset, len, error = %err, "read aborted"),
    }
}
