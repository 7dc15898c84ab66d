//! fanread - parallel read dispatch for passthrough filesystems
//!
//! A single large read arriving on one thread is split into one contiguous
//! sub-read per worker, executed by a pool of long-lived worker threads, and
//! reported back to the caller as one aggregate result.
//!
//! # Architecture
//!
//! - **engine**: positioned-read backends (`pread`, scripted mock)
//! - **worker**: long-lived threads, one bounded queue each
//! - **dispatch**: partitioning, generation tracking, fan-out / fan-in
//! - **fs**: passthrough filesystem boundary using negated-errno results
//! - **config / logging / stats**: ambient plumbing
//! - **bench / output**: the read benchmark behind the `fanread` binary

pub mod bench;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod fs;
pub mod logging;
pub mod output;
pub mod stats;
pub mod util;
pub mod worker;

// Re-export commonly used types
pub use config::Config;
pub use dispatch::{CancelToken, DispatchError, Dispatcher, ReadOptions, ReadOutcome};
pub use engine::ReadEngine;
pub use fs::PassthroughFs;

/// Result type used for setup, configuration and CLI code
pub type Result<T> = anyhow::Result<T>;
