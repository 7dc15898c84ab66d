//! Shared helpers

pub mod buffer;
