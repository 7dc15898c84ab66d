//! Benchmark result output

pub mod json;
pub mod text;
