//! JSON output formatting

use crate::bench::BenchReport;
use crate::Result;
use anyhow::Context;
use serde::Serialize;

/// Versioned JSON document wrapping a benchmark report
#[derive(Debug, Serialize)]
struct JsonDocument<'a> {
    tool: &'static str,
    version: &'static str,
    #[serde(flatten)]
    report: &'a BenchReport,
}

/// Render a report as pretty-printed JSON
pub fn to_json(report: &BenchReport) -> Result<String> {
    let document = JsonDocument {
        tool: "fanread",
        version: env!("CARGO_PKG_VERSION"),
        report,
    };
    serde_json::to_string_pretty(&document).context("Failed to serialize report")
}

/// Print a report as JSON to stdout
pub fn print_report(report: &BenchReport) -> Result<()> {
    println!("{}", to_json(report)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::text::tests::sample_report;

    #[test]
    fn test_json_fields() {
        let json = to_json(&sample_report()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["tool"], "fanread");
        assert_eq!(value["workers"], 4);
        assert_eq!(value["bytes_read"], 8 * 1024 * 1024);
        assert_eq!(value["first_errno"], libc::EIO);
        assert_eq!(value["latency"]["count"], 8);
        assert_eq!(value["dispatch"]["sub_tasks"], 32);
        assert_eq!(value["path"], "/data/big.bin");
    }
}
