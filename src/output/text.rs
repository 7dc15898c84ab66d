//! Human-readable text output

use crate::bench::BenchReport;
use std::fmt::Write;

/// Print benchmark results to stdout
pub fn print_report(report: &BenchReport) {
    print!("{}", format_report(report));
}

/// Render benchmark results as a text block
pub fn format_report(report: &BenchReport) -> String {
    let mut out = String::new();
    // Writing into a String cannot fail
    let _ = write_report(&mut out, report);
    out
}

fn write_report(out: &mut String, report: &BenchReport) -> std::fmt::Result {
    writeln!(out, "═══════════════════════════════════════════════════════════")?;
    writeln!(out, "                    READ RESULTS")?;
    writeln!(out, "═══════════════════════════════════════════════════════════")?;
    writeln!(out)?;

    writeln!(out, "File:         {} ({})", report.path.display(), format_bytes(report.file_size))?;
    writeln!(
        out,
        "Dispatch:     {} workers, {} callers, {} blocks{}{}",
        report.workers,
        report.callers,
        format_bytes(report.block_size),
        if report.random { ", random" } else { ", sequential" },
        if report.direct { ", O_DIRECT" } else { "" }
    )?;
    writeln!(out, "Elapsed Time: {:.3}s", report.elapsed_secs)?;
    writeln!(out)?;

    writeln!(out, "Reads:")?;
    writeln!(
        out,
        "  {} requests ({}) - {} IOPS, {}",
        format_number(report.requests),
        format_bytes(report.bytes_read),
        format_rate(report.iops),
        format_throughput(report.throughput_bytes_per_sec)
    )?;
    if report.short_reads > 0 {
        writeln!(out, "  Short reads: {}", format_number(report.short_reads))?;
    }
    if report.errors > 0 {
        let detail = report
            .first_errno
            .map(|errno| format!(" (first: {})", std::io::Error::from_raw_os_error(errno)))
            .unwrap_or_default();
        writeln!(out, "  Errors: {}{}", format_number(report.errors), detail)?;
    }
    if report.verified > 0 {
        let passed = report.verified - report.verify_failures;
        writeln!(
            out,
            "  Verified: {}/{} blocks match a plain pread",
            format_number(passed),
            format_number(report.verified)
        )?;
    }
    writeln!(out)?;

    let latency = &report.latency;
    if latency.count > 0 {
        writeln!(out, "Latency (us):")?;
        writeln!(
            out,
            "  min {:.1}  mean {:.1}  p50 {:.1}  p99 {:.1}  p99.9 {:.1}  max {:.1}",
            latency.min_us, latency.mean_us, latency.p50_us, latency.p99_us, latency.p999_us, latency.max_us
        )?;
        writeln!(out)?;
    }

    let dispatch = &report.dispatch;
    writeln!(out, "Dispatcher:")?;
    writeln!(
        out,
        "  {} sub-reads, {} skipped, {} failed",
        format_number(dispatch.sub_tasks),
        format_number(dispatch.skipped_sub_tasks),
        format_number(dispatch.sub_task_errors)
    )?;
    if dispatch.timeouts > 0 || dispatch.cancellations > 0 {
        writeln!(
            out,
            "  {} timed out, {} cancelled",
            format_number(dispatch.timeouts),
            format_number(dispatch.cancellations)
        )?;
    }
    writeln!(out)?;
    writeln!(out, "═══════════════════════════════════════════════════════════")?;
    Ok(())
}

/// Format a number with thousands separators
fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::new();

    for (count, c) in s.chars().rev().enumerate() {
        if count > 0 && count % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }

    result.chars().rev().collect()
}

/// Format bytes with appropriate units
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

fn format_rate(rate: f64) -> String {
    if rate < 1_000.0 {
        format!("{:.0}", rate)
    } else if rate < 1_000_000.0 {
        format!("{:.2}K", rate / 1_000.0)
    } else {
        format!("{:.2}M", rate / 1_000_000.0)
    }
}

fn format_throughput(bytes_per_sec: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec as u64))
}
