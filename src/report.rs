//! Console output for merged reports.
//!
//! Renderers for HTML, JUnit XML and the like consume [`AggregateReport`]
//! directly; this module only prints the terminal summary shown after a
//! merge.

use std::time::Duration;

use crate::merge::AggregateReport;
use crate::model::FinalStatus;

/// Prints a summary of the merged report to the console.
///
/// Missing shards are called out before the totals so partial numbers are
/// never mistaken for a complete run.
pub fn print_summary(report: &AggregateReport) {
    println!();
    if let Some(warning) = report.missing_shard_warning() {
        println!("{}", console::style(warning).red().bold());
        println!();
    }

    println!(
        "Test Results ({} of {} shards):",
        report.shards_received, report.shards_expected
    );
    println!("  Total:   {}", report.test_records.len());
    println!("  Passed:  {}", console::style(report.totals.passed).green());
    println!("  Failed:  {}", console::style(report.totals.failed).red());
    println!("  Flaky:   {}", console::style(report.totals.flaky).yellow());
    println!("  Skipped: {}", console::style(report.totals.skipped).yellow());
    println!(
        "  Duration: {:?}",
        Duration::from_millis(report.total_duration_ms)
    );

    let flaky: Vec<_> = report
        .test_records
        .iter()
        .filter(|r| r.final_status == FinalStatus::Flaky)
        .collect();
    if !flaky.is_empty() {
        println!();
        println!("Flaky tests:");
        for record in flaky {
            println!(
                "  - {} {}",
                record.identity,
                console::style(format!("(passed on attempt {})", record.attempts.len())).dim()
            );
        }
    }

    if report.totals.failed > 0 {
        println!();
        println!("Failed tests:");
        for record in report.failures() {
            println!("  - {} [{}]", record.identity, record.final_status);
            if let Some(msg) = record.attempts.last().and_then(|a| a.error_summary.as_ref()) {
                println!("    {}", console::style(msg).dim());
            }
        }
    }

    println!();
    if !report.complete {
        println!("{}", console::style("Merge is incomplete.").red().bold());
    } else if report.success() {
        println!("{}", console::style("All tests passed!").green().bold());
    } else {
        println!("{}", console::style("Some tests failed.").red().bold());
    }
}
