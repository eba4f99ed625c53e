pub mod types;

pub use types::{FileDiffCoverage, Report, Status};

use crate::parser::{CoverageReport, DiffEntry};
use colored::Colorize;
use std::collections::BTreeSet;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Failed to write report file: {0}")]
    FileWrite(#[from] std::io::Error),

    #[error("Failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Correlate changed lines with covered lines.
///
/// Changed lines the coverage tool did not measure (comments, blank lines)
/// count neither as covered nor as missed. `threshold` is in percent.
pub fn build(coverage: &CoverageReport, diff: &[DiffEntry], threshold: Option<f64>) -> Report {
    let mut files = Vec::new();
    let mut untracked = Vec::new();

    for entry in diff {
        let Some(file) = coverage.file_coverage.get(&entry.filename) else {
            untracked.push(entry.filename.clone());
            continue;
        };
        let changed: BTreeSet<u32> = entry.lines.iter().copied().collect();
        let covered = changed.intersection(&file.lines).copied().collect();
        let missed = changed
            .intersection(&file.measured)
            .filter(|line| !file.lines.contains(*line))
            .copied()
            .collect();
        files.push(FileDiffCoverage {
            path: entry.filename.clone(),
            covered,
            missed,
            file_line_rate: file.line_rate,
        });
    }

    let covered_lines: usize = files.iter().map(|f| f.covered.len()).sum();
    let missed_lines: usize = files.iter().map(|f| f.missed.len()).sum();
    let status = match types::ratio(covered_lines, covered_lines + missed_lines) {
        None => Status::NoData,
        Some(rate) => match threshold {
            Some(min) if rate * 100.0 < min => Status::Fail,
            _ => Status::Pass,
        },
    };

    Report {
        files,
        untracked,
        covered_lines,
        missed_lines,
        project_line_rate: coverage.line_rate,
        threshold,
        status,
    }
}

/// Output the report to terminal (default) or to a markdown file.
#[instrument(skip(report), fields(status = %report.status))]
pub fn output(report: &Report, output_path: Option<&Path>) -> Result<(), ReportError> {
    match output_path {
        None => {
            debug!("writing report to terminal");
            print_terminal_report(report);
            Ok(())
        }
        Some(path) => {
            debug!(path = %path.display(), "writing report to file");
            std::fs::write(path, render_markdown(report))?;
            Ok(())
        }
    }
}

/// Print the report as pretty JSON on stdout.
pub fn output_json(report: &Report) -> Result<(), ReportError> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}

fn print_terminal_report(report: &Report) {
    println!();
    println!(
        "Diff coverage: {} ({}/{} lines) | Project coverage: {}",
        format_rate(report.diff_line_rate()),
        report.covered_lines,
        report.covered_lines + report.missed_lines,
        format_rate(Some(report.project_line_rate)),
    );
    println!();

    println!("═══ Changed Files ═══");
    if report.files.is_empty() {
        println!("  No covered files changed.");
    }
    for file in &report.files {
        let rate = format_rate(file.line_rate());
        if file.missed.is_empty() {
            println!("  • {} {}", file.path, rate.green());
        } else {
            println!(
                "  • {} {} missed: {}",
                file.path,
                rate.yellow(),
                format_ranges(&file.missed)
            );
        }
    }
    if !report.untracked.is_empty() {
        println!("  Not in coverage report: {}", report.untracked.join(", "));
    }
    println!();

    if let Some(threshold) = report.threshold {
        println!("Threshold: {:.2}%", threshold);
    }
    println!("═══ Status: {} ═══", colorize_status(report.status));
    println!();
}

/// Render the report as a markdown document, suitable as a PR comment.
pub fn render_markdown(report: &Report) -> String {
    let mut md = String::new();
    md.push_str(&format!(
        "# Diff coverage: {}\n\n",
        format_rate(report.diff_line_rate())
    ));
    md.push_str(&format!(
        "**Changed lines covered:** {}/{} | **Project coverage:** {}\n\n",
        report.covered_lines,
        report.covered_lines + report.missed_lines,
        format_rate(Some(report.project_line_rate))
    ));

    if !report.files.is_empty() {
        md.push_str("| File | Diff coverage | File coverage | Missed lines |\n");
        md.push_str("| --- | --- | --- | --- |\n");
        for file in &report.files {
            md.push_str(&format!(
                "| `{}` | {} | {} | {} |\n",
                file.path,
                format_rate(file.line_rate()),
                format_rate(Some(file.file_line_rate)),
                format_ranges(&file.missed)
            ));
        }
        md.push('\n');
    }

    if !report.untracked.is_empty() {
        md.push_str("Changed files without coverage data:\n");
        for path in &report.untracked {
            md.push_str(&format!("- `{}`\n", path));
        }
        md.push('\n');
    }

    match report.threshold {
        Some(threshold) => md.push_str(&format!(
            "## Status: {} (threshold {:.2}%)\n",
            report.status, threshold
        )),
        None => md.push_str(&format!("## Status: {}\n", report.status)),
    }
    md
}

fn format_rate(rate: Option<f64>) -> String {
    match rate {
        Some(rate) => format!("{:.2}%", rate * 100.0),
        None => "n/a".to_string(),
    }
}

/// Collapse sorted line numbers into ranges: `[1, 2, 3, 7]` -> `1-3, 7`.
fn format_ranges(lines: &[u32]) -> String {
    let mut ranges: Vec<(u32, u32)> = Vec::new();
    for &line in lines {
        match ranges.last_mut() {
            Some((_, end)) if end.checked_add(1) == Some(line) => *end = line,
            _ => ranges.push((line, line)),
        }
    }
    ranges
        .iter()
        .map(|&(start, end)| {
            if start == end {
                start.to_string()
            } else {
                format!("{}-{}", start, end)
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn colorize_status(status: Status) -> colored::ColoredString {
    match status {
        Status::Pass => "PASS".green().bold(),
        Status::Fail => "FAIL".red().bold(),
        Status::NoData => "NO DATA".yellow().bold(),
    }
}
