use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Normalized coverage for one embedded Cobertura document, or the
/// aggregate of several.
///
/// Rates and counts are copied verbatim from the source attributes; they are
/// never recomputed from the line sets.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CoverageReport {
    pub line_rate: f64,
    pub branch_rate: f64,
    pub lines_covered: u64,
    pub lines_valid: u64,
    pub branches_covered: u64,
    pub branches_valid: u64,
    pub complexity: f64,
    /// Milliseconds since epoch, as written by the coverage tool
    pub timestamp: i64,
    /// `<source>` roots that class filenames are relative to
    pub sources: Vec<String>,
    /// Keyed by repository-relative path
    pub file_coverage: BTreeMap<String, FileCoverage>,
}

/// Coverage for a single source file (one `<class>` element).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FileCoverage {
    pub line_rate: f64,
    pub branch_rate: f64,
    pub complexity: f64,
    /// Line numbers with at least one hit
    pub lines: BTreeSet<u32>,
    /// Every line number the tool reported, hit or not
    pub measured: BTreeSet<u32>,
}

/// Changed lines of one file in a pull request diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffEntry {
    /// Post-image path
    pub filename: String,
    /// Added post-image line numbers, in diff order
    pub lines: Vec<u32>,
}
