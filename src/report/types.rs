use serde::Serialize;

/// Outcome of the diff coverage gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pass,
    Fail,
    /// No changed line is measured by the coverage report
    NoData,
}

impl Status {
    pub fn passed(self) -> bool {
        !matches!(self, Status::Fail)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Pass => write!(f, "PASS"),
            Status::Fail => write!(f, "FAIL"),
            Status::NoData => write!(f, "NO DATA"),
        }
    }
}

/// Diff coverage of a single changed file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileDiffCoverage {
    pub path: String,
    /// Changed lines that were hit
    pub covered: Vec<u32>,
    /// Changed executable lines that were not hit
    pub missed: Vec<u32>,
    /// Tool-reported line rate for the whole file
    pub file_line_rate: f64,
}

impl FileDiffCoverage {
    pub fn line_rate(&self) -> Option<f64> {
        ratio(self.covered.len(), self.covered.len() + self.missed.len())
    }
}

/// Complete diff coverage report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    /// Files with coverage data, in diff order
    pub files: Vec<FileDiffCoverage>,
    /// Changed files the coverage report does not know
    pub untracked: Vec<String>,
    pub covered_lines: usize,
    pub missed_lines: usize,
    /// Tool-reported line rate for the whole project
    pub project_line_rate: f64,
    /// Gate in percent
    pub threshold: Option<f64>,
    pub status: Status,
}

impl Report {
    pub fn diff_line_rate(&self) -> Option<f64> {
        ratio(self.covered_lines, self.covered_lines + self.missed_lines)
    }

    pub fn passed(&self) -> bool {
        self.status.passed()
    }
}

pub(crate) fn ratio(part: usize, total: usize) -> Option<f64> {
    if total == 0 {
        None
    } else {
        Some(part as f64 / total as f64)
    }
}
