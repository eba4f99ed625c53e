//! Splitting and aggregation of raw coverage uploads.
//!
//! An upload looks like:
//!
//! ```text
//! src/app/__init__.py
//! src/app/main.py
//! <<<<<< network
//! # path=coverage.xml
//! <?xml version="1.0" ?>
//! <coverage ...>...</coverage>
//! <<<<<< EOF
//! ```
//!
//! Lines before the `network` marker list the files tracked by the
//! repository. Each segment after it is an optional `# path=` header and a
//! document body closed by an `EOF` marker.

use tracing::{debug, info, instrument, warn};

use super::cobertura;
use super::types::CoverageReport;
use super::ParsingError;

const MARKER_MIN_LEN: usize = 6;
const PATH_HEADER: &str = "# path=";

/// One embedded document recovered from an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment<'a> {
    /// Value of the `# path=` header. Informational only.
    pub path: Option<String>,
    /// Whether the segment was closed by an `EOF` marker
    pub terminated: bool,
    pub body: &'a [u8],
}

impl Segment<'_> {
    pub fn is_blank(&self) -> bool {
        self.body.iter().all(u8::is_ascii_whitespace)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope<'a> {
    /// Repository paths listed before the `network` marker
    pub tracked_files: Vec<String>,
    pub segments: Vec<Segment<'a>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    Network,
    Eof,
}

fn marker(line: &str) -> Option<Marker> {
    let rest = line.trim_start_matches('<');
    if line.len() - rest.len() < MARKER_MIN_LEN {
        return None;
    }
    match rest.trim() {
        "network" => Some(Marker::Network),
        "EOF" => Some(Marker::Eof),
        _ => None,
    }
}

enum State {
    Preamble,
    Between,
    InSegment { start: usize, path: Option<String> },
}

/// Split an upload into its tracked-file preamble and document segments.
///
/// An upload without any `network` marker has no preamble; its content
/// starts directly with the first segment. Blank segments are dropped.
pub fn split(raw: &[u8]) -> Envelope<'_> {
    let mut envelope = Envelope::default();

    let has_network = raw
        .split(|b| *b == b'\n')
        .any(|line| marker(&String::from_utf8_lossy(line)) == Some(Marker::Network));
    let mut state = if has_network {
        State::Preamble
    } else {
        State::Between
    };

    let mut offset = 0;
    for raw_line in raw.split_inclusive(|b| *b == b'\n') {
        let line_start = offset;
        offset += raw_line.len();
        let text = String::from_utf8_lossy(raw_line);
        let line = text.trim_end_matches(['\n', '\r']);

        match marker(line) {
            Some(found) => {
                if let State::InSegment { start, path } = state {
                    push_segment(
                        &mut envelope,
                        Segment {
                            path,
                            terminated: found == Marker::Eof,
                            body: &raw[start..line_start],
                        },
                    );
                }
                state = State::Between;
            }
            None => match state {
                State::Preamble => {
                    let file = line.trim();
                    if !file.is_empty() {
                        envelope.tracked_files.push(file.to_string());
                    }
                }
                State::Between => {
                    if let Some(path) = line.trim_start().strip_prefix(PATH_HEADER) {
                        state = State::InSegment {
                            start: offset,
                            path: Some(path.trim().to_string()),
                        };
                    } else if !line.trim().is_empty() {
                        state = State::InSegment {
                            start: line_start,
                            path: None,
                        };
                    }
                }
                State::InSegment { .. } => {}
            },
        }
    }

    if let State::InSegment { start, path } = state {
        push_segment(
            &mut envelope,
            Segment {
                path,
                terminated: false,
                body: &raw[start..],
            },
        );
    }

    envelope
}

fn push_segment<'a>(envelope: &mut Envelope<'a>, segment: Segment<'a>) {
    if segment.is_blank() {
        debug!(path = ?segment.path, "dropping blank segment");
        return;
    }
    envelope.segments.push(segment);
}

/// Merge reports in order. Scalar fields come from the last report; file
/// entries are merged with later reports replacing earlier ones per path.
pub fn aggregate(reports: Vec<CoverageReport>) -> CoverageReport {
    reports
        .into_iter()
        .fold(CoverageReport::default(), |mut merged, mut next| {
            merged.file_coverage.append(&mut next.file_coverage);
            next.file_coverage = merged.file_coverage;
            next
        })
}

/// Rewrite file keys to tracked repository paths. Unmatched files are
/// dropped. An empty tracked list leaves the report untouched.
pub fn resolve_paths(mut report: CoverageReport, tracked_files: &[String]) -> CoverageReport {
    if tracked_files.is_empty() {
        return report;
    }

    let files = std::mem::take(&mut report.file_coverage);
    for (filename, coverage) in files {
        match resolve_path(&filename, &report.sources, tracked_files) {
            Some(path) => {
                report.file_coverage.insert(path.to_string(), coverage);
            }
            None => debug!(filename = %filename, "ignoring file not tracked by repository"),
        }
    }
    report
}

/// Match a class filename to a tracked path, trying in order:
///
/// 1. the filename itself as a tracked path;
/// 2. the filename (joined onto each `<source>` root unless absolute), taking
///    the longest tracked path it ends with at a `/` boundary;
/// 3. the first tracked path ending in `/<filename>`.
fn resolve_path<'a>(filename: &str, sources: &[String], tracked_files: &'a [String]) -> Option<&'a str> {
    let filename = filename.replace('\\', "/");
    let filename = filename.trim_start_matches("./");
    if let Some(exact) = tracked_files.iter().find(|f| *f == filename) {
        return Some(exact.as_str());
    }

    let candidates: Vec<String> = if is_absolute(filename) {
        vec![filename.to_string()]
    } else {
        sources
            .iter()
            .map(|source| format!("{}/{}", source.replace('\\', "/").trim_end_matches('/'), filename))
            .collect()
    };
    for candidate in &candidates {
        let found = tracked_files
            .iter()
            .filter(|tracked| ends_with_path(candidate, tracked))
            .max_by_key(|tracked| tracked.len());
        if let Some(found) = found {
            return Some(found.as_str());
        }
    }

    let suffix = format!("/{}", filename.trim_start_matches('/'));
    tracked_files
        .iter()
        .find(|f| f.ends_with(&suffix))
        .map(String::as_str)
}

fn is_absolute(path: &str) -> bool {
    path.starts_with('/') || path.as_bytes().get(1) == Some(&b':')
}

/// Whether `path` is `tail` or ends with `/<tail>`.
fn ends_with_path(path: &str, tail: &str) -> bool {
    match path.strip_suffix(tail) {
        Some(head) => !tail.is_empty() && (head.is_empty() || head.ends_with('/')),
        None => false,
    }
}

/// Parse a raw coverage upload into one aggregated report.
///
/// Segments that are not well-formed XML, or are XML but not usable
/// Cobertura documents, are skipped. Fails only when no segment at all is
/// well-formed XML.
#[instrument(skip(raw), fields(bytes = raw.len()))]
pub fn parse_raw_coverage_data(raw: &[u8]) -> Result<CoverageReport, ParsingError> {
    let envelope = split(raw);
    debug!(
        tracked_files = envelope.tracked_files.len(),
        segments = envelope.segments.len(),
        "split coverage upload"
    );

    let mut well_formed = 0usize;
    let mut reports = Vec::new();
    for segment in &envelope.segments {
        debug!(path = ?segment.path, terminated = segment.terminated, "parsing segment");
        match cobertura::parse(segment.body) {
            Ok(report) => {
                well_formed += 1;
                reports.push(resolve_paths(report, &envelope.tracked_files));
            }
            Err(ParsingError::MalformedXml(reason)) => {
                debug!(path = ?segment.path, reason = %reason, "skipping segment that is not XML");
            }
            Err(err) => {
                well_formed += 1;
                warn!(path = ?segment.path, error = %err, "skipping unusable coverage document");
            }
        }
    }

    if well_formed == 0 {
        return Err(ParsingError::NoCoverageData {
            segments: envelope.segments.len(),
            preview: preview(raw),
        });
    }

    let report = aggregate(reports);
    info!(files = report.file_coverage.len(), "parsed coverage upload");
    Ok(report)
}

fn preview(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    text.trim().chars().take(80).collect()
}
