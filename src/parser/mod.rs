pub mod cobertura;
pub mod diff;
pub mod envelope;
pub mod types;
pub mod xml;

pub use diff::parse_diff;
pub use envelope::parse_raw_coverage_data;
pub use types::{CoverageReport, DiffEntry};

use thiserror::Error;

/// Raised when an input cannot be interpreted under its expected grammar.
///
/// Empty results are never reported through this type: a report with no
/// files or a diff with no entries is a successful parse.
#[derive(Debug, Error)]
pub enum ParsingError {
    #[error("Malformed XML: {0}")]
    MalformedXml(String),

    #[error("Missing required element <{tag}> under <{node}>")]
    MissingElement { tag: String, node: String },

    #[error("Unexpected root element <{0}>, expected <coverage>")]
    UnexpectedRoot(String),

    #[error("Invalid number {value:?} in attribute {attribute} of <{element}>")]
    InvalidNumber {
        attribute: String,
        element: String,
        value: String,
    },

    #[error("No parsable coverage data in {segments} segment(s): {preview:?}")]
    NoCoverageData { segments: usize, preview: String },

    #[error("Invalid hunk header: {0}")]
    InvalidHunkHeader(String),

    #[error("Missing path in diff header: {0}")]
    MissingDiffHeader(String),
}
