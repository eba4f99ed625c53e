//! Cobertura XML coverage document parser.
//!
//! The element tree is validated once into [`CoberturaDocument`]; every
//! attribute is read there, with missing numeric attributes defaulting to
//! zero and non-numeric ones rejected.

use std::str::FromStr;
use tracing::{debug, instrument};

use super::types::{CoverageReport, FileCoverage};
use super::xml::{self, get_required, Element};
use super::ParsingError;

/// Typed view of a `<coverage>` document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoberturaDocument {
    pub line_rate: f64,
    pub branch_rate: f64,
    pub lines_covered: u64,
    pub lines_valid: u64,
    pub branches_covered: u64,
    pub branches_valid: u64,
    pub complexity: f64,
    pub timestamp: i64,
    pub sources: Vec<String>,
    pub packages: Vec<Package>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Package {
    pub name: Option<String>,
    pub classes: Vec<Class>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Class {
    pub filename: Option<String>,
    pub line_rate: f64,
    pub branch_rate: f64,
    pub complexity: f64,
    pub lines: Vec<Line>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Line {
    pub number: Option<u32>,
    pub hits: i64,
}

impl CoberturaDocument {
    /// Validate a parsed element tree. The root must be `<coverage>` and
    /// must contain `<packages>`; packages, classes and lines may be empty.
    pub fn from_element(root: &Element) -> Result<Self, ParsingError> {
        if root.name != "coverage" {
            return Err(ParsingError::UnexpectedRoot(root.name.clone()));
        }
        let packages_el = get_required(root, "packages")?;

        let sources = root
            .children
            .iter()
            .filter(|c| c.name == "sources")
            .flat_map(|sources| sources.children.iter().filter(|c| c.name == "source"))
            .map(|source| source.text.trim())
            .filter(|source| !source.is_empty())
            .map(str::to_string)
            .collect();

        let packages = packages_el
            .descendants("package")
            .into_iter()
            .map(Package::from_element)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(CoberturaDocument {
            line_rate: number_attr(root, "line-rate")?,
            branch_rate: number_attr(root, "branch-rate")?,
            lines_covered: number_attr(root, "lines-covered")?,
            lines_valid: number_attr(root, "lines-valid")?,
            branches_covered: number_attr(root, "branches-covered")?,
            branches_valid: number_attr(root, "branches-valid")?,
            complexity: number_attr(root, "complexity")?,
            timestamp: number_attr(root, "timestamp")?,
            sources,
            packages,
        })
    }

    /// Flatten into a report keyed by each class's `filename`.
    ///
    /// Classes without a filename or without any `<line>` elements are
    /// skipped. A later class with the same filename replaces an earlier one.
    pub fn into_report(self) -> CoverageReport {
        let mut report = CoverageReport {
            line_rate: self.line_rate,
            branch_rate: self.branch_rate,
            lines_covered: self.lines_covered,
            lines_valid: self.lines_valid,
            branches_covered: self.branches_covered,
            branches_valid: self.branches_valid,
            complexity: self.complexity,
            timestamp: self.timestamp,
            sources: self.sources,
            file_coverage: Default::default(),
        };

        for package in self.packages {
            debug!(
                package = package.name.as_deref().unwrap_or(""),
                classes = package.classes.len(),
                "walking package"
            );
            for class in package.classes {
                insert_class(&mut report, class);
            }
        }

        report
    }
}

fn insert_class(report: &mut CoverageReport, class: Class) {
    let Some(filename) = class.filename else {
        debug!("skipping class without filename");
        return;
    };
    if class.lines.is_empty() {
        debug!(filename = %filename, "skipping class without line data");
        return;
    }

    let mut file = FileCoverage {
        line_rate: class.line_rate,
        branch_rate: class.branch_rate,
        complexity: class.complexity,
        ..Default::default()
    };
    for line in &class.lines {
        let Some(number) = line.number else { continue };
        file.measured.insert(number);
        if line.hits > 0 {
            file.lines.insert(number);
        }
    }
    report.file_coverage.insert(filename, file);
}

impl Package {
    fn from_element(el: &Element) -> Result<Self, ParsingError> {
        let classes = el
            .descendants("class")
            .into_iter()
            .map(Class::from_element)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Package {
            name: el.attribute("name").map(str::to_string),
            classes,
        })
    }
}

impl Class {
    fn from_element(el: &Element) -> Result<Self, ParsingError> {
        // Only the class-level <lines>; <methods> repeat the same lines.
        let lines = el
            .children
            .iter()
            .filter(|c| c.name == "lines")
            .flat_map(|lines| lines.children.iter().filter(|c| c.name == "line"))
            .map(Line::from_element)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Class {
            filename: el
                .attribute("filename")
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(str::to_string),
            line_rate: number_attr(el, "line-rate")?,
            branch_rate: number_attr(el, "branch-rate")?,
            complexity: number_attr(el, "complexity")?,
            lines,
        })
    }
}

impl Line {
    fn from_element(el: &Element) -> Result<Self, ParsingError> {
        Ok(Line {
            number: optional_number_attr(el, "number")?,
            hits: number_attr(el, "hits")?,
        })
    }
}

/// Read a numeric attribute, defaulting to zero when it is absent.
fn number_attr<T: FromStr + Default>(el: &Element, key: &str) -> Result<T, ParsingError> {
    Ok(optional_number_attr(el, key)?.unwrap_or_default())
}

fn optional_number_attr<T: FromStr>(el: &Element, key: &str) -> Result<Option<T>, ParsingError> {
    match el.attribute(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ParsingError::InvalidNumber {
                attribute: key.to_string(),
                element: el.name.clone(),
                value: raw.to_string(),
            }),
    }
}

/// Parse one XML fragment into a coverage report.
#[instrument(skip(fragment), fields(bytes = fragment.len()))]
pub fn parse(fragment: &[u8]) -> Result<CoverageReport, ParsingError> {
    let root = xml::parse_document(fragment)?;
    let document = CoberturaDocument::from_element(&root)?;
    let report = document.into_report();
    debug!(files = report.file_coverage.len(), "parsed coverage document");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" ?>
<coverage version="5.3.1" timestamp="1610313969570" lines-valid="10" lines-covered="7" line-rate="0.7" branches-covered="1" branches-valid="4" branch-rate="0.25" complexity="1.5">
    <sources>
        <source>/src</source>
    </sources>
    <packages>
        <package name="app" line-rate="0.7" branch-rate="0" complexity="0">
            <classes>
                <class name="main.py" filename="app/main.py" complexity="2" line-rate="0.5" branch-rate="0.25">
                    <methods>
                        <method name="run">
                            <lines>
                                <line number="1" hits="1"/>
                            </lines>
                        </method>
                    </methods>
                    <lines>
                        <line number="1" hits="1"/>
                        <line number="2" hits="0"/>
                        <line number="3" hits="4"/>
                        <line number="3" hits="2"/>
                        <line number="4"/>
                    </lines>
                </class>
            </classes>
        </package>
    </packages>
</coverage>"#;

    #[test]
    fn test_parse_report_attributes() {
        let report = parse(SAMPLE.as_bytes()).unwrap();
        assert_eq!(report.line_rate, 0.7);
        assert_eq!(report.branch_rate, 0.25);
        assert_eq!(report.lines_covered, 7);
        assert_eq!(report.lines_valid, 10);
        assert_eq!(report.branches_covered, 1);
        assert_eq!(report.branches_valid, 4);
        assert_eq!(report.complexity, 1.5);
        assert_eq!(report.timestamp, 1610313969570);
        assert_eq!(report.sources, vec!["/src".to_string()]);
    }

    #[test]
    fn test_parse_class_lines() {
        let report = parse(SAMPLE.as_bytes()).unwrap();
        let file = &report.file_coverage["app/main.py"];
        assert_eq!(file.line_rate, 0.5);
        assert_eq!(file.branch_rate, 0.25);
        assert_eq!(file.complexity, 2.0);
        assert_eq!(file.lines.iter().copied().collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(file.measured.iter().copied().collect::<Vec<_>>(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_missing_root_attributes_default_to_zero() {
        let report = parse(b"<coverage><packages/></coverage>").unwrap();
        assert_eq!(report, CoverageReport::default());
    }

    #[test]
    fn test_non_numeric_attribute_is_error() {
        let err = parse(b"<coverage line-rate=\"high\"><packages/></coverage>").unwrap_err();
        match err {
            ParsingError::InvalidNumber { attribute, element, value } => {
                assert_eq!(attribute, "line-rate");
                assert_eq!(element, "coverage");
                assert_eq!(value, "high");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_non_numeric_hits_is_error() {
        let xml = r#"<coverage><packages><package><classes>
            <class filename="a.py"><lines><line number="1" hits="many"/></lines></class>
        </classes></package></packages></coverage>"#;
        assert!(matches!(
            parse(xml.as_bytes()),
            Err(ParsingError::InvalidNumber { .. })
        ));
    }

    #[test]
    fn test_wrong_root_is_rejected() {
        assert!(matches!(
            parse(b"<testsuite/>"),
            Err(ParsingError::UnexpectedRoot(name)) if name == "testsuite"
        ));
    }

    #[test]
    fn test_missing_packages_is_rejected() {
        assert!(matches!(
            parse(b"<coverage line-rate=\"1\"/>"),
            Err(ParsingError::MissingElement { .. })
        ));
    }

    #[test]
    fn test_class_without_filename_is_skipped() {
        let xml = r#"<coverage><packages><package><classes>
            <class name="anon"><lines><line number="1" hits="1"/></lines></class>
        </classes></package></packages></coverage>"#;
        let report = parse(xml.as_bytes()).unwrap();
        assert!(report.file_coverage.is_empty());
    }

    #[test]
    fn test_class_without_lines_is_skipped() {
        let xml = r#"<coverage><packages><package><classes>
            <class filename="empty.py" line-rate="1"><methods/><lines/></class>
        </classes></package></packages></coverage>"#;
        let report = parse(xml.as_bytes()).unwrap();
        assert_eq!(report.file_coverage.len(), 0);
    }

    #[test]
    fn test_uncovered_class_has_empty_line_set() {
        let xml = r#"<coverage><packages><package><classes>
            <class filename="cold.py"><lines><line number="1" hits="0"/><line number="2" hits="0"/></lines></class>
        </classes></package></packages></coverage>"#;
        let report = parse(xml.as_bytes()).unwrap();
        let file = &report.file_coverage["cold.py"];
        assert!(file.lines.is_empty());
        assert_eq!(file.measured.len(), 2);
    }

    #[test]
    fn test_duplicate_filename_last_class_wins() {
        let xml = r#"<coverage><packages>
            <package><classes>
                <class filename="dup.py" line-rate="0.1"><lines><line number="1" hits="1"/></lines></class>
            </classes></package>
            <package><classes>
                <class filename="dup.py" line-rate="0.9"><lines><line number="9" hits="1"/></lines></class>
            </classes></package>
        </packages></coverage>"#;
        let report = parse(xml.as_bytes()).unwrap();
        let file = &report.file_coverage["dup.py"];
        assert_eq!(file.line_rate, 0.9);
        assert_eq!(file.lines.iter().copied().collect::<Vec<_>>(), vec![9]);
    }

    #[test]
    fn test_typed_document_keeps_packages() {
        let root = xml::parse_document(SAMPLE.as_bytes()).unwrap();
        let doc = CoberturaDocument::from_element(&root).unwrap();
        assert_eq!(doc.packages.len(), 1);
        assert_eq!(doc.packages[0].name.as_deref(), Some("app"));
        assert_eq!(doc.packages[0].classes[0].lines.len(), 5);
        assert_eq!(doc.packages[0].classes[0].lines[4], Line { number: Some(4), hits: 0 });
    }

    #[test]
    fn test_parse_is_idempotent() {
        let first = parse(SAMPLE.as_bytes()).unwrap();
        let second = parse(SAMPLE.as_bytes()).unwrap();
        assert_eq!(first, second);
    }
}
