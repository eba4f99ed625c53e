use std::fmt;
use tracing::{debug, instrument};

use super::types::DiffEntry;
use super::ParsingError;

const DEV_NULL: &str = "/dev/null";

/// One file section of a unified diff.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilePatch {
    /// Pre-image path, without the `a/` prefix
    pub source_path: String,
    /// Post-image path, without the `b/` prefix
    pub target_path: String,
    pub is_added: bool,
    pub is_removed: bool,
    pub is_binary: bool,
    pub is_rename: bool,
    pub hunks: Vec<Hunk>,
}

/// A contiguous region of changes within a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub old_start: u32,
    pub old_count: u32,
    pub new_start: u32,
    pub new_count: u32,
    /// Hunk body lines, each prefixed with `+`, `-`, ` ` or `\`
    pub lines: Vec<String>,
}

impl Hunk {
    /// Post-image line numbers of the added lines, in order.
    ///
    /// Parsed hunks never hold more post-image lines than `new_count`, and
    /// `new_start + new_count` fits in a `u32`.
    pub fn added_lines(&self) -> Vec<u32> {
        let mut added = Vec::new();
        let mut target_line = self.new_start;
        for line in &self.lines {
            match line.as_bytes().first() {
                Some(b'+') => {
                    added.push(target_line);
                    target_line = target_line.saturating_add(1);
                }
                Some(b' ') => target_line = target_line.saturating_add(1),
                _ => {}
            }
        }
        added
    }
}

impl fmt::Display for Hunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "@@ -{},{} +{},{} @@",
            self.old_start, self.old_count, self.new_start, self.new_count
        )
    }
}

/// Line budget left in the hunk currently being read.
struct OpenHunk {
    old_remaining: u32,
    new_remaining: u32,
}

impl OpenHunk {
    fn new(hunk: &Hunk) -> Self {
        OpenHunk {
            old_remaining: hunk.old_count,
            new_remaining: hunk.new_count,
        }
    }

    fn is_done(&self) -> bool {
        self.old_remaining == 0 && self.new_remaining == 0
    }
}

/// Split a unified diff into per-file patches.
///
/// Accepts `git diff` output as well as plain `---`/`+++` diffs. Hunk line
/// counts decide where a hunk ends, so removed lines that begin with `--`
/// are not read as file headers.
pub fn parse_patches(raw_diff: &str) -> Result<Vec<FilePatch>, ParsingError> {
    let mut files: Vec<FilePatch> = Vec::new();
    let mut current: Option<FilePatch> = None;
    let mut open: Option<OpenHunk> = None;
    let mut saw_target = false;

    for line in raw_diff.lines() {
        if let Some(budget) = open.as_mut() {
            if let Some(file) = current.as_mut() {
                if consume_hunk_line(file, budget, line) {
                    if budget.is_done() {
                        open = None;
                    }
                    continue;
                }
            }
            if let Some(hunk) = current.as_ref().and_then(|file| file.hunks.last()) {
                debug!(hunk = %hunk, line = %line, "hunk ended before its declared length");
            }
            open = None;
        }

        if let Some(rest) = line.strip_prefix("diff --git ") {
            finish_file(&mut files, &mut current);
            let (source_path, target_path) = parse_git_header(rest)?;
            current = Some(FilePatch {
                source_path,
                target_path,
                ..Default::default()
            });
            saw_target = false;
            continue;
        }

        if let Some(rest) = line.strip_prefix("--- ") {
            let starts_new_file = match current.as_ref() {
                None => true,
                Some(file) => saw_target || !file.hunks.is_empty(),
            };
            if starts_new_file {
                finish_file(&mut files, &mut current);
                current = Some(FilePatch::default());
                saw_target = false;
            }
            if let Some(file) = current.as_mut() {
                let path = header_path(rest);
                if path == DEV_NULL {
                    file.is_added = true;
                } else {
                    file.source_path = strip_side_prefix(path, "a/");
                }
            }
            continue;
        }

        if let Some(rest) = line.strip_prefix("+++ ") {
            let file = current.get_or_insert_with(FilePatch::default);
            let path = header_path(rest);
            if path == DEV_NULL {
                file.is_removed = true;
            } else {
                file.target_path = strip_side_prefix(path, "b/");
            }
            saw_target = true;
            continue;
        }

        if line.starts_with("@@") {
            let file = current.as_mut().ok_or_else(|| {
                ParsingError::MissingDiffHeader(format!("hunk without a file header: {}", line))
            })?;
            let (old_start, old_count, new_start, new_count) = parse_hunk_header(line)?;
            let hunk = Hunk {
                old_start,
                old_count,
                new_start,
                new_count,
                lines: Vec::new(),
            };
            let budget = OpenHunk::new(&hunk);
            file.hunks.push(hunk);
            if !budget.is_done() {
                open = Some(budget);
            }
            continue;
        }

        let Some(file) = current.as_mut() else {
            continue;
        };
        if line.starts_with("Binary files ") || line.starts_with("GIT binary patch") {
            file.is_binary = true;
        } else if line.starts_with("deleted file mode") {
            file.is_removed = true;
        } else if line.starts_with("new file mode") {
            file.is_added = true;
        } else if let Some(path) = line.strip_prefix("rename from ") {
            file.is_rename = true;
            file.source_path = unquote(path.trim()).to_string();
        } else if let Some(path) = line.strip_prefix("rename to ") {
            file.is_rename = true;
            file.target_path = unquote(path.trim()).to_string();
        }
    }

    finish_file(&mut files, &mut current);
    Ok(files)
}

/// Record one body line of the open hunk. Returns false when the line
/// cannot belong to a hunk or would exceed the hunk's declared counts.
fn consume_hunk_line(file: &mut FilePatch, budget: &mut OpenHunk, line: &str) -> bool {
    let Some(hunk) = file.hunks.last_mut() else {
        return false;
    };
    match line.as_bytes().first() {
        Some(b'+') if budget.new_remaining > 0 => budget.new_remaining -= 1,
        Some(b'-') if budget.old_remaining > 0 => budget.old_remaining -= 1,
        Some(b' ') | None if budget.old_remaining > 0 && budget.new_remaining > 0 => {
            budget.old_remaining -= 1;
            budget.new_remaining -= 1;
        }
        Some(b'\\') => {}
        _ => return false,
    }
    // Some tools strip the space from blank context lines.
    if line.is_empty() {
        hunk.lines.push(" ".to_string());
    } else {
        hunk.lines.push(line.to_string());
    }
    true
}

fn finish_file(files: &mut Vec<FilePatch>, file: &mut Option<FilePatch>) {
    if let Some(file) = file.take() {
        files.push(file);
    }
}

fn parse_git_header(rest: &str) -> Result<(String, String), ParsingError> {
    let rest = rest.trim();
    if let Some((a_path, b_path)) = rest.split_once(" b/") {
        let source = strip_side_prefix(a_path, "a/");
        return Ok((source, b_path.to_string()));
    }
    if let Some((a_path, b_path)) = rest.split_once("\" \"") {
        let source = strip_side_prefix(&format!("{}\"", a_path), "a/");
        let target = strip_side_prefix(&format!("\"{}", b_path), "b/");
        return Ok((source, target));
    }
    Err(ParsingError::MissingDiffHeader(format!("diff --git {}", rest)))
}

/// Path of a `---`/`+++` header, without any trailing timestamp.
fn header_path(rest: &str) -> &str {
    let path = rest.split('\t').next().unwrap_or(rest).trim_end();
    unquote(path)
}

fn unquote(path: &str) -> &str {
    path.strip_prefix('"')
        .and_then(|p| p.strip_suffix('"'))
        .unwrap_or(path)
}

fn strip_side_prefix(path: &str, prefix: &str) -> String {
    let path = unquote(path);
    path.strip_prefix(prefix).unwrap_or(path).to_string()
}

fn parse_hunk_header(line: &str) -> Result<(u32, u32, u32, u32), ParsingError> {
    let invalid = || ParsingError::InvalidHunkHeader(line.to_string());
    let header = line.strip_prefix("@@").ok_or_else(invalid)?;
    let mut parts = header.split_whitespace();
    let old_part = parts.next().ok_or_else(invalid)?;
    let new_part = parts.next().ok_or_else(invalid)?;
    if parts.next() != Some("@@") {
        return Err(invalid());
    }

    let (old_start, old_count) = parse_range(old_part, '-').ok_or_else(invalid)?;
    let (new_start, new_count) = parse_range(new_part, '+').ok_or_else(invalid)?;
    // Line numbers are counted up from the start; the range must stay in u32.
    old_start.checked_add(old_count).ok_or_else(invalid)?;
    new_start.checked_add(new_count).ok_or_else(invalid)?;

    Ok((old_start, old_count, new_start, new_count))
}

fn parse_range(part: &str, prefix: char) -> Option<(u32, u32)> {
    let range = part.strip_prefix(prefix)?;
    let (start, count) = match range.split_once(',') {
        Some((start, count)) => (start, count),
        None => (range, "1"),
    };
    Some((start.parse().ok()?, count.parse().ok()?))
}

/// Parse a unified diff into the changed lines of each file.
///
/// Binary patches and removed files are skipped. A file with no added
/// lines, such as a pure rename, is kept with an empty line list.
#[instrument(skip(raw_diff), fields(bytes = raw_diff.len()))]
pub fn parse_diff(raw_diff: &str) -> Result<Vec<DiffEntry>, ParsingError> {
    let patches = parse_patches(raw_diff)?;
    let entries: Vec<DiffEntry> = patches
        .into_iter()
        .filter_map(|patch| {
            if patch.is_binary {
                debug!(path = %patch.target_path, "skipping binary patch");
                return None;
            }
            if patch.is_removed {
                debug!(path = %patch.source_path, "skipping removed file");
                return None;
            }
            debug!(
                path = %patch.target_path,
                added = patch.is_added,
                renamed = patch.is_rename,
                hunks = patch.hunks.len(),
                "collecting changed lines"
            );
            Some(DiffEntry {
                lines: patch.hunks.iter().flat_map(Hunk::added_lines).collect(),
                filename: patch.target_path,
            })
        })
        .collect();
    debug!(files = entries.len(), "parsed diff");
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDONS_DIFF: &str = r#"diff --git a/guillotina/addons.py b/guillotina/addons.py
index 8ad9304b..de0e1d25 100644
--- a/guillotina/addons.py
+++ b/guillotina/addons.py
@@ -29,6 +29,7 @@ async def install(container, addon):
         await install(container, dependency)
     await apply_coroutine(handler.install, container, request)
     registry = task_vars.registry.get()
+    registry
     config = registry.for_interface(IAddons)
     config["enabled"] |= {addon}

"#;

    #[test]
    fn test_parse_diff() {
        let diff = parse_diff(ADDONS_DIFF).unwrap();
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].filename, "guillotina/addons.py");
        assert_eq!(diff[0].lines, vec![32]);
    }

    #[test]
    fn test_parse_diff_ignore_binary_and_removed() {
        let diff = r#"diff --git a/logo.png b/logo.png
index 1111111..2222222 100644
Binary files a/logo.png and b/logo.png differ
diff --git a/old.py b/old.py
deleted file mode 100644
index e69de29..0000000
--- a/old.py
+++ /dev/null
@@ -1,2 +0,0 @@
-hello
-world
"#;
        assert_eq!(parse_diff(diff).unwrap().len(), 0);
    }

    #[test]
    fn test_git_binary_patch_is_skipped() {
        let diff = "diff --git a/font.woff b/font.woff\nnew file mode 100644\nGIT binary patch\nliteral 10\nzcmV\n\nliteral 0\nHcmV?d00001\n\n";
        let patches = parse_patches(diff).unwrap();
        assert_eq!(patches.len(), 1);
        assert!(patches[0].is_binary);
        assert!(parse_diff(diff).unwrap().is_empty());
    }

    #[test]
    fn test_parse_multiple_hunks_and_files() {
        let diff = r#"diff --git a/src/main.rs b/src/main.rs
index abc1234..def5678 100644
--- a/src/main.rs
+++ b/src/main.rs
@@ -1,3 +1,4 @@
 fn main() {
-    println!("old");
+    println!("new");
+    // Added a comment
 }
@@ -20,3 +21,4 @@ fn helper() {
 a
+b
 c
 d
diff --git a/README.md b/README.md
--- a/README.md
+++ b/README.md
@@ -1 +1 @@
-# Title
+# New title
"#;
        let entries = parse_diff(diff).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].filename, "src/main.rs");
        assert_eq!(entries[0].lines, vec![2, 3, 22]);
        assert_eq!(entries[1].filename, "README.md");
        assert_eq!(entries[1].lines, vec![1]);
    }

    #[test]
    fn test_parse_new_file() {
        let diff = r#"diff --git a/new_file.txt b/new_file.txt
new file mode 100644
index 0000000..e69de29
--- /dev/null
+++ b/new_file.txt
@@ -0,0 +1,2 @@
+hello
+world
"#;
        let patches = parse_patches(diff).unwrap();
        assert!(patches[0].is_added);
        assert!(!patches[0].is_removed);
        let entries = parse_diff(diff).unwrap();
        assert_eq!(entries[0].lines, vec![1, 2]);
    }

    #[test]
    fn test_pure_rename_is_kept_with_no_lines() {
        let diff = r#"diff --git a/src/old_name.py b/src/new_name.py
similarity index 100%
rename from src/old_name.py
rename to src/new_name.py
"#;
        let patches = parse_patches(diff).unwrap();
        assert!(patches[0].is_rename);
        assert_eq!(patches[0].source_path, "src/old_name.py");
        let entries = parse_diff(diff).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].filename, "src/new_name.py");
        assert!(entries[0].lines.is_empty());
    }

    #[test]
    fn test_removed_line_that_looks_like_header() {
        let diff = r#"diff --git a/schema.sql b/schema.sql
--- a/schema.sql
+++ b/schema.sql
@@ -1,3 +1,3 @@
--- old comment
+-- new comment
 CREATE TABLE t (id int);
 -- trailing
"#;
        let patches = parse_patches(diff).unwrap();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].hunks[0].lines.len(), 4);
        let entries = parse_diff(diff).unwrap();
        assert_eq!(entries[0].lines, vec![1]);
    }

    #[test]
    fn test_plain_unified_diff_without_git_header() {
        let diff = "--- a/one.txt\t2021-01-01 00:00:00\n+++ b/one.txt\t2021-01-02 00:00:00\n@@ -1 +1,2 @@\n x\n+y\n--- a/two.txt\n+++ b/two.txt\n@@ -5,0 +6 @@\n+z\n";
        let entries = parse_diff(diff).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].filename, "one.txt");
        assert_eq!(entries[0].lines, vec![2]);
        assert_eq!(entries[1].filename, "two.txt");
        assert_eq!(entries[1].lines, vec![6]);
    }

    #[test]
    fn test_no_newline_marker_is_ignored() {
        let diff = "diff --git a/f b/f\n--- a/f\n+++ b/f\n@@ -1 +1 @@\n-a\n\\ No newline at end of file\n+b\n\\ No newline at end of file\n";
        let entries = parse_diff(diff).unwrap();
        assert_eq!(entries[0].lines, vec![1]);
    }

    #[test]
    fn test_malformed_hunk_header_is_error() {
        let diff = "diff --git a/f b/f\n--- a/f\n+++ b/f\n@@ -x,1 +1 @@\n+a\n";
        assert!(matches!(
            parse_diff(diff),
            Err(ParsingError::InvalidHunkHeader(_))
        ));
        let unterminated = "diff --git a/f b/f\n--- a/f\n+++ b/f\n@@ -1 +1\n+a\n";
        assert!(parse_diff(unterminated).is_err());
    }

    #[test]
    fn test_hunk_without_file_is_error() {
        assert!(matches!(
            parse_diff("@@ -1 +1 @@\n+a\n"),
            Err(ParsingError::MissingDiffHeader(_))
        ));
    }

    #[test]
    fn test_parse_empty_diff() {
        assert!(parse_diff("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_hunk_header_default_counts() {
        assert_eq!(parse_hunk_header("@@ -3 +4 @@").unwrap(), (3, 1, 4, 1));
        assert_eq!(
            parse_hunk_header("@@ -29,6 +29,7 @@ async def install").unwrap(),
            (29, 6, 29, 7)
        );
    }

    #[test]
    fn test_hunk_range_past_u32_is_error() {
        let diff = "diff --git a/f b/f\n--- a/f\n+++ b/f\n@@ -1 +4294967295,2 @@\n+a\n+b\n";
        assert!(matches!(
            parse_diff(diff),
            Err(ParsingError::InvalidHunkHeader(_))
        ));
        assert!(parse_hunk_header("@@ -4294967295,1 +1 @@").is_err());
        assert_eq!(
            parse_hunk_header("@@ -1 +4294967294,1 @@").unwrap(),
            (1, 1, 4294967294, 1)
        );
    }

    #[test]
    fn test_lines_past_declared_count_end_hunk() {
        let diff = "diff --git a/f b/f\n--- a/f\n+++ b/f\n@@ -1,3 +1,1 @@\n+a\n+b\n-c\n";
        let patches = parse_patches(diff).unwrap();
        assert_eq!(patches[0].hunks[0].lines, vec!["+a".to_string()]);
        assert_eq!(parse_diff(diff).unwrap()[0].lines, vec![1]);
    }

    #[test]
    fn test_hunk_display() {
        let patches = parse_patches(ADDONS_DIFF).unwrap();
        assert_eq!(patches[0].hunks[0].to_string(), "@@ -29,6 +29,7 @@");
    }

    #[test]
    fn test_duplicate_lines_are_preserved() {
        let hunk = Hunk {
            old_start: 1,
            old_count: 0,
            new_start: 4,
            new_count: 2,
            lines: vec!["+a".to_string(), "+b".to_string()],
        };
        let mut entry_lines = hunk.added_lines();
        entry_lines.extend(hunk.added_lines());
        assert_eq!(entry_lines, vec![4, 5, 4, 5]);
    }
}
