use serde::{Deserialize, Serialize};
use std::fmt;

/// Source reference range.
///
/// Line/column values are 1-based for human-readable diagnostics; byte
/// offsets are 0-based indices into the source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Span {
    #[serde(rename = "line")]
    pub start_line: u32,
    #[serde(rename = "column")]
    pub start_col: u32,
    pub end_line: u32,
    #[serde(rename = "end_column")]
    pub end_col: u32,
    pub start_byte: u32,
    pub end_byte: u32,
}

impl Span {
    /// Create a span from line/column pairs. Byte offsets are left at zero.
    pub fn new(start_line: u32, start_col: u32, end_line: u32, end_col: u32) -> Self {
        Self {
            start_line,
            start_col,
            end_line,
            end_col,
            start_byte: 0,
            end_byte: 0,
        }
    }

    /// Attach byte offsets to a span.
    pub fn with_bytes(mut self, start_byte: u32, end_byte: u32) -> Self {
        self.start_byte = start_byte;
        self.end_byte = end_byte;
        self
    }

    /// Create a zero-width span at a single position.
    pub fn point(line: u32, col: u32) -> Self {
        Self::new(line, col, line, col)
    }

    /// Merge two spans into one that covers both.
    pub fn merge(self, other: Span) -> Span {
        let (start_line, start_col) = (self.start_line, self.start_col)
            .min((other.start_line, other.start_col));
        let (end_line, end_col) =
            (self.end_line, self.end_col).max((other.end_line, other.end_col));

        Span {
            start_line,
            start_col,
            end_line,
            end_col,
            start_byte: self.start_byte.min(other.start_byte),
            end_byte: self.end_byte.max(other.end_byte),
        }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.start_line, self.start_col)
    }
}

/// Holds the source text for error reporting.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub name: String,
    pub source: String,
    /// Cached line start byte offsets for fast line lookup.
    line_starts: Vec<usize>,
}

impl SourceFile {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        let source = source.into();
        let line_starts = std::iter::once(0)
            .chain(source.match_indices('\n').map(|(i, _)| i + 1))
            .collect();
        Self {
            name: name.into(),
            source,
            line_starts,
        }
    }

    /// Extract a source line by 1-based line number.
    ///
    /// Returns `None` if the line number is out of range.
    pub fn line(&self, line_number: u32) -> Option<&str> {
        let idx = line_number.checked_sub(1)? as usize;
        let start = *self.line_starts.get(idx)?;
        let end = self
            .line_starts
            .get(idx + 1)
            .map(|&s| s.saturating_sub(1))
            .unwrap_or(self.source.len());
        Some(self.source[start..end].trim_end_matches('\r'))
    }

    /// Text covered by a span's byte range, if the range is in bounds.
    pub fn snippet(&self, span: Span) -> Option<&str> {
        self.source
            .get(span.start_byte as usize..span.end_byte as usize)
    }

    pub fn line_count(&self) -> usize {
        self.line_starts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_point() {
        let s = Span::point(1, 5);
        assert_eq!(s.start_line, 1);
        assert_eq!(s.start_col, 5);
        assert_eq!(s.end_line, 1);
        assert_eq!(s.end_col, 5);
    }

    #[test]
    fn test_span_merge() {
        let a = Span::new(1, 5, 1, 10).with_bytes(4, 9);
        let b = Span::new(2, 3, 2, 8).with_bytes(14, 19);
        let merged = a.merge(b);
        assert_eq!((merged.start_line, merged.start_col), (1, 5));
        assert_eq!((merged.end_line, merged.end_col), (2, 8));
        assert_eq!((merged.start_byte, merged.end_byte), (4, 19));
    }

    #[test]
    fn test_span_merge_same_line() {
        let a = Span::new(1, 5, 1, 10);
        let b = Span::new(1, 3, 1, 8);
        let merged = a.merge(b);
        assert_eq!(merged.start_col, 3);
        assert_eq!(merged.end_col, 10);
    }

    #[test]
    fn test_span_display() {
        let s = Span::new(3, 7, 3, 15);
        assert_eq!(format!("{s}"), "3:7");
    }

    #[test]
    fn test_span_json_field_names() {
        let json = serde_json::to_string(&Span::new(1, 2, 3, 4)).unwrap();
        assert!(json.contains("\"line\":1"));
        assert!(json.contains("\"column\":2"));
        assert!(json.contains("\"end_column\":4"));
    }

    #[test]
    fn test_source_file_line_extraction() {
        let src = SourceFile::new("test.fe", "line one\nline two\nline three");
        assert_eq!(src.line(1), Some("line one"));
        assert_eq!(src.line(2), Some("line two"));
        assert_eq!(src.line(3), Some("line three"));
        assert_eq!(src.line(0), None);
        assert_eq!(src.line(4), None);
    }

    #[test]
    fn test_source_file_crlf() {
        let src = SourceFile::new("test.fe", "line one\r\nline two\r\n");
        assert_eq!(src.line(1), Some("line one"));
        assert_eq!(src.line(2), Some("line two"));
    }

    #[test]
    fn test_source_file_snippet() {
        let src = SourceFile::new("test.fe", "let x = 42;");
        let span = Span::new(1, 9, 1, 11).with_bytes(8, 10);
        assert_eq!(src.snippet(span), Some("42"));
        assert_eq!(src.snippet(Span::default().with_bytes(8, 99)), None);
    }
}
