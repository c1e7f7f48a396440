//! # Context Assembler
//!
//! Deterministically cuts the slice of a document a subtask needs.
//! Pure functions only: no I/O, no network.
//!
//! A document is structured by markdown ATX headers (`#` to `######`). A
//! section runs from its header up to, not including, the next header of
//! equal or higher level. Headers inside fenced code blocks are ignored.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Structural or positional reference into the context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextPointer {
    /// Section header titles, matched case-insensitively
    Sections(Vec<String>),
    /// Zero-based line range `[start, end)`
    Lines { start: usize, end: usize },
}

impl ContextPointer {
    pub fn sections<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ContextPointer::Sections(names.into_iter().map(Into::into).collect())
    }

    pub fn lines(start: usize, end: usize) -> Self {
        ContextPointer::Lines { start, end }
    }

    /// Lenient decoding of whatever shape a planner produced.
    ///
    /// Accepts `{"sections": [...]}`, a bare array of titles,
    /// `{"lines": [s, e]}`, `{"lines": {"start": s, "end": e}}` and
    /// `{"start": s, "end": e}`. `null`, `"all"` and anything unrecognised
    /// mean the whole document.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        use serde_json::Value;

        fn titles(items: &[Value]) -> Option<ContextPointer> {
            let names: Vec<String> = items
                .iter()
                .filter_map(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            (!names.is_empty()).then_some(ContextPointer::Sections(names))
        }

        fn range(value: &Value) -> Option<ContextPointer> {
            match value {
                Value::Array(pair) if pair.len() == 2 => Some(ContextPointer::Lines {
                    start: pair[0].as_u64()? as usize,
                    end: pair[1].as_u64()? as usize,
                }),
                Value::Object(map) => Some(ContextPointer::Lines {
                    start: map.get("start")?.as_u64()? as usize,
                    end: map.get("end")?.as_u64()? as usize,
                }),
                _ => None,
            }
        }

        match value {
            Value::Array(items) => titles(items),
            Value::String(s) if !matches!(s.trim(), "" | "all" | "full" | "whole") => {
                Some(ContextPointer::Sections(vec![s.trim().to_string()]))
            }
            Value::Object(map) => {
                if let Some(Value::Array(items)) = map.get("sections") {
                    titles(items)
                } else if let Some(lines) = map.get("lines") {
                    range(lines)
                } else {
                    range(value)
                }
            }
            _ => None,
        }
    }
}

/// A parsed header line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub line: usize,
    pub level: usize,
    pub title: String,
}

/// Outcome of resolving a pointer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub text: String,
    /// The pointer could not be resolved and the whole document was used
    pub fell_back: bool,
}

fn header_regex() -> Option<&'static Regex> {
    static HEADER: OnceLock<Option<Regex>> = OnceLock::new();
    HEADER
        .get_or_init(|| Regex::new(r"^ {0,3}(#{1,6})[ \t]+(.*?)(?:[ \t]+#+)?[ \t]*$").ok())
        .as_ref()
}

fn normalize_title(title: &str) -> String {
    title
        .trim()
        .trim_start_matches('#')
        .trim()
        .to_lowercase()
}

/// Headers in document order
pub fn parse_headers(context: &str) -> Vec<Header> {
    let mut headers = Vec::new();
    let Some(re) = header_regex() else {
        return headers;
    };
    let mut in_fence = false;
    for (line_no, line) in context.lines().enumerate() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        if let Some(caps) = re.captures(line) {
            headers.push(Header {
                line: line_no,
                level: caps[1].len(),
                title: caps[2].trim().to_string(),
            });
        }
    }
    headers
}

/// Extract the text a pointer designates, falling back to the full context
pub fn assemble(context: &str, pointer: &ContextPointer) -> String {
    resolve(context, Some(pointer)).text
}

/// Like [`assemble`], but reports whether the fallback was taken.
/// `None` designates the whole document.
pub fn resolve(context: &str, pointer: Option<&ContextPointer>) -> Resolution {
    let full = || Resolution {
        text: context.to_string(),
        fell_back: false,
    };
    let fallback = |reason: &str| {
        tracing::warn!(reason, "context pointer unresolved, using full context");
        Resolution {
            text: context.to_string(),
            fell_back: true,
        }
    };

    let Some(pointer) = pointer else {
        return full();
    };

    // Lines with their terminators so slices concatenate back exactly
    let lines: Vec<&str> = context.split_inclusive('\n').collect();

    let spans = match pointer {
        ContextPointer::Lines { start, end } => {
            let end = (*end).min(lines.len());
            if *start >= end {
                return fallback("empty line range");
            }
            vec![(*start, end)]
        }
        ContextPointer::Sections(names) => {
            if names.is_empty() {
                return full();
            }
            let headers = parse_headers(context);
            let mut spans = Vec::with_capacity(names.len());
            for name in names {
                let wanted = normalize_title(name);
                let Some(idx) = headers
                    .iter()
                    .position(|h| normalize_title(&h.title) == wanted)
                else {
                    tracing::warn!(section = %name, "section header not found");
                    return fallback("section header not found");
                };
                let header = &headers[idx];
                let end = headers[idx + 1..]
                    .iter()
                    .find(|h| h.level <= header.level)
                    .map(|h| h.line)
                    .unwrap_or(lines.len());
                spans.push((header.line, end));
            }
            spans
        }
    };

    let text = join_spans(&lines, spans);
    if text.trim().is_empty() {
        return fallback("pointer resolved to blank text");
    }
    Resolution {
        text,
        fell_back: false,
    }
}

/// Concatenate spans in document order, merging overlaps so nested or
/// repeated sections are emitted once.
fn join_spans(lines: &[&str], mut spans: Vec<(usize, usize)>) -> String {
    spans.sort_unstable();
    let mut merged: Vec<(usize, usize)> = Vec::with_capacity(spans.len());
    for (start, end) in spans {
        match merged.last_mut() {
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }

    let mut out = String::new();
    for (start, end) in merged {
        for line in &lines[start..end] {
            out.push_str(line);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "# Report\nIntro line.\n## A\nalpha 1\nalpha 2\n### A.1\nnested\n## B\nbeta\n## C\ngamma\n";

    #[test]
    fn test_parse_headers() {
        let headers = parse_headers(DOC);
        let titles: Vec<_> = headers.iter().map(|h| h.title.as_str()).collect();
        assert_eq!(titles, vec!["Report", "A", "A.1", "B", "C"]);
        assert_eq!(headers[2].level, 3);
    }

    #[test]
    fn test_closing_hashes_need_leading_space() {
        let doc = "# Langs\n## C#\nsharp\n## C\nplain\n## Go ##\ngopher\n";
        let titles: Vec<_> = parse_headers(doc).into_iter().map(|h| h.title).collect();
        assert_eq!(titles, vec!["Langs", "C#", "C", "Go"]);

        let sharp = resolve(doc, Some(&ContextPointer::sections(["C#"])));
        assert!(!sharp.fell_back);
        assert_eq!(sharp.text, "## C#\nsharp\n");
        assert_eq!(assemble(doc, &ContextPointer::sections(["C"])), "## C\nplain\n");
    }

    #[test]
    fn test_section_includes_nested_subsections() {
        let text = assemble(DOC, &ContextPointer::sections(["A"]));
        assert_eq!(text, "## A\nalpha 1\nalpha 2\n### A.1\nnested\n");
    }

    #[test]
    fn test_sections_follow_document_order() {
        let text = assemble(DOC, &ContextPointer::sections(["C", "A"]));
        let a = assemble(DOC, &ContextPointer::sections(["A"]));
        let c = assemble(DOC, &ContextPointer::sections(["C"]));
        assert_eq!(text, format!("{}{}", a, c));
    }

    #[test]
    fn test_overlapping_sections_not_duplicated() {
        let text = assemble(DOC, &ContextPointer::sections(["A.1", "A"]));
        assert_eq!(text.matches("nested").count(), 1);
    }

    #[test]
    fn test_case_insensitive_and_hash_prefixed_titles() {
        let text = assemble(DOC, &ContextPointer::sections(["## b"]));
        assert_eq!(text, "## B\nbeta\n");
    }

    #[test]
    fn test_missing_header_returns_full_context() {
        let res = resolve(DOC, Some(&ContextPointer::sections(["A", "Nope"])));
        assert!(res.fell_back);
        assert_eq!(res.text, DOC);
    }

    #[test]
    fn test_idempotent() {
        let pointer = ContextPointer::sections(["B", "A"]);
        assert_eq!(assemble(DOC, &pointer), assemble(DOC, &pointer));
    }

    #[test]
    fn test_line_range_clamped() {
        assert_eq!(assemble(DOC, &ContextPointer::lines(1, 2)), "Intro line.\n");
        let tail = assemble(DOC, &ContextPointer::lines(9, 500));
        assert_eq!(tail, "## C\ngamma\n");
    }

    #[test]
    fn test_empty_line_range_falls_back() {
        let res = resolve(DOC, Some(&ContextPointer::lines(5, 5)));
        assert!(res.fell_back);
        assert_eq!(res.text, DOC);

        let res = resolve(DOC, Some(&ContextPointer::lines(400, 500)));
        assert!(res.fell_back);
    }

    #[test]
    fn test_headers_in_code_fence_ignored() {
        let doc = "## Real\ntext\n```\n## Fake\n```\nmore\n## Next\nx\n";
        let text = assemble(doc, &ContextPointer::sections(["Real"]));
        assert_eq!(text, "## Real\ntext\n```\n## Fake\n```\nmore\n");
        assert!(resolve(doc, Some(&ContextPointer::sections(["Fake"]))).fell_back);
    }

    #[test]
    fn test_no_pointer_is_whole_document() {
        let res = resolve(DOC, None);
        assert!(!res.fell_back);
        assert_eq!(res.text, DOC);
    }

    #[test]
    fn test_pointer_from_value_shapes() {
        use serde_json::json;
        assert_eq!(
            ContextPointer::from_value(&json!({"sections": ["A", "B"]})),
            Some(ContextPointer::sections(["A", "B"]))
        );
        assert_eq!(
            ContextPointer::from_value(&json!(["A"])),
            Some(ContextPointer::sections(["A"]))
        );
        assert_eq!(
            ContextPointer::from_value(&json!({"lines": [3, 9]})),
            Some(ContextPointer::lines(3, 9))
        );
        assert_eq!(
            ContextPointer::from_value(&json!({"start": 1, "end": 2})),
            Some(ContextPointer::lines(1, 2))
        );
        assert_eq!(ContextPointer::from_value(&json!(null)), None);
        assert_eq!(ContextPointer::from_value(&json!("all")), None);
        assert_eq!(ContextPointer::from_value(&json!({"sections": []})), None);
    }
}
