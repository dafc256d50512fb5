//! Cleanup applied to every transcript before classification.

use std::sync::LazyLock;

use regex::Regex;

/// A line that holds nothing but an arabic page number ("12", "- 12 -", "Page 3 of 20").
static PAGE_NUMBER_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^[\s\-–—]*(page\s+)?\d+(\s+of\s+\d+)?[\s\-–—]*$").expect("valid regex")
});

/// A roman page number in footer form ("Page xiv", "xiv of 300", "- xiv -").
/// A bare numeral is indistinguishable from a heading such as "IV".
static ROMAN_FOOTER_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(?:page\s+(?P<a>[ivxlcdm]+)(?:\s+of\s+\d+)?|(?P<b>[ivxlcdm]+)\s+of\s+\d+|[\-–—]\s*(?P<c>[ivxlcdm]+)\s*[\-–—])\s*$",
    )
    .expect("valid regex")
});

static ROMAN_NUMERAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^m{0,4}(cm|cd|d?c{0,3})(xc|xl|l?x{0,3})(ix|iv|v?i{0,3})$").expect("valid regex")
});

fn is_page_number_line(line: &str) -> bool {
    if PAGE_NUMBER_LINE_RE.is_match(line) {
        return true;
    }
    ROMAN_FOOTER_LINE_RE.captures(line).is_some_and(|caps| {
        ["a", "b", "c"]
            .iter()
            .filter_map(|name| caps.name(name))
            .any(|numeral| ROMAN_NUMERAL_RE.is_match(numeral.as_str()))
    })
}

/// Trim every line and drop page-number-only (and blank) lines at the start
/// and end of the text. Interior blank lines are kept as paragraph breaks.
pub fn normalize(text: &str) -> String {
    let lines: Vec<&str> = text.lines().map(str::trim).collect();
    let noise = |line: &&str| line.is_empty() || is_page_number_line(line);

    let start = lines.iter().position(|l| !noise(l)).unwrap_or(lines.len());
    let end = lines
        .iter()
        .rposition(|l| !noise(l))
        .map_or(start, |i| i + 1);

    lines[start..end.max(start)].join("\n")
}

/// Remove a leading, case-insensitive echo of a chapter heading.
///
/// Returns the text unchanged when it does not start with `label`, when the
/// label only matches part of a word, or when nothing would remain.
pub fn strip_heading_echo(text: &str, label: &str) -> String {
    let label = label.trim();
    let body = text.trim_start().trim_start_matches('#').trim_start();
    if label.is_empty() {
        return text.to_string();
    }

    let mut chars = body.char_indices();
    for expected in label.chars() {
        match chars.next() {
            Some((_, c)) if c.to_lowercase().eq(expected.to_lowercase()) => {}
            _ => return text.to_string(),
        }
    }
    let consumed = chars.next().map_or(body.len(), |(i, _)| i);
    let rest = &body[consumed..];
    if rest.chars().next().is_some_and(char::is_alphanumeric) {
        return text.to_string();
    }

    let rest = rest
        .trim_start_matches(|c: char| matches!(c, ':' | '.' | '-' | '–' | '—'))
        .trim_start();
    if rest.is_empty() {
        text.to_string()
    } else {
        rest.to_string()
    }
}
