//! Footer text parsing.
//!
//! The reader shows the current position in a footer such as
//! `"Page 12 of 300 • 4%"`, `"Location 1450 of 5200"` or `"Page xiv of 300"`.
//! [`parse_footer`] normalizes all three into a [`LocationSample`].

use std::sync::LazyLock;

use regex::Regex;

use pagescribe_shared::LocationSample;

static PAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bpage\s+(\d+)\s+of\s+(\d+)").expect("valid regex"));

static LOCATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\blocation\s+(\d+)\s+of\s+(\d+)").expect("valid regex"));

static ROMAN_PAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bpage\s+([ivxlcdm]+)\s+of\s+(\d+)").expect("valid regex")
});

/// Parse reader footer text. Returns `None` when no notation matches or the
/// numbers are unusable (zero total, zero position, bad numeral, overflow).
pub fn parse_footer(text: &str) -> Option<LocationSample> {
    if let Some(caps) = PAGE_RE.captures(text) {
        let (page, total) = (number(&caps[1])?, number(&caps[2])?);
        return valid(page, total).then(|| LocationSample::page(page, total));
    }

    if let Some(caps) = LOCATION_RE.captures(text) {
        let (location, total) = (number(&caps[1])?, number(&caps[2])?);
        return valid(location, total).then(|| LocationSample::location(location, total));
    }

    if let Some(caps) = ROMAN_PAGE_RE.captures(text) {
        let (page, total) = (deromanize(&caps[1])?, number(&caps[2])?);
        return valid(page, total).then(|| LocationSample::page(page, total));
    }

    None
}

fn number(digits: &str) -> Option<u32> {
    digits.parse().ok()
}

fn valid(position: u32, total: u32) -> bool {
    position > 0 && total > 0
}

/// Decode a roman numeral using subtractive notation.
///
/// Case-insensitive. Returns `None` for empty input, unknown symbols, or
/// sequences that are not well-formed numerals (e.g. `"IIII"`, `"IC"`).
pub fn deromanize(numeral: &str) -> Option<u32> {
    let values: Vec<i64> = numeral
        .chars()
        .map(roman_value)
        .collect::<Option<Vec<_>>>()?;
    if values.is_empty() {
        return None;
    }

    let mut total: i64 = 0;
    for (i, &value) in values.iter().enumerate() {
        match values.get(i + 1) {
            Some(&next) if value < next => {
                // Only I, X, C subtract, and only from the next two magnitudes.
                if !matches!((value, next), (1, 5 | 10) | (10, 50 | 100) | (100, 500 | 1000)) {
                    return None;
                }
                total -= value;
            }
            _ => total += value,
        }
    }

    let total = u32::try_from(total).ok()?;
    // Reject non-canonical spellings such as "IIII" or "VX" by re-encoding.
    (romanize(total)? == numeral.to_ascii_uppercase()).then_some(total)
}

fn roman_value(c: char) -> Option<i64> {
    match c.to_ascii_uppercase() {
        'I' => Some(1),
        'V' => Some(5),
        'X' => Some(10),
        'L' => Some(50),
        'C' => Some(100),
        'D' => Some(500),
        'M' => Some(1000),
        _ => None,
    }
}

/// Canonical upper-case roman numeral for `1..=3999`.
fn romanize(mut n: u32) -> Option<String> {
    if n == 0 || n > 3999 {
        return None;
    }
    const TABLE: [(u32, &str); 13] = [
        (1000, "M"),
        (900, "CM"),
        (500, "D"),
        (400, "CD"),
        (100, "C"),
        (90, "XC"),
        (50, "L"),
        (40, "XL"),
        (10, "X"),
        (9, "IX"),
        (5, "V"),
        (4, "IV"),
        (1, "I"),
    ];
    let mut out = String::new();
    for (value, symbol) in TABLE {
        while n >= value {
            out.push_str(symbol);
            n -= value;
        }
    }
    Some(out)
}
