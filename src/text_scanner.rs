// =============================================================================
// text_scanner.rs — TURNING TABLE-CELL SOUP INTO NUMBERS
// =============================================================================
//
// The exchange publishes numbers the way humans write them: "1,234.50",
// " 30.01 %", "N/A", a blank cell, the occasional "-". None of that should
// ever take a run down. Every helper in here returns Option and treats
// anything unreadable as "absent".
//
// The share-holding labels are matched with an Aho-Corasick automaton so a
// single pass over a cell tells us which holder group it describes, no
// matter how much whitespace and markup debris surrounds the label.
// =============================================================================

use aho_corasick::{AhoCorasick, MatchKind};
use std::fmt;
use std::sync::LazyLock;
use tracing::debug;

/// Safe numeric parse.
///
/// - empty, whitespace-only and `n/a` (any case) are absent
/// - thousands separators and embedded whitespace are stripped
/// - anything that still does not parse, or parses to NaN/infinity, is absent
pub fn parse_numeric(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("n/a") {
        return None;
    }

    let cleaned: String = trimmed
        .chars()
        .filter(|c| *c != ',' && !c.is_whitespace())
        .collect();

    match cleaned.parse::<f64>() {
        Ok(value) if value.is_finite() => Some(value),
        _ => {
            debug!(raw = raw, "Unparseable numeric cell treated as absent");
            None
        }
    }
}

/// Parse a whole-number count such as "1,103,619,910". Thousands
/// separators and whitespace are dropped and a zero fraction (".00") is
/// tolerated. Any other character, or a real fractional part, means absent.
pub fn parse_count(raw: &str) -> Option<i64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| *c != ',' && !c.is_whitespace())
        .collect();

    let whole = match cleaned.split_once('.') {
        Some((whole, fraction)) if fraction.bytes().all(|b| b == b'0') => whole,
        Some(_) => {
            debug!(raw = raw, "Fractional count treated as absent");
            return None;
        }
        None => cleaned.as_str(),
    };

    if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    whole.parse().ok()
}

/// Parse an integer cell with the same leniency as [`parse_numeric`].
/// Fractional values are rejected rather than truncated.
pub fn parse_integer(raw: &str) -> Option<i64> {
    let value = parse_numeric(raw)?;
    if value.fract() != 0.0 || value.abs() > i64::MAX as f64 {
        return None;
    }
    Some(value as i64)
}

/// Pull `key` out of a link's query string. Works for absolute and relative
/// hrefs alike (`displayCompany.php?name=ACI`). Empty values are absent.
pub fn query_param(href: &str, key: &str) -> Option<String> {
    let (_, query) = href.split_once('?')?;
    let query = query.split('#').next().unwrap_or_default();

    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Collapse runs of whitespace (including the newlines scraper hands back
/// for `<br>`-split cells) into single spaces and trim the ends.
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Header comparison key: lowercase with all whitespace removed, so
/// "P/E 1*(Basic)" and "p/e 1* (basic)" compare equal.
pub fn header_key(header: &str) -> String {
    header
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

/// The holder groups listed on a company's share-holding breakdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShareHolder {
    SponsorDirector,
    Govt,
    Institute,
    Foreign,
    Public,
}

impl ShareHolder {
    /// Column order used by the `Symbol_Share` table.
    pub const ALL: [ShareHolder; 5] = [
        ShareHolder::SponsorDirector,
        ShareHolder::Govt,
        ShareHolder::Institute,
        ShareHolder::Foreign,
        ShareHolder::Public,
    ];

    pub fn index(&self) -> usize {
        match self {
            ShareHolder::SponsorDirector => 0,
            ShareHolder::Govt => 1,
            ShareHolder::Institute => 2,
            ShareHolder::Foreign => 3,
            ShareHolder::Public => 4,
        }
    }
}

impl fmt::Display for ShareHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShareHolder::SponsorDirector => write!(f, "Sponsor/Director"),
            ShareHolder::Govt => write!(f, "Govt"),
            ShareHolder::Institute => write!(f, "Institute"),
            ShareHolder::Foreign => write!(f, "Foreign"),
            ShareHolder::Public => write!(f, "Public"),
        }
    }
}

/// Label text as it appears on the page, paired with the holder group.
/// "Foreign_share:" shows up on some older snapshots of the page.
static SHARE_LABELS: &[(&str, ShareHolder)] = &[
    ("Sponsor/Director:", ShareHolder::SponsorDirector),
    ("Govt:", ShareHolder::Govt),
    ("Institute:", ShareHolder::Institute),
    ("Foreign_share:", ShareHolder::Foreign),
    ("Foreign:", ShareHolder::Foreign),
    ("Public:", ShareHolder::Public),
];

static SHARE_LABEL_AUTOMATON: LazyLock<AhoCorasick> = LazyLock::new(|| {
    AhoCorasick::builder()
        .ascii_case_insensitive(true)
        .match_kind(MatchKind::LeftmostFirst)
        .build(SHARE_LABELS.iter().map(|(label, _)| *label))
        .expect("share label patterns are static and always compile")
});

/// A share-holding cell after scanning.
#[derive(Debug, Clone, PartialEq)]
pub struct ShareCell {
    pub holder: ShareHolder,
    /// Percentage, or `None` when the label was present but its value was not
    /// a number.
    pub percent: Option<f64>,
}

/// Scan one table cell for a share-holding label and its percentage.
///
/// The value is the last non-empty line after the label, with `%` stripped.
/// Returns `None` when the cell carries no known label.
pub fn scan_share_cell(text: &str) -> Option<ShareCell> {
    let found = SHARE_LABEL_AUTOMATON.find(text)?;
    let holder = SHARE_LABELS[found.pattern().as_usize()].1;

    let value_line = text[found.end()..]
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .unwrap_or_default();

    let percent = parse_numeric(&value_line.replace('%', ""));

    debug!(holder = %holder, raw = value_line, "Share-holding cell scanned");

    Some(ShareCell { holder, percent })
}
