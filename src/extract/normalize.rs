//! Text clean-up shared by the extraction tiers.

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime};
use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

/// Fixed representation of `screening_datetime`.
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M";

static QUOTED: Lazy<Regex> = Lazy::new(|| Regex::new(r#"["“”](.+?)["“”]"#).expect("valid regex"));
static THROWBACK_WITH_YEAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Throwback Thursday:\s*(.+?)\s*\(\d{4}\)").expect("valid regex"));
static YEAR_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*\(\d{4}\)\s*").expect("valid regex"));
static ISO_DATE_TIME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d{4})-(\d{2})-(\d{2})\s+(?:kl\.?\s*)?(\d{1,2})[.:](\d{2})").expect("valid regex")
});
static SWEDISH_DATE_TIME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(\d{1,2})\s+(januari|februari|mars|april|maj|juni|juli|augusti|september|oktober|november|december)(?:\s+(\d{4}))?\s*(?:,\s*)?(?:kl\.?\s*)?(\d{1,2})[.:](\d{2})",
    )
    .expect("valid regex")
});

const SWEDISH_MONTHS: [&str; 12] = [
    "januari", "februari", "mars", "april", "maj", "juni", "juli", "augusti", "september",
    "oktober", "november", "december",
];

/// Collapse runs of whitespace and trim.
pub fn squash_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Pull the film title out of a heading. Handles `"Title"` in quotes,
/// `Throwback Thursday: Title (1971)` and plain headings.
pub fn clean_title(raw: &str) -> Option<String> {
    let raw = squash_whitespace(raw);
    if raw.is_empty() {
        return None;
    }
    if let Some(c) = QUOTED.captures(&raw) {
        return non_empty(&c[1]);
    }
    if let Some(c) = THROWBACK_WITH_YEAR.captures(&raw) {
        return non_empty(&c[1]);
    }
    if let Some((_, rest)) = raw.split_once("Throwback Thursday:") {
        return non_empty(&YEAR_SUFFIX.replace_all(rest, " "));
    }
    non_empty(&raw)
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

/// Normalise a `datetime` attribute. Keeps the wall-clock time written on
/// the page; the offset is dropped rather than converted.
pub fn normalize_datetime_attr(value: &str) -> Option<String> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.naive_local().format(DATETIME_FORMAT).to_string());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, fmt) {
            return Some(dt.format(DATETIME_FORMAT).to_string());
        }
    }
    None
}

/// Find a screening date-time in free text: `2026-02-26 19.00` or
/// `26 februari 19.00`. A Swedish date without a year takes the year of
/// `reference`.
pub fn datetime_from_text(text: &str, reference: DateTime<FixedOffset>) -> Option<String> {
    if let Some(c) = ISO_DATE_TIME.captures(text) {
        let date = NaiveDate::from_ymd_opt(c[1].parse().ok()?, c[2].parse().ok()?, c[3].parse().ok()?);
        if let Some(dt) = date.and_then(|d| d.and_hms_opt(c[4].parse().ok()?, c[5].parse().ok()?, 0)) {
            return Some(dt.format(DATETIME_FORMAT).to_string());
        }
    }
    let c = SWEDISH_DATE_TIME.captures(text)?;
    let day: u32 = c[1].parse().ok()?;
    let month_name = c[2].to_lowercase();
    let month = SWEDISH_MONTHS.iter().position(|m| *m == month_name)? as u32 + 1;
    let year: i32 = match c.get(3) {
        Some(y) => y.as_str().parse().ok()?,
        None => reference.year(),
    };
    let dt = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(c[4].parse().ok()?, c[5].parse().ok()?, 0)?;
    Some(dt.format(DATETIME_FORMAT).to_string())
}

/// Resolve an `href` against the page URL; only http(s) results are kept.
pub fn absolute_http_url(href: &str, base: Option<&Url>) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }
    let url = match base {
        Some(base) => base.join(href).ok()?,
        None => Url::parse(href).ok()?,
    };
    matches!(url.scheme(), "http" | "https").then(|| url.to_string())
}
