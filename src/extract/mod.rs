//! Field extraction from a rendered screening page.
//!
//! Every field has an ordered list of named tiers, from the most specific
//! structural match down to loose text patterns. The first tier producing a
//! non-empty value wins; a field whose tiers all fail is reported missing and
//! the remaining fields are still extracted.

use chrono::{DateTime, FixedOffset};
use scraper::{ElementRef, Html, Selector};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::model::{now_fixed, ExtractionDiagnostics, Field, ScreeningRecord};
use crate::render::RenderedDocument;

pub mod normalize;

use normalize::{absolute_http_url, clean_title, datetime_from_text, normalize_datetime_attr, squash_whitespace};

/// Parse a CSS selector once and hand out a `&'static` to it.
macro_rules! css {
    ($s:expr) => {{
        static SEL: once_cell::sync::Lazy<Selector> =
            once_cell::sync::Lazy::new(|| Selector::parse($s).expect("valid selector"));
        &*SEL
    }};
}

/// The "last updated" footer carries its own `<time>`; it is never the screening.
const UPDATED_INFO_CLASS: &str = "sv-font-uppdaterad-info-ny";
const DEFAULT_LOCATION_TIER: &str = "configured_default";
const MAX_LOCATION_LEN: usize = 120;

const SKIP_TAGS: &[&str] = &["head", "script", "style", "noscript", "template", "svg"];
const BLOCK_TAGS: &[&str] = &[
    "address", "article", "aside", "blockquote", "br", "dd", "div", "dl", "dt", "figure",
    "footer", "form", "h1", "h2", "h3", "h4", "h5", "h6", "header", "hr", "li", "main", "nav",
    "ol", "p", "section", "table", "td", "th", "tr", "ul",
];

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("document could not be read: {0}")]
    Unreadable(String),
    #[error("no fields could be extracted from {url}")]
    Empty {
        url: String,
        screenshot: Option<PathBuf>,
    },
}

struct Ctx<'a> {
    base: Option<Url>,
    extracted_at: DateTime<FixedOffset>,
    default_location: Option<&'a str>,
    text: String,
}

type Locate = fn(&Html, &Ctx<'_>) -> Option<String>;

struct Tier {
    name: &'static str,
    locate: Locate,
}

const TITLE_TIERS: &[Tier] = &[
    Tier { name: "sidrubrik", locate: title_sidrubrik },
    Tier { name: "h1", locate: title_h1 },
    Tier { name: "title_class", locate: title_class },
    Tier { name: "heading_class", locate: title_heading_class },
];

const DATETIME_TIERS: &[Tier] = &[
    Tier { name: "tid_label_time", locate: datetime_tid_label_time },
    Tier { name: "time_attribute", locate: datetime_time_attribute },
    Tier { name: "tid_label_text", locate: datetime_tid_label_text },
    Tier { name: "page_text", locate: datetime_page_text },
];

const LOCATION_TIERS: &[Tier] = &[
    Tier { name: "plats_label", locate: location_plats_label },
    Tier { name: "plats_text", locate: location_plats_text },
    Tier { name: "location_class", locate: location_class },
    Tier { name: DEFAULT_LOCATION_TIER, locate: location_default },
];

const BOOKING_TIERS: &[Tier] = &[
    Tier { name: "ticket_link", locate: booking_ticket_link },
    Tier { name: "booking_link_text", locate: booking_link_text },
    Tier { name: "booking_class", locate: booking_class },
    Tier { name: "ticket_host", locate: booking_ticket_host },
];

fn tiers(field: Field) -> &'static [Tier] {
    match field {
        Field::Title => TITLE_TIERS,
        Field::ScreeningDatetime => DATETIME_TIERS,
        Field::Location => LOCATION_TIERS,
        Field::BookingUrl => BOOKING_TIERS,
    }
}

/// Tier names for `field`, in evaluation order.
pub fn tier_names(field: Field) -> Vec<&'static str> {
    tiers(field).iter().map(|t| t.name).collect()
}

// ---- text helpers ----

fn element_text(el: ElementRef<'_>) -> String {
    squash_whitespace(&el.text().collect::<Vec<_>>().join(" "))
}

fn in_updated_info(el: ElementRef<'_>) -> bool {
    std::iter::once(el)
        .chain(el.ancestors().filter_map(ElementRef::wrap))
        .any(|e| e.value().classes().any(|c| c == UPDATED_INFO_CLASS))
}

fn collect_text(el: ElementRef<'_>, out: &mut String) {
    for child in el.children() {
        if let Some(text) = child.value().as_text() {
            out.push_str(text);
            continue;
        }
        let Some(child_el) = ElementRef::wrap(child) else {
            continue;
        };
        let name = child_el.value().name();
        if SKIP_TAGS.contains(&name) || in_updated_info(child_el) {
            continue;
        }
        let block = BLOCK_TAGS.contains(&name);
        if block {
            out.push('\n');
        }
        collect_text(child_el, out);
        if block {
            out.push('\n');
        }
    }
}

/// Visible page text, one line per block element, excluding scripts and the
/// "last updated" footer.
pub fn page_text(doc: &Html) -> String {
    let mut raw = String::new();
    collect_text(doc.root_element(), &mut raw);
    raw.lines()
        .map(squash_whitespace)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// If `text` is `label`, optionally followed by a colon and a value, return the value.
fn label_value<'t>(text: &'t str, label: &str) -> Option<&'t str> {
    let rest = text.trim().strip_prefix(label)?;
    if rest.is_empty() {
        return Some(rest);
    }
    rest.strip_prefix(':').map(str::trim)
}

fn labels<'a>(doc: &'a Html, label: &'a str) -> impl Iterator<Item = (ElementRef<'a>, String)> + 'a {
    doc.select(css!("strong, b")).filter_map(move |el| {
        let text = element_text(el);
        label_value(&text, label).map(|v| (el, v.to_string()))
    })
}

// ---- title ----

fn title_by(doc: &Html, sel: &Selector) -> Option<String> {
    doc.select(sel).find_map(|el| clean_title(&element_text(el)))
}

fn title_sidrubrik(doc: &Html, _: &Ctx<'_>) -> Option<String> {
    title_by(doc, css!(".sidrubrik"))
}

fn title_h1(doc: &Html, _: &Ctx<'_>) -> Option<String> {
    title_by(doc, css!("h1"))
}

fn title_class(doc: &Html, _: &Ctx<'_>) -> Option<String> {
    title_by(doc, css!("body [class*=\"title\"]"))
}

fn title_heading_class(doc: &Html, _: &Ctx<'_>) -> Option<String> {
    title_by(doc, css!("body [class*=\"heading\"]"))
}

// ---- screening date-time ----

/// `<strong>Tid:</strong> <time datetime="...">`: the first element after
/// the label, ignoring whitespace.
fn datetime_tid_label_time(doc: &Html, _: &Ctx<'_>) -> Option<String> {
    labels(doc, "Tid").find_map(|(label, _)| {
        for node in label.next_siblings() {
            if let Some(text) = node.value().as_text() {
                if text.trim().is_empty() {
                    continue;
                }
                return None;
            }
            let Some(el) = ElementRef::wrap(node) else {
                continue;
            };
            if el.value().name() != "time" {
                return None;
            }
            return el.value().attr("datetime").and_then(normalize_datetime_attr);
        }
        None
    })
}

fn datetime_time_attribute(doc: &Html, _: &Ctx<'_>) -> Option<String> {
    doc.select(css!("time[datetime]"))
        .filter(|el| !in_updated_info(*el))
        .find_map(|el| el.value().attr("datetime").and_then(normalize_datetime_attr))
}

fn datetime_tid_label_text(doc: &Html, ctx: &Ctx<'_>) -> Option<String> {
    labels(doc, "Tid").find_map(|(label, _)| {
        let parent = label.parent().and_then(ElementRef::wrap)?;
        datetime_from_text(&element_text(parent), ctx.extracted_at)
    })
}

fn datetime_page_text(_: &Html, ctx: &Ctx<'_>) -> Option<String> {
    datetime_from_text(&ctx.text, ctx.extracted_at)
}

// ---- location ----

/// `<strong>Plats: </strong>Borås Bio Röda Kvarn<br>`: text following the
/// label up to the next line break or label.
fn location_plats_label(doc: &Html, _: &Ctx<'_>) -> Option<String> {
    labels(doc, "Plats").find_map(|(label, inline)| {
        if !inline.is_empty() {
            return Some(inline);
        }
        let mut buf = String::new();
        for node in label.next_siblings() {
            if let Some(text) = node.value().as_text() {
                buf.push_str(text);
                continue;
            }
            if let Some(el) = ElementRef::wrap(node) {
                let name = el.value().name();
                if BLOCK_TAGS.contains(&name) || name == "strong" || name == "b" {
                    break;
                }
                buf.push(' ');
                buf.push_str(&element_text(el));
            }
        }
        let value = squash_whitespace(&buf);
        (!value.is_empty()).then_some(value)
    })
}

fn location_plats_text(_: &Html, ctx: &Ctx<'_>) -> Option<String> {
    ctx.text.lines().find_map(|line| {
        let (_, rest) = line.split_once("Plats:")?;
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    })
}

fn location_class(doc: &Html, _: &Ctx<'_>) -> Option<String> {
    doc.select(css!("body [class*=\"location\"], body [class*=\"venue\"]"))
        .map(element_text)
        .find(|t| !t.is_empty() && t.chars().count() <= MAX_LOCATION_LEN)
}

fn location_default(_: &Html, ctx: &Ctx<'_>) -> Option<String> {
    ctx.default_location.map(str::to_string)
}

// ---- booking url ----

fn link_where(doc: &Html, ctx: &Ctx<'_>, pred: impl Fn(&str) -> bool) -> Option<String> {
    doc.select(css!("a[href]")).find_map(|a| {
        let text = element_text(a).to_lowercase();
        if !pred(&text) {
            return None;
        }
        absolute_http_url(a.value().attr("href")?, ctx.base.as_ref())
    })
}

fn first_href(doc: &Html, ctx: &Ctx<'_>, sel: &Selector) -> Option<String> {
    doc.select(sel)
        .find_map(|a| absolute_http_url(a.value().attr("href")?, ctx.base.as_ref()))
}

fn booking_ticket_link(doc: &Html, ctx: &Ctx<'_>) -> Option<String> {
    link_where(doc, ctx, |t| t.contains("köp biljett"))
}

fn booking_link_text(doc: &Html, ctx: &Ctx<'_>) -> Option<String> {
    link_where(doc, ctx, |t| {
        ["boka", "book", "biljett", "tickets"]
            .iter()
            .any(|needle| t.contains(needle))
    })
}

fn booking_class(doc: &Html, ctx: &Ctx<'_>) -> Option<String> {
    first_href(doc, ctx, css!("a[href][class*=\"booking\"], [class*=\"booking\"] a[href]"))
}

fn booking_ticket_host(doc: &Html, ctx: &Ctx<'_>) -> Option<String> {
    first_href(doc, ctx, css!("a[href*=\"bio.se\"]"))
}

/// First link matching `selector`, resolved against `base`.
pub fn find_link(html: &str, selector: &Selector, base: Option<&Url>) -> Option<String> {
    let doc = Html::parse_document(html);
    doc.select(selector)
        .find_map(|a| absolute_http_url(a.value().attr("href")?, base))
}

/// Run every field's tiers over `html`. Never fails; gaps are reported in the
/// diagnostics.
pub fn extract_from_html(
    html: &str,
    source_url: &str,
    extracted_at: DateTime<FixedOffset>,
    default_location: Option<&str>,
) -> (ScreeningRecord, ExtractionDiagnostics) {
    let doc = Html::parse_document(html);
    let ctx = Ctx {
        base: Url::parse(source_url).ok(),
        extracted_at,
        default_location,
        text: page_text(&doc),
    };

    let mut record = ScreeningRecord::empty(source_url, extracted_at);
    let mut diagnostics = ExtractionDiagnostics::default();
    for field in Field::ALL {
        let hit = tiers(field).iter().find_map(|tier| {
            let value = (tier.locate)(&doc, &ctx)?;
            let value = value.trim();
            (!value.is_empty()).then(|| (tier.name, value.to_string()))
        });
        match hit {
            Some((tier, value)) => {
                record.set(field, value);
                diagnostics.strategy_used_per_field.insert(field, tier);
            }
            None => {
                diagnostics.missing_fields.insert(field);
            }
        }
    }
    (record, diagnostics)
}

/// Extracts a [`ScreeningRecord`] from a live document.
#[derive(Debug, Clone)]
pub struct Extractor {
    default_location: Option<String>,
    element_wait: Duration,
    poll: Duration,
    screenshot_on_failure: bool,
}

impl Extractor {
    pub fn new(
        default_location: Option<String>,
        element_wait: Duration,
        screenshot_on_failure: bool,
    ) -> Self {
        Self {
            default_location,
            element_wait,
            poll: Duration::from_millis(250),
            screenshot_on_failure,
        }
    }

    /// Extract from `doc`, re-reading the DOM for up to the element wait while
    /// fields are still missing.
    #[instrument(skip_all, fields(url = %doc.url()))]
    pub async fn extract(
        &self,
        doc: &mut RenderedDocument,
    ) -> Result<(ScreeningRecord, ExtractionDiagnostics), ExtractionError> {
        let deadline = Instant::now() + self.element_wait;
        let (record, mut diagnostics) = loop {
            let html = doc
                .snapshot()
                .await
                .map_err(|e| ExtractionError::Unreadable(format!("{:#}", e)))?;
            let extracted = extract_from_html(
                &html,
                doc.url(),
                now_fixed(),
                self.default_location.as_deref(),
            );
            let now = Instant::now();
            if extracted.1.missing_fields.is_empty() || now >= deadline {
                break extracted;
            }
            tokio::time::sleep(self.poll.min(deadline - now)).await;
        };

        if !diagnostics.missing_fields.is_empty() && self.screenshot_on_failure {
            diagnostics.screenshot_ref = doc.screenshot("extraction").await;
        }

        let found_on_page = diagnostics
            .strategy_used_per_field
            .values()
            .any(|tier| *tier != DEFAULT_LOCATION_TIER);
        if !found_on_page {
            warn!(screenshot = ?diagnostics.screenshot_ref, "nothing extractable on page");
            return Err(ExtractionError::Empty {
                url: doc.url().to_string(),
                screenshot: diagnostics.screenshot_ref,
            });
        }

        for (field, tier) in &diagnostics.strategy_used_per_field {
            debug!(field = %field, tier, value = record.get(*field), "field extracted");
        }
        if diagnostics.missing_fields.is_empty() {
            info!(title = %record.title, "extraction complete");
        } else {
            warn!(
                missing = ?diagnostics.missing_fields,
                screenshot = ?diagnostics.screenshot_ref,
                "partial extraction"
            );
        }
        Ok((record, diagnostics))
    }
}
