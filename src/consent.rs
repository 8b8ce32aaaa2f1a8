//! Cookie-consent detection and dismissal.
//!
//! Strategies are evaluated in a fixed order against a DOM snapshot; the first
//! whose presence check matches is clicked, then its check is polled until it
//! clears. Nothing here can fail the pipeline: problems are reported on the
//! returned [`ConsentOutcome`] and extraction proceeds regardless.

use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config;
use crate::model::{ConsentOutcome, ConsentStrategy};
use crate::render::{ClickTarget, RenderedDocument};

/// Accept buttons of consent platforms seen in the wild.
const PLATFORM_ACCEPT_BUTTONS: &[&str] = &[
    "#CybotCookiebotDialogBodyLevelButtonLevelOptinAllowAll",
    "#onetrust-accept-btn-handler",
    ".cky-btn-accept",
];

/// Longest first, so "Godkänn alla kakor" wins over "Godkänn".
const ACCEPT_PHRASES: &[&str] = &[
    "godkänn alla kakor",
    "acceptera alla kakor",
    "godkänn alla",
    "acceptera alla",
    "accept all",
    "acceptera",
    "godkänn",
    "accept",
];

const CONSENT_CONTAINERS: &[&str] = &[
    "[role=\"dialog\"]",
    "dialog",
    "[id*=\"cookie\"]",
    "[class*=\"cookie\"]",
    "[id*=\"consent\"]",
    "[class*=\"consent\"]",
    "[class*=\"gdpr\"]",
];

const ACCEPT_ATTRIBUTES: &[&str] = &[
    "[data-testid*=\"accept\"]",
    "[id*=\"accept\"]",
    "[class*=\"accept\"]",
    "[data-cy*=\"accept\"]",
];

static PLATFORM_SELECTORS: Lazy<Vec<(&'static str, Selector)>> = Lazy::new(|| {
    PLATFORM_ACCEPT_BUTTONS
        .iter()
        .map(|s| (*s, Selector::parse(s).expect("valid platform selector")))
        .collect()
});

static BUTTON: Lazy<Selector> = Lazy::new(|| Selector::parse("button").expect("valid selector"));

static ATTRIBUTE_SELECTORS: Lazy<Vec<(String, Selector)>> = Lazy::new(|| {
    CONSENT_CONTAINERS
        .iter()
        .flat_map(|container| {
            ACCEPT_ATTRIBUTES
                .iter()
                .map(move |attr| format!("{} {}", container, attr))
        })
        .map(|s| {
            let sel = Selector::parse(&s).expect("valid attribute selector");
            (s, sel)
        })
        .collect()
});

type Detector = fn(&Html) -> Option<ClickTarget>;

/// Evaluation order of the strategies.
const STRATEGIES: &[(ConsentStrategy, Detector)] = &[
    (ConsentStrategy::PlatformMarkers, detect_platform_markers),
    (ConsentStrategy::GenericLocalizedText, detect_localized_text),
    (ConsentStrategy::GenericAttribute, detect_attribute),
];

/// Elements hidden with inline styles, `hidden` or `aria-hidden` (on
/// themselves or an ancestor) do not count as present. Dismissed dialogs are
/// often hidden rather than removed.
fn is_hidden(el: ElementRef<'_>) -> bool {
    std::iter::once(el)
        .chain(el.ancestors().filter_map(ElementRef::wrap))
        .any(|e| {
            let v = e.value();
            if v.attr("hidden").is_some() || v.attr("aria-hidden") == Some("true") {
                return true;
            }
            v.attr("style")
                .map(|style| {
                    let compact: String = style
                        .chars()
                        .filter(|c| !c.is_whitespace())
                        .collect::<String>()
                        .to_ascii_lowercase();
                    compact.contains("display:none") || compact.contains("visibility:hidden")
                })
                .unwrap_or(false)
        })
}

fn first_visible<'a>(doc: &'a Html, sel: &Selector) -> Option<ElementRef<'a>> {
    doc.select(sel).find(|el| !is_hidden(*el))
}

fn detect_platform_markers(doc: &Html) -> Option<ClickTarget> {
    PLATFORM_SELECTORS
        .iter()
        .find(|(_, sel)| first_visible(doc, sel).is_some())
        .map(|(raw, _)| ClickTarget::Css((*raw).to_string()))
}

fn normalized_text(el: ElementRef<'_>) -> String {
    el.text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Browser-side counterpart of `is_hidden`.
const HIDDEN_XPATH: &str = "ancestor-or-self::*[@hidden or @aria-hidden='true' or contains(translate(@style, ' ', ''), 'display:none') or contains(translate(@style, ' ', ''), 'visibility:hidden')]";

/// Case-insensitive XPath for a visible button containing `phrase` (already
/// lowercase).
fn button_xpath(phrase: &str) -> String {
    format!(
        "//button[contains(translate(normalize-space(.), 'ABCDEFGHIJKLMNOPQRSTUVWXYZÅÄÖ', 'abcdefghijklmnopqrstuvwxyzåäö'), '{}')][not({})]",
        phrase, HIDDEN_XPATH
    )
}

fn detect_localized_text(doc: &Html) -> Option<ClickTarget> {
    let buttons: Vec<String> = doc
        .select(&BUTTON)
        .filter(|el| !is_hidden(*el))
        .map(normalized_text)
        .collect();
    ACCEPT_PHRASES
        .iter()
        .find(|phrase| buttons.iter().any(|text| text.contains(**phrase)))
        .map(|phrase| ClickTarget::XPath(button_xpath(phrase)))
}

fn detect_attribute(doc: &Html) -> Option<ClickTarget> {
    ATTRIBUTE_SELECTORS
        .iter()
        .find(|(_, sel)| first_visible(doc, sel).is_some())
        .map(|(raw, _)| ClickTarget::Css(raw.clone()))
}

/// Run every strategy against `html` in order; first hit wins.
pub fn detect(html: &str) -> Option<(ConsentStrategy, ClickTarget)> {
    let doc = Html::parse_document(html);
    STRATEGIES
        .iter()
        .find_map(|(strategy, check)| check(&doc).map(|target| (*strategy, target)))
}

/// Presence check for one strategy only.
pub fn is_present(html: &str, strategy: ConsentStrategy) -> bool {
    let doc = Html::parse_document(html);
    STRATEGIES
        .iter()
        .filter(|(s, _)| *s == strategy)
        .any(|(_, check)| check(&doc).is_some())
}

/// Detect and dismiss a consent dialog on `doc`.
#[instrument(skip_all, fields(url = %doc.url()))]
pub async fn resolve(doc: &mut RenderedDocument, cfg: &config::Consent) -> ConsentOutcome {
    let poll = cfg.poll_interval();
    let probe_deadline = Instant::now() + cfg.probe_window();

    let (strategy, target) = loop {
        match doc.snapshot().await {
            Ok(html) => {
                if let Some(hit) = detect(&html) {
                    break hit;
                }
            }
            Err(err) => {
                warn!(?err, "could not inspect page for consent dialog; proceeding");
                return ConsentOutcome {
                    dialog_present: false,
                    dismissed: false,
                    error: Some(format!("{:#}", err)),
                    ..Default::default()
                };
            }
        }
        let now = Instant::now();
        if now >= probe_deadline {
            debug!("no consent dialog detected");
            return ConsentOutcome::no_dialog();
        }
        tokio::time::sleep(poll.min(probe_deadline - now)).await;
    };

    info!(strategy = %strategy, target = %target, "consent dialog detected");
    let mut outcome = ConsentOutcome {
        dialog_present: true,
        dismissed: false,
        strategy_used: Some(strategy),
        ..Default::default()
    };

    if let Err(err) = doc.click(&target).await {
        warn!(?err, strategy = %strategy, "consent click failed; proceeding");
        outcome.error = Some(format!("{:#}", err));
        outcome.screenshot_ref = doc.screenshot("consent_failure").await;
        return outcome;
    }

    let dismiss_deadline = Instant::now() + cfg.dismiss_timeout();
    loop {
        match doc.snapshot().await {
            Ok(html) if !is_present(&html, strategy) => {
                info!(strategy = %strategy, "consent dialog dismissed");
                outcome.dismissed = true;
                return outcome;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(?err, "could not confirm consent dismissal; proceeding");
                outcome.error = Some(format!("{:#}", err));
                return outcome;
            }
        }
        let now = Instant::now();
        if now >= dismiss_deadline {
            break;
        }
        tokio::time::sleep(poll.min(dismiss_deadline - now)).await;
    }

    warn!(strategy = %strategy, timeout = ?cfg.dismiss_timeout(), "consent dialog still present; proceeding");
    outcome.error = Some(format!(
        "dialog still present {:?} after click",
        cfg.dismiss_timeout()
    ));
    outcome.screenshot_ref = doc.screenshot("consent_failure").await;
    outcome
}
