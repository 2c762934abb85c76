//! Restriction and challenge detection.
//!
//! [`detect_restriction`] looks for the dashboard's "renewal restricted"
//! wording, first in headings and alert regions, then anywhere in the body.
//! [`detect_challenge`] spots anti-bot interstitials that make every further
//! step pointless. Both are pure functions over HTML; [`check`] and
//! [`check_challenge`] read the current page from a runtime first.

use std::sync::LazyLock;
use std::time::Duration;

use scraper::{Html, Selector};
use serde::Serialize;

use crate::browser::{self, BrowserRuntime, BrowserRuntimeError};
use crate::markup;

/// Phrases the dashboard shows when a renewal is refused, lowercase.
pub const RESTRICTION_PHRASES: [&str; 2] = [
    "renewal restricted",
    "you can only renew your free service",
];

/// Markers of a security challenge page, matched against raw lowercase HTML.
pub const CHALLENGE_MARKERS: [&str; 3] = ["security verification", "cf_chl_prog", "turnstile"];

const EVIDENCE_CONTEXT: usize = 80;
const EVIDENCE_MAX_CHARS: usize = 240;

static STRUCTURED_SELECTOR: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("h1, h2, h3, h4, h5, h6, [role='alert'], [role='alertdialog'], .alert")
        .expect("invalid restriction selector")
});

/// Restriction state of the page at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "evidence", rename_all = "snake_case")]
pub enum RestrictionStatus {
    NotRestricted,
    Restricted(String),
}

impl RestrictionStatus {
    pub fn is_restricted(&self) -> bool {
        matches!(self, RestrictionStatus::Restricted(_))
    }

    pub fn evidence(&self) -> Option<&str> {
        match self {
            RestrictionStatus::Restricted(evidence) => Some(evidence),
            RestrictionStatus::NotRestricted => None,
        }
    }
}

/// Scan `html` for restriction wording.
pub fn detect_restriction(html: &str) -> RestrictionStatus {
    let document = Html::parse_document(html);

    for element in document.select(&STRUCTURED_SELECTOR) {
        let text = markup::element_text(element);
        if contains_phrase(&text.to_lowercase()).is_some() {
            return RestrictionStatus::Restricted(markup::truncate_chars(&text, EVIDENCE_MAX_CHARS));
        }
    }

    let body = markup::document_text(&document);
    match contains_phrase(&body.to_lowercase()) {
        Some(position) => RestrictionStatus::Restricted(snippet_around(&body, position)),
        None => RestrictionStatus::NotRestricted,
    }
}

/// Return the first challenge marker present in `html`, if any.
pub fn detect_challenge(html: &str) -> Option<&'static str> {
    let lowered = html.to_lowercase();
    CHALLENGE_MARKERS
        .into_iter()
        .find(|marker| lowered.contains(marker))
}

/// Read the current page and run [`detect_restriction`] on it.
pub async fn check<R>(runtime: &R, timeout: Duration) -> Result<RestrictionStatus, BrowserRuntimeError>
where
    R: BrowserRuntime + ?Sized,
{
    let html = browser::content_within(runtime, timeout).await?;
    Ok(detect_restriction(&html))
}

/// Read the current page and run [`detect_challenge`] on it.
pub async fn check_challenge<R>(
    runtime: &R,
    timeout: Duration,
) -> Result<Option<&'static str>, BrowserRuntimeError>
where
    R: BrowserRuntime + ?Sized,
{
    let html = browser::content_within(runtime, timeout).await?;
    Ok(detect_challenge(&html))
}

/// Byte offset of the earliest restriction phrase in lowercase `text`.
fn contains_phrase(lowered: &str) -> Option<usize> {
    RESTRICTION_PHRASES
        .iter()
        .filter_map(|phrase| lowered.find(phrase))
        .min()
}

fn snippet_around(text: &str, position: usize) -> String {
    // Lowercasing can shift byte offsets for some scripts; map via chars.
    let lowered_prefix_chars = text
        .to_lowercase()
        .get(..position)
        .map(|prefix| prefix.chars().count())
        .unwrap_or(0);
    let start = lowered_prefix_chars.saturating_sub(EVIDENCE_CONTEXT);
    let snippet: String = text
        .chars()
        .skip(start)
        .take(EVIDENCE_CONTEXT * 2)
        .collect();
    markup::truncate_chars(snippet.trim(), EVIDENCE_MAX_CHARS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heading_marker_is_restricted() {
        let html = "<html><body><h2>Renewal Restricted</h2><p>Come back later.</p></body></html>";
        assert_eq!(
            detect_restriction(html),
            RestrictionStatus::Restricted("Renewal Restricted".into())
        );
    }

    #[test]
    fn alert_role_marker_is_restricted() {
        let html = r#"<div role="alert">You can only renew your free service when less than 1 day remains.</div>"#;
        let status = detect_restriction(html);
        assert!(status.is_restricted());
        assert!(status.evidence().unwrap().starts_with("You can only renew"));
    }

    #[test]
    fn body_text_is_scanned_when_no_structured_marker_matches() {
        let html = "<html><body><h1>Manage service</h1><div><span>Notice:</span> \
                    renewal   restricted until tomorrow</div></body></html>";
        match detect_restriction(html) {
            RestrictionStatus::Restricted(evidence) => {
                assert!(evidence.contains("renewal restricted until tomorrow"));
            }
            other => panic!("expected restriction, got {other:?}"),
        }
    }

    #[test]
    fn page_without_markers_is_not_restricted() {
        let html = "<html><body><h1>Manage service</h1><button>Renew</button></body></html>";
        assert_eq!(detect_restriction(html), RestrictionStatus::NotRestricted);
        assert_eq!(detect_restriction(""), RestrictionStatus::NotRestricted);
    }

    #[test]
    fn script_text_does_not_count_as_evidence() {
        let html = "<html><body><script>const msg = 'Renewal restricted';</script>\
                    <h1>Manage service</h1></body></html>";
        assert_eq!(detect_restriction(html), RestrictionStatus::NotRestricted);
    }

    #[test]
    fn challenge_markers_are_found_in_raw_html() {
        let html = "<html><head><script src=\"/cdn-cgi/challenge-platform/h/b/cf_chl_prog\"></script></head></html>";
        assert_eq!(detect_challenge(html), Some("cf_chl_prog"));
        assert_eq!(
            detect_challenge("<h1>Security Verification</h1>"),
            Some("security verification")
        );
        assert_eq!(detect_challenge("<h1>Dashboard</h1>"), None);
    }
}
