//! Invoice amount extraction.
//!
//! Two phases, first success wins:
//!
//! 1. **Structured**: the smallest element whose text carries both a
//!    "Subtotal" and a standalone "Total" label. The amount printed right
//!    after "Total" is the result. A region that exists but yields no
//!    readable total is reported as [`AmountProvenance::Unknown`]; the loose
//!    heuristic is not consulted in that case.
//! 2. **Heuristic**: every amount-shaped token in the visible text is
//!    considered. A token qualifies only with a currency marker or a payment
//!    keyword shortly before it. Among qualifying tokens the first one after a
//!    "total" keyword wins, then the first one after any payment keyword, and
//!    finally the largest currency-marked value.
//!
//! Behind a label, a currency-marked token beats a bare number, and a bare
//! number is only read when nothing else sits in the label's window.
//! Percentages and counts (`0% VAT`, `1 item`, `0 days`) are never amounts.
//! Nothing readable means [`InvoiceAmount::unknown`], never zero.

use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use scraper::{Html, Selector};
use serde::Serialize;

use crate::browser::{self, BrowserRuntime, BrowserRuntimeError};
use crate::markup;

/// Maximum distance, in bytes of collapsed text, between a label and its value.
const KEYWORD_WINDOW: usize = 40;

static AMOUNT_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?i)(?P<pre>[$€£]|\b(?:usd|eur|gbp|chf)\b)?[\s\x{a0}]*",
        r"(?P<num>\d{1,3}(?:[.,\x20\x{a0}\x{202f}]\d{3})+(?:[.,]\d{1,2})?|\d+(?:[.,]\d{1,2})?)",
        r"(?:[\s\x{a0}]*(?P<post>[$€£]|(?:usd|eur|gbp|chf)\b))?",
    ))
    .expect("invalid amount regex")
});

static KEYWORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?i)\b(?:(?P<sub>sub|sous)[\s-]?)?(?P<total>total)\b",
        r"|\b(?P<payment>amount|due|balance|pay|payer|montant|à payer)\b",
    ))
    .expect("invalid keyword regex")
});

static ANY_ELEMENT: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("body *").expect("invalid element selector"));

/// Non-negative money amount stored as integer cents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Money {
    cents: u64,
}

impl Money {
    pub const ZERO: Money = Money { cents: 0 };

    pub fn from_cents(cents: u64) -> Self {
        Money { cents }
    }

    pub fn cents(self) -> u64 {
        self.cents
    }

    pub fn is_zero(self) -> bool {
        self.cents == 0
    }

    /// Parse a numeric amount such as `12.50`, `1,234.00`, `1 234,00` or `0`.
    ///
    /// Up to two decimals are accepted. Other separators must split the
    /// integer part into groups of three digits; anything else is rejected.
    pub fn parse(raw: &str) -> Option<Money> {
        let compact: String = raw
            .trim()
            .chars()
            .filter(|c| !matches!(c, ' ' | '\u{a0}' | '\u{202f}'))
            .collect();
        if compact.is_empty() {
            return None;
        }

        let (integer, fraction) = match compact.rfind(['.', ',']) {
            Some(idx) if (1..=2).contains(&(compact.len() - idx - 1)) => {
                (&compact[..idx], &compact[idx + 1..])
            }
            _ => (compact.as_str(), ""),
        };

        let mut groups = integer.split(['.', ',']);
        let head = groups.next()?;
        if head.is_empty() || !head.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let mut whole: u64 = head.parse().ok()?;
        let mut grouped = false;
        for group in groups {
            if group.len() != 3 || !group.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            grouped = true;
            whole = whole.checked_mul(1000)?.checked_add(group.parse().ok()?)?;
        }
        if grouped && head.len() > 3 {
            return None;
        }

        if !fraction.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let fraction_cents: u64 = match fraction.len() {
            0 => 0,
            1 => fraction.parse::<u64>().ok()? * 10,
            _ => fraction.parse().ok()?,
        };

        whole
            .checked_mul(100)?
            .checked_add(fraction_cents)
            .map(Money::from_cents)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.cents / 100, self.cents % 100)
    }
}

/// Where an [`InvoiceAmount`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AmountProvenance {
    StructuredTotal,
    HeuristicMatch,
    Unknown,
}

/// Resolved invoice amount. `Unknown` carries no value and is never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InvoiceAmount {
    value: Option<Money>,
    provenance: AmountProvenance,
}

impl InvoiceAmount {
    pub fn structured(value: Money) -> Self {
        Self {
            value: Some(value),
            provenance: AmountProvenance::StructuredTotal,
        }
    }

    pub fn heuristic(value: Money) -> Self {
        Self {
            value: Some(value),
            provenance: AmountProvenance::HeuristicMatch,
        }
    }

    pub fn unknown() -> Self {
        Self {
            value: None,
            provenance: AmountProvenance::Unknown,
        }
    }

    pub fn value(&self) -> Option<Money> {
        self.value
    }

    pub fn provenance(&self) -> AmountProvenance {
        self.provenance
    }

    pub fn is_unknown(&self) -> bool {
        self.value.is_none()
    }

    /// True only for a resolved value of exactly zero.
    pub fn is_zero(&self) -> bool {
        self.value.is_some_and(Money::is_zero)
    }
}

impl fmt::Display for InvoiceAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.value, self.provenance) {
            (Some(value), AmountProvenance::StructuredTotal) => write!(f, "{value} (invoice total)"),
            (Some(value), _) => write!(f, "{value} (inferred)"),
            (None, _) => f.write_str("unknown"),
        }
    }
}

/// Extract the invoice amount from page HTML.
pub fn extract_amount(html: &str) -> InvoiceAmount {
    let document = Html::parse_document(html);

    if let Some(region) = structured_region(&document) {
        return match value_after_total_label(&region) {
            Some(value) => InvoiceAmount::structured(value),
            None => {
                log::debug!("invoice total region found but no readable amount: {region}");
                InvoiceAmount::unknown()
            }
        };
    }

    match heuristic_amount(&markup::document_text(&document)) {
        Some(value) => InvoiceAmount::heuristic(value),
        None => InvoiceAmount::unknown(),
    }
}

/// Read the current page and run [`extract_amount`] on it.
pub async fn extract<R>(runtime: &R, timeout: Duration) -> Result<InvoiceAmount, BrowserRuntimeError>
where
    R: BrowserRuntime + ?Sized,
{
    let html = browser::content_within(runtime, timeout).await?;
    Ok(extract_amount(&html))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeywordKind {
    Subtotal,
    Total,
    Payment,
}

#[derive(Debug, Clone, Copy)]
struct Keyword {
    kind: KeywordKind,
    start: usize,
    end: usize,
}

#[derive(Debug, Clone, Copy)]
struct AmountToken {
    value: Money,
    start: usize,
    has_currency: bool,
}

fn keywords(text: &str) -> Vec<Keyword> {
    KEYWORD
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let kind = if caps.name("sub").is_some() {
                KeywordKind::Subtotal
            } else if caps.name("total").is_some() {
                KeywordKind::Total
            } else {
                KeywordKind::Payment
            };
            Some(Keyword {
                kind,
                start: whole.start(),
                end: whole.end(),
            })
        })
        .collect()
}

fn amount_tokens(text: &str) -> Vec<AmountToken> {
    AMOUNT_TOKEN
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let number = caps.name("num")?;
            if !standalone_number(text, number.start(), number.end()) {
                return None;
            }
            let has_currency = caps.name("pre").is_some() || caps.name("post").is_some();
            let trailing = text[number.end()..].trim_start();
            if trailing.starts_with('%') {
                return None;
            }
            // `1 item`, `0 days`: a count, not a price.
            if !has_currency && trailing.starts_with(char::is_alphabetic) {
                return None;
            }
            Some(AmountToken {
                value: Money::parse(number.as_str())?,
                start: whole.start(),
                has_currency,
            })
        })
        .collect()
}

/// Reject digits glued to words, invoice numbers, dates and times.
fn standalone_number(text: &str, start: usize, end: usize) -> bool {
    let before = text[..start].chars().next_back();
    let mut after = text[end..].chars();
    let next = after.next();
    let next_next = after.next();

    if before.is_some_and(|c| c.is_alphanumeric() || c == '#' || c == '_') {
        return false;
    }
    if next.is_some_and(|c| c.is_alphanumeric() && !c.is_ascii_digit() && !is_currency_code_start(c)) {
        return false;
    }
    if next.is_some_and(|c| c.is_ascii_digit()) {
        return false;
    }
    if matches!(next, Some('/' | '-' | ':')) && next_next.is_some_and(|c| c.is_ascii_digit()) {
        return false;
    }
    let mut back = text[..start].chars().rev();
    if matches!(back.next(), Some('/' | '-' | ':')) && back.next().is_some_and(|c| c.is_ascii_digit()) {
        return false;
    }
    true
}

fn is_currency_code_start(c: char) -> bool {
    matches!(c.to_ascii_lowercase(), 'u' | 'e' | 'g' | 'c')
}

fn structured_region(document: &Html) -> Option<String> {
    document
        .select(&ANY_ELEMENT)
        .map(markup::element_text)
        .filter(|text| {
            let found = keywords(text);
            found.iter().any(|k| k.kind == KeywordKind::Subtotal)
                && found.iter().any(|k| k.kind == KeywordKind::Total)
        })
        .min_by_key(String::len)
}

fn value_after_total_label(region: &str) -> Option<Money> {
    let found = keywords(region);
    let subtotal_end = found
        .iter()
        .find(|k| k.kind == KeywordKind::Subtotal)
        .map(|k| k.end)
        .unwrap_or(0);
    let label = found
        .iter()
        .filter(|k| k.kind == KeywordKind::Total)
        .find(|k| k.start >= subtotal_end)
        .or_else(|| found.iter().find(|k| k.kind == KeywordKind::Total))?;

    value_in_window(&amount_tokens(region), label.end)
}

/// Value labelled by a keyword ending at `label_end`.
///
/// The first currency-marked token in the window wins. A bare number is only
/// taken when it is the sole token there.
fn value_in_window(tokens: &[AmountToken], label_end: usize) -> Option<Money> {
    let window: Vec<&AmountToken> = tokens
        .iter()
        .filter(|token| token.start >= label_end && token.start - label_end <= KEYWORD_WINDOW)
        .collect();
    match window.iter().find(|token| token.has_currency) {
        Some(token) => Some(token.value),
        None => match window.as_slice() {
            [only] => Some(only.value),
            _ => None,
        },
    }
}

fn heuristic_amount(text: &str) -> Option<Money> {
    let found = keywords(text);
    let tokens = amount_tokens(text);
    let after = |wanted: fn(KeywordKind) -> bool| {
        found
            .iter()
            .filter(|keyword| wanted(keyword.kind))
            .find_map(|keyword| value_in_window(&tokens, keyword.end))
    };

    after(|kind| kind == KeywordKind::Total)
        .or_else(|| after(|kind| kind == KeywordKind::Payment))
        .or_else(|| {
            tokens
                .iter()
                .filter(|token| token.has_currency)
                .fold(None, |best: Option<Money>, token| match best {
                    Some(best) if best >= token.value => Some(best),
                    _ => Some(token.value),
                })
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn money_parses_common_formats() {
        assert_eq!(Money::parse("12.50"), Some(Money::from_cents(1250)));
        assert_eq!(Money::parse("12,5"), Some(Money::from_cents(1250)));
        assert_eq!(Money::parse("1,234.00"), Some(Money::from_cents(123_400)));
        assert_eq!(Money::parse("1.234,00"), Some(Money::from_cents(123_400)));
        assert_eq!(Money::parse("1 234,56"), Some(Money::from_cents(123_456)));
        assert_eq!(Money::parse("1,000"), Some(Money::from_cents(100_000)));
        assert_eq!(Money::parse("0"), Some(Money::ZERO));
        assert_eq!(Money::from_cents(1250).to_string(), "12.50");
    }

    #[test]
    fn money_rejects_malformed_grouping() {
        assert_eq!(Money::parse("12,34,5"), None);
        assert_eq!(Money::parse("1234,567"), None);
        assert_eq!(Money::parse("abc"), None);
        assert_eq!(Money::parse(""), None);
    }

    #[test]
    fn structured_region_yields_total() {
        let html = r#"<html><body>
            <h1>Invoice #20931</h1>
            <div class="summary">
              <div><span>Subtotal:</span> <span>$10.00</span></div>
              <div><span>Total:</span> <span>$12.50</span></div>
            </div>
            <p>Pay within 7 days. Late fee $99.00</p>
        </body></html>"#;
        assert_eq!(
            extract_amount(html),
            InvoiceAmount::structured(Money::from_cents(1250))
        );
    }

    #[test]
    fn structured_region_in_a_table() {
        let html = "<table><tr><td>Sous-total</td><td>0,00 €</td></tr>\
                    <tr><td>Total</td><td>0,00 €</td></tr></table>";
        let amount = extract_amount(html);
        assert_eq!(amount.provenance(), AmountProvenance::StructuredTotal);
        assert!(amount.is_zero());
    }

    #[test]
    fn structured_region_without_a_number_is_unknown() {
        let html = "<div><p>Subtotal: pending</p><p>Total: pending</p></div><p>Amount due $5.00</p>";
        assert_eq!(extract_amount(html), InvoiceAmount::unknown());
    }

    #[test]
    fn loose_text_falls_back_to_heuristic() {
        let html = "<html><body><p>Your total due is $0.00</p></body></html>";
        let amount = extract_amount(html);
        assert_eq!(amount, InvoiceAmount::heuristic(Money::ZERO));
        assert!(amount.is_zero());
    }

    #[test]
    fn heuristic_prefers_first_value_after_total_keyword() {
        let text = "Service fee $3.00. Amount due $4.00. Total $5.00 then total $6.00";
        assert_eq!(heuristic_amount(text), Some(Money::from_cents(500)));
    }

    #[test]
    fn heuristic_uses_largest_currency_value_without_keywords() {
        let text = "Plan A €2.00 Plan B €7,50 Plan C €7.50";
        assert_eq!(heuristic_amount(text), Some(Money::from_cents(750)));
    }

    #[test]
    fn bare_number_without_marker_or_keyword_is_rejected() {
        let html = "<p>Service 42 has 3 days left</p>";
        assert_eq!(extract_amount(html), InvoiceAmount::unknown());
    }

    #[test]
    fn bare_number_after_keyword_is_accepted() {
        assert_eq!(heuristic_amount("Montant: 0"), Some(Money::ZERO));
    }

    #[test]
    fn dates_and_invoice_numbers_are_not_amounts() {
        assert_eq!(heuristic_amount("Due 2026-10-19"), None);
        assert_eq!(heuristic_amount("Total for #1234"), None);
        assert_eq!(heuristic_amount("Pay before 12:30"), None);
    }

    #[test]
    fn percentages_are_not_totals() {
        let html = "<div><p>Subtotal: €25.00</p><p>Total (incl. 0% VAT): €25.00</p></div>";
        assert_eq!(
            extract_amount(html),
            InvoiceAmount::structured(Money::from_cents(2_500))
        );
        assert_eq!(heuristic_amount("Total VAT 0 %"), None);
    }

    #[test]
    fn item_counts_are_not_totals() {
        assert_eq!(
            heuristic_amount("Total (1 item): $25.00"),
            Some(Money::from_cents(2_500))
        );
        assert_eq!(heuristic_amount("Total: 3 items"), None);
    }

    #[test]
    fn day_counts_are_not_totals() {
        let html = "<p>Invoice created. Due in 0 days. Amount: €25.00</p>";
        assert_eq!(
            extract_amount(html),
            InvoiceAmount::heuristic(Money::from_cents(2_500))
        );
        assert!(extract_amount("<p>Invoice due in 0 days</p>").is_unknown());
    }

    #[test]
    fn several_bare_numbers_after_a_label_are_ambiguous() {
        assert_eq!(heuristic_amount("Total 5 , 12"), None);
        assert_eq!(heuristic_amount("Total 5 , $12.00"), Some(Money::from_cents(1_200)));
    }

    #[test]
    fn page_without_amounts_is_unknown() {
        let amount = extract_amount("<html><body><h1>Invoice created</h1></body></html>");
        assert!(amount.is_unknown());
        assert!(!amount.is_zero());
        assert_eq!(amount.to_string(), "unknown");
    }
}
