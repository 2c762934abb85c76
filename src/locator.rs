//! Element locator.
//!
//! Resolves a logical action to a concrete element by probing an ordered list
//! of selector candidates. Candidates are tried lazily in configured order and
//! the first visible, enabled match wins. Not finding anything is an ordinary
//! [`ActionResult`], never an error.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{self, Instant};

use crate::browser::{BrowserRuntime, BrowserRuntimeError, ElementHandle};

const PROBE_INTERVAL: Duration = Duration::from_millis(250);

/// Logical actions the renewal workflow performs on the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionName {
    Renew,
    CreateInvoice,
    Pay,
}

impl ActionName {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionName::Renew => "renew",
            ActionName::CreateInvoice => "create_invoice",
            ActionName::Pay => "pay",
        }
    }
}

impl fmt::Display for ActionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered selector candidates for one action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorCandidates(Vec<String>);

impl SelectorCandidates {
    pub fn new(selectors: Vec<String>) -> Self {
        Self(selectors)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Outcome of locating (or clicking) the element behind an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionResult {
    Succeeded(ElementHandle),
    ElementNotFound,
    Timeout,
}

impl ActionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ActionResult::Succeeded(_))
    }
}

/// Probe `candidates` until one resolves or `timeout` elapses.
///
/// Each round walks the candidates in order and stops at the first match.
/// Every probe only gets what is left of the budget, so a hung page cannot
/// stretch the step. Probe errors count as a miss for that candidate; if the
/// budget runs out and the last failing probe was itself a timeout, the
/// result is [`ActionResult::Timeout`] rather than
/// [`ActionResult::ElementNotFound`]. A runtime that was never launched is
/// the only hard error.
pub async fn locate<R>(
    runtime: &R,
    action: ActionName,
    candidates: &SelectorCandidates,
    timeout: Duration,
) -> Result<ActionResult, BrowserRuntimeError>
where
    R: BrowserRuntime + ?Sized,
{
    if candidates.is_empty() {
        return Ok(ActionResult::ElementNotFound);
    }

    let deadline = Instant::now() + timeout;

    let last_timed_out = loop {
        let mut timed_out = false;
        for selector in candidates.iter() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match time::timeout(remaining, runtime.find_element(selector)).await {
                Ok(Ok(Some(handle))) => {
                    log::debug!("{action}: matched selector '{selector}'");
                    return Ok(ActionResult::Succeeded(handle));
                }
                Ok(Ok(None)) => {}
                Ok(Err(BrowserRuntimeError::NotInitialized)) => {
                    return Err(BrowserRuntimeError::NotInitialized);
                }
                Ok(Err(err)) => {
                    timed_out = err.is_timeout();
                    log::debug!("{action}: probe for '{selector}' failed: {err}");
                }
                Err(_) => {
                    log::debug!("{action}: probe for '{selector}' outlived the step budget");
                    timed_out = true;
                    break;
                }
            }
        }

        let now = Instant::now();
        if now >= deadline {
            break timed_out;
        }
        time::sleep(PROBE_INTERVAL.min(deadline - now)).await;
    };

    if last_timed_out {
        Ok(ActionResult::Timeout)
    } else {
        Ok(ActionResult::ElementNotFound)
    }
}

/// Click a located element within `timeout`.
///
/// A click that outlives its budget is [`ActionResult::Timeout`]; a click the
/// runtime rejects means the element went away and is reported as
/// [`ActionResult::ElementNotFound`].
pub async fn click<R>(
    runtime: &R,
    element: &ElementHandle,
    timeout: Duration,
) -> Result<ActionResult, BrowserRuntimeError>
where
    R: BrowserRuntime + ?Sized,
{
    match time::timeout(timeout, runtime.click(element)).await {
        Ok(Ok(())) => Ok(ActionResult::Succeeded(element.clone())),
        Ok(Err(BrowserRuntimeError::NotInitialized)) => Err(BrowserRuntimeError::NotInitialized),
        Ok(Err(err)) if err.is_timeout() => Ok(ActionResult::Timeout),
        Ok(Err(err)) => {
            log::debug!("click on '{}' failed: {err}", element.selector);
            Ok(ActionResult::ElementNotFound)
        }
        Err(_) => Ok(ActionResult::Timeout),
    }
}
