//! Renewal state machine.
//!
//! `Start → SessionReady → Navigated → RenewClicked → InvoiceCreated →
//! RestrictionChecked → AmountResolved → PaymentDecision → {Paid, Skipped, Aborted}`
//!
//! Restriction is re-read after every click and once more right before the
//! payment gate.
//!
//! The orchestrator is strictly sequential. Every step failure becomes a
//! terminal [`Terminal`] plus one summary notification naming the step and
//! the cause; nothing escapes [`RenewalOrchestrator::run`] as an error. The
//! browser session is released exactly once, before the summary goes out.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time;

use crate::amount::{self, InvoiceAmount};
use crate::browser::{self, BrowserRuntime, BrowserRuntimeError};
use crate::config::{RunConfig, RunIntent};
use crate::gate::{self, Clearance, GateInput, PaymentDecision, RefusalReason};
use crate::locator::{self, ActionName, ActionResult};
use crate::logging::RunLogger;
use crate::markup;
use crate::metrics::{RunStep, StepTimings, start_timer};
use crate::notifier::{Delivery, NotificationEvent, NotificationKind, Notifier};
use crate::restriction::{self, RestrictionStatus};
use crate::session::{SessionError, SessionProvisioner};

pub const EXIT_OK: i32 = 0;
pub const EXIT_CONFIG: i32 = 2;
pub const EXIT_RESTRICTED: i32 = 3;
pub const EXIT_ELEMENT_NOT_FOUND: i32 = 4;
pub const EXIT_TIMEOUT: i32 = 5;
pub const EXIT_LAUNCH: i32 = 6;
pub const EXIT_NAVIGATION: i32 = 7;
pub const EXIT_CHALLENGE: i32 = 8;

const SETTLE_TIMEOUT: Duration = Duration::from_secs(8);
const SNIPPET_CHARS: usize = 800;
const NAVIGATION_ATTEMPTS: u32 = 2;

/// States the run passes through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Start,
    SessionReady,
    Navigated,
    RenewClicked,
    InvoiceCreated,
    RestrictionChecked,
    AmountResolved,
    PaymentDecision,
    Paid,
    Skipped,
    Aborted,
}

/// Why a run stopped without paying, on purpose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    DryRun,
    PaymentRefused { refusal: RefusalReason },
}

/// Why a run was aborted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum AbortCause {
    Launch { message: String },
    Navigation { message: String },
    Timeout { step: RunStep },
    Challenge { marker: String },
    ElementNotFound { action: ActionName, selectors: Vec<String> },
    Restricted { evidence: String, after: RunStep },
    Browser { step: RunStep, message: String },
}

impl AbortCause {
    pub fn exit_code(&self) -> i32 {
        match self {
            AbortCause::Launch { .. } => EXIT_LAUNCH,
            AbortCause::Navigation { .. } | AbortCause::Browser { .. } => EXIT_NAVIGATION,
            AbortCause::Timeout { .. } => EXIT_TIMEOUT,
            AbortCause::Challenge { .. } => EXIT_CHALLENGE,
            AbortCause::ElementNotFound { .. } => EXIT_ELEMENT_NOT_FOUND,
            AbortCause::Restricted { .. } => EXIT_RESTRICTED,
        }
    }

    fn notification_kind(&self) -> NotificationKind {
        match self {
            AbortCause::ElementNotFound { .. } => NotificationKind::ElementNotFound,
            AbortCause::Restricted { .. } => NotificationKind::Restricted,
            AbortCause::Challenge { .. } => NotificationKind::Challenge,
            _ => NotificationKind::Failure,
        }
    }
}

impl fmt::Display for AbortCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortCause::Launch { message } => write!(f, "browser could not be started: {message}"),
            AbortCause::Navigation { message } => {
                write!(f, "management page could not be loaded: {message}")
            }
            AbortCause::Timeout { step } => write!(f, "step '{}' timed out", step.as_str()),
            AbortCause::Challenge { marker } => write!(
                f,
                "the page shows a security challenge ({marker}); manual intervention required"
            ),
            AbortCause::ElementNotFound { action, selectors } => write!(
                f,
                "'{action}' not found (selectors: {})",
                selectors.join(" | ")
            ),
            AbortCause::Restricted { evidence, after } => write!(
                f,
                "renewal restricted at step '{}': {evidence}",
                after.as_str()
            ),
            AbortCause::Browser { step, message } => {
                write!(f, "browser error during '{}': {message}", step.as_str())
            }
        }
    }
}

/// Terminal outcome of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Terminal {
    Paid,
    Skipped(SkipReason),
    Aborted(AbortCause),
}

impl Terminal {
    pub fn state(&self) -> RunState {
        match self {
            Terminal::Paid => RunState::Paid,
            Terminal::Skipped(_) => RunState::Skipped,
            Terminal::Aborted(_) => RunState::Aborted,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Terminal::Paid | Terminal::Skipped(_) => EXIT_OK,
            Terminal::Aborted(cause) => cause.exit_code(),
        }
    }

    fn describe(&self) -> String {
        match self {
            Terminal::Paid => "payment submitted".to_string(),
            Terminal::Skipped(SkipReason::DryRun) => "dry run: page loaded and cookies exported".to_string(),
            Terminal::Skipped(SkipReason::PaymentRefused { refusal }) => {
                format!("payment not attempted: {refusal}")
            }
            Terminal::Aborted(cause) => format!("aborted: {cause}"),
        }
    }

    fn notification_kind(&self) -> NotificationKind {
        match self {
            Terminal::Paid | Terminal::Skipped(SkipReason::DryRun) => NotificationKind::Summary,
            Terminal::Skipped(SkipReason::PaymentRefused { refusal }) => match refusal {
                RefusalReason::AmountUnknown => NotificationKind::AmountAmbiguous,
                RefusalReason::NotExecuteIntent => NotificationKind::Summary,
                _ => NotificationKind::PaymentRefused,
            },
            Terminal::Aborted(cause) => cause.notification_kind(),
        }
    }
}

/// Session cookies read back after the management page loaded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CookieExport {
    pub cookies: BTreeMap<String, String>,
}

impl CookieExport {
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{\"cookies\":{}}".to_string())
    }
}

/// Everything a caller needs to know about a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub terminal: Terminal,
    pub states: Vec<RunState>,
    pub amount: Option<InvoiceAmount>,
    pub forced_bypass: bool,
    pub cookies: Option<CookieExport>,
    pub timings: StepTimings,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        self.terminal.exit_code()
    }

    pub fn reached(&self, state: RunState) -> bool {
        self.states.contains(&state)
    }
}

/// Mutable bookkeeping for one run.
struct RunRecord {
    states: Vec<RunState>,
    amount: Option<InvoiceAmount>,
    forced_bypass: bool,
    cookies: Option<CookieExport>,
    timings: StepTimings,
}

impl RunRecord {
    fn new() -> Self {
        Self {
            states: vec![RunState::Start],
            amount: None,
            forced_bypass: false,
            cookies: None,
            timings: StepTimings::new(),
        }
    }

    fn into_outcome(mut self, terminal: Terminal) -> RunOutcome {
        self.states.push(terminal.state());
        RunOutcome {
            terminal,
            states: self.states,
            amount: self.amount,
            forced_bypass: self.forced_bypass,
            cookies: self.cookies,
            timings: self.timings,
        }
    }
}

/// Drives one renewal attempt against a browser runtime.
pub struct RenewalOrchestrator<R: BrowserRuntime + 'static> {
    config: RunConfig,
    provisioner: SessionProvisioner<R>,
    notifier: Notifier,
    logger: RunLogger,
}

impl<R: BrowserRuntime + 'static> RenewalOrchestrator<R> {
    pub fn new(config: RunConfig, runtime: Arc<R>, notifier: Notifier, logger: RunLogger) -> Self {
        Self {
            config,
            provisioner: SessionProvisioner::new(runtime),
            notifier,
            logger,
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Run the workflow to a terminal state.
    pub async fn run(&self) -> RunOutcome {
        let mut record = RunRecord::new();

        let launch_started = start_timer();
        let opened = self.provisioner.open(&self.config, &self.logger).await;
        record.timings.finish(RunStep::Launch, launch_started);

        let session = match opened {
            Ok(session) => session,
            Err(err) => {
                let cause = match err {
                    SessionError::Launch(source) => AbortCause::Launch {
                        message: source.to_string(),
                    },
                    SessionError::Navigation(source) => AbortCause::Navigation {
                        message: source.to_string(),
                    },
                };
                let outcome = record.into_outcome(Terminal::Aborted(cause));
                self.send_summary(&outcome, None).await;
                return outcome;
            }
        };
        self.transition(&mut record, RunState::SessionReady);

        let terminal = self.drive(session.runtime(), &mut record).await;

        let screenshot = if self.config.flags.capture_screens {
            self.capture(session.runtime()).await
        } else {
            None
        };
        session.release().await;

        let outcome = record.into_outcome(terminal);
        self.send_summary(&outcome, screenshot).await;
        outcome
    }

    async fn drive(&self, runtime: &R, record: &mut RunRecord) -> Terminal {
        match self.drive_steps(runtime, record).await {
            Ok(terminal) | Err(terminal) => terminal,
        }
    }

    async fn drive_steps(&self, runtime: &R, record: &mut RunRecord) -> Result<Terminal, Terminal> {
        let started = start_timer();
        let navigated = self.navigate(runtime).await;
        record.timings.finish(RunStep::Navigate, started);
        navigated?;
        self.transition(record, RunState::Navigated);
        self.checkpoint(runtime, "management page loaded").await;

        let started = start_timer();
        record.cookies = self.export_cookies(runtime).await;
        record.timings.finish(RunStep::ExportCookies, started);

        if self.config.intent == RunIntent::Dry {
            return Ok(Terminal::Skipped(SkipReason::DryRun));
        }

        match restriction::check_challenge(runtime, self.config.step_timeout()).await {
            Ok(Some(marker)) => {
                self.logger.error(
                    format!("Security challenge detected ({marker}); stopping before any click"),
                    Some("navigate"),
                    None,
                );
                return Err(Terminal::Aborted(AbortCause::Challenge {
                    marker: marker.to_string(),
                }));
            }
            Ok(None) => {}
            Err(err) => return Err(browser_abort(RunStep::Navigate, err)),
        }

        self.perform(runtime, record, ActionName::Renew, RunStep::Renew)
            .await?;
        self.transition(record, RunState::RenewClicked);
        self.require_clearance(runtime, record, RunStep::Renew, false)
            .await?;

        self.perform(runtime, record, ActionName::CreateInvoice, RunStep::CreateInvoice)
            .await?;
        self.transition(record, RunState::InvoiceCreated);
        self.require_clearance(runtime, record, RunStep::CreateInvoice, false)
            .await?;
        self.transition(record, RunState::RestrictionChecked);

        let started = start_timer();
        let resolved = amount::extract(runtime, self.config.step_timeout()).await;
        record.timings.finish(RunStep::ResolveAmount, started);
        let invoice_amount = resolved.map_err(|err| browser_abort(RunStep::ResolveAmount, err))?;
        record.amount = Some(invoice_amount);
        self.logger.info(
            format!("Invoice amount: {invoice_amount}"),
            Some("amount"),
            Some(serde_json::json!({ "provenance": invoice_amount.provenance() })),
        );
        self.transition(record, RunState::AmountResolved);

        // Fresh restriction state for the gate, immediately before paying.
        let clearance = self
            .require_clearance(runtime, record, RunStep::Pay, false)
            .await?;
        let decision = gate::evaluate(&GateInput {
            intent: self.config.intent,
            clearance,
            amount: invoice_amount,
            allow_payment: self.config.flags.allow_payment,
        });
        self.transition(record, RunState::PaymentDecision);

        match decision {
            PaymentDecision::Refuse(refusal) => {
                self.logger.info(
                    format!("Payment not attempted: {refusal}"),
                    Some("gate"),
                    None,
                );
                Ok(Terminal::Skipped(SkipReason::PaymentRefused { refusal }))
            }
            PaymentDecision::Proceed => {
                self.perform(runtime, record, ActionName::Pay, RunStep::Pay)
                    .await?;
                self.require_clearance(runtime, record, RunStep::Pay, true)
                    .await?;
                Ok(Terminal::Paid)
            }
        }
    }

    /// Load the management page, retrying once.
    async fn navigate(&self, runtime: &R) -> Result<(), Terminal> {
        let Some(url) = self.config.manage_url.as_deref() else {
            return Err(Terminal::Aborted(AbortCause::Navigation {
                message: "no management URL configured".to_string(),
            }));
        };

        let mut attempt = 1;
        loop {
            self.logger.info(
                format!("Navigating to {url} (attempt {attempt}/{NAVIGATION_ATTEMPTS})"),
                Some("navigate"),
                None,
            );
            match runtime.navigate(url, self.config.timeout()).await {
                Ok(()) => break,
                Err(err) if attempt < NAVIGATION_ATTEMPTS => {
                    self.logger.info(
                        format!("Navigation failed, retrying: {err}"),
                        Some("navigate"),
                        None,
                    );
                    attempt += 1;
                }
                Err(err) if err.is_timeout() => {
                    return Err(Terminal::Aborted(AbortCause::Timeout {
                        step: RunStep::Navigate,
                    }));
                }
                Err(BrowserRuntimeError::Navigation { message, .. }) => {
                    return Err(Terminal::Aborted(AbortCause::Navigation { message }));
                }
                Err(err) => {
                    return Err(Terminal::Aborted(AbortCause::Navigation {
                        message: err.to_string(),
                    }));
                }
            }
        }

        self.settle(runtime).await;
        self.log_page_state(runtime, "navigate").await;
        Ok(())
    }

    async fn export_cookies(&self, runtime: &R) -> Option<CookieExport> {
        let read = time::timeout(self.config.step_timeout(), runtime.cookies())
            .await
            .unwrap_or_else(|_| {
                Err(BrowserRuntimeError::timeout(
                    "reading cookies",
                    self.config.step_timeout(),
                ))
            });
        match read {
            Ok(cookies) => {
                let export = CookieExport {
                    cookies: cookies
                        .into_iter()
                        .map(|cookie| (cookie.name, cookie.value))
                        .collect(),
                };
                self.logger.info(
                    format!("Exported {} cookie(s)", export.cookies.len()),
                    Some("cookies"),
                    None,
                );
                Some(export)
            }
            Err(err) => {
                self.logger.error(
                    format!("Could not read cookies back from the browser: {err}"),
                    Some("cookies"),
                    None,
                );
                None
            }
        }
    }

    /// Locate and click the element behind `action`, then let the page settle.
    async fn perform(
        &self,
        runtime: &R,
        record: &mut RunRecord,
        action: ActionName,
        step: RunStep,
    ) -> Result<(), Terminal> {
        let started = start_timer();
        let clicked = self.locate_and_click(runtime, action, step).await;
        record.timings.finish(step, started);
        clicked?;

        self.settle(runtime).await;
        self.log_page_state(runtime, action.as_str()).await;
        self.checkpoint(runtime, &format!("after '{action}'")).await;
        Ok(())
    }

    async fn locate_and_click(
        &self,
        runtime: &R,
        action: ActionName,
        step: RunStep,
    ) -> Result<(), Terminal> {
        let candidates = self.config.selectors.candidates(action);
        let not_found = || {
            Terminal::Aborted(AbortCause::ElementNotFound {
                action,
                selectors: candidates.as_slice().to_vec(),
            })
        };

        self.logger.info(
            format!("Looking for '{action}'"),
            Some(action.as_str()),
            Some(serde_json::json!({ "selectors": candidates.as_slice() })),
        );

        let step_timeout = self.config.step_timeout();
        let element = match locator::locate(runtime, action, &candidates, step_timeout)
            .await
            .map_err(|err| browser_abort(step, err))?
        {
            ActionResult::Succeeded(element) => element,
            ActionResult::ElementNotFound => {
                self.logger.error(
                    format!("'{action}' not found with any configured selector"),
                    Some(action.as_str()),
                    None,
                );
                return Err(not_found());
            }
            ActionResult::Timeout => return Err(Terminal::Aborted(AbortCause::Timeout { step })),
        };

        match locator::click(runtime, &element, step_timeout)
            .await
            .map_err(|err| browser_abort(step, err))?
        {
            ActionResult::Succeeded(_) => {
                self.logger.info(
                    format!("Clicked '{action}' via '{}'", element.selector),
                    Some(action.as_str()),
                    None,
                );
                Ok(())
            }
            ActionResult::ElementNotFound => Err(not_found()),
            ActionResult::Timeout => Err(Terminal::Aborted(AbortCause::Timeout { step })),
        }
    }

    /// Re-evaluate restriction on the current page.
    ///
    /// A restriction aborts the run unless bypass is allowed; after the pay
    /// click (`final_check`) it always aborts. Every bypassed restriction is
    /// notified with the step it was seen at.
    async fn require_clearance(
        &self,
        runtime: &R,
        record: &mut RunRecord,
        step: RunStep,
        final_check: bool,
    ) -> Result<Clearance, Terminal> {
        let status = restriction::check(runtime, self.config.step_timeout())
            .await
            .map_err(|err| browser_abort(step, err))?;

        let RestrictionStatus::Restricted(evidence) = status else {
            return Ok(if record.forced_bypass {
                Clearance::Bypassed
            } else {
                Clearance::Clear
            });
        };

        self.logger.error(
            format!("Renewal restricted detected at '{}': {evidence}", step.as_str()),
            Some("restriction"),
            None,
        );

        if final_check || !self.config.flags.allow_bypass_restriction {
            return Err(Terminal::Aborted(AbortCause::Restricted {
                evidence,
                after: step,
            }));
        }

        record.forced_bypass = true;
        let event = NotificationEvent::new(
            NotificationKind::ForcedBypass,
            "Renewal restricted, continuing because bypass was explicitly allowed.",
        )
        .with_field("Step", step.as_str())
        .with_field("Evidence", evidence)
        .with_field("Forced bypass", "yes");
        self.notifier.notify(event).await;
        Ok(Clearance::Bypassed)
    }

    async fn settle(&self, runtime: &R) {
        match time::timeout(SETTLE_TIMEOUT, runtime.wait_for_settle(SETTLE_TIMEOUT)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                self.logger
                    .debug(format!("Page did not settle: {err}"), Some("settle"), None);
            }
            Err(_) => {
                self.logger.debug("Page did not settle in time", Some("settle"), None);
            }
        }
    }

    async fn log_page_state(&self, runtime: &R, category: &str) {
        let budget = self.config.step_timeout();
        let title = time::timeout(budget, runtime.title())
            .await
            .ok()
            .and_then(Result::ok)
            .flatten();
        let url = time::timeout(budget, runtime.current_url())
            .await
            .ok()
            .and_then(Result::ok)
            .flatten();
        self.logger.info(
            format!(
                "Page: {} ({})",
                title.as_deref().unwrap_or("<untitled>"),
                url.as_deref().unwrap_or("<unknown url>")
            ),
            Some(category),
            None,
        );
        if let Ok(html) = browser::content_within(runtime, budget).await {
            self.logger.debug(
                format!("Snippet: {}", markup::truncate_chars(&html, SNIPPET_CHARS)),
                Some(category),
                None,
            );
        }
    }

    async fn capture(&self, runtime: &R) -> Option<Vec<u8>> {
        let budget = self.config.step_timeout();
        let shot = time::timeout(budget, runtime.screenshot(true))
            .await
            .unwrap_or_else(|_| Err(BrowserRuntimeError::timeout("screenshot", budget)));
        match shot {
            Ok(png) if !png.is_empty() => Some(png),
            Ok(_) => None,
            Err(err) => {
                self.logger
                    .debug(format!("Screenshot failed: {err}"), Some("screenshot"), None);
                None
            }
        }
    }

    async fn checkpoint(&self, runtime: &R, label: &str) {
        if !self.config.flags.capture_screens {
            return;
        }
        if let Some(png) = self.capture(runtime).await {
            let event = NotificationEvent::new(NotificationKind::Checkpoint, label).with_image(png);
            self.notifier.notify(event).await;
        }
    }

    fn transition(&self, record: &mut RunRecord, state: RunState) {
        self.logger
            .debug(format!("State: {state:?}"), Some("orchestrator"), None);
        record.states.push(state);
    }

    async fn send_summary(&self, outcome: &RunOutcome, screenshot: Option<Vec<u8>>) {
        let description = outcome.terminal.describe();
        match &outcome.terminal {
            Terminal::Aborted(_) => self.logger.error(&description, Some("summary"), None),
            _ => self.logger.info(&description, Some("summary"), None),
        }

        let mut event = NotificationEvent::new(outcome.terminal.notification_kind(), description)
            .with_field("State", format!("{:?}", outcome.terminal.state()))
            .with_field(
                "Amount",
                outcome
                    .amount
                    .map(|amount| amount.to_string())
                    .unwrap_or_else(|| "-".to_string()),
            )
            .with_field(
                "Forced bypass",
                if outcome.forced_bypass { "yes" } else { "no" },
            )
            .with_field("Timings", outcome.timings.to_string());
        if let Some(url) = self.config.manage_url.as_deref() {
            event = event.with_field("URL", url);
        }
        let Some(png) = screenshot else {
            self.notifier.notify(event).await;
            return;
        };

        // The summary always goes out; only its screenshot is subject to dedup.
        if self.notifier.notify(event.clone().with_image(png)).await == Delivery::Suppressed {
            self.notifier.notify(event).await;
        }
    }
}

fn browser_abort(step: RunStep, err: BrowserRuntimeError) -> Terminal {
    if err.is_timeout() {
        Terminal::Aborted(AbortCause::Timeout { step })
    } else {
        Terminal::Aborted(AbortCause::Browser {
            step,
            message: err.to_string(),
        })
    }
}
