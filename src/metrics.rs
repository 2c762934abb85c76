//! Step timing for the run summary.
//!
//! Durations are measured with [`Instant`] so wall-clock adjustments cannot
//! skew them.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Workflow steps whose duration is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStep {
    Launch,
    Navigate,
    ExportCookies,
    Renew,
    CreateInvoice,
    ResolveAmount,
    Pay,
}

impl RunStep {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStep::Launch => "launch",
            RunStep::Navigate => "navigate",
            RunStep::ExportCookies => "export_cookies",
            RunStep::Renew => "renew",
            RunStep::CreateInvoice => "create_invoice",
            RunStep::ResolveAmount => "resolve_amount",
            RunStep::Pay => "pay",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTiming {
    pub step: RunStep,
    pub duration_ms: u64,
}

/// Ordered per-step durations for one run. Repeated steps accumulate.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTimings {
    steps: Vec<StepTiming>,
}

impl StepTimings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, step: RunStep, elapsed: Duration) {
        let ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        match self.steps.iter_mut().find(|timing| timing.step == step) {
            Some(timing) => timing.duration_ms = timing.duration_ms.saturating_add(ms),
            None => self.steps.push(StepTiming {
                step,
                duration_ms: ms,
            }),
        }
    }

    /// Record the time elapsed since `started`.
    pub fn finish(&mut self, step: RunStep, started: Instant) {
        self.record(step, started.elapsed());
    }

    pub fn get(&self, step: RunStep) -> Option<u64> {
        self.steps
            .iter()
            .find(|timing| timing.step == step)
            .map(|timing| timing.duration_ms)
    }

    pub fn steps(&self) -> &[StepTiming] {
        &self.steps
    }

    pub fn total_ms(&self) -> u64 {
        self.steps
            .iter()
            .fold(0u64, |acc, timing| acc.saturating_add(timing.duration_ms))
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl fmt::Display for StepTimings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.steps.is_empty() {
            return f.write_str("-");
        }
        let parts: Vec<String> = self
            .steps
            .iter()
            .map(|timing| format!("{} {}ms", timing.step.as_str(), timing.duration_ms))
            .collect();
        write!(f, "{} (total {}ms)", parts.join(", "), self.total_ms())
    }
}

/// Start a step timer.
pub fn start_timer() -> Instant {
    Instant::now()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_keeps_first_seen_order_and_accumulates() {
        let mut timings = StepTimings::new();
        timings.record(RunStep::Launch, Duration::from_millis(120));
        timings.record(RunStep::Navigate, Duration::from_millis(900));
        timings.record(RunStep::Navigate, Duration::from_millis(100));

        assert_eq!(timings.get(RunStep::Navigate), Some(1_000));
        assert_eq!(timings.get(RunStep::Pay), None);
        assert_eq!(timings.total_ms(), 1_120);
        assert_eq!(
            timings.to_string(),
            "launch 120ms, navigate 1000ms (total 1120ms)"
        );
    }

    #[test]
    fn empty_timings_display_as_dash() {
        assert_eq!(StepTimings::new().to_string(), "-");
    }

    #[test]
    fn finish_measures_elapsed_time() {
        let mut timings = StepTimings::new();
        let started = start_timer();
        std::thread::sleep(Duration::from_millis(10));
        timings.finish(RunStep::Renew, started);
        assert!(timings.get(RunStep::Renew).unwrap() >= 10);
    }
}
