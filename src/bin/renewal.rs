//! Renewal CLI.
//!
//! Loads `config.json` (or `--config`), applies environment variables and
//! command-line overrides, and runs one renewal attempt. The process exit
//! code reflects the terminal state.
//!
//! Usage examples:
//!   Export cookies only:
//!     $ renewal --dry --export-cookies cookies.json
//!   Full run with a visible browser:
//!     $ RENEWAL_CHROME_BIN=/usr/bin/chromium renewal --headful --capture-screens

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use renewal_rs::config::{RunConfig, RunConfigOverrides, RunIntent, Verbosity};
use renewal_rs::logging::{LogConfig, RunLogger};
use renewal_rs::notifier::Notifier;
use renewal_rs::orchestrator::{EXIT_CONFIG, RenewalOrchestrator, RunOutcome};
use renewal_rs::runtime::ChromiumoxideRuntime;

#[derive(Parser, Debug)]
#[command(
    name = "renewal",
    author,
    version,
    about = "Renew a hosted service, create its invoice and pay it when safe"
)]
struct Cli {
    /// Configuration file (defaults to ./config.json when present).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Only load the management page and export cookies.
    #[arg(long, conflicts_with = "preview")]
    dry: bool,

    /// Renew and create the invoice, but never pay.
    #[arg(long)]
    preview: bool,

    /// Show the browser window.
    #[arg(long)]
    headful: bool,

    /// Navigation timeout in milliseconds.
    #[arg(long, value_name = "MS")]
    timeout_ms: Option<u64>,

    /// Per-step locate/click timeout in milliseconds.
    #[arg(long, value_name = "MS")]
    step_timeout_ms: Option<u64>,

    /// Allow paying a non-zero invoice.
    #[arg(long)]
    allow_payment: bool,

    /// Continue even when the dashboard reports the renewal as restricted.
    #[arg(long)]
    allow_bypass_restriction: bool,

    /// Attach full-page screenshots to notifications.
    #[arg(long)]
    capture_screens: bool,

    /// Do not inject the cookies listed in the configuration file.
    #[arg(long)]
    no_config_cookies: bool,

    /// Also write the exported cookies to this file.
    #[arg(long, value_name = "PATH")]
    export_cookies: Option<PathBuf>,

    /// Log at DEBUG detail.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    /// Intent requested on the command line; `None` keeps the configured one.
    fn intent(&self) -> Option<RunIntent> {
        if self.dry {
            Some(RunIntent::Dry)
        } else if self.preview {
            Some(RunIntent::Preview)
        } else {
            None
        }
    }

    fn overrides(&self) -> RunConfigOverrides {
        let mut overrides = RunConfigOverrides::default();
        overrides.intent = self.intent();
        overrides.timeout_ms = self.timeout_ms;
        overrides.step_timeout_ms = self.step_timeout_ms;
        overrides.headless = self.headful.then_some(false);
        overrides.use_config_cookies = self.no_config_cookies.then_some(false);
        overrides.allow_payment = self.allow_payment.then_some(true);
        overrides.allow_bypass_restriction = self.allow_bypass_restriction.then_some(true);
        overrides.capture_screens = self.capture_screens.then_some(true);
        overrides.verbose = verbosity_from_count(self.verbose);
        overrides
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_env_logger();
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            error!("{err:#}");
            return ExitCode::from(EXIT_CONFIG as u8);
        }
    };

    match run(&cli, config).await {
        Ok(outcome) => {
            let code = outcome.exit_code();
            info!(
                "Finished in state {:?} (exit code {code})",
                outcome.terminal.state()
            );
            ExitCode::from(code as u8)
        }
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> Result<RunConfig> {
    let config = RunConfig::load(cli.config.as_deref())
        .context("failed to load configuration")?
        .with_overrides(cli.overrides());
    config.validate().context("invalid configuration")?;
    Ok(config)
}

async fn run(cli: &Cli, config: RunConfig) -> Result<RunOutcome> {
    info!("Starting renewal run ({:?} intent)", config.intent);

    let mut log_config = LogConfig::new(config.verbose);
    log_config.log_file = config.paths.log_file.clone();
    let logger = RunLogger::with_config(log_config);

    let notifier = Notifier::from_webhook(config.webhook_url.as_deref());
    let runtime = Arc::new(ChromiumoxideRuntime::new());
    let orchestrator = RenewalOrchestrator::new(config, runtime, notifier, logger);

    let outcome = orchestrator.run().await;

    if let Some(export) = &outcome.cookies {
        let json = export.to_json();
        println!("{json}");
        if let Some(path) = &cli.export_cookies {
            tokio::fs::write(path, format!("{json}\n"))
                .await
                .with_context(|| format!("failed to write cookies to {}", path.display()))?;
            info!("Cookies written to {}", path.display());
        }
    }

    Ok(outcome)
}

fn verbosity_from_count(count: u8) -> Option<Verbosity> {
    (count > 0).then_some(Verbosity::Detailed)
}

fn init_env_logger() {
    if env::var("RUST_LOG").is_err() {
        unsafe {
            env::set_var("RUST_LOG", "info");
        }
    }

    let _ = env_logger::Builder::from_env(env_logger::Env::default())
        .format_timestamp_secs()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_flags_leave_the_configuration_alone() {
        let cli = Cli::parse_from(["renewal"]);
        let overrides = cli.overrides();
        assert_eq!(overrides.intent, None);
        assert_eq!(overrides.headless, None);
        assert_eq!(overrides.allow_payment, None);
        assert_eq!(overrides.verbose, None);
    }

    #[test]
    fn configured_intent_survives_a_plain_invocation() {
        let mut config = RunConfig::default();
        config.intent = RunIntent::Preview;
        let config = config.with_overrides(Cli::parse_from(["renewal"]).overrides());
        assert_eq!(config.intent, RunIntent::Preview);

        let config = config.with_overrides(Cli::parse_from(["renewal", "--dry"]).overrides());
        assert_eq!(config.intent, RunIntent::Dry);
    }

    #[test]
    fn single_verbose_flag_raises_verbosity() {
        let overrides = Cli::parse_from(["renewal", "-v"]).overrides();
        assert_eq!(overrides.verbose, Some(Verbosity::Detailed));
        assert_ne!(RunConfig::default().verbose, Verbosity::Detailed);
    }

    #[test]
    fn flags_become_overrides() {
        let cli = Cli::parse_from([
            "renewal",
            "--preview",
            "--headful",
            "--allow-payment",
            "--no-config-cookies",
            "--step-timeout-ms",
            "2500",
            "-vv",
        ]);
        let overrides = cli.overrides();
        assert_eq!(overrides.intent, Some(RunIntent::Preview));
        assert_eq!(overrides.headless, Some(false));
        assert_eq!(overrides.allow_payment, Some(true));
        assert_eq!(overrides.use_config_cookies, Some(false));
        assert_eq!(overrides.step_timeout_ms, Some(2500));
        assert_eq!(overrides.verbose, Some(Verbosity::Detailed));
    }

    #[test]
    fn dry_and_preview_conflict() {
        assert!(Cli::try_parse_from(["renewal", "--dry", "--preview"]).is_err());
    }
}
