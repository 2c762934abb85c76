//! Strongly-typed configuration for a renewal run.
//!
//! A [`RunConfig`] is assembled once per invocation: defaults, then the JSON
//! configuration file, then environment variables (with optional `.env`
//! support), then explicit overrides coming from the command line. The result
//! is read-only for the remainder of the run.

use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::num::ParseIntError;
use std::path::{Path, PathBuf};
use std::time::Duration;

use dotenvy::dotenv;
use serde::de::{Deserialize, Deserializer, Error as DeError};
use serde::ser::{Serialize, Serializer};
use serde::{Deserialize as DeriveDeserialize, Serialize as DeriveSerialize};
use thiserror::Error;
use url::Url;

use crate::locator::{ActionName, SelectorCandidates};

/// Default configuration file looked up next to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "config.json";

/// Default navigation budget for the management page.
pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;

/// Default budget for a single locate/click step.
pub const DEFAULT_STEP_TIMEOUT_MS: u64 = 5_000;

const DEFAULT_RENEW_SELECTOR: &str = "text=/Renouvel|renouvel|Renew/i";
const DEFAULT_CREATE_INVOICE_SELECTOR: &str = "text=/Créer une facture|Create Invoice/i";
const DEFAULT_PAY_SELECTOR: &str = "text=/Payer|Pay/i";

/// Verbosity level for run logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    Minimal,
    Medium,
    Detailed,
}

impl Verbosity {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            Verbosity::Minimal => 0,
            Verbosity::Medium => 1,
            Verbosity::Detailed => 2,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Verbosity::Minimal),
            1 => Some(Verbosity::Medium),
            2 => Some(Verbosity::Detailed),
            _ => None,
        }
    }
}

impl Default for Verbosity {
    fn default() -> Self {
        Verbosity::Medium
    }
}

impl Serialize for Verbosity {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for Verbosity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = u8::deserialize(deserializer)?;
        Verbosity::from_u8(value).ok_or_else(|| {
            DeError::custom(format!(
                "invalid verbosity value {value}; expected 0, 1, or 2"
            ))
        })
    }
}

/// What the invocation is allowed to do once the management page is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, DeriveSerialize, DeriveDeserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunIntent {
    /// Load the page and export cookies, nothing else.
    Dry,
    /// Renew and create the invoice, but never pay.
    Preview,
    /// Full workflow, payment subject to the payment gate.
    Execute,
}

impl Default for RunIntent {
    fn default() -> Self {
        RunIntent::Execute
    }
}

/// Safety switches consulted by the orchestrator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, DeriveSerialize, DeriveDeserialize)]
#[serde(default)]
pub struct RunFlags {
    #[serde(alias = "allowBypassRestriction")]
    pub allow_bypass_restriction: bool,
    #[serde(alias = "allowPayment")]
    pub allow_payment: bool,
    #[serde(alias = "captureScreens")]
    pub capture_screens: bool,
}

/// Selector candidates as written in the configuration file: a single
/// selector string or an ordered list of them.
#[derive(Debug, Clone, PartialEq, Eq, DeriveSerialize, DeriveDeserialize)]
#[serde(untagged)]
pub enum SelectorList {
    One(String),
    Many(Vec<String>),
}

impl SelectorList {
    fn into_vec(self) -> Vec<String> {
        match self {
            SelectorList::One(selector) => vec![selector],
            SelectorList::Many(selectors) => selectors,
        }
    }
}

/// Per-action selector overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, DeriveSerialize, DeriveDeserialize)]
#[serde(default)]
pub struct SelectorConfig {
    pub renew: Option<SelectorList>,
    #[serde(alias = "createInvoice")]
    pub create_invoice: Option<SelectorList>,
    pub pay: Option<SelectorList>,
}

impl SelectorConfig {
    /// Ordered candidates for `action`, falling back to the built-in text
    /// selector when the configuration leaves the action out.
    pub fn candidates(&self, action: ActionName) -> SelectorCandidates {
        let (configured, fallback) = match action {
            ActionName::Renew => (&self.renew, DEFAULT_RENEW_SELECTOR),
            ActionName::CreateInvoice => (&self.create_invoice, DEFAULT_CREATE_INVOICE_SELECTOR),
            ActionName::Pay => (&self.pay, DEFAULT_PAY_SELECTOR),
        };

        let selectors: Vec<String> = configured
            .clone()
            .map(SelectorList::into_vec)
            .unwrap_or_default()
            .into_iter()
            .map(|selector| selector.trim().to_string())
            .filter(|selector| !selector.is_empty())
            .collect();

        if selectors.is_empty() {
            SelectorCandidates::new(vec![fallback.to_string()])
        } else {
            SelectorCandidates::new(selectors)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, DeriveSerialize, DeriveDeserialize)]
#[serde(default)]
pub struct HttpSettings {
    #[serde(alias = "userAgent")]
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, DeriveSerialize, DeriveDeserialize)]
#[serde(default)]
pub struct PathSettings {
    #[serde(alias = "logFile")]
    pub log_file: Option<PathBuf>,
}

/// Configuration values for one renewal run.
#[derive(DeriveSerialize, DeriveDeserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    #[serde(alias = "service_manage_url", alias = "manageUrl")]
    pub manage_url: Option<String>,
    #[serde(alias = "baseUrl")]
    pub base_url: Option<String>,
    pub cookies: BTreeMap<String, Option<String>>,
    pub selectors: SelectorConfig,
    #[serde(alias = "discord_webhook", alias = "webhookUrl")]
    pub webhook_url: Option<String>,
    pub http: HttpSettings,
    pub paths: PathSettings,
    #[serde(alias = "timeoutMs")]
    pub timeout_ms: u64,
    #[serde(alias = "stepTimeoutMs")]
    pub step_timeout_ms: u64,
    pub headless: bool,
    #[serde(alias = "chromeExecutable")]
    pub chrome_executable: Option<PathBuf>,
    #[serde(alias = "launchArgs")]
    pub launch_args: Vec<String>,
    #[serde(alias = "useConfigCookies")]
    pub use_config_cookies: bool,
    pub intent: RunIntent,
    pub flags: RunFlags,
    pub verbose: Verbosity,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            manage_url: None,
            base_url: None,
            cookies: BTreeMap::new(),
            selectors: SelectorConfig::default(),
            webhook_url: None,
            http: HttpSettings::default(),
            paths: PathSettings::default(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            step_timeout_ms: DEFAULT_STEP_TIMEOUT_MS,
            headless: true,
            chrome_executable: None,
            launch_args: vec![
                "--no-sandbox".to_string(),
                "--disable-blink-features=AutomationControlled".to_string(),
            ],
            use_config_cookies: true,
            intent: RunIntent::default(),
            flags: RunFlags::default(),
            verbose: Verbosity::default(),
        }
    }
}

impl RunConfig {
    /// Load configuration from `path` (or [`DEFAULT_CONFIG_FILE`]) and then
    /// apply environment overrides.
    ///
    /// A missing default file is not an error; a missing explicit file is.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::from_file(default_path)?
                } else {
                    RunConfig::default()
                }
            }
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Parse a JSON configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Construct a configuration from defaults and environment variables,
    /// after loading a `.env` file if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = RunConfig::default();
        config.apply_env()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        let _ = dotenv();

        if let Some(value) = env_var("RENEWAL_MANAGE_URL") {
            self.manage_url = Some(value);
        }

        if let Some(value) = env_var("RENEWAL_BASE_URL") {
            self.base_url = Some(value);
        }

        if let Some(value) = env_var("RENEWAL_WEBHOOK_URL") {
            self.webhook_url = Some(value);
        }

        if let Some(value) = env_var("RENEWAL_TIMEOUT_MS") {
            self.timeout_ms = parse_u64("RENEWAL_TIMEOUT_MS", &value)?;
        }

        if let Some(value) = env_var("RENEWAL_STEP_TIMEOUT_MS") {
            self.step_timeout_ms = parse_u64("RENEWAL_STEP_TIMEOUT_MS", &value)?;
        }

        if let Some(value) = env_var("RENEWAL_HEADLESS") {
            self.headless = parse_bool("RENEWAL_HEADLESS", &value)?;
        }

        if let Some(value) = env_var("RENEWAL_ALLOW_PAYMENT") {
            self.flags.allow_payment = parse_bool("RENEWAL_ALLOW_PAYMENT", &value)?;
        }

        if let Some(value) = env_var("RENEWAL_ALLOW_BYPASS_RESTRICTION") {
            self.flags.allow_bypass_restriction =
                parse_bool("RENEWAL_ALLOW_BYPASS_RESTRICTION", &value)?;
        }

        if let Some(value) = env_var("RENEWAL_CAPTURE_SCREENS") {
            self.flags.capture_screens = parse_bool("RENEWAL_CAPTURE_SCREENS", &value)?;
        }

        if let Some(value) = env_var("RENEWAL_CHROME_BIN") {
            self.chrome_executable = Some(PathBuf::from(value));
        }

        if let Some(value) = env_var("RENEWAL_USER_AGENT") {
            self.http.user_agent = Some(value);
        }

        if let Some(value) = env_var("RENEWAL_LOG_FILE") {
            self.paths.log_file = Some(PathBuf::from(value));
        }

        if let Some(value) = env_var("RENEWAL_VERBOSE") {
            let parsed = parse_u8("RENEWAL_VERBOSE", &value)?;
            self.verbose = Verbosity::from_u8(parsed).ok_or_else(|| {
                ConfigError::invalid_enum("RENEWAL_VERBOSE", parsed.to_string())
            })?;
        }

        Ok(())
    }

    /// Create a new configuration with explicit field overrides applied.
    pub fn with_overrides(&self, overrides: RunConfigOverrides) -> RunConfig {
        let mut next = self.clone();

        if let Some(value) = overrides.manage_url {
            next.manage_url = value;
        }
        if let Some(value) = overrides.base_url {
            next.base_url = value;
        }
        if let Some(value) = overrides.webhook_url {
            next.webhook_url = value;
        }
        if let Some(value) = overrides.timeout_ms {
            next.timeout_ms = value;
        }
        if let Some(value) = overrides.step_timeout_ms {
            next.step_timeout_ms = value;
        }
        if let Some(value) = overrides.headless {
            next.headless = value;
        }
        if let Some(value) = overrides.use_config_cookies {
            next.use_config_cookies = value;
        }
        if let Some(value) = overrides.intent {
            next.intent = value;
        }
        if let Some(value) = overrides.allow_payment {
            next.flags.allow_payment = value;
        }
        if let Some(value) = overrides.allow_bypass_restriction {
            next.flags.allow_bypass_restriction = value;
        }
        if let Some(value) = overrides.capture_screens {
            next.flags.capture_screens = value;
        }
        if let Some(value) = overrides.verbose {
            next.verbose = value;
        }

        next
    }

    /// Check the fields the orchestrator cannot run without.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let manage_url = self
            .manage_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or(ConfigError::MissingManageUrl)?;
        parse_url("service_manage_url", manage_url)?;

        if let Some(base) = self.base_url.as_deref() {
            parse_url("base_url", base)?;
        }
        Ok(())
    }

    /// Cookie name/value pairs worth injecting; empty values are skipped.
    pub fn cookie_pairs(&self) -> Vec<(String, String)> {
        self.cookies
            .iter()
            .filter_map(|(name, value)| match value.as_deref() {
                Some(value) if !value.is_empty() => Some((name.clone(), value.to_string())),
                _ => None,
            })
            .collect()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }
}

/// Field-level overrides for [`RunConfig::with_overrides`].
#[derive(Debug, Default, Clone)]
pub struct RunConfigOverrides {
    pub manage_url: Option<Option<String>>,
    pub base_url: Option<Option<String>>,
    pub webhook_url: Option<Option<String>>,
    pub timeout_ms: Option<u64>,
    pub step_timeout_ms: Option<u64>,
    pub headless: Option<bool>,
    pub use_config_cookies: Option<bool>,
    pub intent: Option<RunIntent>,
    pub allow_payment: Option<bool>,
    pub allow_bypass_restriction: Option<bool>,
    pub capture_screens: Option<bool>,
    pub verbose: Option<Verbosity>,
}

impl RunConfigOverrides {
    /// Builder-style helper to set the `intent` override.
    pub fn intent(mut self, intent: RunIntent) -> Self {
        self.intent = Some(intent);
        self
    }

    /// Builder-style helper to set the `manage_url` override.
    pub fn manage_url<T: Into<Option<String>>>(mut self, url: T) -> Self {
        self.manage_url = Some(url.into());
        self
    }
}

impl fmt::Debug for RunConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cookie_names: Vec<&str> = self.cookies.keys().map(String::as_str).collect();
        f.debug_struct("RunConfig")
            .field("manage_url", &self.manage_url)
            .field("base_url", &self.base_url)
            .field("cookie_names", &cookie_names)
            .field("selectors", &self.selectors)
            .field("webhook_configured", &self.webhook_url.is_some())
            .field("http", &self.http)
            .field("paths", &self.paths)
            .field("timeout_ms", &self.timeout_ms)
            .field("step_timeout_ms", &self.step_timeout_ms)
            .field("headless", &self.headless)
            .field("chrome_executable", &self.chrome_executable)
            .field("launch_args", &self.launch_args)
            .field("use_config_cookies", &self.use_config_cookies)
            .field("intent", &self.intent)
            .field("flags", &self.flags)
            .field("verbose", &self.verbose)
            .finish()
    }
}

/// Errors that can arise while constructing a [`RunConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("service_manage_url is missing from the configuration")]
    MissingManageUrl,
    #[error("invalid URL '{value}' for {field}: {source}")]
    InvalidUrl {
        field: &'static str,
        value: String,
        #[source]
        source: url::ParseError,
    },
    #[error("invalid value '{value}' for {field}")]
    InvalidEnumVariant { field: &'static str, value: String },
    #[error("invalid boolean '{value}' for {field}")]
    InvalidBool { field: &'static str, value: String },
    #[error("invalid number '{value}' for {field}: {source}")]
    InvalidNumber {
        field: &'static str,
        value: String,
        #[source]
        source: ParseIntError,
    },
}

impl ConfigError {
    fn invalid_enum(field: &'static str, value: String) -> Self {
        ConfigError::InvalidEnumVariant { field, value }
    }
}

fn env_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_url(field: &'static str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|source| ConfigError::InvalidUrl {
        field,
        value: value.to_string(),
        source,
    })
}

fn parse_bool(field: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            field,
            value: value.to_string(),
        }),
    }
}

fn parse_u8(field: &'static str, value: &str) -> Result<u8, ConfigError> {
    value
        .trim()
        .parse::<u8>()
        .map_err(|source| ConfigError::InvalidNumber {
            field,
            value: value.to_string(),
            source,
        })
}

fn parse_u64(field: &'static str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|source| ConfigError::InvalidNumber {
            field,
            value: value.to_string(),
            source,
        })
}
