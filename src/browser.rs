//! Browser capability surface consumed by the renewal workflow.
//!
//! The workflow never talks to a concrete automation engine. It drives a
//! [`BrowserRuntime`]: launch, cookies, navigation, single-selector probes,
//! clicks, text/HTML reads and screenshots. [`crate::runtime`] provides the
//! chromiumoxide implementation; tests provide scripted ones.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time;

use crate::config::RunConfig;

/// Viewport dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Viewport {
            width: 1280,
            height: 800,
        }
    }
}

/// Launch options derived from the run configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchPlan {
    pub headless: bool,
    pub args: Vec<String>,
    pub user_agent: Option<String>,
    pub chrome_executable: Option<PathBuf>,
    pub viewport: Viewport,
    pub launch_timeout: Duration,
}

impl LaunchPlan {
    pub fn from_config(config: &RunConfig) -> Self {
        let user_agent = config
            .http
            .user_agent
            .as_deref()
            .map(str::trim)
            .filter(|ua| !ua.is_empty())
            .map(str::to_string);

        LaunchPlan {
            headless: config.headless,
            args: config.launch_args.clone(),
            user_agent,
            chrome_executable: config.chrome_executable.clone(),
            viewport: Viewport::default(),
            launch_timeout: config.timeout(),
        }
    }
}

/// Cookie as injected into, or read back from, the browser context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl SessionCookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: None,
            path: None,
        }
    }

    pub fn scoped(mut self, domain: Option<String>, path: impl Into<String>) -> Self {
        self.domain = domain;
        self.path = Some(path.into());
        self
    }
}

/// Reference to an element that a probe found visible and enabled.
///
/// `token` is opaque to the workflow; the runtime that produced it knows how
/// to resolve it again for a click or a text read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementHandle {
    pub selector: String,
    pub token: String,
}

/// Adapter between the workflow and an actual browser engine.
#[async_trait]
pub trait BrowserRuntime: Send + Sync {
    async fn launch(&self, plan: &LaunchPlan) -> Result<(), BrowserRuntimeError>;

    async fn set_cookies(&self, cookies: &[SessionCookie]) -> Result<(), BrowserRuntimeError>;

    async fn cookies(&self) -> Result<Vec<SessionCookie>, BrowserRuntimeError>;

    async fn navigate(&self, url: &str, timeout: Duration) -> Result<(), BrowserRuntimeError>;

    /// Probe a single selector once. `Ok(None)` means nothing visible and
    /// enabled matched right now.
    async fn find_element(
        &self,
        selector: &str,
    ) -> Result<Option<ElementHandle>, BrowserRuntimeError>;

    async fn click(&self, element: &ElementHandle) -> Result<(), BrowserRuntimeError>;

    /// Wait for network/DOM activity to calm down after a page-affecting step.
    async fn wait_for_settle(&self, _timeout: Duration) -> Result<(), BrowserRuntimeError> {
        Ok(())
    }

    /// Rendered HTML of the current document.
    async fn content(&self) -> Result<String, BrowserRuntimeError>;

    /// Visible text of the page, or of a single element when one is given.
    async fn read_text(
        &self,
        element: Option<&ElementHandle>,
    ) -> Result<String, BrowserRuntimeError>;

    async fn title(&self) -> Result<Option<String>, BrowserRuntimeError> {
        Ok(None)
    }

    async fn current_url(&self) -> Result<Option<String>, BrowserRuntimeError> {
        Ok(None)
    }

    /// PNG screenshot of the page.
    async fn screenshot(&self, full_page: bool) -> Result<Vec<u8>, BrowserRuntimeError>;

    async fn shutdown(&self) -> Result<(), BrowserRuntimeError>;
}

#[derive(Debug, Error)]
pub enum BrowserRuntimeError {
    #[error("browser failed to launch: {0}")]
    Launch(String),
    #[error("navigation to {url} failed: {message}")]
    Navigation { url: String, message: String },
    #[error("{operation} timed out after {}ms", .after.as_millis())]
    Timeout {
        operation: String,
        after: Duration,
    },
    #[error("browser runtime error: {0}")]
    Message(String),
    #[error("browser runtime not initialized")]
    NotInitialized,
}

impl BrowserRuntimeError {
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        BrowserRuntimeError::Timeout {
            operation: operation.into(),
            after,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, BrowserRuntimeError::Timeout { .. })
    }
}

/// Read the current document, giving up after `timeout`.
pub async fn content_within<R>(runtime: &R, timeout: Duration) -> Result<String, BrowserRuntimeError>
where
    R: BrowserRuntime + ?Sized,
{
    match time::timeout(timeout, runtime.content()).await {
        Ok(result) => result,
        Err(_) => Err(BrowserRuntimeError::timeout("reading page content", timeout)),
    }
}

#[async_trait]
impl<R: BrowserRuntime + ?Sized> BrowserRuntime for Arc<R> {
    async fn launch(&self, plan: &LaunchPlan) -> Result<(), BrowserRuntimeError> {
        (**self).launch(plan).await
    }

    async fn set_cookies(&self, cookies: &[SessionCookie]) -> Result<(), BrowserRuntimeError> {
        (**self).set_cookies(cookies).await
    }

    async fn cookies(&self) -> Result<Vec<SessionCookie>, BrowserRuntimeError> {
        (**self).cookies().await
    }

    async fn navigate(&self, url: &str, timeout: Duration) -> Result<(), BrowserRuntimeError> {
        (**self).navigate(url, timeout).await
    }

    async fn find_element(
        &self,
        selector: &str,
    ) -> Result<Option<ElementHandle>, BrowserRuntimeError> {
        (**self).find_element(selector).await
    }

    async fn click(&self, element: &ElementHandle) -> Result<(), BrowserRuntimeError> {
        (**self).click(element).await
    }

    async fn wait_for_settle(&self, timeout: Duration) -> Result<(), BrowserRuntimeError> {
        (**self).wait_for_settle(timeout).await
    }

    async fn content(&self) -> Result<String, BrowserRuntimeError> {
        (**self).content().await
    }

    async fn read_text(
        &self,
        element: Option<&ElementHandle>,
    ) -> Result<String, BrowserRuntimeError> {
        (**self).read_text(element).await
    }

    async fn title(&self) -> Result<Option<String>, BrowserRuntimeError> {
        (**self).title().await
    }

    async fn current_url(&self) -> Result<Option<String>, BrowserRuntimeError> {
        (**self).current_url().await
    }

    async fn screenshot(&self, full_page: bool) -> Result<Vec<u8>, BrowserRuntimeError> {
        (**self).screenshot(full_page).await
    }

    async fn shutdown(&self) -> Result<(), BrowserRuntimeError> {
        (**self).shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HttpSettings;

    #[test]
    fn launch_plan_follows_config() {
        let mut config = RunConfig::default();
        config.headless = false;
        config.timeout_ms = 12_000;
        config.chrome_executable = Some(PathBuf::from("/opt/chrome"));
        config.http = HttpSettings {
            user_agent: Some("  Mozilla/5.0 custom  ".into()),
        };

        let plan = LaunchPlan::from_config(&config);
        assert!(!plan.headless);
        assert_eq!(plan.user_agent.as_deref(), Some("Mozilla/5.0 custom"));
        assert_eq!(plan.chrome_executable, Some(PathBuf::from("/opt/chrome")));
        assert_eq!(plan.launch_timeout, Duration::from_millis(12_000));
        assert!(
            plan.args
                .iter()
                .any(|arg| arg == "--disable-blink-features=AutomationControlled")
        );
    }

    #[test]
    fn blank_user_agent_is_ignored() {
        let mut config = RunConfig::default();
        config.http.user_agent = Some("   ".into());
        assert!(LaunchPlan::from_config(&config).user_agent.is_none());
    }

    #[test]
    fn timeout_error_reports_operation_and_budget() {
        let err = BrowserRuntimeError::timeout("navigate", Duration::from_millis(1500));
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "navigate timed out after 1500ms");
    }

    /// Runtime whose page reads never answer.
    struct StalledRuntime;

    #[async_trait]
    impl BrowserRuntime for StalledRuntime {
        async fn launch(&self, _plan: &LaunchPlan) -> Result<(), BrowserRuntimeError> {
            Ok(())
        }

        async fn set_cookies(&self, _cookies: &[SessionCookie]) -> Result<(), BrowserRuntimeError> {
            Ok(())
        }

        async fn cookies(&self) -> Result<Vec<SessionCookie>, BrowserRuntimeError> {
            Ok(Vec::new())
        }

        async fn navigate(&self, _url: &str, _timeout: Duration) -> Result<(), BrowserRuntimeError> {
            Ok(())
        }

        async fn find_element(
            &self,
            _selector: &str,
        ) -> Result<Option<ElementHandle>, BrowserRuntimeError> {
            Ok(None)
        }

        async fn click(&self, _element: &ElementHandle) -> Result<(), BrowserRuntimeError> {
            Ok(())
        }

        async fn content(&self) -> Result<String, BrowserRuntimeError> {
            time::sleep(Duration::from_secs(30)).await;
            Ok(String::new())
        }

        async fn read_text(
            &self,
            _element: Option<&ElementHandle>,
        ) -> Result<String, BrowserRuntimeError> {
            Ok(String::new())
        }

        async fn screenshot(&self, _full_page: bool) -> Result<Vec<u8>, BrowserRuntimeError> {
            Ok(Vec::new())
        }

        async fn shutdown(&self) -> Result<(), BrowserRuntimeError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_content_read_times_out_within_budget() {
        let started = time::Instant::now();
        let err = content_within(&StalledRuntime, Duration::from_millis(500))
            .await
            .expect_err("stalled read must time out");
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn cookie_serialisation_skips_unscoped_fields() {
        let cookie = SessionCookie::new("session", "abc");
        let value = serde_json::to_value(&cookie).expect("serialize");
        assert_eq!(value, serde_json::json!({"name": "session", "value": "abc"}));

        let scoped = cookie.scoped(Some("dash.example.com".into()), "/");
        assert_eq!(scoped.domain.as_deref(), Some("dash.example.com"));
        assert_eq!(scoped.path.as_deref(), Some("/"));
    }
}
