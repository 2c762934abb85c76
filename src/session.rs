//! Session provisioning.
//!
//! [`SessionProvisioner::open`] launches the browser, seeds the context with
//! the configured cookies before any navigation happens, and hands back a
//! [`SessionHandle`] that exclusively owns the browser for the rest of the
//! run. Releasing the handle shuts the browser down; a handle dropped without
//! an explicit release still schedules the shutdown.

use std::sync::Arc;

use thiserror::Error;
use url::Url;

use crate::browser::{BrowserRuntime, BrowserRuntimeError, LaunchPlan, SessionCookie};
use crate::config::RunConfig;
use crate::logging::RunLogger;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("browser launch failed: {0}")]
    Launch(#[source] BrowserRuntimeError),
    #[error("session setup failed: {0}")]
    Navigation(#[source] BrowserRuntimeError),
}

/// Builds cookie-seeded sessions from a [`RunConfig`].
pub struct SessionProvisioner<R: BrowserRuntime + 'static> {
    runtime: Arc<R>,
}

impl<R: BrowserRuntime + 'static> SessionProvisioner<R> {
    pub fn new(runtime: Arc<R>) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &Arc<R> {
        &self.runtime
    }

    /// Launch the browser and inject cookies.
    ///
    /// Launch failures are [`SessionError::Launch`]; a launched browser that
    /// refuses the cookie set is torn down again and reported as
    /// [`SessionError::Navigation`].
    pub async fn open(
        &self,
        config: &RunConfig,
        logger: &RunLogger,
    ) -> Result<SessionHandle<R>, SessionError> {
        let plan = LaunchPlan::from_config(config);
        logger.debug(
            format!("Launching browser (headless: {})", plan.headless),
            Some("session"),
            None,
        );
        self.runtime
            .launch(&plan)
            .await
            .map_err(SessionError::Launch)?;

        let handle = SessionHandle::new(self.runtime.clone());

        if config.use_config_cookies {
            let cookies = scoped_cookies(config);
            if !cookies.is_empty() {
                if let Err(err) = handle.runtime().set_cookies(&cookies).await {
                    handle.release().await;
                    return Err(SessionError::Navigation(err));
                }
                let names: Vec<&str> = cookies.iter().map(|c| c.name.as_str()).collect();
                logger.info(
                    format!("Injected {} cookie(s) into the browser context", cookies.len()),
                    Some("session"),
                    Some(serde_json::json!({ "names": names })),
                );
            }
        }

        Ok(handle)
    }
}

/// Cookie list for injection: every non-empty configured cookie, scoped to
/// the host of `base_url` (or of the manage URL when no base is configured)
/// with path `/`.
pub fn scoped_cookies(config: &RunConfig) -> Vec<SessionCookie> {
    let domain = config
        .base_url
        .as_deref()
        .and_then(host_of)
        .or_else(|| config.manage_url.as_deref().and_then(host_of));

    config
        .cookie_pairs()
        .into_iter()
        .map(|(name, value)| SessionCookie::new(name, value).scoped(domain.clone(), "/"))
        .collect()
}

fn host_of(url: &str) -> Option<String> {
    Url::parse(url.trim())
        .ok()
        .and_then(|parsed| parsed.host_str().map(str::to_string))
}

/// Exclusive owner of the live browser for one run.
pub struct SessionHandle<R: BrowserRuntime + 'static> {
    runtime: Arc<R>,
    released: bool,
}

impl<R: BrowserRuntime + 'static> SessionHandle<R> {
    fn new(runtime: Arc<R>) -> Self {
        Self {
            runtime,
            released: false,
        }
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    /// Shut the browser down. Consumes the handle so it cannot be released twice.
    pub async fn release(mut self) {
        self.released = true;
        if let Err(err) = self.runtime.shutdown().await {
            log::warn!("browser shutdown reported an error: {err}");
        }
    }
}

impl<R: BrowserRuntime + 'static> Drop for SessionHandle<R> {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            let runtime = Arc::clone(&self.runtime);
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(err) = runtime.shutdown().await {
                            log::warn!("deferred browser shutdown failed: {err}");
                        }
                    });
                }
                Err(_) => log::warn!("session dropped outside a tokio runtime; browser left running"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::ElementHandle;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingRuntime {
        events: Mutex<Vec<String>>,
        cookies: Mutex<Vec<SessionCookie>>,
        fail_launch: bool,
        reject_cookies: bool,
    }

    impl RecordingRuntime {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BrowserRuntime for RecordingRuntime {
        async fn launch(&self, _plan: &LaunchPlan) -> Result<(), BrowserRuntimeError> {
            self.events.lock().unwrap().push("launch".into());
            if self.fail_launch {
                return Err(BrowserRuntimeError::Launch("no chrome".into()));
            }
            Ok(())
        }

        async fn set_cookies(&self, cookies: &[SessionCookie]) -> Result<(), BrowserRuntimeError> {
            self.events.lock().unwrap().push("set_cookies".into());
            if self.reject_cookies {
                return Err(BrowserRuntimeError::Message("bad cookie".into()));
            }
            self.cookies.lock().unwrap().extend_from_slice(cookies);
            Ok(())
        }

        async fn cookies(&self) -> Result<Vec<SessionCookie>, BrowserRuntimeError> {
            Ok(self.cookies.lock().unwrap().clone())
        }

        async fn navigate(&self, _url: &str, _timeout: Duration) -> Result<(), BrowserRuntimeError> {
            self.events.lock().unwrap().push("navigate".into());
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
            self.events.lock().unwrap().push("shutdown".into());
            Ok(())
        }
    }

    fn config_with_cookies() -> RunConfig {
        let mut config = RunConfig::default();
        config.manage_url = Some("https://dash.example.com/service/1/manage".into());
        config.base_url = Some("https://www.example.com/".into());
        config.cookies.insert("session".into(), Some("abc".into()));
        config.cookies.insert("cf_clearance".into(), Some("xyz".into()));
        config.cookies.insert("blank".into(), Some(String::new()));
        config
    }

    #[test]
    fn cookies_are_scoped_to_base_url_host() {
        let cookies = scoped_cookies(&config_with_cookies());
        assert_eq!(cookies.len(), 2);
        for cookie in &cookies {
            assert_eq!(cookie.domain.as_deref(), Some("www.example.com"));
            assert_eq!(cookie.path.as_deref(), Some("/"));
        }
    }

    #[test]
    fn cookie_scope_falls_back_to_manage_url() {
        let mut config = config_with_cookies();
        config.base_url = None;
        let cookies = scoped_cookies(&config);
        assert!(
            cookies
                .iter()
                .all(|cookie| cookie.domain.as_deref() == Some("dash.example.com"))
        );
    }

    #[tokio::test]
    async fn open_injects_cookies_before_any_navigation() {
        let runtime = Arc::new(RecordingRuntime::default());
        let provisioner = SessionProvisioner::new(runtime.clone());
        let config = config_with_cookies();

        let handle = provisioner
            .open(&config, &RunLogger::default())
            .await
            .expect("session opens");

        let stored = handle.runtime().cookies().await.expect("cookies");
        let mut pairs: Vec<(String, String)> = stored
            .into_iter()
            .map(|cookie| (cookie.name, cookie.value))
            .collect();
        pairs.sort();
        assert_eq!(pairs, config.cookie_pairs());

        handle.release().await;
        assert_eq!(runtime.events(), vec!["launch", "set_cookies", "shutdown"]);
    }

    #[tokio::test]
    async fn open_skips_cookies_when_disabled() {
        let runtime = Arc::new(RecordingRuntime::default());
        let provisioner = SessionProvisioner::new(runtime.clone());
        let mut config = config_with_cookies();
        config.use_config_cookies = false;

        let handle = provisioner
            .open(&config, &RunLogger::default())
            .await
            .expect("session opens");
        handle.release().await;
        assert_eq!(runtime.events(), vec!["launch", "shutdown"]);
    }

    #[tokio::test]
    async fn launch_failure_is_reported_as_launch_error() {
        let runtime = Arc::new(RecordingRuntime {
            fail_launch: true,
            ..RecordingRuntime::default()
        });
        let provisioner = SessionProvisioner::new(runtime.clone());
        let result = provisioner
            .open(&config_with_cookies(), &RunLogger::default())
            .await;
        assert!(matches!(result, Err(SessionError::Launch(_))));
    }

    #[tokio::test]
    async fn rejected_cookies_release_the_browser() {
        let runtime = Arc::new(RecordingRuntime {
            reject_cookies: true,
            ..RecordingRuntime::default()
        });
        let provisioner = SessionProvisioner::new(runtime.clone());
        let result = provisioner
            .open(&config_with_cookies(), &RunLogger::default())
            .await;
        assert!(matches!(result, Err(SessionError::Navigation(_))));
        assert_eq!(runtime.events(), vec!["launch", "set_cookies", "shutdown"]);
    }

    #[tokio::test]
    async fn dropped_handle_still_shuts_down() {
        let runtime = Arc::new(RecordingRuntime::default());
        let provisioner = SessionProvisioner::new(runtime.clone());
        let mut config = config_with_cookies();
        config.use_config_cookies = false;

        let handle = provisioner
            .open(&config, &RunLogger::default())
            .await
            .expect("session opens");
        drop(handle);
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(runtime.events(), vec!["launch", "shutdown"]);
    }
}
