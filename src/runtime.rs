//! Chromiumoxide-based browser runtime.
//!
//! Provides an implementation of [`BrowserRuntime`](crate::browser::BrowserRuntime)
//! backed by the `chromiumoxide` crate. One runtime owns one launched browser
//! and a single working page; the renewal workflow never needs more.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::{
    browser::{Browser, BrowserConfig},
    cdp::browser_protocol::network::CookieParam,
    cdp::browser_protocol::page::CaptureScreenshotFormat,
    page::{Page as ChromiumPage, ScreenshotParams},
};
use futures_util::StreamExt;
use serde_json::Value as JsonValue;
use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{self, Instant},
};

use crate::browser::{
    BrowserRuntime, BrowserRuntimeError, ElementHandle, LaunchPlan, SessionCookie,
};
use crate::dom_scripts::{self, PROBE_SCRIPT, VISIBLE_TEXT_SCRIPT};

const SETTLE_POLL: Duration = Duration::from_millis(250);
const SETTLE_GRACE: Duration = Duration::from_millis(1_200);

pub struct ChromiumoxideRuntime {
    state: Arc<Mutex<Option<RuntimeState>>>,
}

struct RuntimeState {
    browser: Browser,
    handler: JoinHandle<()>,
    page: ChromiumPage,
}

impl ChromiumoxideRuntime {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(None)),
        }
    }

    async fn page(&self) -> Result<ChromiumPage, BrowserRuntimeError> {
        let guard = self.state.lock().await;
        let state = guard.as_ref().ok_or(BrowserRuntimeError::NotInitialized)?;
        Ok(state.page.clone())
    }

    async fn evaluate(&self, expression: String) -> Result<JsonValue, BrowserRuntimeError> {
        let page = self.page().await?;
        let result = page
            .evaluate(expression)
            .await
            .map_err(map_chromiumoxide_error)?;
        Ok(result.value().cloned().unwrap_or(JsonValue::Null))
    }

    async fn ready_state(&self) -> Option<String> {
        self.evaluate("document.readyState".to_string())
            .await
            .ok()
            .and_then(|value| value.as_str().map(str::to_string))
    }
}

impl Default for ChromiumoxideRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrowserRuntime for ChromiumoxideRuntime {
    async fn launch(&self, plan: &LaunchPlan) -> Result<(), BrowserRuntimeError> {
        if self.state.lock().await.is_some() {
            return Ok(());
        }

        let config = build_config(plan)?;
        let (mut browser, handler) = time::timeout(plan.launch_timeout, Browser::launch(config))
            .await
            .map_err(|_| {
                BrowserRuntimeError::Launch(format!(
                    "browser did not start within {}ms",
                    plan.launch_timeout.as_millis()
                ))
            })?
            .map_err(|err| BrowserRuntimeError::Launch(err.to_string()))?;

        let handler = spawn_handler(handler);

        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(err) => {
                let _ = browser.close().await;
                handler.abort();
                return Err(BrowserRuntimeError::Launch(format!(
                    "failed to open initial page: {err}"
                )));
            }
        };

        let mut guard = self.state.lock().await;
        *guard = Some(RuntimeState {
            browser,
            handler,
            page,
        });
        Ok(())
    }

    async fn set_cookies(&self, cookies: &[SessionCookie]) -> Result<(), BrowserRuntimeError> {
        if cookies.is_empty() {
            return Ok(());
        }
        let page = self.page().await?;
        let params = cookies
            .iter()
            .map(cookie_param)
            .collect::<Result<Vec<_>, _>>()?;
        page.set_cookies(params)
            .await
            .map_err(map_chromiumoxide_error)?;
        Ok(())
    }

    async fn cookies(&self) -> Result<Vec<SessionCookie>, BrowserRuntimeError> {
        let page = self.page().await?;
        let cookies = page.get_cookies().await.map_err(map_chromiumoxide_error)?;
        Ok(cookies
            .into_iter()
            .map(|cookie| SessionCookie {
                name: cookie.name,
                value: cookie.value,
                domain: Some(cookie.domain),
                path: Some(cookie.path),
            })
            .collect())
    }

    async fn navigate(&self, url: &str, timeout: Duration) -> Result<(), BrowserRuntimeError> {
        let page = self.page().await?;
        match time::timeout(timeout, page.goto(url)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) => Err(BrowserRuntimeError::Navigation {
                url: url.to_string(),
                message: err.to_string(),
            }),
            Err(_) => Err(BrowserRuntimeError::timeout(
                format!("navigation to {url}"),
                timeout,
            )),
        }
    }

    async fn find_element(
        &self,
        selector: &str,
    ) -> Result<Option<ElementHandle>, BrowserRuntimeError> {
        let value = self
            .evaluate(dom_scripts::invoke(PROBE_SCRIPT, Some(selector)))
            .await?;
        Ok(value.as_str().map(|token| ElementHandle {
            selector: selector.to_string(),
            token: token.to_string(),
        }))
    }

    async fn click(&self, element: &ElementHandle) -> Result<(), BrowserRuntimeError> {
        let page = self.page().await?;
        let css = dom_scripts::handle_selector(&element.token);

        let native = match page.find_element(css.as_str()).await {
            Ok(target) => target.click().await.map(|_| ()),
            Err(err) => Err(err),
        };

        if let Err(err) = native {
            // Some submit buttons refuse synthetic mouse events; fall back to
            // a DOM-level click before giving up.
            let script = format!(
                "(function () {{ const el = document.querySelector({}); if (!el) return false; el.click(); return true; }})()",
                JsonValue::String(css.clone())
            );
            let clicked = self.evaluate(script).await?;
            if clicked.as_bool() != Some(true) {
                return Err(BrowserRuntimeError::Message(format!(
                    "could not click '{}': {err}",
                    element.selector
                )));
            }
        }
        Ok(())
    }

    async fn wait_for_settle(&self, timeout: Duration) -> Result<(), BrowserRuntimeError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.ready_state().await.as_deref() == Some("complete") {
                break;
            }
            if Instant::now() >= deadline {
                return Ok(());
            }
            time::sleep(SETTLE_POLL).await;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        time::sleep(SETTLE_GRACE.min(remaining)).await;
        Ok(())
    }

    async fn content(&self) -> Result<String, BrowserRuntimeError> {
        let page = self.page().await?;
        page.content().await.map_err(map_chromiumoxide_error)
    }

    async fn read_text(
        &self,
        element: Option<&ElementHandle>,
    ) -> Result<String, BrowserRuntimeError> {
        let token = element.map(|handle| handle.token.as_str());
        let value = self
            .evaluate(dom_scripts::invoke(VISIBLE_TEXT_SCRIPT, token))
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn title(&self) -> Result<Option<String>, BrowserRuntimeError> {
        let page = self.page().await?;
        page.get_title().await.map_err(map_chromiumoxide_error)
    }

    async fn current_url(&self) -> Result<Option<String>, BrowserRuntimeError> {
        let page = self.page().await?;
        page.url().await.map_err(map_chromiumoxide_error)
    }

    async fn screenshot(&self, full_page: bool) -> Result<Vec<u8>, BrowserRuntimeError> {
        let page = self.page().await?;
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(full_page)
            .build();
        page.screenshot(params)
            .await
            .map_err(map_chromiumoxide_error)
    }

    async fn shutdown(&self) -> Result<(), BrowserRuntimeError> {
        let state = {
            let mut guard = self.state.lock().await;
            guard.take()
        };

        if let Some(mut state) = state {
            let closed = state.browser.close().await.map(|_| ());
            let _ = state.browser.wait().await;
            state.handler.abort();
            closed.map_err(map_chromiumoxide_error)?;
        }
        Ok(())
    }
}

fn build_config(plan: &LaunchPlan) -> Result<BrowserConfig, BrowserRuntimeError> {
    let viewport = chromiumoxide::handler::viewport::Viewport {
        width: plan.viewport.width,
        height: plan.viewport.height,
        device_scale_factor: None,
        emulating_mobile: false,
        is_landscape: plan.viewport.width >= plan.viewport.height,
        has_touch: false,
    };

    let mut builder = BrowserConfig::builder();

    if let Some(path) = &plan.chrome_executable {
        builder = builder.chrome_executable(path);
    }

    let builder = builder.viewport(viewport).args(plan.args.clone());

    let builder = if plan.headless {
        builder
    } else {
        builder.with_head()
    };

    let builder = match &plan.user_agent {
        Some(user_agent) => builder.arg(format!("--user-agent={user_agent}")),
        None => builder,
    };

    builder.build().map_err(BrowserRuntimeError::Launch)
}

fn cookie_param(cookie: &SessionCookie) -> Result<CookieParam, BrowserRuntimeError> {
    let mut builder = CookieParam::builder()
        .name(cookie.name.clone())
        .value(cookie.value.clone());
    if let Some(domain) = &cookie.domain {
        builder = builder.domain(domain.clone());
    }
    if let Some(path) = &cookie.path {
        builder = builder.path(path.clone());
    }
    builder.build().map_err(BrowserRuntimeError::Message)
}

fn map_chromiumoxide_error<E: std::fmt::Display>(err: E) -> BrowserRuntimeError {
    BrowserRuntimeError::Message(err.to_string())
}

fn spawn_handler(mut handler: chromiumoxide::handler::Handler) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(result) = handler.next().await {
            if let Err(err) = result {
                log::debug!("chromiumoxide handler error: {err}");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::Viewport;
    use std::path::PathBuf;

    fn plan() -> LaunchPlan {
        LaunchPlan {
            headless: true,
            args: vec!["--no-sandbox".into()],
            user_agent: Some("Mozilla/5.0 test".into()),
            chrome_executable: Some(PathBuf::from("/usr/bin/chromium")),
            viewport: Viewport::default(),
            launch_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn build_config_accepts_launch_plan() {
        assert!(build_config(&plan()).is_ok());
    }

    #[test]
    fn cookie_param_carries_scope() {
        let cookie = SessionCookie::new("session", "abc").scoped(Some("dash.example.com".into()), "/");
        let param = cookie_param(&cookie).expect("cookie param");
        assert_eq!(param.name, "session");
        assert_eq!(param.value, "abc");
        assert_eq!(param.domain.as_deref(), Some("dash.example.com"));
        assert_eq!(param.path.as_deref(), Some("/"));
    }

    #[tokio::test]
    async fn operations_before_launch_report_not_initialized() {
        let runtime = ChromiumoxideRuntime::new();
        let err = runtime.content().await.expect_err("no browser yet");
        assert!(matches!(err, BrowserRuntimeError::NotInitialized));

        // Shutting down a runtime that never launched is a no-op.
        runtime.shutdown().await.expect("shutdown");
    }
}
