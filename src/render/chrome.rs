use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{Browser, LaunchOptions, Tab};
use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{BrowserDriver, BrowserSession, ClickTarget};
use crate::config;

/// Reads the HTTP status of the main document, when the browser exposes it.
const NAVIGATION_STATUS_JS: &str =
    "(() => { const e = performance.getEntriesByType('navigation')[0]; return e && e.responseStatus ? e.responseStatus : 0; })()";

/// Launches a local Chrome/Chromium per session.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChromeDriver;

#[async_trait]
impl BrowserDriver for ChromeDriver {
    async fn launch(&self, options: &config::Browser) -> Result<Box<dyn BrowserSession>> {
        let options = options.clone();
        let session = tokio::task::spawn_blocking(move || ChromeSession::launch(&options))
            .await
            .context("browser launch task failed")??;
        Ok(Box::new(session))
    }
}

pub struct ChromeSession {
    browser: Option<Browser>,
    tab: Option<Arc<Tab>>,
    element_timeout: Duration,
}

impl ChromeSession {
    fn launch(options: &config::Browser) -> Result<Self> {
        info!(headless = options.headless, "launching chrome");
        let launch = LaunchOptions::default_builder()
            .headless(options.headless)
            .sandbox(false)
            .window_size(Some((options.window_width, options.window_height)))
            .path(options.chrome_path.as_ref().map(PathBuf::from))
            .idle_browser_timeout(options.page_load_timeout() * 4)
            .args(vec![
                OsStr::new("--disable-dev-shm-usage"),
                OsStr::new("--disable-gpu"),
            ])
            .build()
            .map_err(|e| anyhow!("invalid chrome launch options: {}", e))?;
        let browser = Browser::new(launch).context("failed to start chrome")?;
        let tab = browser.new_tab().context("failed to open browser tab")?;
        tab.set_default_timeout(options.element_wait_timeout());
        Ok(Self {
            browser: Some(browser),
            tab: Some(tab),
            element_timeout: options.element_wait_timeout(),
        })
    }

    /// Run a blocking tab operation on the blocking pool.
    async fn with_tab<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<Tab>) -> Result<T> + Send + 'static,
    {
        let tab = self
            .tab
            .clone()
            .ok_or_else(|| anyhow!("browser session already torn down"))?;
        tokio::task::spawn_blocking(move || op(tab))
            .await
            .context("browser task failed")?
    }
}

#[async_trait]
impl BrowserSession for ChromeSession {
    async fn navigate(&mut self, url: &str, timeout: Duration) -> Result<()> {
        let url = url.to_string();
        let element_timeout = self.element_timeout;
        self.with_tab(move |tab| {
            tab.set_default_timeout(timeout);
            let res = tab
                .navigate_to(&url)
                .and_then(|t| t.wait_until_navigated())
                .map(|_| ());
            tab.set_default_timeout(element_timeout);
            res.with_context(|| format!("navigation to {} failed", url))?;

            let status = tab
                .evaluate(NAVIGATION_STATUS_JS, false)
                .ok()
                .and_then(|obj| obj.value)
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            if status >= 400 {
                return Err(anyhow!("navigation to {} returned HTTP {}", url, status));
            }
            Ok(())
        })
        .await
    }

    async fn content(&mut self) -> Result<String> {
        self.with_tab(|tab| tab.get_content()).await
    }

    async fn current_url(&mut self) -> Result<String> {
        self.with_tab(|tab| Ok(tab.get_url())).await
    }

    async fn click(&mut self, target: &ClickTarget, timeout: Duration) -> Result<()> {
        let target = target.clone();
        self.with_tab(move |tab| {
            let element = match &target {
                ClickTarget::Css(sel) => tab.wait_for_element_with_custom_timeout(sel, timeout),
                ClickTarget::XPath(xpath) => tab.wait_for_xpath_with_custom_timeout(xpath, timeout),
            }
            .with_context(|| format!("click target {} not found", target))?;
            element
                .click()
                .with_context(|| format!("failed to click {}", target))?;
            Ok(())
        })
        .await
    }

    async fn screenshot_png(&mut self) -> Result<Vec<u8>> {
        self.with_tab(|tab| {
            tab.capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true)
        })
        .await
    }

    fn teardown(&mut self) {
        // Dropping the last `Browser` handle kills the chrome process.
        self.tab.take();
        if self.browser.take().is_some() {
            debug!("chrome process released");
        }
    }
}
