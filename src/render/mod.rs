//! Rendering engine: owns one browser session per render and guarantees its
//! teardown on every exit path.
//!
//! The browser itself sits behind [`BrowserDriver`] / [`BrowserSession`] so the
//! pipeline can be driven by the real Chrome implementation in [`chrome`] or by
//! scripted sessions in tests.

use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config;

pub mod chrome;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderPhase {
    Launch,
    Navigate,
    Settle,
}

impl RenderPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenderPhase::Launch => "launch",
            RenderPhase::Navigate => "navigate",
            RenderPhase::Settle => "settle",
        }
    }
}

impl fmt::Display for RenderPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("render failed during {phase}: {cause}")]
pub struct RenderError {
    pub phase: RenderPhase,
    pub cause: String,
}

impl RenderError {
    pub fn new(phase: RenderPhase, cause: impl fmt::Display) -> Self {
        Self {
            phase,
            cause: format!("{:#}", cause),
        }
    }
}

/// Something a session can click: a CSS selector or an XPath expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickTarget {
    Css(String),
    XPath(String),
}

impl fmt::Display for ClickTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClickTarget::Css(s) => write!(f, "css:{}", s),
            ClickTarget::XPath(s) => write!(f, "xpath:{}", s),
        }
    }
}

/// A live browser page. Implementations must make `teardown` release the
/// browser process; it is called exactly once, from [`SessionGuard`]'s drop.
#[async_trait]
pub trait BrowserSession: Send {
    async fn navigate(&mut self, url: &str, timeout: Duration) -> Result<()>;

    /// Serialised DOM of the current page.
    async fn content(&mut self) -> Result<String>;

    async fn current_url(&mut self) -> Result<String>;

    async fn click(&mut self, target: &ClickTarget, timeout: Duration) -> Result<()>;

    async fn screenshot_png(&mut self) -> Result<Vec<u8>>;

    fn teardown(&mut self);
}

#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn launch(&self, options: &config::Browser) -> Result<Box<dyn BrowserSession>>;
}

/// Owns a session and tears it down when dropped, whether the render
/// succeeded, failed or its future was cancelled.
pub struct SessionGuard {
    session: Box<dyn BrowserSession>,
}

impl SessionGuard {
    pub fn new(session: Box<dyn BrowserSession>) -> Self {
        Self { session }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        debug!("tearing down browser session");
        self.session.teardown();
    }
}

/// A rendered, settled page plus the session that produced it.
pub struct RenderedDocument {
    guard: SessionGuard,
    url: String,
    options: config::Browser,
    screenshot_dir: Option<PathBuf>,
}

impl fmt::Debug for RenderedDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderedDocument")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl RenderedDocument {
    /// Wrap an already-launched session. The guard is armed immediately.
    pub fn attach(
        session: Box<dyn BrowserSession>,
        options: config::Browser,
        screenshot_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            guard: SessionGuard::new(session),
            url: String::new(),
            options,
            screenshot_dir,
        }
    }

    /// URL of the page as reported after the last navigation.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn options(&self) -> &config::Browser {
        &self.options
    }

    pub async fn snapshot(&mut self) -> Result<String> {
        self.guard.session.content().await
    }

    pub async fn click(&mut self, target: &ClickTarget) -> Result<()> {
        let timeout = self.options.element_wait_timeout();
        self.guard.session.click(target, timeout).await
    }

    /// Navigate this session to `url` and wait for the page to settle.
    #[instrument(skip(self))]
    pub async fn follow(&mut self, url: &str) -> Result<(), RenderError> {
        let timeout = self.options.page_load_timeout();
        match tokio::time::timeout(timeout, self.guard.session.navigate(url, timeout)).await {
            Err(_) => {
                return Err(RenderError::new(
                    RenderPhase::Navigate,
                    format!("page load exceeded {:?}", timeout),
                ))
            }
            Ok(Err(err)) => return Err(RenderError::new(RenderPhase::Navigate, err)),
            Ok(Ok(())) => {}
        }
        self.settle().await?;
        self.url = match self.guard.session.current_url().await {
            Ok(current) if !current.is_empty() => current,
            _ => url.to_string(),
        };
        info!(url = %self.url, "page rendered");
        Ok(())
    }

    /// Poll the DOM until it stays unchanged for `settle_quiet` or
    /// `settle_timeout` has elapsed. Only a failed snapshot is an error.
    async fn settle(&mut self) -> Result<(), RenderError> {
        let quiet = self.options.settle_quiet();
        let ceiling = self.options.settle_timeout();
        let poll = (quiet / 4).max(Duration::from_millis(25));
        let started = Instant::now();

        let mut last = self
            .guard
            .session
            .content()
            .await
            .map_err(|e| RenderError::new(RenderPhase::Settle, e))?;
        let mut stable_since = Instant::now();
        loop {
            if stable_since.elapsed() >= quiet {
                debug!(elapsed = ?started.elapsed(), "page settled");
                return Ok(());
            }
            if started.elapsed() >= ceiling {
                warn!(?ceiling, "content still changing; proceeding unsettled");
                return Ok(());
            }
            tokio::time::sleep(poll).await;
            let current = self
                .guard
                .session
                .content()
                .await
                .map_err(|e| RenderError::new(RenderPhase::Settle, e))?;
            if current != last {
                last = current;
                stable_since = Instant::now();
            }
        }
    }

    /// Capture a full-page PNG into the screenshot directory. Failures are
    /// logged and swallowed; the capture is diagnostic only.
    pub async fn screenshot(&mut self, reason: &str) -> Option<PathBuf> {
        let dir = self.screenshot_dir.clone()?;
        let bytes = match self.guard.session.screenshot_png().await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(?err, reason, "failed to capture screenshot");
                return None;
            }
        };
        if let Err(err) = tokio::fs::create_dir_all(&dir).await {
            warn!(?err, dir = %dir.display(), "failed to create screenshot dir");
            return None;
        }
        let stamp = chrono::Local::now().format("%Y%m%dT%H%M%S");
        let id = uuid::Uuid::new_v4().simple().to_string();
        let path = dir.join(format!("{}_{}_{}.png", reason, stamp, &id[..8]));
        match tokio::fs::write(&path, bytes).await {
            Ok(()) => {
                info!(path = %path.display(), reason, "debug screenshot saved");
                Some(path)
            }
            Err(err) => {
                warn!(?err, path = %path.display(), "failed to write screenshot");
                None
            }
        }
    }
}

/// Produces rendered documents. Does not retry; that belongs to the pipeline.
#[derive(Clone)]
pub struct RenderEngine {
    driver: Arc<dyn BrowserDriver>,
    options: config::Browser,
    screenshot_dir: Option<PathBuf>,
}

impl fmt::Debug for RenderEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderEngine")
            .field("options", &self.options)
            .field("screenshot_dir", &self.screenshot_dir)
            .finish_non_exhaustive()
    }
}

impl RenderEngine {
    pub fn new(
        driver: Arc<dyn BrowserDriver>,
        options: config::Browser,
        screenshot_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            driver,
            options,
            screenshot_dir,
        }
    }

    pub fn options(&self) -> &config::Browser {
        &self.options
    }

    /// Launch a fresh session, load `url` and wait for it to settle.
    #[instrument(skip(self))]
    pub async fn render(&self, url: &str) -> Result<RenderedDocument, RenderError> {
        let session = self
            .driver
            .launch(&self.options)
            .await
            .map_err(|e| RenderError::new(RenderPhase::Launch, e))?;
        let mut doc = RenderedDocument::attach(
            session,
            self.options.clone(),
            self.screenshot_dir.clone(),
        );
        doc.follow(url).await?;
        Ok(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Counters {
        teardowns: AtomicUsize,
        launches: AtomicUsize,
    }

    enum Behaviour {
        Static(&'static str),
        NavigateFails,
        NeverSettles,
        Blank,
        Hangs,
    }

    struct ScriptedSession {
        behaviour: Behaviour,
        ticks: usize,
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl BrowserSession for ScriptedSession {
        async fn navigate(&mut self, _url: &str, _timeout: Duration) -> Result<()> {
            match self.behaviour {
                Behaviour::NavigateFails => Err(anyhow!("net::ERR_TIMED_OUT")),
                Behaviour::Hangs => std::future::pending().await,
                _ => Ok(()),
            }
        }

        async fn content(&mut self) -> Result<String> {
            self.ticks += 1;
            match self.behaviour {
                Behaviour::Static(html) => Ok(html.to_string()),
                Behaviour::NeverSettles => Ok(format!("<p>{}</p>", self.ticks)),
                _ => Err(anyhow!("no page")),
            }
        }

        async fn current_url(&mut self) -> Result<String> {
            Ok("https://example.se/final".into())
        }

        async fn click(&mut self, _target: &ClickTarget, _timeout: Duration) -> Result<()> {
            Ok(())
        }

        async fn screenshot_png(&mut self) -> Result<Vec<u8>> {
            Ok(vec![0x89, b'P', b'N', b'G'])
        }

        fn teardown(&mut self) {
            self.counters.teardowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct ScriptedDriver {
        behaviours: Mutex<Vec<Behaviour>>,
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl BrowserDriver for ScriptedDriver {
        async fn launch(&self, _options: &config::Browser) -> Result<Box<dyn BrowserSession>> {
            self.counters.launches.fetch_add(1, Ordering::SeqCst);
            let behaviour = self.behaviours.lock().unwrap().remove(0);
            Ok(Box::new(ScriptedSession {
                behaviour,
                ticks: 0,
                counters: self.counters.clone(),
            }))
        }
    }

    fn engine(behaviour: Behaviour) -> (RenderEngine, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let driver = ScriptedDriver {
            behaviours: Mutex::new(vec![behaviour]),
            counters: counters.clone(),
        };
        let options = config::Browser {
            settle_quiet_ms: 100,
            settle_timeout_ms: 1_000,
            page_load_timeout_ms: 5_000,
            ..Default::default()
        };
        (RenderEngine::new(Arc::new(driver), options, None), counters)
    }

    #[tokio::test(start_paused = true)]
    async fn render_settles_and_reports_final_url() {
        let (engine, counters) = engine(Behaviour::Static("<p>hello</p>"));
        let mut doc = engine.render("https://example.se/").await.unwrap();
        assert_eq!(doc.url(), "https://example.se/final");
        assert_eq!(doc.snapshot().await.unwrap(), "<p>hello</p>");
        assert_eq!(counters.teardowns.load(Ordering::SeqCst), 0);
        drop(doc);
        assert_eq!(counters.teardowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn navigate_failure_tears_down_once() {
        let (engine, counters) = engine(Behaviour::NavigateFails);
        let err = engine.render("https://example.se/").await.unwrap_err();
        assert_eq!(err.phase, RenderPhase::Navigate);
        assert!(err.cause.contains("ERR_TIMED_OUT"));
        assert_eq!(counters.launches.load(Ordering::SeqCst), 1);
        assert_eq!(counters.teardowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn restless_page_renders_after_settle_ceiling() {
        let (engine, counters) = engine(Behaviour::NeverSettles);
        let started = Instant::now();
        let mut doc = engine.render("https://example.se/").await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(1_000));
        assert!(doc.snapshot().await.unwrap().starts_with("<p>"));
        drop(doc);
        assert_eq!(counters.teardowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unreadable_page_is_a_settle_failure() {
        let (engine, counters) = engine(Behaviour::Blank);
        let err = engine.render("https://example.se/").await.unwrap_err();
        assert_eq!(err.phase, RenderPhase::Settle);
        assert_eq!(counters.teardowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_navigation_times_out_and_tears_down() {
        let (engine, counters) = engine(Behaviour::Hangs);
        let err = engine.render("https://example.se/").await.unwrap_err();
        assert_eq!(err.phase, RenderPhase::Navigate);
        assert!(err.cause.contains("exceeded"));
        assert_eq!(counters.teardowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_render_still_tears_down() {
        let (engine, counters) = engine(Behaviour::Hangs);
        let res = tokio::time::timeout(
            Duration::from_millis(50),
            engine.render("https://example.se/"),
        )
        .await;
        assert!(res.is_err());
        assert_eq!(counters.teardowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn screenshot_is_written_to_configured_dir() {
        let td = tempfile::tempdir().unwrap();
        let counters = Arc::new(Counters::default());
        let session = ScriptedSession {
            behaviour: Behaviour::Static("<p/>"),
            ticks: 0,
            counters: counters.clone(),
        };
        let mut doc = RenderedDocument::attach(
            Box::new(session),
            config::Browser::default(),
            Some(td.path().join("shots")),
        );
        let path = doc.screenshot("consent_failure").await.unwrap();
        assert!(path.starts_with(td.path().join("shots")));
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("consent_failure_"));
        assert_eq!(std::fs::read(&path).unwrap()[1], b'P');
    }
}
