#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use screening_watchbot::config::{self, Config};
use screening_watchbot::notify::{Notification, Notifier, NotifyError};
use screening_watchbot::render::{BrowserDriver, BrowserSession, ClickTarget};

pub const TARGET_URL: &str = "https://www.boras.se/throwback.html";

pub const CONSENT_BANNER: &str = r#"<div class="sv-cookie-consent"><p>Vi använder kakor.</p><button type="button">Godkänn alla kakor</button></div>"#;

/// Announcement page in the shape the site serves.
pub fn screening_page(title: &str, booking: &str) -> String {
    format!(
        r#"<html><head><title>Throwback Thursday</title></head><body>
<main>
  <h1 class="sidrubrik">Throwback Thursday: {title} (1971)</h1>
  <p class="sv-font-ny-brodtext"><strong>Tid:</strong> <time datetime="2026-02-26T19:00:00+01:00">2026-02-26 19.00</time><br><strong>Plats: </strong>Borås Bio Röda Kvarn</p>
  <p><a href="{booking}" rel="external"><strong>Köp biljett</strong></a></p>
</main>
<div class="sv-font-uppdaterad-info-ny">Sidan uppdaterades <time datetime="2026-01-10T13:45:00+01:00">2026-01-10 13.45</time></div>
</body></html>"#
    )
}

pub fn with_banner(page: &str) -> String {
    page.replacen("<body>", &format!("<body>{}", CONSENT_BANNER), 1)
}

pub fn test_config(data_dir: &Path) -> Config {
    let yaml = format!(
        r#"
app:
  data_dir: "{}"
target:
  url: "{}"
browser:
  settle_quiet_ms: 100
  settle_timeout_ms: 1000
  element_wait_timeout_ms: 500
consent:
  probe_window_ms: 200
  dismiss_timeout_ms: 500
  poll_interval_ms: 50
retry:
  max_attempts: 3
  backoff_base_ms: 2000
  max_backoff_seconds: 60
"#,
        data_dir.display(),
        TARGET_URL
    );
    let cfg: Config = serde_yaml::from_str(&yaml).unwrap();
    config::validate(&cfg).unwrap();
    cfg
}

/// What one launched session does.
#[derive(Debug, Clone)]
pub enum Script {
    NavigateFails(&'static str),
    Hangs,
    /// `banner` is shown until the first click lands.
    Page { banner: Option<String>, html: String },
}

impl Script {
    pub fn page(html: String) -> Self {
        Script::Page { banner: None, html }
    }
}

#[derive(Debug, Default)]
pub struct Calls {
    pub launches: usize,
    pub teardowns: usize,
    pub navigations: Vec<String>,
    pub clicks: Vec<ClickTarget>,
}

/// Hands out scripted sessions in order; the last script repeats.
#[derive(Clone, Default)]
pub struct FakeDriver {
    scripts: Arc<Mutex<VecDeque<Script>>>,
    pub calls: Arc<Mutex<Calls>>,
}

impl FakeDriver {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(VecDeque::from(scripts))),
            ..Default::default()
        }
    }

    pub fn launches(&self) -> usize {
        self.calls.lock().unwrap().launches
    }

    pub fn teardowns(&self) -> usize {
        self.calls.lock().unwrap().teardowns
    }

    pub fn clicks(&self) -> Vec<ClickTarget> {
        self.calls.lock().unwrap().clicks.clone()
    }

    pub fn navigations(&self) -> Vec<String> {
        self.calls.lock().unwrap().navigations.clone()
    }
}

#[async_trait]
impl BrowserDriver for FakeDriver {
    async fn launch(&self, _options: &config::Browser) -> Result<Box<dyn BrowserSession>> {
        let script = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.len() > 1 {
                scripts.pop_front()
            } else {
                scripts.front().cloned()
            }
        }
        .ok_or_else(|| anyhow!("no script left"))?;
        self.calls.lock().unwrap().launches += 1;
        Ok(Box::new(FakeSession {
            script,
            clicked: false,
            url: String::new(),
            calls: self.calls.clone(),
        }))
    }
}

struct FakeSession {
    script: Script,
    clicked: bool,
    url: String,
    calls: Arc<Mutex<Calls>>,
}

#[async_trait]
impl BrowserSession for FakeSession {
    async fn navigate(&mut self, url: &str, _timeout: Duration) -> Result<()> {
        self.calls.lock().unwrap().navigations.push(url.to_string());
        match &self.script {
            Script::NavigateFails(cause) => Err(anyhow!("{}", cause)),
            Script::Hangs => std::future::pending().await,
            Script::Page { .. } => {
                self.url = url.to_string();
                Ok(())
            }
        }
    }

    async fn content(&mut self) -> Result<String> {
        match &self.script {
            Script::Page {
                banner: Some(banner),
                html,
            } if !self.clicked => Ok(banner.clone() + html),
            Script::Page { html, .. } => Ok(html.clone()),
            _ => Err(anyhow!("no document")),
        }
    }

    async fn current_url(&mut self) -> Result<String> {
        Ok(self.url.clone())
    }

    async fn click(&mut self, target: &ClickTarget, _timeout: Duration) -> Result<()> {
        self.calls.lock().unwrap().clicks.push(target.clone());
        self.clicked = true;
        Ok(())
    }

    async fn screenshot_png(&mut self) -> Result<Vec<u8>> {
        Ok(b"\x89PNG\r\n".to_vec())
    }

    fn teardown(&mut self) {
        self.calls.lock().unwrap().teardowns += 1;
    }
}

/// Records every notification; optionally fails them all.
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    sent: Arc<tokio::sync::Mutex<Vec<Notification>>>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub async fn sent(&self) -> Vec<Notification> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.sent.lock().await.push(notification.clone());
        if self.fail {
            return Err(NotifyError::InvalidUrl("webhook unavailable".into()));
        }
        Ok(())
    }
}
