//! Configuration loader and validator for the screening watcher.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const WEBHOOK_ENV: &str = "DISCORD_WEBHOOK_URL";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub target: Target,
    #[serde(default)]
    pub browser: Browser,
    #[serde(default)]
    pub consent: Consent,
    #[serde(default)]
    pub retry: Retry,
    #[serde(default)]
    pub notify: Notify,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    #[serde(default = "default_state_file")]
    pub state_file: String,
    #[serde(default = "default_screenshot_dir")]
    pub screenshot_dir: String,
    #[serde(default = "default_true")]
    pub screenshot_on_failure: bool,
    #[serde(default = "default_cycle_timeout")]
    pub cycle_timeout_seconds: u64,
}

/// The page being watched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Target {
    pub url: String,
    /// Listing pages link to the announcement itself; when this selector
    /// matches, the detail page is followed before extraction.
    #[serde(default)]
    pub detail_link_selector: Option<String>,
    #[serde(default)]
    pub default_location: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Browser {
    pub headless: bool,
    pub chrome_path: Option<String>,
    pub page_load_timeout_ms: u64,
    pub settle_timeout_ms: u64,
    pub settle_quiet_ms: u64,
    pub element_wait_timeout_ms: u64,
    pub window_width: u32,
    pub window_height: u32,
}

impl Default for Browser {
    fn default() -> Self {
        Self {
            headless: true,
            chrome_path: None,
            page_load_timeout_ms: 30_000,
            settle_timeout_ms: 10_000,
            settle_quiet_ms: 500,
            element_wait_timeout_ms: 10_000,
            window_width: 1920,
            window_height: 1080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Consent {
    pub probe_window_ms: u64,
    pub dismiss_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for Consent {
    fn default() -> Self {
        Self {
            probe_window_ms: 2_000,
            dismiss_timeout_ms: 3_000,
            poll_interval_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Retry {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub max_backoff_seconds: u64,
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 2_000,
            max_backoff_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Notify {
    pub discord_webhook_url: String,
}

fn default_state_file() -> String {
    "db.json".into()
}

fn default_screenshot_dir() -> String {
    "debug_screenshots".into()
}

fn default_true() -> bool {
    true
}

fn default_cycle_timeout() -> u64 {
    300
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    pub fn state_path(&self) -> PathBuf {
        Path::new(&self.app.data_dir).join(&self.app.state_file)
    }

    pub fn screenshot_dir(&self) -> PathBuf {
        Path::new(&self.app.data_dir).join(&self.app.screenshot_dir)
    }

    pub fn lock_path(&self) -> PathBuf {
        Path::new(&self.app.data_dir).join("run.lock")
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.app.cycle_timeout_seconds)
    }

    /// Webhook URL, preferring the environment over the file.
    pub fn webhook_url(&self) -> Option<String> {
        std::env::var(WEBHOOK_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| {
                Some(self.notify.discord_webhook_url.clone()).filter(|v| !v.trim().is_empty())
            })
    }
}

impl Browser {
    pub fn page_load_timeout(&self) -> Duration {
        Duration::from_millis(self.page_load_timeout_ms)
    }

    pub fn settle_timeout(&self) -> Duration {
        Duration::from_millis(self.settle_timeout_ms)
    }

    pub fn settle_quiet(&self) -> Duration {
        Duration::from_millis(self.settle_quiet_ms)
    }

    pub fn element_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.element_wait_timeout_ms)
    }
}

impl Consent {
    pub fn probe_window(&self) -> Duration {
        Duration::from_millis(self.probe_window_ms)
    }

    pub fn dismiss_timeout(&self) -> Duration {
        Duration::from_millis(self.dismiss_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Retry {
    /// Delay before retrying after `attempt` (1-based) failed:
    /// `base * 2^(attempt-1)`, capped at `max_backoff_seconds`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let ms = self.backoff_base_ms.saturating_mul(1_u64 << shift);
        let cap = if self.max_backoff_seconds == 0 {
            ms
        } else {
            self.max_backoff_seconds.saturating_mul(1000)
        };
        Duration::from_millis(ms.min(cap))
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.state_file.trim().is_empty() {
        return Err(ConfigError::Invalid("app.state_file must be non-empty"));
    }
    if cfg.app.cycle_timeout_seconds == 0 {
        return Err(ConfigError::Invalid("app.cycle_timeout_seconds must be > 0"));
    }

    match url::Url::parse(cfg.target.url.trim()) {
        Ok(u) if u.scheme() == "http" || u.scheme() == "https" => {}
        _ => return Err(ConfigError::Invalid("target.url must be an absolute http(s) URL")),
    }
    if let Some(sel) = &cfg.target.detail_link_selector {
        if scraper::Selector::parse(sel).is_err() {
            return Err(ConfigError::Invalid("target.detail_link_selector is not a valid CSS selector"));
        }
    }

    if cfg.browser.page_load_timeout_ms == 0 {
        return Err(ConfigError::Invalid("browser.page_load_timeout_ms must be > 0"));
    }
    if cfg.browser.element_wait_timeout_ms == 0 {
        return Err(ConfigError::Invalid("browser.element_wait_timeout_ms must be > 0"));
    }
    if cfg.browser.settle_quiet_ms > cfg.browser.settle_timeout_ms {
        return Err(ConfigError::Invalid("browser.settle_quiet_ms must not exceed settle_timeout_ms"));
    }

    if cfg.consent.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("consent.poll_interval_ms must be > 0"));
    }

    if cfg.retry.max_attempts == 0 {
        return Err(ConfigError::Invalid("retry.max_attempts must be >= 1"));
    }

    Ok(())
}

/// Example configuration, printed by `--print-example-config`.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  state_file: "db.json"
  screenshot_dir: "debug_screenshots"
  screenshot_on_failure: true
  cycle_timeout_seconds: 300

target:
  url: "https://www.boras.se/upplevaochgora/kulturochnoje/borasbiorodakvarn/throwbackthursday.4.706b03641584ebf5394d6c1a.html"
  detail_link_selector: ".sv-channel-item a[href]"

browser:
  headless: true
  page_load_timeout_ms: 30000
  settle_timeout_ms: 10000
  settle_quiet_ms: 500
  element_wait_timeout_ms: 10000

consent:
  probe_window_ms: 2000
  dismiss_timeout_ms: 3000
  poll_interval_ms: 250

retry:
  max_attempts: 3
  backoff_base_ms: 2000
  max_backoff_seconds: 60

notify:
  # DISCORD_WEBHOOK_URL in the environment takes precedence.
  discord_webhook_url: ""
"#
}
