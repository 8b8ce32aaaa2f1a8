//! One watch cycle: render, resolve consent, extract, detect, commit.
//!
//! Render and extraction failures are retried with a fresh browser session
//! each time. Acquisition runs under a ceiling; when it is hit the in-flight
//! attempt is dropped, which tears its session down. Detect and commit run
//! outside it so a late timeout cannot cut a commit short.

use scraper::Selector;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use crate::config::{self, Config, ConfigError};
use crate::consent;
use crate::extract::{self, ExtractionError, Extractor};
use crate::model::{
    now_fixed, ConsentOutcome, ExtractionDiagnostics, PersistedState, ScreeningRecord, Stage,
};
use crate::notify::{Notification, Notifier, NotifyError};
use crate::render::{BrowserDriver, RenderEngine, RenderError, RenderedDocument};
use crate::store::{ChangeDetector, ChangeResult, JsonFileStore, StoreError};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("rendering failed after {attempts} attempt(s)")]
    Render {
        attempts: u32,
        #[source]
        source: RenderError,
    },
    #[error("extraction failed after {attempts} attempt(s)")]
    Extraction {
        attempts: u32,
        #[source]
        source: ExtractionError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("cycle exceeded {0:?}")]
    Timeout(Duration),
    #[error("state committed but notification failed")]
    Notify(#[source] NotifyError),
}

impl RunError {
    /// Stage the run had reached when it failed.
    pub fn stage(&self) -> Stage {
        match self {
            RunError::Render { .. } => Stage::Render,
            RunError::Extraction { .. } => Stage::Extract,
            RunError::Store(_) => Stage::Detect,
            RunError::Timeout(_) => Stage::Error,
            RunError::Notify(_) => Stage::Done,
        }
    }

    pub fn screenshot(&self) -> Option<&Path> {
        match self {
            RunError::Extraction {
                source: ExtractionError::Empty { screenshot, .. },
                ..
            } => screenshot.as_deref(),
            _ => None,
        }
    }
}

/// Result of a completed cycle.
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub change: ChangeResult,
    pub record: ScreeningRecord,
    pub diagnostics: ExtractionDiagnostics,
    pub consent: ConsentOutcome,
    pub attempts: u32,
    pub backoff_delays: Vec<Duration>,
    /// The newly written state; `None` when nothing changed.
    pub state: Option<PersistedState>,
}

#[derive(Debug)]
enum AttemptError {
    Render(RenderError),
    Extraction(ExtractionError),
}

impl AttemptError {
    fn stage(&self) -> Stage {
        match self {
            AttemptError::Render(_) => Stage::Render,
            AttemptError::Extraction(_) => Stage::Extract,
        }
    }

    fn into_run_error(self, attempts: u32) -> RunError {
        match self {
            AttemptError::Render(source) => RunError::Render { attempts, source },
            AttemptError::Extraction(source) => RunError::Extraction { attempts, source },
        }
    }
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptError::Render(e) => e.fmt(f),
            AttemptError::Extraction(e) => e.fmt(f),
        }
    }
}

struct Extracted {
    record: ScreeningRecord,
    diagnostics: ExtractionDiagnostics,
    consent: ConsentOutcome,
}

pub struct Pipeline {
    target_url: String,
    detail_link: Option<Selector>,
    engine: RenderEngine,
    consent: config::Consent,
    extractor: Extractor,
    detector: ChangeDetector,
    retry: config::Retry,
    cycle_timeout: Duration,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("target_url", &self.target_url)
            .field("retry", &self.retry)
            .field("cycle_timeout", &self.cycle_timeout)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn from_config(cfg: &Config, driver: Arc<dyn BrowserDriver>) -> Result<Self, ConfigError> {
        let detail_link = match &cfg.target.detail_link_selector {
            Some(raw) => Some(Selector::parse(raw).map_err(|_| {
                ConfigError::Invalid("target.detail_link_selector is not a valid CSS selector")
            })?),
            None => None,
        };
        let screenshot_dir = cfg.app.screenshot_on_failure.then(|| cfg.screenshot_dir());
        Ok(Self {
            target_url: cfg.target.url.trim().to_string(),
            detail_link,
            engine: RenderEngine::new(driver, cfg.browser.clone(), screenshot_dir),
            consent: cfg.consent.clone(),
            extractor: Extractor::new(
                cfg.target.default_location.clone(),
                cfg.browser.element_wait_timeout(),
                cfg.app.screenshot_on_failure,
            ),
            detector: ChangeDetector::new(JsonFileStore::new(cfg.state_path())),
            retry: cfg.retry.clone(),
            cycle_timeout: cfg.cycle_timeout(),
        })
    }

    pub fn detector(&self) -> &ChangeDetector {
        &self.detector
    }

    /// Run one cycle. The cycle ceiling bounds rendering and extraction.
    #[instrument(skip_all, fields(url = %self.target_url))]
    pub async fn run_cycle(&self) -> Result<CycleOutcome, RunError> {
        info!(stage = %Stage::Start, "starting cycle");
        let res = self.cycle().await;
        match &res {
            Ok(outcome) => info!(
                stage = %Stage::Done,
                changed = outcome.change.changed,
                attempts = outcome.attempts,
                missing = ?outcome.diagnostics.missing_fields,
                "cycle finished"
            ),
            Err(err) => error!(
                stage = %Stage::Error,
                failed_at = %err.stage(),
                error = %err,
                cause = ?std::error::Error::source(err).map(|s| s.to_string()),
                screenshot = ?err.screenshot(),
                "cycle failed"
            ),
        }
        res
    }

    /// Run a cycle and, when the screening changed, send the notification.
    /// With no notifier the change is only committed.
    pub async fn run_and_notify(
        &self,
        notifier: Option<&dyn Notifier>,
    ) -> Result<CycleOutcome, RunError> {
        let outcome = self.run_cycle().await?;
        if !outcome.change.changed {
            debug!("no change; nothing to notify");
            return Ok(outcome);
        }
        match notifier {
            Some(notifier) => {
                let notification = Notification::new(outcome.record.clone());
                if let Err(err) = notifier.send(&notification).await {
                    error!(%err, "notification failed");
                    return Err(RunError::Notify(err));
                }
            }
            None => info!(title = %outcome.record.title, "change detected; notifications disabled"),
        }
        Ok(outcome)
    }

    async fn cycle(&self) -> Result<CycleOutcome, RunError> {
        let mut backoff_delays = Vec::new();
        let acquire = self.with_retries(&mut backoff_delays);
        let (extracted, attempts) = match tokio::time::timeout(self.cycle_timeout, acquire).await {
            Ok(res) => res?,
            Err(_) => return Err(RunError::Timeout(self.cycle_timeout)),
        };
        let Extracted {
            record,
            diagnostics,
            consent,
        } = extracted;

        info!(stage = %Stage::Detect, "checking for change");
        let change = self.detector.check(&record).await;
        let state = if change.changed {
            Some(self.detector.commit(&record, now_fixed()).await?)
        } else {
            None
        };

        Ok(CycleOutcome {
            change,
            record,
            diagnostics,
            consent,
            attempts,
            backoff_delays,
            state,
        })
    }

    async fn with_retries(
        &self,
        backoff_delays: &mut Vec<Duration>,
    ) -> Result<(Extracted, u32), RunError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt(attempt).await {
                Ok(extracted) => return Ok((extracted, attempt)),
                Err(err) => {
                    warn!(attempt, max_attempts, stage = %err.stage(), error = %err, "attempt failed");
                    if attempt >= max_attempts {
                        return Err(err.into_run_error(attempt));
                    }
                    let delay = self.retry.backoff(attempt);
                    backoff_delays.push(delay);
                    info!(attempt, ?delay, "retrying after backoff");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// A single attempt on a fresh session. The session is torn down when
    /// `doc` goes out of scope, on success and on every error path.
    #[instrument(skip(self))]
    async fn attempt(&self, attempt: u32) -> Result<Extracted, AttemptError> {
        info!(stage = %Stage::Render, "rendering target");
        let mut doc = self
            .engine
            .render(&self.target_url)
            .await
            .map_err(AttemptError::Render)?;

        info!(stage = %Stage::Consent, "resolving consent");
        let mut consent = consent::resolve(&mut doc, &self.consent).await;
        if let Some(selector) = &self.detail_link {
            if let Some(detail) = self.follow_detail_link(&mut doc, selector).await? {
                consent = detail;
            }
        }

        info!(stage = %Stage::Extract, "extracting fields");
        let (record, diagnostics) = self
            .extractor
            .extract(&mut doc)
            .await
            .map_err(AttemptError::Extraction)?;
        drop(doc);

        Ok(Extracted {
            record,
            diagnostics,
            consent,
        })
    }

    /// Follow the listing's link to the announcement, if there is one.
    /// Returns the consent outcome of the detail page when it showed a dialog.
    async fn follow_detail_link(
        &self,
        doc: &mut RenderedDocument,
        selector: &Selector,
    ) -> Result<Option<ConsentOutcome>, AttemptError> {
        let html = doc
            .snapshot()
            .await
            .map_err(|e| AttemptError::Extraction(ExtractionError::Unreadable(format!("{:#}", e))))?;
        let base = Url::parse(doc.url()).ok();
        let link = match extract::find_link(&html, selector, base.as_ref()) {
            Some(link) if link != doc.url() => link,
            _ => {
                debug!("no detail link; extracting from landing page");
                return Ok(None);
            }
        };
        info!(%link, "following detail link");
        doc.follow(&link).await.map_err(AttemptError::Render)?;
        let outcome = consent::resolve(doc, &self.consent).await;
        Ok(outcome.dialog_present.then_some(outcome))
    }
}
