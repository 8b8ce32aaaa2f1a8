use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::model::{Field, ScreeningRecord};

const UNKNOWN: &str = "unknown";
const EMBED_COLOR: u32 = 0x00FF00;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("invalid webhook URL: {0}")]
    InvalidUrl(String),
    #[error("failed to reach webhook")]
    Transport(#[from] reqwest::Error),
    #[error("webhook rejected notification: HTTP {status}: {body}")]
    Rejected { status: StatusCode, body: String },
}

/// A changed screening, ready to announce.
#[derive(Debug, Clone)]
pub struct Notification {
    pub record: ScreeningRecord,
    pub missing_fields: BTreeSet<Field>,
}

impl Notification {
    pub fn new(record: ScreeningRecord) -> Self {
        let missing_fields = record.missing_fields();
        Self {
            record,
            missing_fields,
        }
    }

    fn value(&self, field: Field) -> &str {
        match self.record.get(field).trim() {
            "" => UNKNOWN,
            v => v,
        }
    }

    pub fn title(&self) -> String {
        format!("New Screening: {}", self.value(Field::Title))
    }

    pub fn description(&self) -> String {
        let details = match self.record.source_url.trim() {
            "" => UNKNOWN,
            v => v,
        };
        format!(
            "**When:** {}\n**Where:** {}\n**Details:** {}\n**Book here:** {}",
            self.value(Field::ScreeningDatetime),
            self.value(Field::Location),
            details,
            self.value(Field::BookingUrl),
        )
    }

    /// "Missing: title, location" or `None` for a complete record.
    pub fn footer(&self) -> Option<String> {
        if self.missing_fields.is_empty() {
            return None;
        }
        let names: Vec<&str> = self.missing_fields.iter().map(|f| f.as_str()).collect();
        Some(format!("Missing: {}", names.join(", ")))
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Posts embeds to a Discord webhook.
#[derive(Clone)]
pub struct DiscordWebhook {
    http: Client,
    url: Url,
}

impl fmt::Debug for DiscordWebhook {
    // The webhook path is a credential.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscordWebhook")
            .field("host", &self.url.host_str())
            .finish_non_exhaustive()
    }
}

impl DiscordWebhook {
    pub fn new(url: &str) -> Result<Self, NotifyError> {
        let url = Url::parse(url.trim()).map_err(|e| NotifyError::InvalidUrl(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(NotifyError::InvalidUrl(format!("unsupported scheme {}", url.scheme())));
        }
        let http = Client::builder()
            .user_agent("screening-watchbot/0.1")
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { http, url })
    }

    pub fn build_payload(notification: &Notification) -> Value {
        let mut embed = json!({
            "title": notification.title(),
            "description": notification.description(),
            "color": EMBED_COLOR,
        });
        if let Some(text) = notification.footer() {
            embed["footer"] = json!({ "text": text });
        }
        json!({ "embeds": [embed] })
    }

    pub fn build_request(&self, notification: &Notification) -> Result<reqwest::Request, NotifyError> {
        Ok(self
            .http
            .post(self.url.clone())
            .json(&Self::build_payload(notification))
            .build()?)
    }
}

#[async_trait]
impl Notifier for DiscordWebhook {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let request = self.build_request(notification)?;
        let res = self.http.execute(request).await?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(%status, %body, "discord webhook rejected notification");
            return Err(NotifyError::Rejected { status, body });
        }
        info!(title = %notification.record.title, "notification sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    fn record() -> ScreeningRecord {
        let at = DateTime::parse_from_rfc3339("2026-02-01T10:00:00+01:00").unwrap();
        let mut r = ScreeningRecord::empty("https://www.boras.se/film.html", at);
        r.set(Field::Title, "Dirty Harry".into());
        r.set(Field::ScreeningDatetime, "2026-02-26 19:00".into());
        r.set(Field::Location, "Borås Bio Röda Kvarn".into());
        r.set(Field::BookingUrl, "https://bio.se/x".into());
        r
    }

    #[test]
    fn complete_record_embed() {
        let payload = DiscordWebhook::build_payload(&Notification::new(record()));
        let embed = &payload["embeds"][0];
        assert_eq!(embed["title"], "New Screening: Dirty Harry");
        assert_eq!(
            embed["description"],
            "**When:** 2026-02-26 19:00\n**Where:** Borås Bio Röda Kvarn\n**Details:** https://www.boras.se/film.html\n**Book here:** https://bio.se/x"
        );
        assert_eq!(embed["color"], 0x00FF00);
        assert!(embed.get("footer").is_none());
    }

    #[test]
    fn partial_record_marks_unknowns() {
        let mut r = record();
        r.set(Field::Location, String::new());
        r.set(Field::BookingUrl, "  ".into());
        let n = Notification::new(r);
        let payload = DiscordWebhook::build_payload(&n);
        let embed = &payload["embeds"][0];
        let description = embed["description"].as_str().unwrap();
        assert!(description.contains("**Where:** unknown"));
        assert!(description.contains("**Book here:** unknown"));
        assert_eq!(embed["footer"]["text"], "Missing: location, booking_url");
    }

    #[test]
    fn request_posts_json_to_webhook() {
        let hook = DiscordWebhook::new("https://discord.com/api/webhooks/1/secret-token").unwrap();
        let req = hook.build_request(&Notification::new(record())).unwrap();
        assert_eq!(req.method(), reqwest::Method::POST);
        assert_eq!(req.url().path(), "/api/webhooks/1/secret-token");
        assert_eq!(
            req.headers().get(reqwest::header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        let body: Value = serde_json::from_slice(req.body().unwrap().as_bytes().unwrap()).unwrap();
        assert_eq!(body["embeds"][0]["title"], "New Screening: Dirty Harry");
    }

    #[test]
    fn debug_does_not_leak_token() {
        let hook = DiscordWebhook::new("https://discord.com/api/webhooks/1/secret-token").unwrap();
        let dbg = format!("{:?}", hook);
        assert!(dbg.contains("discord.com"));
        assert!(!dbg.contains("secret-token"));
    }

    #[test]
    fn rejects_non_http_urls() {
        assert!(matches!(
            DiscordWebhook::new("ftp://example.com/hook"),
            Err(NotifyError::InvalidUrl(_))
        ));
        assert!(matches!(DiscordWebhook::new("not a url"), Err(NotifyError::InvalidUrl(_))));
    }
}
