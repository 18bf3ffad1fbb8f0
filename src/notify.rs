//! Operator notifications.
//!
//! The scheduler collects a [`Journal`] of timestamped lines while a
//! rollout or audit runs and hands the whole thing to a [`Notifier`]
//! once it finishes.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use log::{info, warn};
use serde::Serialize;

use crate::error::NotifyError;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, recipients: &[String], subject: &str, body: &str)
        -> Result<(), NotifyError>;
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(
        &self,
        recipients: &[String],
        subject: &str,
        body: &str,
    ) -> Result<(), NotifyError> {
        info!("Notification to {:?}: {}\n{}", recipients, subject, body);
        Ok(())
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    recipients: &'a [String],
    subject: &'a str,
    body: &'a str,
}

/// POSTs notifications as JSON to a relay that does the actual delivery.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(
        &self,
        recipients: &[String],
        subject: &str,
        body: &str,
    ) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(&WebhookPayload {
                recipients,
                subject,
                body,
            })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(NotifyError::Rejected(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Step log accumulated over one rollout or audit.
#[derive(Debug, Default, Clone)]
pub struct Journal {
    lines: Vec<String>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `msg` prefixed with the local time.
    pub fn record(&mut self, msg: impl AsRef<str>) {
        let stamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        self.lines.push(format!("{stamp}: {}", msg.as_ref()));
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn body(&self) -> String {
        self.lines.join("\n")
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }
}

/// Sends `journal` to `recipients` and clears it.  Delivery problems are
/// logged; notifications never fail the caller.
pub async fn deliver(
    notifier: &dyn Notifier,
    recipients: &[String],
    subject: &str,
    journal: &mut Journal,
) {
    if recipients.is_empty() {
        warn!("No notification recipients configured, not sending {:?}", subject);
    } else if let Err(e) = notifier.send(recipients, subject, &journal.body()).await {
        warn!("Failed to send notification {:?}: {}", subject, e);
    } else {
        info!("Sent notification {:?}", subject);
    }
    journal.clear();
}
