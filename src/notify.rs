//! Job status notifications.
//!
//! A notification goes out when a job reaches CREATED, TERMINATED, ERROR or
//! CANCELLED for the first time. Sinks are tried in order and their failures
//! are logged only.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::NotifyConfig;
use crate::state_machine::{Job, JobStatus};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("webhook answered with status {0}")]
    Status(u16),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub slug: String,
    pub title: String,
    pub status: JobStatus,
    /// Numeric status code of the legacy API.
    pub status_code: i32,
    pub subject: String,
    pub message: String,
    /// User address; `None` for operator notifications.
    pub recipient: Option<String>,
    pub admin: bool,
    pub timestamp: DateTime<Utc>,
}

fn subject_for(status: JobStatus) -> Option<&'static str> {
    match status {
        JobStatus::Created => Some("Job submitted"),
        JobStatus::Terminated => Some("Job completed"),
        JobStatus::Error => Some("Job error"),
        JobStatus::Cancelled => Some("Job cancelled"),
        _ => None,
    }
}

impl Notification {
    fn for_job(job: &Job, subject: &str, recipient: Option<String>, admin: bool) -> Self {
        Self {
            slug: job.slug.clone(),
            title: job.display_name().to_string(),
            status: job.status,
            status_code: job.status.code(),
            subject: format!("[WAVES] {subject}: {}", job.display_name()),
            message: job
                .message
                .clone()
                .unwrap_or_else(|| job.status.label().to_string()),
            recipient,
            admin,
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Emits notifications as structured log events.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, n: &Notification) -> Result<(), NotifyError> {
        info!(
            slug = %n.slug,
            status = %n.status,
            recipient = n.recipient.as_deref().unwrap_or("-"),
            admin = n.admin,
            "{}: {}",
            n.subject,
            n.message
        );
        Ok(())
    }
}

/// Posts each notification as JSON to a fixed URL.
#[derive(Debug)]
pub struct WebhookNotifier {
    url: String,
    client: Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, NotifyError> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, n: &Notification) -> Result<(), NotifyError> {
        let response = self.client.post(&self.url).json(n).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status(status.as_u16()));
        }
        Ok(())
    }
}

/// Decides which notifications a status change deserves and fans them out.
pub struct Notifications {
    enabled: bool,
    sinks: Vec<Box<dyn Notifier>>,
}

impl Notifications {
    pub fn new(enabled: bool, sinks: Vec<Box<dyn Notifier>>) -> Self {
        Self { enabled, sinks }
    }

    /// Log sink always, webhook sink when a URL is configured.
    pub fn from_config(config: &NotifyConfig) -> Result<Self, NotifyError> {
        let mut sinks: Vec<Box<dyn Notifier>> = vec![Box::new(LogNotifier)];
        if let Some(url) = config.webhook_url.as_deref().filter(|u| !u.trim().is_empty()) {
            sinks.push(Box::new(WebhookNotifier::new(url)?));
        }
        Ok(Self::new(config.enabled, sinks))
    }

    /// Notifies about `job`'s current status unless that was already done.
    ///
    /// Updates `status_notified` and returns what was sent.
    pub async fn job_changed(&self, job: &mut Job) -> Vec<Notification> {
        if job.status_notified == Some(job.status) {
            return Vec::new();
        }
        let Some(subject) = subject_for(job.status) else {
            return Vec::new();
        };

        let mut outgoing = Vec::new();
        if job.status == JobStatus::Error {
            outgoing.push(Notification::for_job(job, subject, None, true));
        }
        if self.enabled {
            if let Some(to) = job.email_to.clone() {
                outgoing.push(Notification::for_job(job, subject, Some(to), false));
            }
        }

        for n in &outgoing {
            for sink in &self.sinks {
                if let Err(e) = sink.send(n).await {
                    warn!(slug = %n.slug, error = %e, "notification failed");
                }
            }
        }
        job.status_notified = Some(job.status);
        outgoing
    }
}
