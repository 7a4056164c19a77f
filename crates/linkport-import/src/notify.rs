//! Completion notifications for finished imports.

use askama::Template;
use async_trait::async_trait;
use linkport_core::{FailedRow, ImportSummary};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("rendering summary: {0}")]
    Render(#[from] askama::Error),
    #[error("notification request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("notification endpoint responded {0}")]
    Status(u16),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn import_completed(&self, summary: &ImportSummary) -> Result<(), NotifyError>;
}

#[derive(Template)]
#[template(
    ext = "txt",
    source = "Your CSV import has finished.

Links created: {{ count }}
{% if !domains.is_empty() %}
Domains used:
{% for domain in domains %}  - {{ domain }}
{% endfor %}{% endif %}{% if !error_links.is_empty() %}
{{ error_links.len() }} row(s) could not be imported:
{% for row in error_links %}  - {{ row.domain }}/{{ row.key }}: {{ row.error }}
{% endfor %}{% endif %}"
)]
struct SummaryText<'a> {
    count: u64,
    domains: &'a [String],
    error_links: &'a [FailedRow],
}

/// Plain-text body sent with every completion notification.
pub fn render_summary_text(summary: &ImportSummary) -> Result<String, NotifyError> {
    Ok(SummaryText {
        count: summary.count,
        domains: &summary.domains,
        error_links: &summary.error_links,
    }
    .render()?)
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    #[serde(flatten)]
    summary: &'a ImportSummary,
    text: String,
}

/// POSTs the summary as JSON to an email/notification service.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn import_completed(&self, summary: &ImportSummary) -> Result<(), NotifyError> {
        let payload = WebhookPayload {
            summary,
            text: render_summary_text(summary)?,
        };
        let resp = self.client.post(&self.url).json(&payload).send().await?;
        if !resp.status().is_success() {
            return Err(NotifyError::Status(resp.status().as_u16()));
        }
        Ok(())
    }
}

/// Writes the summary to the log; used when no notification endpoint is configured.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn import_completed(&self, summary: &ImportSummary) -> Result<(), NotifyError> {
        let text = render_summary_text(summary)?;
        info!(
            workspace_id = %summary.workspace_id,
            user_id = %summary.user_id,
            count = summary.count,
            failed = summary.error_links.len(),
            "csv import finished\n{text}"
        );
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<ImportSummary>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<ImportSummary> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn import_completed(&self, summary: &ImportSummary) -> Result<(), NotifyError> {
        self.sent.lock().await.push(summary.clone());
        Ok(())
    }
}
