//! One invocation of a CSV import job: read a bounded slice of rows from the persisted
//! cursor, materialize them, then either hand off to a continuation message or finish.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use linkport_core::{FailedRow, ImportJob, ImportSummary, LinkIntent, MappedRow, MAX_ROWS_PER_EXECUTION};
use linkport_mapper::{map_row, CsvRowReader};
use linkport_storage::{CursorStore, LinkRepository, ObjectStore};
use tracing::{info, info_span, warn, Instrument};

use crate::materialize::LinkMaterializer;
use crate::notify::Notifier;
use crate::queue::{MessageQueue, OutboundMessage};
use crate::registrar::DomainRegistrar;
use crate::validate::LinkValidator;

/// External systems an import invocation talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub objects: Arc<dyn ObjectStore>,
    pub cursors: Arc<dyn CursorStore>,
    pub links: Arc<dyn LinkRepository>,
    pub registrar: Arc<dyn DomainRegistrar>,
    pub validator: Arc<dyn LinkValidator>,
    pub queue: Arc<dyn MessageQueue>,
    pub notifier: Arc<dyn Notifier>,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub max_rows_per_execution: usize,
    /// Destination of continuation messages.
    pub continuation_url: String,
    pub platform_domains: HashSet<String>,
}

impl PipelineSettings {
    pub fn new(continuation_url: impl Into<String>) -> Self {
        Self {
            max_rows_per_execution: MAX_ROWS_PER_EXECUTION,
            continuation_url: continuation_url.into(),
            platform_domains: HashSet::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Budget used up with rows left; a continuation message was published.
    Continued {
        processed: usize,
        cursor: usize,
        message_id: String,
    },
    /// File exhausted; summary sent and job state cleared.
    Finished {
        processed: usize,
        cursor: usize,
        summary: ImportSummary,
    },
}

struct RowBatch {
    processed: usize,
    cursor: usize,
    reached_end: bool,
    intents: Vec<LinkIntent>,
    failures: Vec<FailedRow>,
}

pub struct ImportPipeline {
    settings: PipelineSettings,
    collaborators: Collaborators,
}

impl ImportPipeline {
    pub fn new(settings: PipelineSettings, collaborators: Collaborators) -> Self {
        Self {
            settings,
            collaborators,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Runs one bounded invocation of `job`.
    ///
    /// Fetch and parse errors abort the invocation; per-row problems are recorded and
    /// reported in the final summary instead.
    pub async fn process(&self, job: &ImportJob) -> Result<BatchOutcome> {
        let span = info_span!("csv_import", workspace_id = %job.workspace_id, job_id = %job.id);
        self.process_inner(job).instrument(span).await
    }

    async fn process_inner(&self, job: &ImportJob) -> Result<BatchOutcome> {
        let c = &self.collaborators;
        let namespace = job.namespace();

        let start = c
            .cursors
            .cursor(&namespace)
            .await
            .context("reading import cursor")?;
        let bytes = c
            .objects
            .fetch(&job.url)
            .await
            .with_context(|| format!("fetching import file {}", job.url))?;

        let batch = self.read_rows(job, &namespace, start, &bytes).await?;
        info!(
            start,
            processed = batch.processed,
            cursor = batch.cursor,
            reached_end = batch.reached_end,
            "read import rows"
        );

        c.cursors
            .append_failed(&namespace, &batch.failures)
            .await
            .context("recording unmappable rows")?;
        LinkMaterializer::new(
            c.links.as_ref(),
            c.registrar.as_ref(),
            c.validator.as_ref(),
            c.cursors.as_ref(),
            &self.settings.platform_domains,
        )
        .materialize(job, batch.intents)
        .await?;

        if batch.processed == self.settings.max_rows_per_execution && !batch.reached_end {
            let message = OutboundMessage::json(&self.settings.continuation_url, job, Duration::ZERO)?;
            let message_id = c
                .queue
                .publish(message)
                .await
                .context("enqueueing import continuation")?;
            info!(cursor = batch.cursor, %message_id, "scheduled import continuation");
            return Ok(BatchOutcome::Continued {
                processed: batch.processed,
                cursor: batch.cursor,
                message_id,
            });
        }

        let summary = self.finalize(job, &namespace).await?;
        Ok(BatchOutcome::Finished {
            processed: batch.processed,
            cursor: batch.cursor,
            summary,
        })
    }

    /// Maps up to the row budget starting at `start`, persisting the cursor after every row.
    async fn read_rows(&self, job: &ImportJob, namespace: &str, start: usize, bytes: &[u8]) -> Result<RowBatch> {
        let mut reader = CsvRowReader::new(bytes).context("reading csv headers")?;
        let window = reader
            .window(start, self.settings.max_rows_per_execution)
            .context("skipping already processed rows")?;

        let mut batch = RowBatch {
            processed: 0,
            cursor: start,
            reached_end: false,
            intents: Vec::new(),
            failures: Vec::new(),
        };

        for next in window {
            let (index, row) = next.context("parsing csv row")?;
            match map_row(&row, &job.mapping) {
                MappedRow::Success(intent) => batch.intents.push(intent),
                MappedRow::Failure { error, domain, key } => batch.failures.push(FailedRow {
                    domain: domain.unwrap_or_default(),
                    key: key.unwrap_or_default(),
                    error,
                }),
            }
            batch.processed += 1;
            batch.cursor = index + 1;
            self.collaborators
                .cursors
                .advance_cursor(namespace, batch.cursor)
                .await
                .context("advancing import cursor")?;
        }

        batch.reached_end = reader.is_exhausted();
        Ok(batch)
    }

    /// Sends the summary, then clears job state and the source file on a best-effort basis.
    async fn finalize(&self, job: &ImportJob, namespace: &str) -> Result<ImportSummary> {
        let c = &self.collaborators;
        // Replayed ranges re-append the same failures.
        let mut error_links = c.cursors.failed(namespace).await.context("reading failed rows")?;
        let mut seen = HashSet::new();
        error_links.retain(|row| seen.insert(row.clone()));

        let summary = ImportSummary {
            workspace_id: job.workspace_id.clone(),
            user_id: job.user_id.clone(),
            count: c.cursors.created(namespace).await.context("reading created count")?,
            domains: c.cursors.domains(namespace).await.context("reading touched domains")?,
            error_links,
        };

        c.notifier
            .import_completed(&summary)
            .await
            .context("sending import summary")?;

        if let Err(err) = c.cursors.clear(namespace).await {
            warn!(error = %err, "failed to clear import state");
        }
        if let Err(err) = c.objects.delete(&job.url).await {
            warn!(url = %job.url, error = %err, "failed to delete import file");
        }

        info!(
            count = summary.count,
            failed = summary.error_links.len(),
            domains = summary.domains.len(),
            "csv import finished"
        );
        Ok(summary)
    }
}
