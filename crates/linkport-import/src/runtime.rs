//! Wires the import pipeline and test scheduler to concrete backends chosen from config.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use linkport_core::{ColumnMapping, ImportJob};
use linkport_storage::{
    CursorStore, FsObjectStore, HttpClientConfig, HttpObjectStore, LinkRepository, MemoryCursorStore,
    MemoryLinkRepository, ObjectStoreRouter, PgLinkRepository, RedisStore, ScheduleStore,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ImportConfig;
use crate::notify::{LogNotifier, Notifier, WebhookNotifier};
use crate::pipeline::{Collaborators, ImportPipeline, PipelineSettings};
use crate::queue::{HttpQueue, LocalQueue, MessageQueue, OutboundMessage};
use crate::registrar::{DomainRegistrar, HttpDomainRegistrar, NoopDomainRegistrar};
use crate::schedule::TestCompletionScheduler;
use crate::validate::StandardLinkValidator;
use crate::{COMPLETE_TESTS_PATH, IMPORT_CSV_PATH};

/// Request to start importing an uploaded CSV into a workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRequest {
    pub user_id: String,
    #[serde(default)]
    pub folder_id: Option<String>,
    pub url: String,
    pub mapping: ColumnMapping,
}

pub struct ImportRuntime {
    pub config: ImportConfig,
    pub pipeline: Arc<ImportPipeline>,
    pub scheduler: Arc<TestCompletionScheduler>,
    pub queue: Arc<dyn MessageQueue>,
}

impl ImportRuntime {
    pub async fn from_env() -> Result<Self> {
        Self::from_config(ImportConfig::from_env()).await
    }

    pub async fn from_config(config: ImportConfig) -> Result<Self> {
        let signing_secret = config.require_signing_secret()?.to_string();
        let timeout = Duration::from_secs(config.http_timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building reqwest client")?;

        let (cursors, schedules): (Arc<dyn CursorStore>, Arc<dyn ScheduleStore>) = match &config.redis_url {
            Some(url) => {
                let store = Arc::new(RedisStore::connect(url).await.context("connecting to redis")?);
                (store.clone() as Arc<dyn CursorStore>, store as Arc<dyn ScheduleStore>)
            }
            None => {
                warn!("REDIS_URL not set; import progress is kept in memory");
                let store = Arc::new(MemoryCursorStore::new());
                (store.clone() as Arc<dyn CursorStore>, store as Arc<dyn ScheduleStore>)
            }
        };

        let links: Arc<dyn LinkRepository> = match &config.database_url {
            Some(url) => Arc::new(PgLinkRepository::connect(url).await.context("connecting to postgres")?),
            None => {
                warn!("DATABASE_URL not set; links are kept in memory");
                Arc::new(MemoryLinkRepository::new())
            }
        };

        let queue: Arc<dyn MessageQueue> = match (&config.queue_url, &config.queue_token) {
            (Some(url), Some(token)) => Arc::new(HttpQueue::new(client.clone(), url, token, &signing_secret)),
            _ => {
                info!("QUEUE_URL not set; delivering queue messages in-process");
                Arc::new(LocalQueue::start(client.clone(), &signing_secret).await?)
            }
        };

        let notifier: Arc<dyn Notifier> = match &config.notify_webhook_url {
            Some(url) => Arc::new(WebhookNotifier::new(client.clone(), url.clone())),
            None => Arc::new(LogNotifier),
        };

        let registrar: Arc<dyn DomainRegistrar> = match (
            &config.domain_provider_url,
            &config.domain_provider_project,
            &config.domain_provider_token,
        ) {
            (Some(url), Some(project), Some(token)) => {
                Arc::new(HttpDomainRegistrar::new(client.clone(), url, project, token))
            }
            _ => Arc::new(NoopDomainRegistrar),
        };

        let objects = Arc::new(ObjectStoreRouter::new(
            HttpObjectStore::new(HttpClientConfig {
                timeout,
                user_agent: Some(format!("linkport/{}", env!("CARGO_PKG_VERSION"))),
                ..HttpClientConfig::default()
            })?,
            FsObjectStore::new(&config.uploads_dir),
        ));

        let platform_domains = config.platform_domains()?;
        let collaborators = Collaborators {
            objects,
            cursors,
            links,
            registrar,
            validator: Arc::new(StandardLinkValidator::new(platform_domains.clone())),
            queue,
            notifier,
        };

        Ok(Self::from_parts(config, collaborators, schedules, platform_domains))
    }

    /// Assembles a runtime around caller-supplied collaborators; used for local runs and tests.
    pub fn from_parts(
        config: ImportConfig,
        collaborators: Collaborators,
        schedules: Arc<dyn ScheduleStore>,
        platform_domains: Vec<String>,
    ) -> Self {
        let queue = collaborators.queue.clone();
        let settings = PipelineSettings {
            max_rows_per_execution: config.max_rows_per_execution,
            continuation_url: config.endpoint(IMPORT_CSV_PATH),
            platform_domains: platform_domains.into_iter().collect::<HashSet<_>>(),
        };
        let scheduler = TestCompletionScheduler::new(queue.clone(), schedules, config.endpoint(COMPLETE_TESTS_PATH));
        Self {
            pipeline: Arc::new(ImportPipeline::new(settings, collaborators)),
            scheduler: Arc::new(scheduler),
            queue,
            config,
        }
    }

    /// Allocates a job id and enqueues the first batch.
    pub async fn start_import(&self, workspace_id: &str, request: ImportRequest) -> Result<ImportJob> {
        let job = ImportJob {
            id: Uuid::new_v4().simple().to_string(),
            workspace_id: workspace_id.to_string(),
            user_id: request.user_id,
            folder_id: request.folder_id,
            url: request.url,
            mapping: request.mapping,
        };
        let message = OutboundMessage::json(&self.pipeline.settings().continuation_url, &job, Duration::ZERO)?;
        let message_id = self
            .queue
            .publish(message)
            .await
            .context("enqueueing first import batch")?;
        info!(workspace_id, job_id = %job.id, %message_id, "csv import started");
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn refuses_to_start_without_a_signing_secret() {
        let mut config = ImportConfig::from_env();
        config.signing_secret = None;
        config.redis_url = None;
        config.database_url = None;

        let err = ImportRuntime::from_config(config).await.err().expect("missing secret must fail");
        assert!(err.to_string().contains("QUEUE_SIGNING_SECRET"));
    }
}
