//! Turns a batch of mapped rows into persisted links.

use std::collections::{BTreeSet, HashSet};

use anyhow::{Context, Result};
use futures::future::join_all;
use linkport_core::{same_tag_name, FailedRow, ImportJob, LinkIntent, NewLink, Tag, ROOT_KEY};
use linkport_storage::{CursorStore, LinkRepository};
use tracing::{debug, info, warn};

use crate::registrar::DomainRegistrar;
use crate::validate::{LinkValidator, ValidationContext};

const DUPLICATE_IN_FILE: &str = "Duplicate key: this short link already exists.";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MaterializeOutcome {
    pub created: u64,
    /// Candidates dropped because their short link was already stored.
    pub skipped_existing: usize,
    pub failed: Vec<FailedRow>,
    pub domains: Vec<String>,
    /// Newly seen domains whose registration side effects all succeeded.
    pub registered_domains: Vec<String>,
}

pub struct LinkMaterializer<'a> {
    links: &'a dyn LinkRepository,
    registrar: &'a dyn DomainRegistrar,
    validator: &'a dyn LinkValidator,
    cursors: &'a dyn CursorStore,
    platform_domains: &'a HashSet<String>,
}

impl<'a> LinkMaterializer<'a> {
    pub fn new(
        links: &'a dyn LinkRepository,
        registrar: &'a dyn DomainRegistrar,
        validator: &'a dyn LinkValidator,
        cursors: &'a dyn CursorStore,
        platform_domains: &'a HashSet<String>,
    ) -> Self {
        Self {
            links,
            registrar,
            validator,
            cursors,
            platform_domains,
        }
    }

    /// Safe to repeat over overlapping row ranges: stored short links are never recreated.
    pub async fn materialize(&self, job: &ImportJob, intents: Vec<LinkIntent>) -> Result<MaterializeOutcome> {
        if intents.is_empty() {
            return Ok(MaterializeOutcome::default());
        }
        let namespace = job.namespace();

        let tags = self.resolve_tags(&job.workspace_id, &intents).await?;

        let domains = intents
            .iter()
            .map(|i| i.domain.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>();
        let explicit_roots = intents
            .iter()
            .filter(|i| i.key == ROOT_KEY)
            .map(|i| i.domain.as_str())
            .collect::<HashSet<_>>();
        let registered_domains = self.resolve_domains(job, &domains, &explicit_roots).await?;
        self.cursors
            .add_domains(&namespace, &domains)
            .await
            .context("recording touched domains")?;

        let candidates = intents.iter().map(LinkIntent::short_link).collect::<Vec<_>>();
        let existing = self
            .links
            .existing_short_links(&candidates)
            .await
            .context("checking for existing short links")?;

        let ctx = ValidationContext {
            workspace_id: &job.workspace_id,
            user_id: &job.user_id,
            folder_id: job.folder_id.as_deref(),
            tags: &tags,
        };

        let mut seen = HashSet::new();
        let mut skipped_existing = 0;
        let mut failed = Vec::new();
        let mut valid = Vec::new();
        for (intent, short_link) in intents.iter().zip(candidates) {
            if existing.contains(&short_link) {
                skipped_existing += 1;
                continue;
            }
            if !seen.insert(short_link) {
                failed.push(failed_row(intent, DUPLICATE_IN_FILE));
                continue;
            }
            match self.validator.validate(intent, &ctx).await {
                Ok(link) => valid.push(link),
                Err(error) => failed.push(failed_row(intent, &error)),
            }
        }

        let created = if valid.is_empty() {
            0
        } else {
            self.links
                .insert_links(&valid)
                .await
                .context("bulk inserting links")?
        };
        if created > 0 {
            self.cursors
                .add_created(&namespace, created)
                .await
                .context("incrementing created count")?;
        }
        self.cursors
            .append_failed(&namespace, &failed)
            .await
            .context("recording failed rows")?;

        info!(
            created,
            skipped_existing,
            failed = failed.len(),
            "materialized import batch"
        );
        Ok(MaterializeOutcome {
            created,
            skipped_existing,
            failed,
            domains,
            registered_domains,
        })
    }

    async fn resolve_tags(&self, workspace_id: &str, intents: &[LinkIntent]) -> Result<Vec<Tag>> {
        let mut wanted: Vec<&String> = Vec::new();
        for name in intents.iter().flat_map(|i| &i.tags) {
            if !wanted.iter().any(|w| same_tag_name(w, name)) {
                wanted.push(name);
            }
        }
        if wanted.is_empty() {
            return Ok(Vec::new());
        }

        let existing = self
            .links
            .tags(workspace_id)
            .await
            .context("loading workspace tags")?;
        let missing = wanted
            .into_iter()
            .filter(|name| !existing.iter().any(|t| same_tag_name(&t.name, name)))
            .cloned()
            .collect::<Vec<_>>();
        if missing.is_empty() {
            return Ok(existing);
        }

        debug!(count = missing.len(), "creating missing tags");
        self.links
            .create_tags(workspace_id, &missing)
            .await
            .context("creating missing tags")?;
        self.links
            .tags(workspace_id)
            .await
            .context("reloading workspace tags")
    }

    /// Registers domains the workspace does not own yet. Individual failures are logged only.
    ///
    /// Domains in `explicit_roots` get their root link from the batch itself, not a placeholder.
    async fn resolve_domains(
        &self,
        job: &ImportJob,
        domains: &[String],
        explicit_roots: &HashSet<&str>,
    ) -> Result<Vec<String>> {
        let owned = self
            .links
            .domains(&job.workspace_id)
            .await
            .context("loading workspace domains")?
            .into_iter()
            .collect::<HashSet<_>>();
        let missing = domains
            .iter()
            .filter(|d| !owned.contains(*d) && !self.platform_domains.contains(*d))
            .collect::<Vec<_>>();

        let workspace_id = job.workspace_id.as_str();
        let user_id = job.user_id.as_str();
        let settled = join_all(missing.into_iter().map(|domain| async move {
            let placeholder = (!explicit_roots.contains(domain.as_str()))
                .then(|| NewLink::root_placeholder(workspace_id, user_id, domain));
            let (owned, dns, root) = futures::join!(
                self.links.create_domain(workspace_id, domain),
                self.registrar.register(domain),
                async {
                    match &placeholder {
                        Some(link) => self.links.insert_links(std::slice::from_ref(link)).await,
                        None => Ok(0),
                    }
                },
            );
            let mut ok = true;
            if let Err(err) = owned {
                warn!(domain = %domain, error = %err, "failed to add domain to workspace");
                ok = false;
            }
            if let Err(err) = dns {
                warn!(domain = %domain, error = %err, "failed to register domain with provider");
                ok = false;
            }
            if let Err(err) = root {
                warn!(domain = %domain, error = %err, "failed to create root link for domain");
                ok = false;
            }
            ok.then(|| domain.clone())
        }))
        .await;

        Ok(settled.into_iter().flatten().collect())
    }
}

fn failed_row(intent: &LinkIntent, error: &str) -> FailedRow {
    FailedRow {
        domain: intent.domain.clone(),
        key: intent.key.clone(),
        error: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registrar::{NoopDomainRegistrar, RegistrarError};
    use crate::validate::StandardLinkValidator;
    use async_trait::async_trait;
    use linkport_core::ColumnMapping;
    use linkport_storage::{MemoryCursorStore, MemoryLinkRepository};

    struct DownRegistrar;

    #[async_trait]
    impl DomainRegistrar for DownRegistrar {
        async fn register(&self, domain: &str) -> Result<(), RegistrarError> {
            Err(RegistrarError::Rejected {
                domain: domain.to_string(),
                status: 503,
            })
        }
    }

    fn job() -> ImportJob {
        ImportJob {
            id: "job_1".into(),
            workspace_id: "ws_1".into(),
            user_id: "u1".into(),
            folder_id: None,
            url: "imports/file.csv".into(),
            mapping: ColumnMapping::new("link", "url"),
        }
    }

    fn intent(domain: &str, key: &str, tags: &[&str]) -> LinkIntent {
        LinkIntent {
            domain: domain.into(),
            key: key.into(),
            url: "https://example.com/".into(),
            title: None,
            description: None,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            created_at: None,
        }
    }

    #[tokio::test]
    async fn creates_links_tags_and_placeholder_root() {
        let links = MemoryLinkRepository::new();
        let cursors = MemoryCursorStore::new();
        let validator = StandardLinkValidator::new(Vec::new());
        let platform = HashSet::new();
        let materializer = LinkMaterializer::new(&links, &NoopDomainRegistrar, &validator, &cursors, &platform);

        let outcome = materializer
            .materialize(
                &job(),
                vec![intent("acme.link", "a", &["Promo"]), intent("acme.link", "b", &["promo", "new"])],
            )
            .await
            .unwrap();

        assert_eq!(outcome.created, 2);
        assert_eq!(outcome.registered_domains, vec!["acme.link".to_string()]);
        assert_eq!(links.tags("ws_1").await.unwrap().len(), 2);
        let stored = links.links().await.into_iter().map(|l| l.short_link).collect::<Vec<_>>();
        assert_eq!(
            stored,
            vec!["https://acme.link", "https://acme.link/a", "https://acme.link/b"]
        );
        let ns = job().namespace();
        assert_eq!(cursors.created(&ns).await.unwrap(), 2);
        assert_eq!(cursors.domains(&ns).await.unwrap(), vec!["acme.link".to_string()]);
    }

    #[tokio::test]
    async fn root_row_on_a_new_domain_is_created_with_its_destination() {
        let links = MemoryLinkRepository::new();
        let cursors = MemoryCursorStore::new();
        let validator = StandardLinkValidator::new(Vec::new());
        let platform = HashSet::new();
        let materializer = LinkMaterializer::new(&links, &NoopDomainRegistrar, &validator, &cursors, &platform);
        let mut root = intent("fresh.link", ROOT_KEY, &[]);
        root.url = "https://landing.example.com/".into();

        let outcome = materializer.materialize(&job(), vec![root]).await.unwrap();

        assert_eq!(outcome.created, 1);
        assert_eq!(outcome.skipped_existing, 0);
        assert!(outcome.failed.is_empty());
        let stored = links
            .links()
            .await
            .into_iter()
            .map(|l| (l.short_link, l.url))
            .collect::<Vec<_>>();
        assert_eq!(
            stored,
            vec![("https://fresh.link".to_string(), "https://landing.example.com/".to_string())]
        );
        assert_eq!(links.domains("ws_1").await.unwrap(), vec!["fresh.link".to_string()]);
    }

    #[tokio::test]
    async fn tags_differing_only_in_non_ascii_case_resolve_to_one_tag() {
        let links = MemoryLinkRepository::with_domains("ws_1", &["acme.link"]).await;
        links.create_tags("ws_1", &["Été".to_string()]).await.unwrap();
        let cursors = MemoryCursorStore::new();
        let validator = StandardLinkValidator::new(Vec::new());
        let platform = HashSet::new();
        let materializer = LinkMaterializer::new(&links, &NoopDomainRegistrar, &validator, &cursors, &platform);

        let outcome = materializer
            .materialize(
                &job(),
                vec![intent("acme.link", "a", &["été"]), intent("acme.link", "b", &["ÉTÉ"])],
            )
            .await
            .unwrap();

        assert_eq!(outcome.created, 2);
        assert!(outcome.failed.is_empty());
        let tags = links.tags("ws_1").await.unwrap();
        assert_eq!(tags.len(), 1);
        assert!(links.links().await.iter().all(|l| l.tag_ids == vec![tags[0].id.clone()]));
    }

    #[tokio::test]
    async fn rerunning_the_same_batch_creates_nothing_new() {
        let links = MemoryLinkRepository::with_domains("ws_1", &["acme.link"]).await;
        let cursors = MemoryCursorStore::new();
        let validator = StandardLinkValidator::new(Vec::new());
        let platform = HashSet::new();
        let materializer = LinkMaterializer::new(&links, &NoopDomainRegistrar, &validator, &cursors, &platform);
        let batch = || vec![intent("acme.link", "a", &[]), intent("acme.link", "b", &[])];

        let first = materializer.materialize(&job(), batch()).await.unwrap();
        let second = materializer.materialize(&job(), batch()).await.unwrap();

        assert_eq!(first.created, 2);
        assert_eq!(second.created, 0);
        assert_eq!(second.skipped_existing, 2);
        assert!(second.failed.is_empty());
        assert_eq!(links.links().await.len(), 2);
    }

    #[tokio::test]
    async fn provider_outage_does_not_block_rows_and_domain_is_still_recorded() {
        let links = MemoryLinkRepository::new();
        let cursors = MemoryCursorStore::new();
        let validator = StandardLinkValidator::new(Vec::new());
        let platform = HashSet::new();
        let materializer = LinkMaterializer::new(&links, &DownRegistrar, &validator, &cursors, &platform);

        let outcome = materializer
            .materialize(&job(), vec![intent("fresh.link", "x", &[])])
            .await
            .unwrap();

        assert_eq!(outcome.created, 1);
        assert!(outcome.registered_domains.is_empty());
        assert_eq!(outcome.domains, vec!["fresh.link".to_string()]);
        assert_eq!(links.domains("ws_1").await.unwrap(), vec!["fresh.link".to_string()]);
    }

    #[tokio::test]
    async fn duplicates_within_a_batch_and_platform_domains() {
        let links = MemoryLinkRepository::new();
        let cursors = MemoryCursorStore::new();
        let validator = StandardLinkValidator::new(vec!["dub.sh".to_string()]);
        let platform = HashSet::from(["dub.sh".to_string()]);
        let materializer = LinkMaterializer::new(&links, &NoopDomainRegistrar, &validator, &cursors, &platform);

        let outcome = materializer
            .materialize(&job(), vec![intent("dub.sh", "same", &[]), intent("dub.sh", "same", &[])])
            .await
            .unwrap();

        assert_eq!(outcome.created, 1);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].error, DUPLICATE_IN_FILE);
        assert!(outcome.registered_domains.is_empty());
        assert!(links.domains("ws_1").await.unwrap().is_empty());
        assert_eq!(cursors.failed(&job().namespace()).await.unwrap().len(), 1);
    }
}
