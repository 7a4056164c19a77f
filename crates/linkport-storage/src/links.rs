//! Link, tag and domain persistence as seen by the import pipeline.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use linkport_core::{same_tag_name, NewLink, Tag};
use sqlx::{PgPool, Row};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::StoreError;

/// The slice of the relational store the import pipeline reads and writes.
///
/// Every create is race tolerant: inserting something that already exists is a no-op.
#[async_trait]
pub trait LinkRepository: Send + Sync {
    async fn tags(&self, workspace_id: &str) -> Result<Vec<Tag>, StoreError>;

    async fn create_tags(&self, workspace_id: &str, names: &[String]) -> Result<(), StoreError>;

    /// Domains owned by the workspace.
    async fn domains(&self, workspace_id: &str) -> Result<Vec<String>, StoreError>;

    async fn create_domain(&self, workspace_id: &str, domain: &str) -> Result<(), StoreError>;

    /// Subset of `short_links` already present in storage.
    async fn existing_short_links(&self, short_links: &[String]) -> Result<HashSet<String>, StoreError>;

    /// Returns how many links were actually inserted.
    async fn insert_links(&self, links: &[NewLink]) -> Result<u64, StoreError>;
}

pub struct PgLinkRepository {
    pool: PgPool,
}

impl PgLinkRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        Ok(Self::new(PgPool::connect(database_url).await?))
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl LinkRepository for PgLinkRepository {
    async fn tags(&self, workspace_id: &str) -> Result<Vec<Tag>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, name
              FROM tags
             WHERE workspace_id = $1
            "#,
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(Tag {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
            });
        }
        Ok(out)
    }

    async fn create_tags(&self, workspace_id: &str, names: &[String]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for name in names {
            sqlx::query(
                r#"
                INSERT INTO tags (id, workspace_id, name)
                VALUES ($1, $2, $3)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(format!("tag_{}", Uuid::new_v4().simple()))
            .bind(workspace_id)
            .bind(name)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn domains(&self, workspace_id: &str) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT slug
              FROM domains
             WHERE workspace_id = $1
            "#,
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(row.try_get("slug")?);
        }
        Ok(out)
    }

    async fn create_domain(&self, workspace_id: &str, domain: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO domains (id, workspace_id, slug)
            VALUES ($1, $2, $3)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(format!("dom_{}", Uuid::new_v4().simple()))
        .bind(workspace_id)
        .bind(domain)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn existing_short_links(&self, short_links: &[String]) -> Result<HashSet<String>, StoreError> {
        if short_links.is_empty() {
            return Ok(HashSet::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT short_link
              FROM links
             WHERE short_link = ANY($1)
            "#,
        )
        .bind(short_links.to_vec())
        .fetch_all(&self.pool)
        .await?;
        let mut out = HashSet::with_capacity(rows.len());
        for row in rows {
            out.insert(row.try_get::<String, _>("short_link")?);
        }
        Ok(out)
    }

    async fn insert_links(&self, links: &[NewLink]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for link in links {
            let result = sqlx::query(
                r#"
                INSERT INTO links (
                    id, workspace_id, domain, key, short_link, url,
                    title, description, folder_id, user_id, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ON CONFLICT (short_link) DO NOTHING
                "#,
            )
            .bind(link.id)
            .bind(&link.workspace_id)
            .bind(&link.domain)
            .bind(&link.key)
            .bind(&link.short_link)
            .bind(&link.url)
            .bind(&link.title)
            .bind(&link.description)
            .bind(&link.folder_id)
            .bind(&link.user_id)
            .bind(link.created_at)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                continue;
            }
            inserted += 1;

            for tag_id in &link.tag_ids {
                sqlx::query(
                    r#"
                    INSERT INTO link_tags (link_id, tag_id)
                    VALUES ($1, $2)
                    ON CONFLICT DO NOTHING
                    "#,
                )
                .bind(link.id)
                .bind(tag_id)
                .execute(&mut *tx)
                .await?;
            }
        }
        tx.commit().await?;
        Ok(inserted)
    }
}

#[derive(Debug, Default)]
struct MemoryLinks {
    tags: HashMap<String, Vec<Tag>>,
    domains: HashMap<String, HashSet<String>>,
    links: HashMap<String, NewLink>,
}

/// Process-local repository for single-node runs and tests.
#[derive(Debug, Default)]
pub struct MemoryLinkRepository {
    state: Mutex<MemoryLinks>,
}

impl MemoryLinkRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_domains(workspace_id: &str, domains: &[&str]) -> Self {
        let repo = Self::new();
        for domain in domains {
            repo.create_domain(workspace_id, domain).await.ok();
        }
        repo
    }

    /// All stored links, ordered by short link.
    pub async fn links(&self) -> Vec<NewLink> {
        let state = self.state.lock().await;
        let mut links = state.links.values().cloned().collect::<Vec<_>>();
        links.sort_by(|a, b| a.short_link.cmp(&b.short_link));
        links
    }
}

#[async_trait]
impl LinkRepository for MemoryLinkRepository {
    async fn tags(&self, workspace_id: &str) -> Result<Vec<Tag>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .tags
            .get(workspace_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_tags(&self, workspace_id: &str, names: &[String]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let tags = state.tags.entry(workspace_id.to_string()).or_default();
        for name in names {
            if tags.iter().any(|t| same_tag_name(&t.name, name)) {
                continue;
            }
            tags.push(Tag {
                id: format!("tag_{}", Uuid::new_v4().simple()),
                name: name.clone(),
            });
        }
        Ok(())
    }

    async fn domains(&self, workspace_id: &str) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().await;
        let mut domains = state
            .domains
            .get(workspace_id)
            .map(|set| set.iter().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        domains.sort();
        Ok(domains)
    }

    async fn create_domain(&self, workspace_id: &str, domain: &str) -> Result<(), StoreError> {
        self.state
            .lock()
            .await
            .domains
            .entry(workspace_id.to_string())
            .or_default()
            .insert(domain.to_ascii_lowercase());
        Ok(())
    }

    async fn existing_short_links(&self, short_links: &[String]) -> Result<HashSet<String>, StoreError> {
        let state = self.state.lock().await;
        Ok(short_links
            .iter()
            .filter(|s| state.links.contains_key(s.as_str()))
            .cloned()
            .collect())
    }

    async fn insert_links(&self, links: &[NewLink]) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut inserted = 0;
        for link in links {
            if state.links.contains_key(&link.short_link) {
                continue;
            }
            state.links.insert(link.short_link.clone(), link.clone());
            inserted += 1;
        }
        Ok(inserted)
    }
}
