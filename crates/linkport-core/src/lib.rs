//! Core domain model for CSV link imports and A/B test scheduling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "linkport-core";

/// Upper bound on rows a single import invocation consumes before handing off.
pub const MAX_ROWS_PER_EXECUTION: usize = 25;

/// Key used for a domain's root link (`https://domain` with no path).
pub const ROOT_KEY: &str = "_root";

/// Logical fields a CSV column can be assigned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LinkField {
    Link,
    Url,
    Title,
    Description,
    Tags,
    CreatedAt,
}

impl LinkField {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Link => "link",
            Self::Url => "url",
            Self::Title => "title",
            Self::Description => "description",
            Self::Tags => "tags",
            Self::CreatedAt => "createdAt",
        }
    }
}

/// Assignment of logical link fields to source column names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnMapping {
    pub link: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl ColumnMapping {
    pub fn new(link: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            link: link.into(),
            url: url.into(),
            title: None,
            description: None,
            tags: None,
            created_at: None,
        }
    }

    pub fn column_for(&self, field: LinkField) -> Option<&str> {
        match field {
            LinkField::Link => Some(self.link.as_str()),
            LinkField::Url => Some(self.url.as_str()),
            LinkField::Title => self.title.as_deref(),
            LinkField::Description => self.description.as_deref(),
            LinkField::Tags => self.tags.as_deref(),
            LinkField::CreatedAt => self.created_at.as_deref(),
        }
    }
}

/// Queue payload identifying one CSV import job. Immutable for the life of the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportJob {
    pub id: String,
    pub workspace_id: String,
    pub user_id: String,
    #[serde(default)]
    pub folder_id: Option<String>,
    pub url: String,
    pub mapping: ColumnMapping,
}

impl ImportJob {
    /// Cache-store namespace holding this job's progress keys.
    pub fn namespace(&self) -> String {
        format!("import:csv:{}:{}", self.workspace_id, self.id)
    }
}

/// A row that passed mapping and is ready for tag/domain resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkIntent {
    pub domain: String,
    pub key: String,
    pub url: String,
    pub title: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl LinkIntent {
    pub fn short_link(&self) -> String {
        short_link(&self.domain, &self.key)
    }
}

/// Result of mapping one raw CSV row. Lives for a single invocation only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappedRow {
    Success(LinkIntent),
    Failure {
        error: String,
        /// Whatever could be read from the link column, for reporting.
        domain: Option<String>,
        key: Option<String>,
    },
}

impl MappedRow {
    pub fn failure(error: impl Into<String>) -> Self {
        Self::Failure {
            error: error.into(),
            domain: None,
            key: None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// Row that could not be imported, reported back to the user at the end of the job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FailedRow {
    pub domain: String,
    pub key: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: String,
    pub name: String,
}

/// Fully validated link record, ready for bulk insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewLink {
    pub id: Uuid,
    pub workspace_id: String,
    pub domain: String,
    pub key: String,
    pub short_link: String,
    pub url: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub tag_ids: Vec<String>,
    pub folder_id: Option<String>,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}

impl NewLink {
    /// Placeholder link created alongside a newly registered domain.
    pub fn root_placeholder(workspace_id: &str, user_id: &str, domain: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            workspace_id: workspace_id.to_string(),
            domain: domain.to_string(),
            key: ROOT_KEY.to_string(),
            short_link: short_link(domain, ROOT_KEY),
            url: String::new(),
            title: None,
            description: None,
            tag_ids: Vec::new(),
            folder_id: None,
            user_id: user_id.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Completion notification payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub workspace_id: String,
    pub user_id: String,
    pub count: u64,
    pub domains: Vec<String>,
    pub error_links: Vec<FailedRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestVariant {
    pub url: String,
    pub percentage: f64,
}

/// A/B test configuration for one link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSchedule {
    pub link_id: String,
    #[serde(default)]
    pub test_variants: Vec<TestVariant>,
    #[serde(default)]
    pub test_completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum TestScheduleState {
    NoSchedule,
    Scheduled { message_id: String, delay_secs: u64 },
    Fired,
}

/// Tag names compare under full Unicode lowercasing, matching `lower(name)` in Postgres.
pub fn same_tag_name(a: &str, b: &str) -> bool {
    a == b || a.to_lowercase() == b.to_lowercase()
}

/// Canonical short-link string, the uniqueness key for links.
pub fn short_link(domain: &str, key: &str) -> String {
    if key == ROOT_KEY {
        format!("https://{domain}")
    } else {
        format!("https://{domain}/{key}")
    }
}
