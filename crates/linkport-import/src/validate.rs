//! Standard link validation applied to every imported row before insert.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::Utc;
use linkport_core::{same_tag_name, short_link, LinkIntent, NewLink, Tag, ROOT_KEY};
use url::Url;
use uuid::Uuid;

pub const MAX_KEY_LENGTH: usize = 190;

pub struct ValidationContext<'a> {
    pub workspace_id: &'a str,
    pub user_id: &'a str,
    pub folder_id: Option<&'a str>,
    /// Workspace tags after this batch's missing tags were created.
    pub tags: &'a [Tag],
}

/// Validation is side-effect free: it only builds the record, and the caller inserts
/// the whole batch at once.
#[async_trait]
pub trait LinkValidator: Send + Sync {
    /// `Err` carries the user-facing reason the row was rejected.
    async fn validate(&self, intent: &LinkIntent, ctx: &ValidationContext<'_>) -> Result<NewLink, String>;
}

pub struct StandardLinkValidator {
    platform_domains: HashSet<String>,
}

impl StandardLinkValidator {
    pub fn new(platform_domains: impl IntoIterator<Item = String>) -> Self {
        Self {
            platform_domains: platform_domains
                .into_iter()
                .map(|d| d.to_ascii_lowercase())
                .collect(),
        }
    }

    fn check_key(&self, intent: &LinkIntent) -> Result<(), String> {
        let key = intent.key.as_str();
        if key.is_empty() {
            return Err("Key cannot be empty.".into());
        }
        if key.chars().count() > MAX_KEY_LENGTH {
            return Err(format!("Key cannot be longer than {MAX_KEY_LENGTH} characters."));
        }
        if key.chars().any(|c| c.is_whitespace() || c == '?' || c == '#') {
            return Err(format!("Invalid key: {key}"));
        }
        if key == ROOT_KEY && self.platform_domains.contains(&intent.domain) {
            return Err(format!("You can't create a root link on {}.", intent.domain));
        }
        Ok(())
    }

    fn check_url(intent: &LinkIntent) -> Result<(), String> {
        let url = Url::parse(&intent.url).map_err(|_| format!("Invalid URL: {}", intent.url))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(format!("Invalid URL: {}", intent.url));
        }
        if url
            .host_str()
            .is_some_and(|host| host.eq_ignore_ascii_case(&intent.domain))
            && intent.key != ROOT_KEY
        {
            return Err("Destination URL cannot point back to its own short domain.".into());
        }
        Ok(())
    }
}

#[async_trait]
impl LinkValidator for StandardLinkValidator {
    async fn validate(&self, intent: &LinkIntent, ctx: &ValidationContext<'_>) -> Result<NewLink, String> {
        self.check_key(intent)?;
        Self::check_url(intent)?;

        let mut tag_ids = Vec::with_capacity(intent.tags.len());
        for name in &intent.tags {
            let tag = ctx
                .tags
                .iter()
                .find(|t| same_tag_name(&t.name, name))
                .ok_or_else(|| format!("Tag {name} could not be resolved."))?;
            tag_ids.push(tag.id.clone());
        }

        Ok(NewLink {
            id: Uuid::new_v4(),
            workspace_id: ctx.workspace_id.to_string(),
            domain: intent.domain.clone(),
            key: intent.key.clone(),
            short_link: short_link(&intent.domain, &intent.key),
            url: intent.url.clone(),
            title: intent.title.clone(),
            description: intent.description.clone(),
            tag_ids,
            folder_id: ctx.folder_id.map(str::to_string),
            user_id: ctx.user_id.to_string(),
            created_at: intent.created_at.unwrap_or_else(Utc::now),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intent(domain: &str, key: &str, url: &str) -> LinkIntent {
        LinkIntent {
            domain: domain.into(),
            key: key.into(),
            url: url.into(),
            title: None,
            description: None,
            tags: vec![],
            created_at: None,
        }
    }

    fn ctx(tags: &[Tag]) -> ValidationContext<'_> {
        ValidationContext {
            workspace_id: "ws_1",
            user_id: "u1",
            folder_id: Some("fold_1"),
            tags,
        }
    }

    #[tokio::test]
    async fn valid_intent_becomes_a_link_with_resolved_tags() {
        let validator = StandardLinkValidator::new(vec!["dub.sh".to_string()]);
        let tags = vec![Tag {
            id: "tag_1".into(),
            name: "Promo".into(),
        }];
        let mut row = intent("acme.link", "sale", "https://shop.example.com/");
        row.tags = vec!["promo".into()];

        let link = validator.validate(&row, &ctx(&tags)).await.unwrap();
        assert_eq!(link.short_link, "https://acme.link/sale");
        assert_eq!(link.tag_ids, vec!["tag_1".to_string()]);
        assert_eq!(link.folder_id.as_deref(), Some("fold_1"));
    }

    #[tokio::test]
    async fn tag_lookup_folds_non_ascii_case() {
        let validator = StandardLinkValidator::new(Vec::<String>::new());
        let tags = vec![Tag {
            id: "tag_ete".into(),
            name: "Été".into(),
        }];
        let mut row = intent("acme.link", "summer", "https://shop.example.com/");
        row.tags = vec!["été".into()];

        let link = validator.validate(&row, &ctx(&tags)).await.unwrap();
        assert_eq!(link.tag_ids, vec!["tag_ete".to_string()]);
    }

    #[tokio::test]
    async fn rejects_bad_keys_schemes_and_loops() {
        let validator = StandardLinkValidator::new(vec!["dub.sh".to_string()]);
        let cases = [
            intent("acme.link", "has space", "https://a.com"),
            intent("acme.link", &"k".repeat(MAX_KEY_LENGTH + 1), "https://a.com"),
            intent("acme.link", "x", "ftp://files.example.com/a"),
            intent("acme.link", "x", "https://acme.link/y"),
            intent("dub.sh", ROOT_KEY, "https://a.com"),
        ];
        for case in cases {
            assert!(validator.validate(&case, &ctx(&[])).await.is_err(), "{case:?}");
        }
    }
}
