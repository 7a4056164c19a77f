//! Environment configuration and the optional default-domains YAML file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use linkport_core::MAX_ROWS_PER_EXECUTION;
use serde::Deserialize;

/// Domains provided by the platform itself; never registered per workspace.
pub const DEFAULT_PLATFORM_DOMAINS: [&str; 8] = [
    "dub.sh", "dub.link", "chatg.pt", "amzn.id", "spti.fi", "git.new", "cal.link", "loom.ly",
];

#[derive(Debug, Clone)]
pub struct ImportConfig {
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub app_base_url: String,
    pub queue_url: Option<String>,
    pub queue_token: Option<String>,
    /// Required by every deployment that accepts queue messages; there is no default.
    pub signing_secret: Option<String>,
    pub max_rows_per_execution: usize,
    pub notify_webhook_url: Option<String>,
    pub domain_provider_url: Option<String>,
    pub domain_provider_token: Option<String>,
    pub domain_provider_project: Option<String>,
    pub default_domains_file: Option<PathBuf>,
    pub http_timeout_secs: u64,
    pub web_port: u16,
    pub uploads_dir: PathBuf,
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl ImportConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: non_empty_var("DATABASE_URL"),
            redis_url: non_empty_var("REDIS_URL"),
            app_base_url: std::env::var("APP_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8888".to_string()),
            queue_url: non_empty_var("QUEUE_URL"),
            queue_token: non_empty_var("QUEUE_TOKEN"),
            signing_secret: non_empty_var("QUEUE_SIGNING_SECRET"),
            max_rows_per_execution: std::env::var("IMPORT_MAX_ROWS_PER_EXECUTION")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(MAX_ROWS_PER_EXECUTION),
            notify_webhook_url: non_empty_var("NOTIFY_WEBHOOK_URL"),
            domain_provider_url: non_empty_var("DOMAIN_PROVIDER_URL"),
            domain_provider_token: non_empty_var("DOMAIN_PROVIDER_TOKEN"),
            domain_provider_project: non_empty_var("DOMAIN_PROVIDER_PROJECT"),
            default_domains_file: non_empty_var("DEFAULT_DOMAINS_FILE").map(PathBuf::from),
            http_timeout_secs: std::env::var("LINKPORT_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            web_port: std::env::var("LINKPORT_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8888),
            uploads_dir: std::env::var("LINKPORT_UPLOADS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./uploads")),
        }
    }

    pub fn require_signing_secret(&self) -> Result<&str> {
        self.signing_secret
            .as_deref()
            .context("QUEUE_SIGNING_SECRET must be set to sign and verify queue messages")
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.app_base_url.trim_end_matches('/'), path)
    }

    pub fn platform_domains(&self) -> Result<Vec<String>> {
        match &self.default_domains_file {
            Some(path) => load_default_domains(path),
            None => Ok(DEFAULT_PLATFORM_DOMAINS.iter().map(|d| d.to_string()).collect()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DefaultDomainsFile {
    domains: Vec<String>,
}

/// Reads a YAML document of the form `domains: [a.link, b.link]`.
pub fn load_default_domains(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let parsed: DefaultDomainsFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(parsed
        .domains
        .into_iter()
        .map(|d| d.trim().to_ascii_lowercase())
        .filter(|d| !d.is_empty())
        .collect())
}
