//! Registration of newly seen domains with the DNS/hosting provider.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::json;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RegistrarError {
    #[error("domain provider request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("domain provider rejected {domain} with {status}")]
    Rejected { domain: String, status: u16 },
}

#[async_trait]
pub trait DomainRegistrar: Send + Sync {
    /// Registering an already-known domain succeeds.
    async fn register(&self, domain: &str) -> Result<(), RegistrarError>;
}

/// Vercel-style project domain API.
pub struct HttpDomainRegistrar {
    client: reqwest::Client,
    base_url: String,
    project: String,
    token: String,
}

impl HttpDomainRegistrar {
    pub fn new(client: reqwest::Client, base_url: &str, project: &str, token: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            project: project.to_string(),
            token: token.to_string(),
        }
    }
}

#[async_trait]
impl DomainRegistrar for HttpDomainRegistrar {
    async fn register(&self, domain: &str) -> Result<(), RegistrarError> {
        let resp = self
            .client
            .post(format!("{}/v10/projects/{}/domains", self.base_url, self.project))
            .bearer_auth(&self.token)
            .json(&json!({ "name": domain }))
            .send()
            .await?;
        match resp.status() {
            status if status.is_success() => Ok(()),
            StatusCode::CONFLICT => Ok(()),
            status => Err(RegistrarError::Rejected {
                domain: domain.to_string(),
                status: status.as_u16(),
            }),
        }
    }
}

#[derive(Debug, Default)]
pub struct NoopDomainRegistrar;

#[async_trait]
impl DomainRegistrar for NoopDomainRegistrar {
    async fn register(&self, domain: &str) -> Result<(), RegistrarError> {
        debug!(domain, "no domain provider configured; skipping registration");
        Ok(())
    }
}
