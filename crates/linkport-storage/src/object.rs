//! Source-file access: hash-addressed local uploads and retrying HTTP fetches.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use url::Url;
use uuid::Uuid;

use crate::StoreError;

/// Read/delete access to an uploaded import file.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn fetch(&self, location: &str) -> Result<Vec<u8>, StoreError>;

    /// Deleting a missing object is not an error.
    async fn delete(&self, location: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub location: String,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Filesystem-backed uploads, addressed by content hash.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn object_relative_path(&self, workspace_id: &str, content_hash: &str, extension: &str) -> PathBuf {
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from("imports")
            .join(workspace_id)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Store bytes immutably using a hash-addressed path and atomic temp-file rename.
    pub async fn store_bytes(
        &self,
        workspace_id: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredObject> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.object_relative_path(workspace_id, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating upload directory {}", parent.display()))?;

        let stored = |deduplicated: bool| StoredObject {
            content_hash: content_hash.clone(),
            location: relative_path.display().to_string(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking upload path {}", absolute_path.display()))?
        {
            return Ok(stored(true));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp upload file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp upload file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp upload file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(stored(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                fs::remove_file(&temp_path).await.ok();
                Ok(stored(true))
            }
            Err(err) => {
                fs::remove_file(&temp_path).await.ok();
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp upload {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }

    /// Accepts `file://` URLs and paths relative to the store root.
    fn resolve(&self, location: &str) -> Result<PathBuf, StoreError> {
        if location.starts_with("file://") {
            let url = Url::parse(location)
                .map_err(|_| StoreError::UnsupportedLocation(location.to_string()))?;
            return url
                .to_file_path()
                .map_err(|_| StoreError::UnsupportedLocation(location.to_string()));
        }
        let path = Path::new(location);
        if path.is_absolute() {
            Ok(path.to_path_buf())
        } else {
            Ok(self.root.join(path))
        }
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn fetch(&self, location: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.resolve(location)?;
        Ok(fs::read(&path).await?)
    }

    async fn delete(&self, location: &str) -> Result<(), StoreError> {
        let path = self.resolve(location)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub bearer_token: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            bearer_token: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Object storage reached over HTTP(S), e.g. a bucket behind signed URLs.
#[derive(Debug)]
pub struct HttpObjectStore {
    client: reqwest::Client,
    bearer_token: Option<String>,
    backoff: BackoffPolicy,
}

impl HttpObjectStore {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            bearer_token: config.bearer_token,
            backoff: config.backoff,
        })
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.bearer_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let mut attempt = 0;
        loop {
            match self.request(reqwest::Method::GET, url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        return Ok(resp.bytes().await?.to_vec());
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(%status, attempt, "retrying object fetch");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, attempt, "retrying object fetch");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn fetch(&self, location: &str) -> Result<Vec<u8>, StoreError> {
        let span = info_span!("object_fetch", url = location);
        Ok(self.fetch_bytes(location).instrument(span).await?)
    }

    async fn delete(&self, location: &str) -> Result<(), StoreError> {
        let resp = self
            .request(reqwest::Method::DELETE, location)
            .send()
            .await
            .map_err(FetchError::from)?;
        let status = resp.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: location.to_string(),
            }
            .into())
        }
    }
}

/// Dispatches `http(s)://` locations to HTTP and everything else to the filesystem.
pub struct ObjectStoreRouter {
    http: HttpObjectStore,
    fs: FsObjectStore,
}

impl ObjectStoreRouter {
    pub fn new(http: HttpObjectStore, fs: FsObjectStore) -> Self {
        Self { http, fs }
    }

    pub fn uploads(&self) -> &FsObjectStore {
        &self.fs
    }

    fn is_remote(location: &str) -> bool {
        location.starts_with("http://") || location.starts_with("https://")
    }
}

#[async_trait]
impl ObjectStore for ObjectStoreRouter {
    async fn fetch(&self, location: &str) -> Result<Vec<u8>, StoreError> {
        if Self::is_remote(location) {
            self.http.fetch(location).await
        } else {
            self.fs.fetch(location).await
        }
    }

    async fn delete(&self, location: &str) -> Result<(), StoreError> {
        if Self::is_remote(location) {
            self.http.delete(location).await
        } else {
            self.fs.delete(location).await
        }
    }
}
