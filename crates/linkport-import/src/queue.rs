//! Message queue transports: QStash-style HTTP, in-process delayed delivery, and memory.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::signature::{self, SIGNATURE_HEADER};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("message {0} not found")]
    NotFound(String),
    #[error("queue request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("queue responded {status}: {body}")]
    Status { status: u16, body: String },
    #[error("encoding message body: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("scheduler: {0}")]
    Scheduler(String),
}

/// A JSON message bound for `destination`, delivered after `delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub destination: String,
    pub body: Vec<u8>,
    pub delay: Duration,
}

impl OutboundMessage {
    pub fn json<T: Serialize>(destination: impl Into<String>, body: &T, delay: Duration) -> Result<Self, QueueError> {
        Ok(Self {
            destination: destination.into(),
            body: serde_json::to_vec(body)?,
            delay,
        })
    }

    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, QueueError> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Returns the queue's id for the message.
    async fn publish(&self, message: OutboundMessage) -> Result<String, QueueError>;

    /// [`QueueError::NotFound`] when the message was already delivered or deleted.
    async fn delete(&self, message_id: &str) -> Result<(), QueueError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    message_id: String,
}

/// QStash-compatible HTTP queue. The body signature is forwarded to the destination.
pub struct HttpQueue {
    client: reqwest::Client,
    base_url: String,
    token: String,
    signing_secret: String,
}

impl HttpQueue {
    pub fn new(client: reqwest::Client, base_url: &str, token: &str, signing_secret: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            signing_secret: signing_secret.to_string(),
        }
    }
}

#[async_trait]
impl MessageQueue for HttpQueue {
    async fn publish(&self, message: OutboundMessage) -> Result<String, QueueError> {
        let signature = signature::sign(&self.signing_secret, &message.body);
        let mut request = self
            .client
            .post(format!("{}/v2/publish/{}", self.base_url, message.destination))
            .bearer_auth(&self.token)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(format!("Upstash-Forward-{SIGNATURE_HEADER}"), signature);
        if !message.delay.is_zero() {
            request = request.header("Upstash-Delay", format!("{}s", message.delay.as_secs()));
        }

        let resp = request.body(message.body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(QueueError::Status {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        let published: PublishResponse = resp.json().await?;
        Ok(published.message_id)
    }

    async fn delete(&self, message_id: &str) -> Result<(), QueueError> {
        let resp = self
            .client
            .delete(format!("{}/v2/messages/{}", self.base_url, message_id))
            .bearer_auth(&self.token)
            .send()
            .await?;
        match resp.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(QueueError::NotFound(message_id.to_string())),
            status => Err(QueueError::Status {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            }),
        }
    }
}

/// Single-node queue: one-shot scheduler jobs that POST the signed body when due.
pub struct LocalQueue {
    scheduler: JobScheduler,
    client: reqwest::Client,
    signing_secret: String,
}

impl LocalQueue {
    pub async fn start(client: reqwest::Client, signing_secret: &str) -> Result<Self, QueueError> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|err| QueueError::Scheduler(err.to_string()))?;
        scheduler
            .start()
            .await
            .map_err(|err| QueueError::Scheduler(err.to_string()))?;
        Ok(Self {
            scheduler,
            client,
            signing_secret: signing_secret.to_string(),
        })
    }
}

#[async_trait]
impl MessageQueue for LocalQueue {
    async fn publish(&self, message: OutboundMessage) -> Result<String, QueueError> {
        let signature = signature::sign(&self.signing_secret, &message.body);
        let client = self.client.clone();
        let OutboundMessage {
            destination,
            body,
            delay,
        } = message;

        let job = Job::new_one_shot_async(delay.max(Duration::from_millis(10)), move |id, _sched| {
            let client = client.clone();
            let destination = destination.clone();
            let body = body.clone();
            let signature = signature.clone();
            Box::pin(async move {
                let result = client
                    .post(&destination)
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .header(SIGNATURE_HEADER, signature)
                    .body(body)
                    .send()
                    .await;
                match result {
                    Ok(resp) if resp.status().is_success() => {
                        debug!(message_id = %id, %destination, "delivered local queue message")
                    }
                    Ok(resp) => {
                        warn!(message_id = %id, %destination, status = %resp.status(), "local queue delivery rejected")
                    }
                    Err(err) => {
                        warn!(message_id = %id, %destination, error = %err, "local queue delivery failed")
                    }
                }
            })
        })
        .map_err(|err| QueueError::Scheduler(err.to_string()))?;

        let id = self
            .scheduler
            .add(job)
            .await
            .map_err(|err| QueueError::Scheduler(err.to_string()))?;
        Ok(id.to_string())
    }

    async fn delete(&self, message_id: &str) -> Result<(), QueueError> {
        let id = Uuid::parse_str(message_id).map_err(|_| QueueError::NotFound(message_id.to_string()))?;
        self.scheduler
            .remove(&id)
            .await
            .map_err(|err| QueueError::Scheduler(err.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub id: String,
    pub message: OutboundMessage,
    pub deleted: bool,
}

/// Records messages instead of delivering them; drained by the local CLI runner and tests.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    messages: Mutex<Vec<PublishedMessage>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message ever published, in order.
    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.messages.lock().await.clone()
    }

    /// Published and not deleted.
    pub async fn outstanding(&self) -> Vec<PublishedMessage> {
        self.messages
            .lock()
            .await
            .iter()
            .filter(|m| !m.deleted)
            .cloned()
            .collect()
    }

    /// Marks every outstanding message delivered and returns them.
    pub async fn drain(&self) -> Vec<PublishedMessage> {
        let mut messages = self.messages.lock().await;
        let mut out = Vec::new();
        for message in messages.iter_mut().filter(|m| !m.deleted) {
            message.deleted = true;
            out.push(message.clone());
        }
        out
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn publish(&self, message: OutboundMessage) -> Result<String, QueueError> {
        let id = format!("msg_{}", Uuid::new_v4().simple());
        self.messages.lock().await.push(PublishedMessage {
            id: id.clone(),
            message,
            deleted: false,
        });
        Ok(id)
    }

    async fn delete(&self, message_id: &str) -> Result<(), QueueError> {
        let mut messages = self.messages.lock().await;
        match messages.iter_mut().find(|m| m.id == message_id && !m.deleted) {
            Some(message) => {
                message.deleted = true;
                Ok(())
            }
            None => Err(QueueError::NotFound(message_id.to_string())),
        }
    }
}
