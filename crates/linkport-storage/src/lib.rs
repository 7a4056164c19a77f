//! External state behind narrow traits: source files, job progress, and link records.

mod cursor;
mod links;
mod object;

use thiserror::Error;

pub use cursor::{CursorKeys, CursorStore, MemoryCursorStore, RedisStore, ScheduleStore};
pub use links::{LinkRepository, MemoryLinkRepository, PgLinkRepository};
pub use object::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FsObjectStore,
    HttpClientConfig, HttpObjectStore, ObjectStore, ObjectStoreRouter, RetryDisposition,
    StoredObject,
};

pub const CRATE_NAME: &str = "linkport-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("database: {0}")]
    Database(#[from] sqlx::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed value under {key}: {reason}")]
    Malformed { key: String, reason: String },
    #[error("unsupported object location {0}")]
    UnsupportedLocation(String),
}
