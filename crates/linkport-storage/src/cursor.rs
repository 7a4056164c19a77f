//! Per-job import progress and outstanding schedule handles, kept in a cache store.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use linkport_core::FailedRow;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use tokio::sync::Mutex;

use crate::StoreError;

/// Sets the cursor only when the new value is ahead of the stored one.
///
/// KEYS[1]: cursor key
/// ARGV[1]: candidate cursor
/// Returns the cursor value in effect after the call.
const ADVANCE_CURSOR_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '-1')
local candidate = tonumber(ARGV[1])
if candidate > current then
    redis.call('SET', KEYS[1], ARGV[1])
    return candidate
end
return current
"#;

/// Key layout under `import:csv:{workspaceId}:{jobId}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorKeys {
    pub cursor: String,
    pub created: String,
    pub failed: String,
    pub domains: String,
}

impl CursorKeys {
    pub fn new(namespace: &str) -> Self {
        Self {
            cursor: format!("{namespace}:cursor"),
            created: format!("{namespace}:created"),
            failed: format!("{namespace}:failed"),
            domains: format!("{namespace}:domains"),
        }
    }

    fn all(&self) -> Vec<String> {
        vec![
            self.cursor.clone(),
            self.created.clone(),
            self.failed.clone(),
            self.domains.clone(),
        ]
    }
}

/// Source of truth for a job's progress across invocations.
///
/// Counters and lists are only ever mutated through increments and appends so that
/// duplicate deliveries of the same job cannot clobber each other's results.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Rows already consumed; 0 for a job that has not started.
    async fn cursor(&self, namespace: &str) -> Result<usize, StoreError>;

    /// Never moves the cursor backwards.
    async fn advance_cursor(&self, namespace: &str, cursor: usize) -> Result<(), StoreError>;

    /// Returns the running total.
    async fn add_created(&self, namespace: &str, count: u64) -> Result<u64, StoreError>;

    async fn created(&self, namespace: &str) -> Result<u64, StoreError>;

    async fn append_failed(&self, namespace: &str, rows: &[FailedRow]) -> Result<(), StoreError>;

    async fn failed(&self, namespace: &str) -> Result<Vec<FailedRow>, StoreError>;

    async fn add_domains(&self, namespace: &str, domains: &[String]) -> Result<(), StoreError>;

    /// Sorted.
    async fn domains(&self, namespace: &str) -> Result<Vec<String>, StoreError>;

    async fn clear(&self, namespace: &str) -> Result<(), StoreError>;
}

/// Remembers the delayed message currently standing in for a link's test completion.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn scheduled_message(&self, link_id: &str) -> Result<Option<String>, StoreError>;

    async fn set_scheduled_message(&self, link_id: &str, message_id: &str) -> Result<(), StoreError>;

    async fn clear_scheduled_message(&self, link_id: &str) -> Result<(), StoreError>;
}

fn schedule_key(link_id: &str) -> String {
    format!("ab-test-completion:{link_id}")
}

#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn })
    }

    pub fn from_connection(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl CursorStore for RedisStore {
    async fn cursor(&self, namespace: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let key = CursorKeys::new(namespace).cursor;
        let raw: Option<String> = conn.get(&key).await?;
        match raw {
            None => Ok(0),
            Some(value) => value.trim().parse().map_err(|_| StoreError::Malformed {
                key,
                reason: format!("cursor {value:?} is not an integer"),
            }),
        }
    }

    async fn advance_cursor(&self, namespace: &str, cursor: usize) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let key = CursorKeys::new(namespace).cursor;
        let script = Script::new(ADVANCE_CURSOR_SCRIPT);
        let _current: i64 = script
            .key(&key)
            .arg(cursor as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn add_created(&self, namespace: &str, count: u64) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let total: u64 = conn.incr(CursorKeys::new(namespace).created, count).await?;
        Ok(total)
    }

    async fn created(&self, namespace: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let key = CursorKeys::new(namespace).created;
        let raw: Option<String> = conn.get(&key).await?;
        match raw {
            None => Ok(0),
            Some(value) => value.trim().parse().map_err(|_| StoreError::Malformed {
                key,
                reason: format!("created count {value:?} is not an integer"),
            }),
        }
    }

    async fn append_failed(&self, namespace: &str, rows: &[FailedRow]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let key = CursorKeys::new(namespace).failed;
        let encoded = rows
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| StoreError::Malformed {
                key: key.clone(),
                reason: err.to_string(),
            })?;
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(&key, encoded).await?;
        Ok(())
    }

    async fn failed(&self, namespace: &str) -> Result<Vec<FailedRow>, StoreError> {
        let mut conn = self.conn.clone();
        let key = CursorKeys::new(namespace).failed;
        let raw: Vec<String> = conn.lrange(&key, 0, -1).await?;
        raw.iter()
            .map(|item| {
                serde_json::from_str(item).map_err(|err| StoreError::Malformed {
                    key: key.clone(),
                    reason: err.to_string(),
                })
            })
            .collect()
    }

    async fn add_domains(&self, namespace: &str, domains: &[String]) -> Result<(), StoreError> {
        if domains.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(CursorKeys::new(namespace).domains, domains.to_vec())
            .await?;
        Ok(())
    }

    async fn domains(&self, namespace: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let mut members: Vec<String> = conn.smembers(CursorKeys::new(namespace).domains).await?;
        members.sort();
        Ok(members)
    }

    async fn clear(&self, namespace: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(CursorKeys::new(namespace).all()).await?;
        Ok(())
    }
}

#[async_trait]
impl ScheduleStore for RedisStore {
    async fn scheduled_message(&self, link_id: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let message_id: Option<String> = conn.get(schedule_key(link_id)).await?;
        Ok(message_id)
    }

    async fn set_scheduled_message(&self, link_id: &str, message_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(schedule_key(link_id), message_id).await?;
        Ok(())
    }

    async fn clear_scheduled_message(&self, link_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(schedule_key(link_id)).await?;
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
struct JobProgress {
    cursor: usize,
    created: u64,
    failed: Vec<FailedRow>,
    domains: BTreeSet<String>,
}

/// Process-local store for single-node runs and tests.
#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    jobs: Mutex<HashMap<String, JobProgress>>,
    schedules: Mutex<HashMap<String, String>>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any progress is held for the namespace.
    pub async fn contains(&self, namespace: &str) -> bool {
        self.jobs.lock().await.contains_key(namespace)
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn cursor(&self, namespace: &str) -> Result<usize, StoreError> {
        Ok(self
            .jobs
            .lock()
            .await
            .get(namespace)
            .map(|job| job.cursor)
            .unwrap_or(0))
    }

    async fn advance_cursor(&self, namespace: &str, cursor: usize) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.entry(namespace.to_string()).or_default();
        job.cursor = job.cursor.max(cursor);
        Ok(())
    }

    async fn add_created(&self, namespace: &str, count: u64) -> Result<u64, StoreError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.entry(namespace.to_string()).or_default();
        job.created += count;
        Ok(job.created)
    }

    async fn created(&self, namespace: &str) -> Result<u64, StoreError> {
        Ok(self
            .jobs
            .lock()
            .await
            .get(namespace)
            .map(|job| job.created)
            .unwrap_or(0))
    }

    async fn append_failed(&self, namespace: &str, rows: &[FailedRow]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut jobs = self.jobs.lock().await;
        jobs.entry(namespace.to_string())
            .or_default()
            .failed
            .extend_from_slice(rows);
        Ok(())
    }

    async fn failed(&self, namespace: &str) -> Result<Vec<FailedRow>, StoreError> {
        Ok(self
            .jobs
            .lock()
            .await
            .get(namespace)
            .map(|job| job.failed.clone())
            .unwrap_or_default())
    }

    async fn add_domains(&self, namespace: &str, domains: &[String]) -> Result<(), StoreError> {
        if domains.is_empty() {
            return Ok(());
        }
        let mut jobs = self.jobs.lock().await;
        jobs.entry(namespace.to_string())
            .or_default()
            .domains
            .extend(domains.iter().cloned());
        Ok(())
    }

    async fn domains(&self, namespace: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .jobs
            .lock()
            .await
            .get(namespace)
            .map(|job| job.domains.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn clear(&self, namespace: &str) -> Result<(), StoreError> {
        self.jobs.lock().await.remove(namespace);
        Ok(())
    }
}

#[async_trait]
impl ScheduleStore for MemoryCursorStore {
    async fn scheduled_message(&self, link_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self.schedules.lock().await.get(link_id).cloned())
    }

    async fn set_scheduled_message(&self, link_id: &str, message_id: &str) -> Result<(), StoreError> {
        self.schedules
            .lock()
            .await
            .insert(link_id.to_string(), message_id.to_string());
        Ok(())
    }

    async fn clear_scheduled_message(&self, link_id: &str) -> Result<(), StoreError> {
        self.schedules.lock().await.remove(link_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NS: &str = "import:csv:ws_1:job_1";

    #[test]
    fn keys_hang_off_the_job_namespace() {
        let keys = CursorKeys::new(NS);
        assert_eq!(keys.cursor, "import:csv:ws_1:job_1:cursor");
        assert_eq!(keys.created, "import:csv:ws_1:job_1:created");
        assert_eq!(keys.failed, "import:csv:ws_1:job_1:failed");
        assert_eq!(keys.domains, "import:csv:ws_1:job_1:domains");
        assert_eq!(schedule_key("lnk_1"), "ab-test-completion:lnk_1");
    }

    #[tokio::test]
    async fn cursor_never_moves_backwards() {
        let store = MemoryCursorStore::new();
        assert_eq!(store.cursor(NS).await.unwrap(), 0);
        store.advance_cursor(NS, 25).await.unwrap();
        store.advance_cursor(NS, 10).await.unwrap();
        assert_eq!(store.cursor(NS).await.unwrap(), 25);
    }

    #[tokio::test]
    async fn counters_accumulate_and_clear_drops_everything() {
        let store = MemoryCursorStore::new();
        assert_eq!(store.add_created(NS, 3).await.unwrap(), 3);
        assert_eq!(store.add_created(NS, 4).await.unwrap(), 7);
        store
            .append_failed(
                NS,
                &[FailedRow {
                    domain: "acme.link".into(),
                    key: "x".into(),
                    error: "bad".into(),
                }],
            )
            .await
            .unwrap();
        store
            .add_domains(NS, &["b.link".to_string(), "a.link".to_string(), "a.link".to_string()])
            .await
            .unwrap();

        assert_eq!(store.failed(NS).await.unwrap().len(), 1);
        assert_eq!(store.domains(NS).await.unwrap(), vec!["a.link", "b.link"]);

        store.clear(NS).await.unwrap();
        assert!(!store.contains(NS).await);
        assert_eq!(store.created(NS).await.unwrap(), 0);
    }
}
