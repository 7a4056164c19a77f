//! Keeps at most one delayed completion message outstanding per A/B-tested link.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use linkport_core::{TestSchedule, TestScheduleState};
use linkport_storage::ScheduleStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::queue::{MessageQueue, OutboundMessage, QueueError};

/// Body of the delayed completion message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCompletionMessage {
    pub link_id: String,
}

pub struct TestCompletionScheduler {
    queue: Arc<dyn MessageQueue>,
    schedules: Arc<dyn ScheduleStore>,
    destination: String,
}

impl TestCompletionScheduler {
    pub fn new(queue: Arc<dyn MessageQueue>, schedules: Arc<dyn ScheduleStore>, destination: impl Into<String>) -> Self {
        Self {
            queue,
            schedules,
            destination: destination.into(),
        }
    }

    /// Cancels whatever was scheduled for the link, then schedules anew if the
    /// completion time is still ahead of `now`.
    pub async fn schedule(&self, test: &TestSchedule, now: DateTime<Utc>) -> Result<TestScheduleState> {
        self.cancel_previous(&test.link_id).await;

        let completed_at = match test.test_completed_at {
            Some(at) if !test.test_variants.is_empty() => at,
            _ => {
                debug!(link_id = %test.link_id, "no test configured; nothing scheduled");
                return Ok(TestScheduleState::NoSchedule);
            }
        };

        // Round sub-second remainders up so the message never fires before `completed_at`.
        let delay_millis = (completed_at - now).num_milliseconds();
        if delay_millis <= 0 {
            info!(link_id = %test.link_id, %completed_at, "test completion already due; not scheduling");
            return Ok(TestScheduleState::NoSchedule);
        }
        let delay_secs = (delay_millis as u64).div_ceil(1000);

        let message = OutboundMessage::json(
            &self.destination,
            &TestCompletionMessage {
                link_id: test.link_id.clone(),
            },
            Duration::from_secs(delay_secs),
        )?;
        let message_id = self
            .queue
            .publish(message)
            .await
            .context("publishing test completion message")?;
        self.schedules
            .set_scheduled_message(&test.link_id, &message_id)
            .await
            .context("storing test completion handle")?;

        info!(link_id = %test.link_id, %message_id, delay_secs, "scheduled test completion");
        Ok(TestScheduleState::Scheduled {
            message_id,
            delay_secs,
        })
    }

    /// Called when the delayed message arrives.
    pub async fn mark_fired(&self, link_id: &str) -> Result<TestScheduleState> {
        self.schedules
            .clear_scheduled_message(link_id)
            .await
            .context("clearing test completion handle")?;
        info!(link_id, "test completion fired");
        Ok(TestScheduleState::Fired)
    }

    async fn cancel_previous(&self, link_id: &str) {
        let previous = match self.schedules.scheduled_message(link_id).await {
            Ok(previous) => previous,
            Err(err) => {
                warn!(link_id, error = %err, "failed to read previous test completion handle");
                return;
            }
        };
        let Some(message_id) = previous else {
            return;
        };

        match self.queue.delete(&message_id).await {
            Ok(()) => debug!(link_id, %message_id, "cancelled previous test completion"),
            Err(QueueError::NotFound(_)) => {
                debug!(link_id, %message_id, "previous test completion already gone")
            }
            Err(err) => warn!(link_id, %message_id, error = %err, "failed to cancel previous test completion"),
        }
        if let Err(err) = self.schedules.clear_scheduled_message(link_id).await {
            warn!(link_id, error = %err, "failed to clear previous test completion handle");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryQueue;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use linkport_core::TestVariant;
    use linkport_storage::MemoryCursorStore;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn test_schedule(completed_at: Option<DateTime<Utc>>) -> TestSchedule {
        TestSchedule {
            link_id: "link_1".into(),
            test_variants: vec![
                TestVariant {
                    url: "https://a.example.com".into(),
                    percentage: 50.0,
                },
                TestVariant {
                    url: "https://b.example.com".into(),
                    percentage: 50.0,
                },
            ],
            test_completed_at: completed_at,
        }
    }

    /// Publishes normally but every delete is rejected by the queue service.
    struct RejectingDeletes(Arc<MemoryQueue>);

    #[async_trait]
    impl MessageQueue for RejectingDeletes {
        async fn publish(&self, message: OutboundMessage) -> Result<String, QueueError> {
            self.0.publish(message).await
        }

        async fn delete(&self, _message_id: &str) -> Result<(), QueueError> {
            Err(QueueError::Status {
                status: 500,
                body: "internal error".into(),
            })
        }
    }

    fn scheduler() -> (TestCompletionScheduler, Arc<MemoryQueue>, Arc<MemoryCursorStore>) {
        let queue = Arc::new(MemoryQueue::new());
        let store = Arc::new(MemoryCursorStore::new());
        let scheduler = TestCompletionScheduler::new(
            queue.clone(),
            store.clone(),
            "http://localhost:8888/api/cron/links/complete-tests",
        );
        (scheduler, queue, store)
    }

    #[tokio::test]
    async fn future_completion_schedules_one_delayed_message() {
        let (scheduler, queue, store) = scheduler();
        let at = now() + chrono::Duration::hours(2);

        let state = scheduler.schedule(&test_schedule(Some(at)), now()).await.unwrap();
        let TestScheduleState::Scheduled { message_id, delay_secs } = state else {
            panic!("expected scheduled, got {state:?}");
        };
        assert_eq!(delay_secs, 7200);

        let outstanding = queue.outstanding().await;
        assert_eq!(outstanding.len(), 1);
        assert_eq!(outstanding[0].message.delay, Duration::from_secs(7200));
        let body: TestCompletionMessage = outstanding[0].message.decode().unwrap();
        assert_eq!(body.link_id, "link_1");
        assert_eq!(store.scheduled_message("link_1").await.unwrap(), Some(message_id));
    }

    #[tokio::test]
    async fn rescheduling_cancels_the_previous_message() {
        let (scheduler, queue, store) = scheduler();
        let first = scheduler
            .schedule(&test_schedule(Some(now() + chrono::Duration::hours(1))), now())
            .await
            .unwrap();
        let second = scheduler
            .schedule(&test_schedule(Some(now() + chrono::Duration::hours(3))), now())
            .await
            .unwrap();

        assert_ne!(first, second);
        assert_eq!(queue.published().await.len(), 2);
        let outstanding = queue.outstanding().await;
        assert_eq!(outstanding.len(), 1);
        assert_eq!(
            store.scheduled_message("link_1").await.unwrap(),
            Some(outstanding[0].id.clone())
        );
    }

    #[tokio::test]
    async fn past_completion_only_cancels() {
        let (scheduler, queue, store) = scheduler();
        scheduler
            .schedule(&test_schedule(Some(now() + chrono::Duration::hours(1))), now())
            .await
            .unwrap();

        let state = scheduler
            .schedule(&test_schedule(Some(now() - chrono::Duration::minutes(5))), now())
            .await
            .unwrap();

        assert_eq!(state, TestScheduleState::NoSchedule);
        assert!(queue.outstanding().await.is_empty());
        assert_eq!(store.scheduled_message("link_1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn missing_variants_or_timestamp_is_no_schedule() {
        let (scheduler, queue, _) = scheduler();
        let mut no_variants = test_schedule(Some(now() + chrono::Duration::hours(1)));
        no_variants.test_variants.clear();

        assert_eq!(
            scheduler.schedule(&no_variants, now()).await.unwrap(),
            TestScheduleState::NoSchedule
        );
        assert_eq!(
            scheduler.schedule(&test_schedule(None), now()).await.unwrap(),
            TestScheduleState::NoSchedule
        );
        assert!(queue.published().await.is_empty());
    }

    #[tokio::test]
    async fn already_delivered_message_does_not_block_rescheduling() {
        let (scheduler, queue, store) = scheduler();
        scheduler
            .schedule(&test_schedule(Some(now() + chrono::Duration::minutes(1))), now())
            .await
            .unwrap();
        queue.drain().await;

        let state = scheduler
            .schedule(&test_schedule(Some(now() + chrono::Duration::minutes(10))), now())
            .await
            .unwrap();
        assert!(matches!(state, TestScheduleState::Scheduled { .. }));

        assert_eq!(scheduler.mark_fired("link_1").await.unwrap(), TestScheduleState::Fired);
        assert_eq!(store.scheduled_message("link_1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn failed_cancel_still_schedules_the_new_completion() {
        let queue = Arc::new(MemoryQueue::new());
        let store = Arc::new(MemoryCursorStore::new());
        let scheduler = TestCompletionScheduler::new(
            Arc::new(RejectingDeletes(queue.clone())),
            store.clone(),
            "http://localhost:8888/api/cron/links/complete-tests",
        );

        scheduler
            .schedule(&test_schedule(Some(now() + chrono::Duration::hours(1))), now())
            .await
            .unwrap();
        let state = scheduler
            .schedule(&test_schedule(Some(now() + chrono::Duration::hours(2))), now())
            .await
            .unwrap();

        let TestScheduleState::Scheduled { message_id, delay_secs } = state else {
            panic!("expected scheduled, got {state:?}");
        };
        assert_eq!(delay_secs, 7200);
        assert_eq!(queue.published().await.len(), 2);
        assert_eq!(store.scheduled_message("link_1").await.unwrap(), Some(message_id));
    }

    #[tokio::test]
    async fn sub_second_remainders_round_up() {
        let (scheduler, queue, _) = scheduler();

        let state = scheduler
            .schedule(&test_schedule(Some(now() + chrono::Duration::milliseconds(900))), now())
            .await
            .unwrap();
        assert!(matches!(state, TestScheduleState::Scheduled { delay_secs: 1, .. }));

        let state = scheduler
            .schedule(&test_schedule(Some(now() + chrono::Duration::milliseconds(1900))), now())
            .await
            .unwrap();
        assert!(matches!(state, TestScheduleState::Scheduled { delay_secs: 2, .. }));
        assert_eq!(queue.outstanding().await[0].message.delay, Duration::from_secs(2));
    }
}
