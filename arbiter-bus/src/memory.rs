//! In-memory EventLog implementation.
//!
//! Events live in a shared vector and consumers tail it live: a poll that
//! finds nothing new parks on a [`Notify`] until the next append or the
//! poll timeout. Nothing is persisted, so this backs tests and the local
//! simulation rather than production traffic.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::Instant;

use crate::error::Result;
use crate::traits::{EventBatch, EventConsumer, EventLog, Offset, SeekPosition};

struct Shared<E> {
    /// Stored events; an event's offset is its index
    events: RwLock<Vec<E>>,
    /// Next offset to assign
    next_offset: AtomicU64,
    /// Next offset to read, per consumer group
    group_offsets: Mutex<HashMap<String, Offset>>,
    /// Woken on every append
    appended: Notify,
}

/// In-memory implementation of [`EventLog`] with live-tailing consumers.
pub struct InMemoryEventLog<E> {
    name: String,
    shared: Arc<Shared<E>>,
}

impl<E> InMemoryEventLog<E>
where
    E: Clone + Send + Sync + 'static,
{
    /// Create a new, empty log for the named topic.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shared: Arc::new(Shared {
                events: RwLock::new(Vec::new()),
                next_offset: AtomicU64::new(0),
                group_offsets: Mutex::new(HashMap::new()),
                appended: Notify::new(),
            }),
        }
    }

    /// Topic name this log was created for.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the number of events in the log.
    pub async fn len(&self) -> usize {
        self.shared.events.read().await.len()
    }

    /// Check if the log is empty.
    pub async fn is_empty(&self) -> bool {
        self.shared.events.read().await.is_empty()
    }

    /// Clone every event currently in the log, oldest first.
    pub async fn snapshot(&self) -> Vec<E> {
        self.shared.events.read().await.clone()
    }
}

#[async_trait]
impl<E> EventLog<E> for InMemoryEventLog<E>
where
    E: Clone + Send + Sync + 'static,
{
    async fn append(&self, event: E) -> Result<Offset> {
        let offset = {
            let mut events = self.shared.events.write().await;
            let offset = events.len() as Offset;
            events.push(event);
            self.shared.next_offset.store(offset + 1, Ordering::SeqCst);
            offset
        };
        self.shared.appended.notify_waiters();
        Ok(offset)
    }

    async fn consumer(&self, group: &str) -> Result<Box<dyn EventConsumer<E>>> {
        let cursor = {
            let offsets = self.shared.group_offsets.lock().await;
            offsets.get(group).copied().unwrap_or(0)
        };

        Ok(Box::new(InMemoryConsumer {
            group: group.to_string(),
            shared: Arc::clone(&self.shared),
            cursor,
            committed_offset: cursor.saturating_sub(1),
        }))
    }

    fn high_water_mark(&self) -> Offset {
        self.shared.next_offset.load(Ordering::SeqCst)
    }
}

/// In-memory consumer implementation.
struct InMemoryConsumer<E> {
    group: String,
    shared: Arc<Shared<E>>,
    cursor: Offset,
    committed_offset: Offset,
}

impl<E: Clone> InMemoryConsumer<E> {
    async fn take_available(&mut self, max_count: usize) -> Option<EventBatch<E>> {
        let events = self.shared.events.read().await;
        let start = self.cursor as usize;
        if start >= events.len() {
            return None;
        }

        let end = std::cmp::min(start + max_count, events.len());
        let batch: Vec<(Offset, E)> = events[start..end]
            .iter()
            .enumerate()
            .map(|(i, e)| ((start + i) as Offset, e.clone()))
            .collect();
        self.cursor = end as Offset;
        Some(EventBatch::new(batch))
    }
}

#[async_trait]
impl<E> EventConsumer<E> for InMemoryConsumer<E>
where
    E: Clone + Send + Sync + 'static,
{
    async fn poll(&mut self, max_count: usize, timeout: Duration) -> Result<EventBatch<E>> {
        let max_count = max_count.max(1);
        let deadline = Instant::now() + timeout;
        let shared = Arc::clone(&self.shared);

        loop {
            // Register interest before checking so an append between the
            // check and the wait still wakes us.
            let appended = shared.appended.notified();

            if let Some(batch) = self.take_available(max_count).await {
                return Ok(batch);
            }

            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(EventBatch::empty());
            }
        }
    }

    async fn commit(&mut self, offset: Offset) -> Result<()> {
        self.committed_offset = offset;
        let mut offsets = self.shared.group_offsets.lock().await;
        offsets.insert(self.group.clone(), offset + 1);
        Ok(())
    }

    async fn seek(&mut self, position: SeekPosition) -> Result<()> {
        self.cursor = match position {
            SeekPosition::Beginning => 0,
            SeekPosition::End => self.shared.events.read().await.len() as Offset,
            SeekPosition::Offset(o) => o,
        };
        Ok(())
    }

    fn committed_offset(&self) -> Offset {
        self.committed_offset
    }

    fn group(&self) -> &str {
        &self.group
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log() -> InMemoryEventLog<String> {
        InMemoryEventLog::new("test")
    }

    #[tokio::test]
    async fn append_returns_incrementing_offsets() {
        let log = log();

        let o1 = log.append("first".to_string()).await.unwrap();
        let o2 = log.append("second".to_string()).await.unwrap();
        let o3 = log.append("third".to_string()).await.unwrap();

        assert_eq!((o1, o2, o3), (0, 1, 2));
        assert_eq!(log.high_water_mark(), 3);
        assert_eq!(log.len().await, 3);
    }

    #[tokio::test]
    async fn consumer_polls_events() {
        let log = log();
        log.append("first".to_string()).await.unwrap();
        log.append("second".to_string()).await.unwrap();

        let mut consumer = log.consumer("test-group").await.unwrap();
        let batch = consumer.poll(10, Duration::from_secs(1)).await.unwrap();

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.first_offset(), Some(0));
        assert_eq!(batch.last_offset(), Some(1));
    }

    #[tokio::test]
    async fn consumer_respects_max_count_and_continues() {
        let log = log();
        for i in 0..10 {
            log.append(format!("event-{i}")).await.unwrap();
        }

        let mut consumer = log.consumer("test-group").await.unwrap();

        let batch1 = consumer.poll(3, Duration::from_secs(1)).await.unwrap();
        assert_eq!(batch1.first_offset(), Some(0));
        assert_eq!(batch1.last_offset(), Some(2));

        let batch2 = consumer.poll(3, Duration::from_secs(1)).await.unwrap();
        assert_eq!(batch2.first_offset(), Some(3));
        assert_eq!(batch2.last_offset(), Some(5));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_times_out_with_empty_batch() {
        let log = log();
        let mut consumer = log.consumer("idle").await.unwrap();

        let batch = consumer.poll(10, Duration::from_millis(250)).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn poll_wakes_on_append() {
        let log = Arc::new(log());
        let mut consumer = log.consumer("tail").await.unwrap();

        let writer = Arc::clone(&log);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append("late".to_string()).await.unwrap();
        });

        let batch = consumer.poll(10, Duration::from_secs(5)).await.unwrap();
        let events: Vec<_> = batch.into_iter().map(|(_, e)| e).collect();
        assert_eq!(events, vec!["late".to_string()]);
    }

    #[tokio::test]
    async fn seek_repositions_cursor() {
        let log = log();
        for i in 0..5 {
            log.append(format!("event-{i}")).await.unwrap();
        }

        let mut consumer = log.consumer("test-group").await.unwrap();
        consumer.poll(3, Duration::from_secs(1)).await.unwrap();

        consumer.seek(SeekPosition::Beginning).await.unwrap();
        let batch = consumer.poll(1, Duration::from_secs(1)).await.unwrap();
        assert_eq!(batch.first_offset(), Some(0));

        consumer.seek(SeekPosition::Offset(4)).await.unwrap();
        let batch = consumer.poll(10, Duration::from_secs(1)).await.unwrap();
        assert_eq!(batch.first_offset(), Some(4));
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn seek_to_end_skips_backlog() {
        let log = log();
        for i in 0..5 {
            log.append(format!("event-{i}")).await.unwrap();
        }

        let mut consumer = log.consumer("test-group").await.unwrap();
        consumer.seek(SeekPosition::End).await.unwrap();

        let batch = consumer.poll(10, Duration::from_millis(10)).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn new_consumer_resumes_after_commit() {
        let log = log();
        for i in 0..4 {
            log.append(format!("event-{i}")).await.unwrap();
        }

        let mut consumer = log.consumer("resume").await.unwrap();
        let batch = consumer.poll(2, Duration::from_secs(1)).await.unwrap();
        consumer.commit(batch.last_offset().unwrap()).await.unwrap();
        assert_eq!(consumer.committed_offset(), 1);

        let mut resumed = log.consumer("resume").await.unwrap();
        let batch = resumed.poll(10, Duration::from_secs(1)).await.unwrap();
        assert_eq!(batch.first_offset(), Some(2));
        assert_eq!(resumed.group(), "resume");
    }

    #[tokio::test]
    async fn independent_consumer_groups() {
        let log = log();
        for i in 0..5 {
            log.append(format!("event-{i}")).await.unwrap();
        }

        let mut consumer_a = log.consumer("group-a").await.unwrap();
        let mut consumer_b = log.consumer("group-b").await.unwrap();

        let batch_a = consumer_a.poll(3, Duration::from_secs(1)).await.unwrap();
        consumer_a.commit(batch_a.last_offset().unwrap()).await.unwrap();

        let batch_b = consumer_b.poll(2, Duration::from_secs(1)).await.unwrap();
        assert_eq!(batch_b.first_offset(), Some(0));
    }
}
