//! Core traits for event log operations.

use std::time::Duration;

use async_trait::async_trait;

/// Offset into an event stream.
pub type Offset = u64;

/// Position to seek to when repositioning a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekPosition {
    /// Start from the beginning.
    Beginning,
    /// Start from the end (new events only).
    End,
    /// Start from a specific offset.
    Offset(Offset),
}

/// A batch of events returned from polling, each tagged with its offset.
#[derive(Debug)]
pub struct EventBatch<E> {
    events: Vec<(Offset, E)>,
}

impl<E> EventBatch<E> {
    /// Create a batch from offset-tagged events.
    #[must_use]
    pub fn new(events: Vec<(Offset, E)>) -> Self {
        Self { events }
    }

    /// Create an empty batch.
    #[must_use]
    pub fn empty() -> Self {
        Self { events: Vec::new() }
    }

    /// Number of events in the batch.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the batch has no events.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Offset of the first event, if any.
    pub fn first_offset(&self) -> Option<Offset> {
        self.events.first().map(|(o, _)| *o)
    }

    /// Offset of the last event, if any.
    pub fn last_offset(&self) -> Option<Offset> {
        self.events.last().map(|(o, _)| *o)
    }
}

impl<E> IntoIterator for EventBatch<E> {
    type Item = (Offset, E);
    type IntoIter = std::vec::IntoIter<(Offset, E)>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.into_iter()
    }
}

/// Trait for appending events and creating consumers.
///
/// Delivery is at-least-once: a consumer that is recreated resumes from
/// the last committed offset of its group and may see events again.
#[async_trait]
pub trait EventLog<E>: Send + Sync
where
    E: Send + Sync + 'static,
{
    /// Append an event to the log, returning its offset.
    async fn append(&self, event: E) -> crate::Result<Offset>;

    /// Create a consumer for the given group, positioned at the group's
    /// committed offset.
    async fn consumer(&self, group: &str) -> crate::Result<Box<dyn EventConsumer<E>>>;

    /// Offset that the next appended event will receive.
    fn high_water_mark(&self) -> Offset;
}

/// Trait for polling events with offset tracking.
#[async_trait]
pub trait EventConsumer<E>: Send
where
    E: Send + 'static,
{
    /// Poll for up to `max_count` events, waiting at most `timeout` for the
    /// first one to arrive. Returns an empty batch on timeout.
    async fn poll(&mut self, max_count: usize, timeout: Duration) -> crate::Result<EventBatch<E>>;

    /// Commit `offset` as processed for this consumer's group.
    async fn commit(&mut self, offset: Offset) -> crate::Result<()>;

    /// Reposition the read cursor.
    async fn seek(&mut self, position: SeekPosition) -> crate::Result<()>;

    /// Last committed offset.
    fn committed_offset(&self) -> Offset;

    /// Consumer group name.
    fn group(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_offsets() {
        let batch = EventBatch::new(vec![(3, "a"), (4, "b"), (5, "c")]);
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.first_offset(), Some(3));
        assert_eq!(batch.last_offset(), Some(5));
    }

    #[test]
    fn empty_batch_has_no_offsets() {
        let batch: EventBatch<String> = EventBatch::empty();
        assert!(batch.is_empty());
        assert_eq!(batch.first_offset(), None);
        assert_eq!(batch.last_offset(), None);
    }

    #[test]
    fn batch_iterates_in_offset_order() {
        let batch = EventBatch::new(vec![(0, 'x'), (1, 'y')]);
        let collected: Vec<_> = batch.into_iter().collect();
        assert_eq!(collected, vec![(0, 'x'), (1, 'y')]);
    }
}
